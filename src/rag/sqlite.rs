//! SQLite-backed chunk store.
//!
//! Metadata lives in a JSON column, embeddings as little-endian f32
//! blobs; similarity search is brute-force cosine over the generation.

use std::path::PathBuf;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use super::store::{ChunkMatch, ChunkMetadata, ChunkRecord, ChunkStore, SyncState, SyncStatus};
use crate::core::errors::ApiError;

pub struct SqliteChunkStore {
    pool: SqlitePool,
    #[allow(dead_code)]
    db_path: PathBuf,
}

impl SqliteChunkStore {
    pub async fn new(db_path: PathBuf) -> Result<Self, ApiError> {
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(ApiError::persistence)?;

        let store = Self { pool, db_path };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), ApiError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                doc_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                content TEXT NOT NULL,
                embedding BLOB,
                token_count INTEGER NOT NULL DEFAULT 0,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now')),
                updated_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now')),
                UNIQUE (doc_id, chunk_index)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(ApiError::persistence)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_doc ON chunks(doc_id)")
            .execute(&self.pool)
            .await
            .map_err(ApiError::persistence)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sync_status (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                status TEXT NOT NULL DEFAULT 'idle',
                chunk_count INTEGER NOT NULL DEFAULT 0,
                doc_title TEXT,
                last_synced_at TEXT,
                error_message TEXT,
                updated_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now'))
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(ApiError::persistence)?;

        Ok(())
    }

    fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
        embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    fn deserialize_embedding(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() || a.is_empty() {
            return 0.0;
        }

        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        let denom = norm_a * norm_b;

        if denom <= f32::EPSILON {
            0.0
        } else {
            dot / denom
        }
    }

    fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> ChunkRecord {
        let metadata_str: String = row.get("metadata");
        let metadata =
            serde_json::from_str::<ChunkMetadata>(&metadata_str).unwrap_or_default();

        ChunkRecord {
            id: row.get("id"),
            doc_id: row.get("doc_id"),
            chunk_index: row.get("chunk_index"),
            content: row.get("content"),
            token_count: row.get("token_count"),
            metadata,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }
}

const CHUNK_COLUMNS: &str =
    "id, doc_id, chunk_index, content, token_count, metadata, created_at, updated_at";

#[async_trait]
impl ChunkStore for SqliteChunkStore {
    async fn insert_batch(
        &self,
        items: Vec<(ChunkRecord, Option<Vec<f32>>)>,
    ) -> Result<(), ApiError> {
        if items.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(ApiError::persistence)?;

        for (chunk, embedding) in &items {
            let blob = embedding.as_deref().map(Self::serialize_embedding);
            let metadata_str =
                serde_json::to_string(&chunk.metadata).map_err(ApiError::internal)?;

            sqlx::query(
                "INSERT INTO chunks
                     (id, doc_id, chunk_index, content, embedding, token_count, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )
            .bind(&chunk.id)
            .bind(&chunk.doc_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .bind(blob)
            .bind(chunk.token_count)
            .bind(&metadata_str)
            .bind(&chunk.created_at)
            .bind(&chunk.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(ApiError::persistence)?;
        }

        tx.commit().await.map_err(ApiError::persistence)?;
        Ok(())
    }

    async fn delete_doc(&self, doc_id: &str) -> Result<usize, ApiError> {
        let result = sqlx::query("DELETE FROM chunks WHERE doc_id = ?1")
            .bind(doc_id)
            .execute(&self.pool)
            .await
            .map_err(ApiError::persistence)?;

        Ok(result.rows_affected() as usize)
    }

    async fn count(&self, doc_id: &str) -> Result<usize, ApiError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE doc_id = ?1")
            .bind(doc_id)
            .fetch_one(&self.pool)
            .await
            .map_err(ApiError::persistence)?;

        Ok(count as usize)
    }

    async fn first_chunks(&self, doc_id: &str, limit: usize) -> Result<Vec<ChunkRecord>, ApiError> {
        let sql = format!(
            "SELECT {} FROM chunks WHERE doc_id = ?1 ORDER BY chunk_index ASC LIMIT ?2",
            CHUNK_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(doc_id)
            .bind(limit.max(1) as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(ApiError::persistence)?;

        Ok(rows.iter().map(Self::row_to_chunk).collect())
    }

    async fn search_any_keyword(
        &self,
        doc_id: &str,
        keywords: &[String],
        limit: usize,
    ) -> Result<Vec<ChunkRecord>, ApiError> {
        if keywords.is_empty() {
            return Ok(Vec::new());
        }

        // SQLite LIKE is case-insensitive for ASCII, matching the
        // ILIKE semantics of the query surface.
        let mut sql = format!("SELECT {} FROM chunks WHERE doc_id = ? AND (", CHUNK_COLUMNS);
        for i in 0..keywords.len() {
            if i > 0 {
                sql.push_str(" OR ");
            }
            sql.push_str("content LIKE ?");
        }
        sql.push_str(") ORDER BY rowid ASC LIMIT ?");

        let mut query = sqlx::query(&sql).bind(doc_id);
        for keyword in keywords {
            query = query.bind(format!("%{}%", keyword));
        }
        query = query.bind(limit.max(1) as i64);

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(ApiError::persistence)?;

        Ok(rows.iter().map(Self::row_to_chunk).collect())
    }

    async fn match_chunks(
        &self,
        doc_id: &str,
        query_embedding: &[f32],
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<ChunkMatch>, ApiError> {
        let sql = format!(
            "SELECT {}, embedding FROM chunks
             WHERE doc_id = ?1 AND embedding IS NOT NULL
             ORDER BY rowid ASC",
            CHUNK_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(doc_id)
            .fetch_all(&self.pool)
            .await
            .map_err(ApiError::persistence)?;

        let mut scored: Vec<ChunkMatch> = rows
            .iter()
            .filter_map(|row| {
                let embedding_bytes: Vec<u8> = row.get("embedding");
                if embedding_bytes.is_empty() {
                    return None;
                }
                let stored = Self::deserialize_embedding(&embedding_bytes);
                let similarity = Self::cosine_similarity(query_embedding, &stored);
                if similarity <= threshold {
                    return None;
                }

                Some(ChunkMatch {
                    chunk: Self::row_to_chunk(row),
                    similarity,
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(limit.max(1));

        Ok(scored)
    }

    async fn sync_status(&self) -> Result<SyncStatus, ApiError> {
        let row = sqlx::query(
            "SELECT status, chunk_count, doc_title, last_synced_at, error_message
             FROM sync_status WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(ApiError::persistence)?;

        let Some(row) = row else {
            return Ok(SyncStatus::idle());
        };

        let status: String = row.get("status");
        Ok(SyncStatus {
            status: SyncState::parse(&status),
            chunk_count: row.get("chunk_count"),
            doc_title: row.get("doc_title"),
            last_synced_at: row.get("last_synced_at"),
            error_message: row.get("error_message"),
        })
    }

    async fn set_sync_status(&self, status: &SyncStatus) -> Result<(), ApiError> {
        sqlx::query(
            "INSERT INTO sync_status (id, status, chunk_count, doc_title, last_synced_at, error_message, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now'))
             ON CONFLICT (id) DO UPDATE SET
                 status = excluded.status,
                 chunk_count = excluded.chunk_count,
                 doc_title = excluded.doc_title,
                 last_synced_at = excluded.last_synced_at,
                 error_message = excluded.error_message,
                 updated_at = excluded.updated_at",
        )
        .bind(status.status.as_str())
        .bind(status.chunk_count)
        .bind(&status.doc_title)
        .bind(&status.last_synced_at)
        .bind(&status.error_message)
        .execute(&self.pool)
        .await
        .map_err(ApiError::persistence)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> SqliteChunkStore {
        let tmp = std::env::temp_dir().join(format!("tabula-chunks-test-{}.db", uuid::Uuid::new_v4()));
        SqliteChunkStore::new(tmp).await.unwrap()
    }

    fn make_chunk(doc_id: &str, index: i64, content: &str) -> ChunkRecord {
        let now = chrono::Utc::now().to_rfc3339();
        ChunkRecord {
            id: uuid::Uuid::new_v4().to_string(),
            doc_id: doc_id.to_string(),
            chunk_index: index,
            content: content.to_string(),
            token_count: (content.len() as i64 + 3) / 4,
            metadata: ChunkMetadata {
                row_number: Some(index + 2),
                headers: vec!["name".to_string()],
                source: "test.csv".to_string(),
            },
            created_at: now.clone(),
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn insert_and_match_by_cosine_similarity() {
        let store = test_store().await;

        store
            .insert_batch(vec![
                (make_chunk("kb", 0, "alpha"), Some(vec![1.0, 0.0])),
                (make_chunk("kb", 1, "beta"), Some(vec![0.0, 1.0])),
            ])
            .await
            .unwrap();

        let matches = store.match_chunks("kb", &[1.0, 0.0], 0.25, 5).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].chunk.content, "alpha");
        assert!(matches[0].similarity > 0.99);
    }

    #[tokio::test]
    async fn match_chunks_returns_empty_below_threshold() {
        let store = test_store().await;

        store
            .insert_batch(vec![(make_chunk("kb", 0, "alpha"), Some(vec![0.0, 1.0]))])
            .await
            .unwrap();

        let matches = store.match_chunks("kb", &[1.0, 0.0], 0.25, 5).await.unwrap();
        assert!(matches.is_empty());
    }

    #[tokio::test]
    async fn keyword_search_is_case_insensitive_and_store_ordered() {
        let store = test_store().await;

        store
            .insert_batch(vec![
                (make_chunk("kb", 0, "name: Alice; age: 30"), None),
                (make_chunk("kb", 1, "name: Bob; age: 25"), None),
                (make_chunk("kb", 2, "name: alice-2; age: 41"), None),
            ])
            .await
            .unwrap();

        let hits = store
            .search_any_keyword("kb", &["ALICE".to_string()], 12)
            .await
            .unwrap();
        let indices: Vec<i64> = hits.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indices, vec![0, 2]);
    }

    #[tokio::test]
    async fn delete_doc_removes_only_that_generation() {
        let store = test_store().await;

        store
            .insert_batch(vec![
                (make_chunk("kb", 0, "old"), None),
                (make_chunk("other", 0, "keep"), None),
            ])
            .await
            .unwrap();

        let deleted = store.delete_doc("kb").await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.count("kb").await.unwrap(), 0);
        assert_eq!(store.count("other").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sync_status_is_a_singleton_upsert() {
        let store = test_store().await;

        assert_eq!(store.sync_status().await.unwrap().status, SyncState::Idle);

        store
            .set_sync_status(&SyncStatus {
                status: SyncState::Syncing,
                chunk_count: 0,
                doc_title: Some("staff.csv".to_string()),
                last_synced_at: None,
                error_message: None,
            })
            .await
            .unwrap();
        store
            .set_sync_status(&SyncStatus {
                status: SyncState::Done,
                chunk_count: 7,
                doc_title: Some("staff.csv".to_string()),
                last_synced_at: Some(chrono::Utc::now().to_rfc3339()),
                error_message: None,
            })
            .await
            .unwrap();

        let status = store.sync_status().await.unwrap();
        assert_eq!(status.status, SyncState::Done);
        assert_eq!(status.chunk_count, 7);

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_status")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn first_chunks_follow_chunk_index_order() {
        let store = test_store().await;

        store
            .insert_batch(vec![
                (make_chunk("kb", 2, "third"), None),
                (make_chunk("kb", 0, "first"), None),
                (make_chunk("kb", 1, "second"), None),
            ])
            .await
            .unwrap();

        let chunks = store.first_chunks("kb", 2).await.unwrap();
        let contents: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second"]);
    }
}
