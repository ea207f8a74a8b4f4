//! Ingestion pipeline: raw tabular (or free-text) source → chunk generation.
//!
//! A sync fully replaces the generation for the configured doc id:
//! delete-then-batch-insert, with SyncStatus transitions around it.
//! The delete and the inserts are deliberately not one transaction; a
//! failed sync leaves an `error` status that operators heal by
//! re-syncing.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use super::store::{ChunkMetadata, ChunkRecord, ChunkStore, SyncState, SyncStatus};
use crate::core::errors::ApiError;
use crate::llm::LlmProvider;

const INSERT_BATCH_SIZE: usize = 50;
const TEXT_CHUNK_SIZE: usize = 2000;
const TEXT_CHUNK_OVERLAP: usize = 200;

#[derive(Debug, Clone, Copy)]
pub struct SyncOutcome {
    pub chunk_count: usize,
    pub row_count: usize,
}

pub struct IngestPipeline {
    store: Arc<dyn ChunkStore>,
    embedder: Option<Arc<dyn LlmProvider>>,
    doc_id: String,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        embedder: Option<Arc<dyn LlmProvider>>,
        doc_id: impl Into<String>,
    ) -> Self {
        IngestPipeline {
            store,
            embedder,
            doc_id: doc_id.into(),
        }
    }

    /// Sync a raw CSV table: one chunk per non-empty data row.
    pub async fn sync_table(
        &self,
        raw_table: &str,
        source_label: &str,
    ) -> Result<SyncOutcome, ApiError> {
        let outcome = self.run_table_sync(raw_table, source_label).await;
        self.record_failure(&outcome, source_label).await;
        outcome
    }

    /// Sync free text: fixed-size sliding-window chunks.
    pub async fn sync_text(
        &self,
        content: &str,
        source_label: &str,
    ) -> Result<SyncOutcome, ApiError> {
        let outcome = self.run_text_sync(content, source_label).await;
        self.record_failure(&outcome, source_label).await;
        outcome
    }

    async fn run_table_sync(
        &self,
        raw_table: &str,
        source_label: &str,
    ) -> Result<SyncOutcome, ApiError> {
        let rows = parse_csv(raw_table);
        if rows.len() < 2 {
            return Err(ApiError::BadRequest(
                "table must include a header row and at least one data row".to_string(),
            ));
        }

        let headers = &rows[0];
        let data_rows = &rows[1..];
        let now = Utc::now().to_rfc3339();

        let chunks: Vec<ChunkRecord> = data_rows
            .iter()
            .enumerate()
            .filter(|(_, row)| !row.iter().all(|field| field.trim().is_empty()))
            .map(|(position, row)| {
                let content = row_content(headers, row);
                ChunkRecord {
                    id: Uuid::new_v4().to_string(),
                    doc_id: self.doc_id.clone(),
                    chunk_index: position as i64,
                    token_count: estimate_tokens(&content),
                    content,
                    metadata: ChunkMetadata {
                        // +2: 1-based rows with the header at row 1
                        row_number: Some(position as i64 + 2),
                        headers: headers.clone(),
                        source: source_label.to_string(),
                    },
                    created_at: now.clone(),
                    updated_at: now.clone(),
                }
            })
            .collect();

        let chunk_count = self
            .replace_generation(chunks, source_label)
            .await?;

        Ok(SyncOutcome {
            chunk_count,
            row_count: data_rows.len(),
        })
    }

    async fn run_text_sync(
        &self,
        content: &str,
        source_label: &str,
    ) -> Result<SyncOutcome, ApiError> {
        if content.trim().is_empty() {
            return Err(ApiError::BadRequest("content is empty".to_string()));
        }

        let now = Utc::now().to_rfc3339();
        let windows = window_chunks(content, TEXT_CHUNK_SIZE, TEXT_CHUNK_OVERLAP);
        let chunks: Vec<ChunkRecord> = windows
            .into_iter()
            .enumerate()
            .map(|(position, text)| ChunkRecord {
                id: Uuid::new_v4().to_string(),
                doc_id: self.doc_id.clone(),
                chunk_index: position as i64,
                token_count: estimate_tokens(&text),
                content: text,
                metadata: ChunkMetadata {
                    row_number: None,
                    headers: Vec::new(),
                    source: source_label.to_string(),
                },
                created_at: now.clone(),
                updated_at: now.clone(),
            })
            .collect();

        let row_count = chunks.len();
        let chunk_count = self
            .replace_generation(chunks, source_label)
            .await?;

        Ok(SyncOutcome {
            chunk_count,
            row_count,
        })
    }

    /// Delete the previous generation and insert the new one in batches.
    async fn replace_generation(
        &self,
        chunks: Vec<ChunkRecord>,
        source_label: &str,
    ) -> Result<usize, ApiError> {
        self.store
            .set_sync_status(&SyncStatus {
                status: SyncState::Syncing,
                chunk_count: 0,
                doc_title: Some(source_label.to_string()),
                last_synced_at: None,
                error_message: None,
            })
            .await?;

        let removed = self.store.delete_doc(&self.doc_id).await?;
        if removed > 0 {
            tracing::info!("Replaced {} chunks of previous generation", removed);
        }

        let total = chunks.len();
        for batch in chunks.chunks(INSERT_BATCH_SIZE) {
            let embeddings = match &self.embedder {
                Some(embedder) => {
                    let inputs: Vec<String> =
                        batch.iter().map(|chunk| chunk.content.clone()).collect();
                    let vectors = embedder.embed(&inputs).await?;
                    if vectors.len() != batch.len() {
                        return Err(ApiError::Upstream(format!(
                            "embedding count mismatch: {} inputs, {} vectors",
                            batch.len(),
                            vectors.len()
                        )));
                    }
                    vectors.into_iter().map(Some).collect()
                }
                None => vec![None; batch.len()],
            };

            let items: Vec<(ChunkRecord, Option<Vec<f32>>)> = batch
                .iter()
                .cloned()
                .zip(embeddings)
                .collect();
            self.store.insert_batch(items).await?;
        }

        self.store
            .set_sync_status(&SyncStatus {
                status: SyncState::Done,
                chunk_count: total as i64,
                doc_title: Some(source_label.to_string()),
                last_synced_at: Some(Utc::now().to_rfc3339()),
                error_message: None,
            })
            .await?;

        tracing::info!("Synced {} chunks from {}", total, source_label);
        Ok(total)
    }

    async fn record_failure(&self, outcome: &Result<SyncOutcome, ApiError>, source_label: &str) {
        let Err(err) = outcome else {
            return;
        };

        let status = SyncStatus {
            status: SyncState::Error,
            chunk_count: 0,
            doc_title: Some(source_label.to_string()),
            last_synced_at: None,
            error_message: Some(err.to_string()),
        };
        if let Err(status_err) = self.store.set_sync_status(&status).await {
            tracing::error!("Failed to record sync error status: {}", status_err);
        }
    }
}

/// Minimal RFC-4180 parser: quoted fields may contain commas, newlines
/// and doubled quotes; CRLF line endings are tolerated. Blank lines are
/// dropped.
pub fn parse_csv(raw: &str) -> Vec<Vec<String>> {
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;

    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                _ => field.push(c),
            }
            continue;
        }

        match c {
            '"' => in_quotes = true,
            ',' => row.push(std::mem::take(&mut field)),
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                end_row(&mut rows, &mut row, &mut field);
            }
            '\n' => end_row(&mut rows, &mut row, &mut field),
            _ => field.push(c),
        }
    }
    end_row(&mut rows, &mut row, &mut field);

    rows
}

fn end_row(rows: &mut Vec<Vec<String>>, row: &mut Vec<String>, field: &mut String) {
    if row.is_empty() && field.is_empty() {
        return;
    }
    row.push(std::mem::take(field));
    rows.push(std::mem::take(row));
}

/// `"Header1: Value1; Header2: Value2"`, omitting pairs with empty values.
pub fn row_content(headers: &[String], row: &[String]) -> String {
    headers
        .iter()
        .zip(row.iter())
        .filter(|(_, value)| !value.trim().is_empty())
        .map(|(header, value)| format!("{}: {}", header.trim(), value.trim()))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Fixed-size sliding window over characters.
pub fn window_chunks(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    if total == 0 {
        return Vec::new();
    }

    let step = chunk_size.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < total {
        let end = (start + chunk_size).min(total);
        let chunk: String = chars[start..end].iter().collect();
        let trimmed = chunk.trim();
        if !trimmed.is_empty() {
            chunks.push(trimmed.to_string());
        }
        if end == total {
            break;
        }
        start += step;
    }

    chunks
}

fn estimate_tokens(content: &str) -> i64 {
    (content.chars().count() as i64 + 3) / 4
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::sqlite::SqliteChunkStore;

    async fn pipeline() -> (IngestPipeline, Arc<SqliteChunkStore>) {
        let tmp = std::env::temp_dir().join(format!("tabula-ingest-test-{}.db", Uuid::new_v4()));
        let store = Arc::new(SqliteChunkStore::new(tmp).await.unwrap());
        let pipeline = IngestPipeline::new(store.clone(), None, "knowledge-base");
        (pipeline, store)
    }

    #[test]
    fn parse_csv_handles_quoted_commas_newlines_and_escaped_quotes() {
        let raw = "name,notes\r\nAlice,\"likes a, b\"\nBob,\"line1\nline2\"\nCarol,\"say \"\"hi\"\"\"\n";
        let rows = parse_csv(raw);

        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0], vec!["name", "notes"]);
        assert_eq!(rows[1], vec!["Alice", "likes a, b"]);
        assert_eq!(rows[2], vec!["Bob", "line1\nline2"]);
        assert_eq!(rows[3], vec!["Carol", "say \"hi\""]);
    }

    #[test]
    fn parse_csv_drops_blank_lines() {
        let rows = parse_csv("a,b\n\n1,2\n");
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn row_content_omits_empty_values() {
        let headers = vec!["name".to_string(), "age".to_string(), "city".to_string()];
        let row = vec!["Bob".to_string(), "".to_string(), "Berlin".to_string()];
        assert_eq!(row_content(&headers, &row), "name: Bob; city: Berlin");
    }

    #[test]
    fn window_chunks_overlap_and_cover_the_text() {
        let text = "x".repeat(4500);
        let chunks = window_chunks(&text, 2000, 200);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 2000);
        assert_eq!(chunks[1].len(), 2000);
        // last window starts at 3600
        assert_eq!(chunks[2].len(), 900);
    }

    #[tokio::test]
    async fn sync_produces_one_chunk_per_data_row_with_row_numbers() {
        let (pipeline, store) = pipeline().await;

        let outcome = pipeline
            .sync_table("name,age\nAlice,30\nBob,25", "staff.csv")
            .await
            .unwrap();
        assert_eq!(outcome.chunk_count, 2);
        assert_eq!(outcome.row_count, 2);

        let chunks = store.first_chunks("knowledge-base", 10).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].content, "name: Bob; age: 25");
        assert_eq!(chunks[1].metadata.row_number, Some(3));
        assert_eq!(chunks[0].metadata.row_number, Some(2));

        let status = store.sync_status().await.unwrap();
        assert_eq!(status.status, SyncState::Done);
        assert_eq!(status.chunk_count, 2);
        assert_eq!(status.doc_title.as_deref(), Some("staff.csv"));
        assert!(status.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn resync_replaces_the_previous_generation() {
        let (pipeline, store) = pipeline().await;

        pipeline
            .sync_table("name,age\nAlice,30\nBob,25\nCarol,7", "v1")
            .await
            .unwrap();
        pipeline
            .sync_table("name,age\nDora,52", "v2")
            .await
            .unwrap();

        assert_eq!(store.count("knowledge-base").await.unwrap(), 1);
        let chunks = store.first_chunks("knowledge-base", 10).await.unwrap();
        assert_eq!(chunks[0].content, "name: Dora; age: 52");
    }

    #[tokio::test]
    async fn empty_rows_are_skipped_but_keep_row_numbering() {
        let (pipeline, store) = pipeline().await;

        pipeline
            .sync_table("name,age\nAlice,30\n,\nCarol,7", "gaps.csv")
            .await
            .unwrap();

        let chunks = store.first_chunks("knowledge-base", 10).await.unwrap();
        assert_eq!(chunks.len(), 2);
        // the skipped empty row still occupies source row 3
        assert_eq!(chunks[0].metadata.row_number, Some(2));
        assert_eq!(chunks[1].metadata.row_number, Some(4));
    }

    #[tokio::test]
    async fn too_small_input_fails_validation_and_records_error_status() {
        let (pipeline, store) = pipeline().await;

        let result = pipeline.sync_table("name,age", "tiny.csv").await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));

        let status = store.sync_status().await.unwrap();
        assert_eq!(status.status, SyncState::Error);
        assert!(status.error_message.is_some());
    }

    #[tokio::test]
    async fn text_sync_windows_long_content() {
        let (pipeline, store) = pipeline().await;

        let content = "word ".repeat(1000); // 5000 chars
        let outcome = pipeline.sync_text(&content, "notes.txt").await.unwrap();
        assert!(outcome.chunk_count >= 2);

        let chunks = store.first_chunks("knowledge-base", 10).await.unwrap();
        assert_eq!(chunks.len(), outcome.chunk_count);
        assert!(chunks[0].metadata.row_number.is_none());
        assert!(chunks[0].content.chars().count() <= 2000);
    }
}
