//! Conversation persistence: conversations and an append-only message log.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::core::errors::ApiError;
use crate::rag::Citation;

const DEFAULT_TITLE: &str = "New conversation";
const TITLE_MAX_CHARS: usize = 50;
const MAX_MESSAGE_LIMIT: i64 = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub role: String,
    pub content: String,
    pub citations: Vec<Citation>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct ConversationStore {
    db_path: PathBuf,
    pool: SqlitePool,
}

impl ConversationStore {
    pub async fn new(db_path: PathBuf) -> Result<Self, ApiError> {
        let connect_options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(connect_options)
            .await
            .map_err(ApiError::persistence)?;

        let store = Self { db_path, pool };
        store.init_db().await?;
        Ok(store)
    }

    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    async fn init_db(&self) -> Result<(), ApiError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL CHECK(length(trim(title)) > 0),
                created_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now')),
                updated_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now'))
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(ApiError::persistence)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                role TEXT NOT NULL CHECK(role IN ('user', 'assistant')),
                content TEXT NOT NULL,
                citations TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now')),
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(ApiError::persistence)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_conversations_user
             ON conversations(user_id, updated_at DESC)",
        )
        .execute(&self.pool)
        .await
        .map_err(ApiError::persistence)?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation
             ON messages(conversation_id, created_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(ApiError::persistence)?;

        Ok(())
    }

    pub async fn create_conversation(
        &self,
        user_id: &str,
        title: Option<String>,
    ) -> Result<Conversation, ApiError> {
        let id = Uuid::new_v4().to_string();
        let title = title
            .map(|raw| derive_title(&raw))
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_TITLE.to_string());

        sqlx::query("INSERT INTO conversations (id, user_id, title) VALUES (?1, ?2, ?3)")
            .bind(&id)
            .bind(user_id)
            .bind(&title)
            .execute(&self.pool)
            .await
            .map_err(ApiError::persistence)?;

        self.get_conversation(&id)
            .await?
            .ok_or_else(|| ApiError::Persistence("conversation vanished after insert".to_string()))
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, ApiError> {
        let row = sqlx::query(
            "SELECT id, user_id, title, created_at, updated_at FROM conversations WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(ApiError::persistence)?;

        Ok(row.map(|row| Conversation {
            id: row.get("id"),
            user_id: row.get("user_id"),
            title: row.get("title"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }))
    }

    pub async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, ApiError> {
        let rows = sqlx::query(
            "SELECT id, user_id, title, created_at, updated_at
             FROM conversations
             WHERE user_id = ?1
             ORDER BY updated_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(ApiError::persistence)?;

        Ok(rows
            .into_iter()
            .map(|row| Conversation {
                id: row.get("id"),
                user_id: row.get("user_id"),
                title: row.get("title"),
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
            })
            .collect())
    }

    /// Append one message. User messages auto-title a fresh conversation
    /// from their content.
    pub async fn append_message(
        &self,
        conversation_id: &str,
        user_id: &str,
        role: &str,
        content: &str,
        citations: &[Citation],
    ) -> Result<String, ApiError> {
        let mut tx = self.pool.begin().await.map_err(ApiError::persistence)?;

        let id = Uuid::new_v4().to_string();
        let citations_json = serde_json::to_string(citations).map_err(ApiError::internal)?;

        sqlx::query(
            "INSERT INTO messages (id, conversation_id, user_id, role, content, citations)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&id)
        .bind(conversation_id)
        .bind(user_id)
        .bind(role)
        .bind(content)
        .bind(&citations_json)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::persistence)?;

        if role == "user" {
            auto_title_tx(&mut tx, conversation_id, content).await?;
        }
        touch_conversation_tx(&mut tx, conversation_id).await?;

        tx.commit().await.map_err(ApiError::persistence)?;
        Ok(id)
    }

    pub async fn list_messages(
        &self,
        conversation_id: &str,
        limit: i64,
    ) -> Result<Vec<StoredMessage>, ApiError> {
        let limit = if limit <= 0 {
            MAX_MESSAGE_LIMIT
        } else {
            limit.min(MAX_MESSAGE_LIMIT)
        };

        let rows = sqlx::query(
            "SELECT id, conversation_id, user_id, role, content, citations, created_at
             FROM messages
             WHERE conversation_id = ?1
             ORDER BY created_at ASC, rowid ASC
             LIMIT ?2",
        )
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(ApiError::persistence)?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let citations_raw: String = row.get("citations");
                let citations =
                    serde_json::from_str::<Vec<Citation>>(&citations_raw).unwrap_or_default();
                StoredMessage {
                    id: row.get("id"),
                    conversation_id: row.get("conversation_id"),
                    user_id: row.get("user_id"),
                    role: row.get("role"),
                    content: row.get("content"),
                    citations,
                    created_at: row.get("created_at"),
                }
            })
            .collect())
    }

    pub async fn message_count(&self, conversation_id: &str) -> Result<i64, ApiError> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages WHERE conversation_id = ?1")
            .bind(conversation_id)
            .fetch_one(&self.pool)
            .await
            .map_err(ApiError::persistence)
    }
}

async fn auto_title_tx(
    tx: &mut Transaction<'_, Sqlite>,
    conversation_id: &str,
    content: &str,
) -> Result<(), ApiError> {
    let title = derive_title(content);
    if title.is_empty() {
        return Ok(());
    }

    sqlx::query("UPDATE conversations SET title = ?1 WHERE id = ?2 AND title = ?3")
        .bind(&title)
        .bind(conversation_id)
        .bind(DEFAULT_TITLE)
        .execute(&mut **tx)
        .await
        .map_err(ApiError::persistence)?;
    Ok(())
}

async fn touch_conversation_tx(
    tx: &mut Transaction<'_, Sqlite>,
    conversation_id: &str,
) -> Result<(), ApiError> {
    sqlx::query(
        "UPDATE conversations SET updated_at = STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id = ?1",
    )
    .bind(conversation_id)
    .execute(&mut **tx)
    .await
    .map_err(ApiError::persistence)?;
    Ok(())
}

/// First 50 chars of the trimmed content, `…` appended when truncated.
fn derive_title(content: &str) -> String {
    let trimmed = content.trim();
    let mut title: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
    if trimmed.chars().count() > TITLE_MAX_CHARS {
        title.push('…');
    }
    title
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> (ConversationStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path().join("history.db"))
            .await
            .unwrap();
        (store, dir)
    }

    fn citation(reference: &str) -> Citation {
        Citation {
            chunk_id: "c1".to_string(),
            chunk_index: 0,
            excerpt: "name: Alice; age: 30".to_string(),
            row_number: Some(2),
            reference: reference.to_string(),
            similarity: Some(90),
        }
    }

    #[tokio::test]
    async fn conversations_are_scoped_to_their_user() {
        let (store, _dir) = test_store().await;

        store.create_conversation("alice", None).await.unwrap();
        store.create_conversation("alice", None).await.unwrap();
        store.create_conversation("bob", None).await.unwrap();

        assert_eq!(store.list_conversations("alice").await.unwrap().len(), 2);
        assert_eq!(store.list_conversations("bob").await.unwrap().len(), 1);
        assert!(store.list_conversations("carol").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn first_user_message_sets_the_title_truncated() {
        let (store, _dir) = test_store().await;
        let conversation = store.create_conversation("alice", None).await.unwrap();
        assert_eq!(conversation.title, DEFAULT_TITLE);

        let long_question = "a".repeat(80);
        store
            .append_message(&conversation.id, "alice", "user", &long_question, &[])
            .await
            .unwrap();

        let updated = store
            .get_conversation(&conversation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.title.chars().count(), 51);
        assert!(updated.title.ends_with('…'));

        // a later user message must not re-title
        store
            .append_message(&conversation.id, "alice", "user", "second question", &[])
            .await
            .unwrap();
        let unchanged = store
            .get_conversation(&conversation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unchanged.title, updated.title);
    }

    #[tokio::test]
    async fn short_titles_are_kept_verbatim() {
        let (store, _dir) = test_store().await;
        let conversation = store.create_conversation("alice", None).await.unwrap();

        store
            .append_message(&conversation.id, "alice", "user", "How old is Alice?", &[])
            .await
            .unwrap();

        let updated = store
            .get_conversation(&conversation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.title, "How old is Alice?");
    }

    #[tokio::test]
    async fn messages_round_trip_citations_in_rank_order() {
        let (store, _dir) = test_store().await;
        let conversation = store.create_conversation("alice", None).await.unwrap();

        let citations = vec![citation("Row 3"), citation("Row 2")];
        store
            .append_message(
                &conversation.id,
                "alice",
                "assistant",
                "Bob is 25 [Row 3].",
                &citations,
            )
            .await
            .unwrap();

        let messages = store.list_messages(&conversation.id, 100).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "assistant");
        assert_eq!(messages[0].citations.len(), 2);
        assert_eq!(messages[0].citations[0].reference, "Row 3");
        assert_eq!(messages[0].citations[1].reference, "Row 2");
    }

    #[tokio::test]
    async fn messages_are_listed_in_append_order() {
        let (store, _dir) = test_store().await;
        let conversation = store.create_conversation("alice", None).await.unwrap();

        for text in ["one", "two", "three"] {
            store
                .append_message(&conversation.id, "alice", "user", text, &[])
                .await
                .unwrap();
        }

        let messages = store.list_messages(&conversation.id, 100).await.unwrap();
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two", "three"]);
        assert_eq!(store.message_count(&conversation.id).await.unwrap(), 3);
    }
}
