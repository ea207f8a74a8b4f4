//! ChunkStore trait — abstract interface for the knowledge-base store.
//!
//! The primary implementation is `SqliteChunkStore` in the `sqlite`
//! module. A chunk is one retrievable unit of text (usually one table
//! row) with optional embedding and a metadata snapshot.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::errors::ApiError;

/// A stored knowledge-base chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: String,
    /// Logical id of the knowledge source generation this chunk belongs to.
    pub doc_id: String,
    /// Stable position within the generation; unique per `doc_id`.
    pub chunk_index: i64,
    pub content: String,
    pub token_count: i64,
    pub metadata: ChunkMetadata,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// 1-based row in the original table, header row included
    /// (data row i maps to row i + 2). Absent for free-text chunks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_number: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<String>,
    #[serde(default)]
    pub source: String,
}

/// Result of a similarity query.
#[derive(Debug, Clone)]
pub struct ChunkMatch {
    pub chunk: ChunkRecord,
    /// Cosine similarity in `[-1, 1]`.
    pub similarity: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Syncing,
    Error,
    Done,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Syncing => "syncing",
            SyncState::Error => "error",
            SyncState::Done => "done",
        }
    }

    pub fn parse(value: &str) -> SyncState {
        match value {
            "syncing" => SyncState::Syncing,
            "error" => SyncState::Error,
            "done" => SyncState::Done,
            _ => SyncState::Idle,
        }
    }
}

/// Singleton ingestion status record; the source of truth for whether
/// the knowledge base is currently being replaced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub status: SyncState,
    pub chunk_count: i64,
    pub doc_title: Option<String>,
    pub last_synced_at: Option<String>,
    pub error_message: Option<String>,
}

impl SyncStatus {
    pub fn idle() -> Self {
        SyncStatus {
            status: SyncState::Idle,
            chunk_count: 0,
            doc_title: None,
            last_synced_at: None,
            error_message: None,
        }
    }
}

#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Insert chunks with optional embeddings in one transaction.
    async fn insert_batch(
        &self,
        items: Vec<(ChunkRecord, Option<Vec<f32>>)>,
    ) -> Result<(), ApiError>;

    /// Delete the whole generation for a doc id; returns deleted count.
    async fn delete_doc(&self, doc_id: &str) -> Result<usize, ApiError>;

    async fn count(&self, doc_id: &str) -> Result<usize, ApiError>;

    /// First chunks of the generation in `chunk_index` order.
    async fn first_chunks(&self, doc_id: &str, limit: usize) -> Result<Vec<ChunkRecord>, ApiError>;

    /// Chunks whose content contains any keyword, case-insensitive,
    /// in the store's natural (insertion) order, capped at `limit`.
    async fn search_any_keyword(
        &self,
        doc_id: &str,
        keywords: &[String],
        limit: usize,
    ) -> Result<Vec<ChunkRecord>, ApiError>;

    /// Chunks whose cosine similarity to the query exceeds `threshold`,
    /// ordered descending, capped at `limit`.
    async fn match_chunks(
        &self,
        doc_id: &str,
        query_embedding: &[f32],
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<ChunkMatch>, ApiError>;

    async fn sync_status(&self) -> Result<SyncStatus, ApiError>;

    async fn set_sync_status(&self, status: &SyncStatus) -> Result<(), ApiError>;
}
