pub mod composer;
pub mod ingest;
pub mod retriever;
pub mod sqlite;
pub mod store;

pub use composer::{build_citations, compose, Citation};
pub use ingest::{IngestPipeline, SyncOutcome};
pub use retriever::{build_retriever, RetrievedChunk, Retriever};
pub use sqlite::SqliteChunkStore;
pub use store::{ChunkRecord, ChunkStore, SyncState, SyncStatus};
