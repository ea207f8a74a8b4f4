use std::sync::Arc;

use thiserror::Error;

use crate::core::config::{AppPaths, Settings};
use crate::core::security::Authenticator;
use crate::history::ConversationStore;
use crate::llm::{LlmProvider, OpenAiProvider};
use crate::rag::{build_retriever, ChunkStore, IngestPipeline, Retriever, SqliteChunkStore};

#[derive(Debug, Error)]
pub enum InitializationError {
    #[error("Failed to initialize chunk store: {0}")]
    Chunks(#[source] anyhow::Error),

    #[error("Failed to initialize conversation store: {0}")]
    History(#[source] anyhow::Error),
}

/// Global application state shared across all routes and background tasks.
pub struct AppState {
    pub paths: Arc<AppPaths>,
    pub settings: Settings,
    pub auth: Authenticator,
    pub chunks: Arc<dyn ChunkStore>,
    pub history: ConversationStore,
    pub llm: Arc<dyn LlmProvider>,
    pub retriever: Arc<dyn Retriever>,
    pub ingest: Arc<IngestPipeline>,
}

impl AppState {
    pub async fn initialize() -> Result<Arc<Self>, InitializationError> {
        let paths = Arc::new(AppPaths::new());
        let settings = Settings::load(&paths);
        let auth = Authenticator::from_settings(&settings.auth);

        let chunks: Arc<dyn ChunkStore> = Arc::new(
            SqliteChunkStore::new(paths.chunks_db_path.clone())
                .await
                .map_err(|e| InitializationError::Chunks(e.into()))?,
        );
        let history = ConversationStore::new(paths.history_db_path.clone())
            .await
            .map_err(|e| InitializationError::History(e.into()))?;

        let llm: Arc<dyn LlmProvider> = Arc::new(OpenAiProvider::new(&settings.upstream));
        let embedder: Option<Arc<dyn LlmProvider>> = settings
            .upstream
            .embedding_model
            .as_ref()
            .map(|_| llm.clone());

        match &settings.upstream.embedding_model {
            Some(model) => {
                tracing::info!("Vector retrieval enabled (embedding model: {})", model)
            }
            None => tracing::info!("Keyword retrieval enabled (no embedding model configured)"),
        }

        let retriever = build_retriever(chunks.clone(), embedder.clone(), &settings.retrieval);
        let ingest = Arc::new(IngestPipeline::new(
            chunks.clone(),
            embedder,
            settings.retrieval.doc_id.clone(),
        ));

        Ok(Arc::new(AppState {
            paths,
            settings,
            auth,
            chunks,
            history,
            llm,
            retriever,
            ingest,
        }))
    }
}
