//! Retrieval strategies: vector similarity or keyword overlap.
//!
//! One strategy is selected at startup from deployment settings; both
//! answer `top_k(question)` with chunks ranked most-relevant-first.

use std::sync::Arc;

use async_trait::async_trait;

use super::store::{ChunkRecord, ChunkStore};
use crate::core::config::RetrievalSettings;
use crate::core::errors::ApiError;
use crate::llm::LlmProvider;

/// A retrieved chunk with its relevance signal (percent, vector mode only).
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk: ChunkRecord,
    pub similarity: Option<u32>,
}

#[async_trait]
pub trait Retriever: Send + Sync {
    async fn top_k(&self, question: &str) -> Result<Vec<RetrievedChunk>, ApiError>;
}

/// Embeds the question and ranks chunks by cosine similarity.
///
/// An empty result (nothing over the threshold) is a valid no-context
/// outcome; only collaborator failures are errors.
pub struct VectorRetriever {
    store: Arc<dyn ChunkStore>,
    embedder: Arc<dyn LlmProvider>,
    doc_id: String,
    threshold: f32,
    top_k: usize,
}

impl VectorRetriever {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        embedder: Arc<dyn LlmProvider>,
        settings: &RetrievalSettings,
    ) -> Self {
        VectorRetriever {
            store,
            embedder,
            doc_id: settings.doc_id.clone(),
            threshold: settings.similarity_threshold,
            top_k: settings.vector_top_k,
        }
    }
}

#[async_trait]
impl Retriever for VectorRetriever {
    async fn top_k(&self, question: &str) -> Result<Vec<RetrievedChunk>, ApiError> {
        let embeddings = self
            .embedder
            .embed(&[question.to_string()])
            .await
            .map_err(|err| ApiError::Retrieval(err.to_string()))?;
        let query = embeddings
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::Retrieval("embedding service returned no vector".to_string()))?;

        let matches = self
            .store
            .match_chunks(&self.doc_id, &query, self.threshold, self.top_k)
            .await
            .map_err(|err| ApiError::Retrieval(err.to_string()))?;

        Ok(matches
            .into_iter()
            .map(|m| RetrievedChunk {
                similarity: Some((m.similarity * 100.0).round() as u32),
                chunk: m.chunk,
            })
            .collect())
    }
}

/// Scores candidates by distinct-keyword overlap; no embedding dependency.
///
/// When no keywords survive filtering or nothing matches, falls back to
/// the first chunks of the knowledge base so the model always gets some
/// grounding context when any chunks exist.
pub struct KeywordRetriever {
    store: Arc<dyn ChunkStore>,
    doc_id: String,
    top_k: usize,
    candidate_limit: usize,
    max_keywords: usize,
}

impl KeywordRetriever {
    pub fn new(store: Arc<dyn ChunkStore>, settings: &RetrievalSettings) -> Self {
        KeywordRetriever {
            store,
            doc_id: settings.doc_id.clone(),
            top_k: settings.keyword_top_k,
            candidate_limit: settings.keyword_candidates,
            max_keywords: settings.max_keywords,
        }
    }

    async fn fallback(&self) -> Result<Vec<RetrievedChunk>, ApiError> {
        let chunks = self
            .store
            .first_chunks(&self.doc_id, self.top_k)
            .await
            .map_err(|err| ApiError::Retrieval(err.to_string()))?;
        Ok(chunks
            .into_iter()
            .map(|chunk| RetrievedChunk {
                chunk,
                similarity: None,
            })
            .collect())
    }
}

#[async_trait]
impl Retriever for KeywordRetriever {
    async fn top_k(&self, question: &str) -> Result<Vec<RetrievedChunk>, ApiError> {
        let keywords = extract_keywords(question, self.max_keywords);
        if keywords.is_empty() {
            return self.fallback().await;
        }

        let candidates = self
            .store
            .search_any_keyword(&self.doc_id, &keywords, self.candidate_limit)
            .await
            .map_err(|err| ApiError::Retrieval(err.to_string()))?;
        if candidates.is_empty() {
            return self.fallback().await;
        }

        let mut scored: Vec<(usize, ChunkRecord)> = candidates
            .into_iter()
            .map(|chunk| {
                let haystack = chunk.content.to_lowercase();
                let score = keywords
                    .iter()
                    .filter(|keyword| haystack.contains(keyword.as_str()))
                    .count();
                (score, chunk)
            })
            .collect();

        // stable sort: equal scores keep the store's natural order
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.truncate(self.top_k);

        Ok(scored
            .into_iter()
            .map(|(_, chunk)| RetrievedChunk {
                chunk,
                similarity: None,
            })
            .collect())
    }
}

/// Lowercase alphanumeric words, stop words and short words dropped,
/// first `max` distinct keywords kept in question order.
pub fn extract_keywords(question: &str, max: usize) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();

    for word in question
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
    {
        if word.len() <= 2 || STOP_WORDS.contains(&word) {
            continue;
        }
        if keywords.iter().any(|existing| existing == word) {
            continue;
        }
        keywords.push(word.to_string());
        if keywords.len() == max {
            break;
        }
    }

    keywords
}

pub fn build_retriever(
    store: Arc<dyn ChunkStore>,
    embedder: Option<Arc<dyn LlmProvider>>,
    settings: &RetrievalSettings,
) -> Arc<dyn Retriever> {
    match embedder {
        Some(embedder) => Arc::new(VectorRetriever::new(store, embedder, settings)),
        None => Arc::new(KeywordRetriever::new(store, settings)),
    }
}

const STOP_WORDS: &[&str] = &[
    "about", "after", "all", "also", "and", "any", "are", "because", "been", "before", "being",
    "between", "both", "but", "can", "could", "did", "does", "down", "each", "few", "for", "from",
    "further", "had", "has", "have", "having", "her", "here", "hers", "him", "his", "how", "into",
    "its", "just", "like", "more", "most", "nor", "not", "now", "off", "once", "only", "other",
    "our", "out", "over", "own", "same", "she", "should", "some", "such", "than", "that", "the",
    "their", "them", "then", "there", "these", "they", "this", "those", "through", "too", "under",
    "until", "very", "was", "were", "what", "when", "where", "which", "while", "who", "whom",
    "why", "will", "with", "would", "you", "your",
];
