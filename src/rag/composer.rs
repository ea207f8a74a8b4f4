//! Grounded prompt composition.
//!
//! The `[Row N]` bracket tokens are load-bearing: the client parses
//! them out of answer text to render citation pills, so the context
//! block and the citation instructions must keep that exact format.

use serde::{Deserialize, Serialize};

use super::retriever::RetrievedChunk;

pub const REFUSAL_SENTENCE: &str =
    "I don't have that information in the current knowledge base.";

const EXCERPT_MAX_CHARS: usize = 150;

#[derive(Debug, Clone)]
pub struct ComposedPrompt {
    pub system_prompt: String,
    pub user_prompt: String,
}

/// Snapshot reference from an answer to a chunk that grounded it.
///
/// A value copy rather than a foreign key: the chunk may be deleted by
/// the next re-sync while the message stays readable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub chunk_id: String,
    pub chunk_index: i64,
    pub excerpt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_number: Option<i64>,
    pub reference: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<u32>,
}

pub fn compose(chunks: &[RetrievedChunk], question: &str) -> ComposedPrompt {
    if chunks.is_empty() {
        return ComposedPrompt {
            system_prompt: NO_KNOWLEDGE_BASE_PROMPT.to_string(),
            user_prompt: question.to_string(),
        };
    }

    let context_block = chunks
        .iter()
        .map(|retrieved| {
            format!(
                "[Row {}]\n{}",
                reference_number(retrieved),
                retrieved.chunk.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    ComposedPrompt {
        system_prompt: format!("{}{}", GROUNDED_PROMPT_HEADER, REFUSAL_SENTENCE),
        user_prompt: format!("Data rows:\n{}\n\nQuestion: {}", context_block, question),
    }
}

/// Citation snapshots in retrieval-rank order.
pub fn build_citations(chunks: &[RetrievedChunk]) -> Vec<Citation> {
    chunks
        .iter()
        .map(|retrieved| {
            let number = reference_number(retrieved);
            Citation {
                chunk_id: retrieved.chunk.id.clone(),
                chunk_index: retrieved.chunk.chunk_index,
                excerpt: excerpt(&retrieved.chunk.content),
                row_number: retrieved.chunk.metadata.row_number,
                reference: format!("Row {}", number),
                similarity: retrieved.similarity,
            }
        })
        .collect()
}

fn reference_number(retrieved: &RetrievedChunk) -> i64 {
    retrieved
        .chunk
        .metadata
        .row_number
        .unwrap_or(retrieved.chunk.chunk_index + 1)
}

fn excerpt(content: &str) -> String {
    content.chars().take(EXCERPT_MAX_CHARS).collect()
}

const GROUNDED_PROMPT_HEADER: &str = "\
You are an assistant that answers questions from a curated data table. Follow these rules exactly:
- Answer using only the data rows provided in the message. Never use outside knowledge and never fabricate values.
- Cite every row you used with its bracket token, for example [Row 4]. Keep the token format exactly as given.
- When several rows are relevant, cite all of them.
- If the answer is not present in the provided rows, reply exactly: ";

const NO_KNOWLEDGE_BASE_PROMPT: &str = "\
There is no knowledge base available. Inform the user that no knowledge base has been synced yet and that an administrator needs to sync one before questions can be answered. Do not attempt to answer the question from outside knowledge.";
