use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use serde::Deserialize;

use crate::core::errors::ApiError;
use crate::llm::{ChatMessage, ChatRequest};
use crate::rag::{build_citations, compose};
use crate::relay;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ChatRequestBody {
    pub question: String,
    pub conversation_id: Option<String>,
}

/// Answer a question with a cited SSE stream.
///
/// Auth and validation reject before any retrieval or completion cost.
/// Upstream rejections (rate limit, quota) surface as JSON errors here;
/// once the SSE stream has started, failures become SSE error records.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<ChatRequestBody>,
) -> Result<Response, ApiError> {
    let user = state.auth.require_user(&headers)?;

    let question = payload.question.trim().to_string();
    if question.is_empty() {
        return Err(ApiError::BadRequest(
            "question must not be empty".to_string(),
        ));
    }

    let conversation = match &payload.conversation_id {
        Some(id) => {
            let conversation = state
                .history
                .get_conversation(id)
                .await?
                .ok_or_else(|| ApiError::NotFound("Conversation not found".to_string()))?;
            if conversation.user_id != user.user_id {
                return Err(ApiError::Forbidden);
            }
            conversation
        }
        None => {
            state
                .history
                .create_conversation(&user.user_id, None)
                .await?
        }
    };

    let retrieved = state.retriever.top_k(&question).await?;
    let prompt = compose(&retrieved, &question);
    let citations = build_citations(&retrieved);

    let request = ChatRequest::new(vec![
        ChatMessage::system(prompt.system_prompt),
        ChatMessage::user(prompt.user_prompt),
    ]);
    let upstream = state.llm.stream_chat(request).await?;

    state
        .history
        .append_message(&conversation.id, &user.user_id, "user", &question, &[])
        .await?;

    Ok(relay::stream_answer(
        state.history.clone(),
        upstream,
        citations,
        conversation.id,
        user.user_id,
    ))
}
