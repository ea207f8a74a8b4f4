use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::core::errors::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    pub title: Option<String>,
}

pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user = state.auth.require_user(&headers)?;
    let conversations = state.history.list_conversations(&user.user_id).await?;
    Ok(Json(json!({ "conversations": conversations })))
}

pub async fn create_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CreateConversationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state.auth.require_user(&headers)?;
    let conversation = state
        .history
        .create_conversation(&user.user_id, payload.title)
        .await?;
    Ok(Json(json!({ "conversation": conversation })))
}

pub async fn get_conversation_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state.auth.require_user(&headers)?;

    let conversation = state
        .history
        .get_conversation(&conversation_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Conversation not found".to_string()))?;
    if conversation.user_id != user.user_id {
        return Err(ApiError::Forbidden);
    }

    let limit = params
        .get("limit")
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(100);
    let messages = state.history.list_messages(&conversation_id, limit).await?;

    Ok(Json(json!({
        "conversation": conversation,
        "messages": messages
    })))
}
