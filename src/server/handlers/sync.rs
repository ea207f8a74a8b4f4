use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::core::errors::ApiError;
use crate::state::AppState;

const DEFAULT_SOURCE_LABEL: &str = "knowledge base";

#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    /// Raw CSV; one chunk per data row.
    pub raw_table: Option<String>,
    /// Free text; sliding-window chunks.
    pub content: Option<String>,
    pub source_label: Option<String>,
}

pub async fn sync(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<SyncRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.auth.require_admin(&headers)?;

    let label = payload
        .source_label
        .filter(|label| !label.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SOURCE_LABEL.to_string());

    let outcome = if let Some(raw) = payload.raw_table.filter(|raw| !raw.trim().is_empty()) {
        state.ingest.sync_table(&raw, &label).await?
    } else if let Some(content) = payload.content.filter(|content| !content.trim().is_empty()) {
        state.ingest.sync_text(&content, &label).await?
    } else {
        return Err(ApiError::BadRequest(
            "raw_table or content is required".to_string(),
        ));
    };

    Ok(Json(json!({
        "chunk_count": outcome.chunk_count,
        "row_count": outcome.row_count
    })))
}

pub async fn sync_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    state.auth.require_user(&headers)?;
    let status = state.chunks.sync_status().await?;
    Ok(Json(status))
}
