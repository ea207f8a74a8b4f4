use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::state::AppState;

pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let vector_mode = state.settings.upstream.embedding_model.is_some();
    Json(json!({
        "status": "ok",
        "retrieval_mode": if vector_mode { "vector" } else { "keyword" }
    }))
}
