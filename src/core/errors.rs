use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

pub const RATE_LIMIT_MESSAGE: &str = "Rate limit exceeded. Please try again in a moment.";
pub const QUOTA_MESSAGE: &str =
    "AI usage limit reached. Please check your plan and billing details.";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("retrieval failed: {0}")]
    Retrieval(String),
    #[error("Rate limit exceeded. Please try again in a moment.")]
    RateLimited,
    #[error("AI usage limit reached. Please check your plan and billing details.")]
    QuotaExceeded,
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        ApiError::Internal(err.to_string())
    }

    pub fn persistence<E: std::fmt::Display>(err: E) -> Self {
        ApiError::Persistence(err.to_string())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Retrieval(_) => StatusCode::BAD_GATEWAY,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::QuotaExceeded => StatusCode::PAYMENT_REQUIRED,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let message = match &self {
            ApiError::Unauthorized => "Unauthorized".to_string(),
            ApiError::Forbidden => "Forbidden".to_string(),
            ApiError::RateLimited => RATE_LIMIT_MESSAGE.to_string(),
            ApiError::QuotaExceeded => QUOTA_MESSAGE.to_string(),
            ApiError::BadRequest(msg)
            | ApiError::NotFound(msg)
            | ApiError::Retrieval(msg)
            | ApiError::Upstream(msg)
            | ApiError::Persistence(msg)
            | ApiError::Internal(msg) => msg.clone(),
        };

        let body = Json(json!({ "error": message }));
        (status, body).into_response()
    }
}
