//! OpenAI-compatible completion and embedding client.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::provider::LlmProvider;
use super::sse::SseLineBuffer;
use super::types::ChatRequest;
use crate::core::config::UpstreamSettings;
use crate::core::errors::ApiError;

#[derive(Clone)]
pub struct OpenAiProvider {
    client: Client,
    base_url: String,
    api_key: String,
    chat_model: String,
    embedding_model: Option<String>,
    temperature: f64,
    max_tokens: i32,
    chat_timeout: Duration,
    embed_timeout: Duration,
}

impl OpenAiProvider {
    pub fn new(settings: &UpstreamSettings) -> Self {
        OpenAiProvider {
            client: Client::new(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            chat_model: settings.chat_model.clone(),
            embedding_model: settings.embedding_model.clone(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            chat_timeout: Duration::from_secs(settings.chat_timeout_secs),
            embed_timeout: Duration::from_secs(settings.embed_timeout_secs),
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn stream_chat(
        &self,
        request: ChatRequest,
    ) -> Result<mpsc::Receiver<Result<String, ApiError>>, ApiError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": self.chat_model,
            "messages": request.messages,
            "temperature": request.temperature.unwrap_or(self.temperature),
            "max_tokens": request.max_tokens.unwrap_or(self.max_tokens),
            "stream": true,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.chat_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|err| ApiError::Upstream(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(map_upstream_error(status, &text));
        }

        let (tx, rx) = mpsc::channel(64);
        let mut stream = response.bytes_stream();

        tokio::spawn(async move {
            let mut lines = SseLineBuffer::new();

            while let Some(item) = stream.next().await {
                match item {
                    Ok(bytes) => {
                        lines.push(&bytes);
                        while let Some(line) = lines.next_line() {
                            if line.is_empty() || line.starts_with(':') {
                                continue;
                            }
                            let Some(payload) = line.strip_prefix("data:") else {
                                continue;
                            };
                            let data = payload.trim();
                            if data == "[DONE]" {
                                return;
                            }
                            if let Ok(value) = serde_json::from_str::<Value>(data) {
                                if let Some(content) = extract_delta(&value) {
                                    if !content.is_empty()
                                        && tx.send(Ok(content)).await.is_err()
                                    {
                                        return;
                                    }
                                }
                            }
                        }
                    }
                    Err(err) => {
                        let _ = tx.send(Err(ApiError::Upstream(err.to_string()))).await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ApiError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let model = self
            .embedding_model
            .clone()
            .ok_or_else(|| ApiError::BadRequest("embedding model not configured".to_string()))?;

        let url = format!("{}/embeddings", self.base_url);
        let body = json!({
            "model": model,
            "input": inputs,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.embed_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|err| ApiError::Upstream(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(map_upstream_error(status, &text));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|err| ApiError::Upstream(err.to_string()))?;
        parse_embedding_response(&payload)
    }
}

fn map_upstream_error(status: StatusCode, body: &str) -> ApiError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimited,
        StatusCode::PAYMENT_REQUIRED => ApiError::QuotaExceeded,
        _ => ApiError::Upstream(format!("{} {}", status, body)),
    }
}

fn extract_delta(payload: &Value) -> Option<String> {
    let choice = payload
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first());
    let delta = choice.and_then(|c| c.get("delta"));
    if let Some(content) = delta
        .and_then(|d| d.get("content"))
        .and_then(|v| v.as_str())
    {
        return Some(content.to_string());
    }
    // some servers send final messages without a delta wrapper
    if let Some(content) = choice
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_str())
    {
        return Some(content.to_string());
    }
    None
}

fn parse_embedding_response(payload: &Value) -> Result<Vec<Vec<f32>>, ApiError> {
    let Some(data) = payload.get("data").and_then(|v| v.as_array()) else {
        return Err(ApiError::Upstream(
            "embedding response missing data array".to_string(),
        ));
    };

    let mut indexed = Vec::with_capacity(data.len());
    for (fallback_idx, item) in data.iter().enumerate() {
        let Some(values) = item.get("embedding").and_then(|v| v.as_array()) else {
            return Err(ApiError::Upstream(
                "embedding response item missing embedding array".to_string(),
            ));
        };

        let mut embedding = Vec::with_capacity(values.len());
        for value in values {
            let Some(float_value) = value.as_f64() else {
                return Err(ApiError::Upstream(
                    "embedding contains non-numeric value".to_string(),
                ));
            };
            embedding.push(float_value as f32);
        }

        let index = item
            .get("index")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(fallback_idx);
        indexed.push((index, embedding));
    }

    indexed.sort_by_key(|(idx, _)| *idx);
    Ok(indexed.into_iter().map(|(_, embedding)| embedding).collect())
}
