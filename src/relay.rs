//! Streaming Completion Relay.
//!
//! Forwards upstream completion fragments to the caller as
//! Server-Sent-Events and persists the finished answer exactly once.
//!
//! Strategy: persist-after-forward. Fragments are forwarded in upstream
//! order as they arrive; the assistant message row is written only
//! after the upstream stream ends, from the accumulated buffer. The
//! relay task is detached from the HTTP body, so a client disconnect
//! stops delivery but not accumulation or the final insert.
//!
//! Wire protocol, in order:
//!   1. `event: citations` with the citation array, before any tokens
//!   2. `data: {"choices":[{"delta":{"content": ...}}]}` per fragment
//!   3. `data: [DONE]`
//! A failure after the preamble is signaled as an `event: error` record
//! and the stream closes without `[DONE]`.

use axum::body::{Body, Bytes};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;

use crate::core::errors::ApiError;
use crate::history::ConversationStore;
use crate::rag::Citation;

pub const DONE_FRAME: &str = "data: [DONE]\n\n";

pub fn citations_frame(citations: &[Citation]) -> String {
    let payload = serde_json::to_string(citations).unwrap_or_else(|_| "[]".to_string());
    format!("event: citations\ndata: {}\n\n", payload)
}

pub fn delta_frame(fragment: &str) -> String {
    let payload = serde_json::json!({"choices": [{"delta": {"content": fragment}}]});
    format!("data: {}\n\n", payload)
}

pub fn error_frame(message: &str) -> String {
    let payload = serde_json::json!({"error": message});
    format!("event: error\ndata: {}\n\n", payload)
}

/// Spawn the relay task and return the channel of outgoing SSE frames.
///
/// Frame delivery failures (client gone) are ignored; the task keeps
/// draining upstream so the paid completion still gets persisted.
pub fn run_relay(
    history: ConversationStore,
    mut upstream: mpsc::Receiver<Result<String, ApiError>>,
    citations: Vec<Citation>,
    conversation_id: String,
    user_id: String,
) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel::<Bytes>(64);

    tokio::spawn(async move {
        let _ = tx.send(Bytes::from(citations_frame(&citations))).await;

        let mut full_answer = String::new();
        let mut upstream_error: Option<ApiError> = None;

        while let Some(item) = upstream.recv().await {
            match item {
                Ok(fragment) => {
                    full_answer.push_str(&fragment);
                    let _ = tx.send(Bytes::from(delta_frame(&fragment))).await;
                }
                Err(err) => {
                    upstream_error = Some(err);
                    break;
                }
            }
        }

        if let Some(err) = upstream_error {
            tracing::error!("Upstream completion stream failed: {}", err);
            let _ = tx.send(Bytes::from(error_frame(&err.to_string()))).await;
            return;
        }

        if let Err(err) = history
            .append_message(
                &conversation_id,
                &user_id,
                "assistant",
                &full_answer,
                &citations,
            )
            .await
        {
            tracing::error!("Failed to persist assistant message: {}", err);
            let _ = tx
                .send(Bytes::from(error_frame("failed to persist answer")))
                .await;
            return;
        }

        let _ = tx.send(Bytes::from(DONE_FRAME)).await;
    });

    rx
}

/// Relay an upstream completion stream as an SSE response.
pub fn stream_answer(
    history: ConversationStore,
    upstream: mpsc::Receiver<Result<String, ApiError>>,
    citations: Vec<Citation>,
    conversation_id: String,
    user_id: String,
) -> Response {
    let rx = run_relay(history, upstream, citations, conversation_id, user_id);

    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|bytes| (Ok::<_, std::convert::Infallible>(bytes), rx))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|err| {
            tracing::error!("Failed to build SSE response: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::sse::SseDecoder;

    async fn test_history() -> (ConversationStore, tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path().join("history.db"))
            .await
            .unwrap();
        let conversation = store.create_conversation("alice", None).await.unwrap();
        let id = conversation.id;
        (store, dir, id)
    }

    fn citation() -> Citation {
        Citation {
            chunk_id: "c1".to_string(),
            chunk_index: 0,
            excerpt: "name: Alice; age: 30".to_string(),
            row_number: Some(2),
            reference: "Row 2".to_string(),
            similarity: Some(90),
        }
    }

    fn upstream_of(fragments: &[&str]) -> mpsc::Receiver<Result<String, ApiError>> {
        let (tx, rx) = mpsc::channel(16);
        let fragments: Vec<String> = fragments.iter().map(|s| s.to_string()).collect();
        tokio::spawn(async move {
            for fragment in fragments {
                if tx.send(Ok(fragment)).await.is_err() {
                    return;
                }
            }
        });
        rx
    }

    async fn collect_frames(mut rx: mpsc::Receiver<Bytes>) -> Vec<u8> {
        let mut bytes = Vec::new();
        while let Some(frame) = rx.recv().await {
            bytes.extend_from_slice(&frame);
        }
        bytes
    }

    #[tokio::test]
    async fn round_trip_reconstructs_the_accumulated_answer() {
        let (history, _dir, conversation_id) = test_history().await;

        let upstream = upstream_of(&["Alice ", "is 30 ", "years old ", "[Row 2]."]);
        let rx = run_relay(
            history.clone(),
            upstream,
            vec![citation()],
            conversation_id.clone(),
            "alice".to_string(),
        );
        let raw = collect_frames(rx).await;

        // replay through the client's line-buffering decoder in tiny reads
        let mut decoder = SseDecoder::new();
        for piece in raw.chunks(3) {
            decoder.push(piece);
        }

        assert!(decoder.done);
        assert_eq!(decoder.answer, "Alice is 30 years old [Row 2].");

        let citations = decoder.citations.unwrap();
        assert_eq!(citations[0]["reference"], "Row 2");
        assert_eq!(citations[0]["similarity"], 90);

        let messages = history.list_messages(&conversation_id, 100).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, decoder.answer);
        assert_eq!(messages[0].citations.len(), 1);
    }

    #[tokio::test]
    async fn persists_exactly_once_regardless_of_fragmentation() {
        let (history, _dir, conversation_id) = test_history().await;

        for fragments in [
            vec!["Bob is 25 [Row 3]."],
            vec!["Bob ", "is 25 ", "[Row 3]."],
            vec!["B", "o", "b", " is 25 [Row 3]."],
        ] {
            let upstream = upstream_of(&fragments);
            let rx = run_relay(
                history.clone(),
                upstream,
                Vec::new(),
                conversation_id.clone(),
                "alice".to_string(),
            );
            let _ = collect_frames(rx).await;
        }

        assert_eq!(history.message_count(&conversation_id).await.unwrap(), 3);
        let messages = history.list_messages(&conversation_id, 100).await.unwrap();
        assert!(messages
            .iter()
            .all(|m| m.content == "Bob is 25 [Row 3]." && m.role == "assistant"));
    }

    #[tokio::test]
    async fn client_disconnect_does_not_lose_the_answer() {
        let (history, _dir, conversation_id) = test_history().await;

        let upstream = upstream_of(&["the full ", "answer"]);
        let rx = run_relay(
            history.clone(),
            upstream,
            Vec::new(),
            conversation_id.clone(),
            "alice".to_string(),
        );
        drop(rx); // client gone before any byte was read

        // the detached task still completes persistence
        let mut persisted = 0;
        for _ in 0..50 {
            persisted = history.message_count(&conversation_id).await.unwrap();
            if persisted == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(persisted, 1);

        let messages = history.list_messages(&conversation_id, 100).await.unwrap();
        assert_eq!(messages[0].content, "the full answer");
    }

    #[tokio::test]
    async fn upstream_failure_emits_error_and_skips_persistence() {
        let (history, _dir, conversation_id) = test_history().await;

        let (tx, upstream) = mpsc::channel(4);
        tokio::spawn(async move {
            let _ = tx.send(Ok("partial ".to_string())).await;
            let _ = tx
                .send(Err(ApiError::Upstream("connection reset".to_string())))
                .await;
        });

        let rx = run_relay(
            history.clone(),
            upstream,
            Vec::new(),
            conversation_id.clone(),
            "alice".to_string(),
        );
        let raw = collect_frames(rx).await;

        let mut decoder = SseDecoder::new();
        decoder.push(&raw);

        assert!(!decoder.done, "failed stream must not end with [DONE]");
        assert!(decoder.error.is_some());
        assert_eq!(history.message_count(&conversation_id).await.unwrap(), 0);
    }

    #[test]
    fn frames_are_bit_exact() {
        assert_eq!(
            delta_frame("hi"),
            "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n"
        );
        assert_eq!(DONE_FRAME, "data: [DONE]\n\n");
        assert!(citations_frame(&[]).starts_with("event: citations\ndata: "));
        assert!(citations_frame(&[]).ends_with("\n\n"));
    }
}
