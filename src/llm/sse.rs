//! Line-buffered Server-Sent-Events decoding.
//!
//! Network reads are not aligned to SSE record boundaries, so both the
//! upstream completion client and the reference client decoder buffer
//! raw bytes and only act on complete `\n`-terminated lines.

use serde_json::Value;

/// Accumulates raw bytes and yields complete lines, trailing `\r` stripped.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buffer: String,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        SseLineBuffer::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
    }

    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.buffer.find('\n')?;
        let line = self.buffer[..pos].trim_end_matches('\r').to_string();
        self.buffer.drain(..=pos);
        Some(line)
    }

    /// Put a line back at the front, to be re-read on the next call.
    pub fn put_back(&mut self, line: &str) {
        let mut restored = String::with_capacity(line.len() + 1 + self.buffer.len());
        restored.push_str(line);
        restored.push('\n');
        restored.push_str(&self.buffer);
        self.buffer = restored;
    }
}

/// Reference client-side decoder for the relay's SSE stream.
///
/// Feed it byte chunks of any granularity; it reconstructs the
/// citations preamble and the concatenated answer. A `data:` payload
/// that fails to parse as JSON is put back and retried once more bytes
/// arrive, never discarded.
#[derive(Debug, Default)]
pub struct SseDecoder {
    lines: SseLineBuffer,
    event_name: Option<String>,
    pub citations: Option<Value>,
    pub answer: String,
    pub error: Option<String>,
    pub done: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        SseDecoder::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.lines.push(bytes);

        while let Some(line) = self.lines.next_line() {
            if line.is_empty() {
                // blank line terminates a record
                self.event_name = None;
                continue;
            }
            if line.starts_with(':') {
                // comment / heartbeat
                continue;
            }
            if let Some(name) = line.strip_prefix("event:") {
                self.event_name = Some(name.trim().to_string());
                continue;
            }
            let Some(payload) = line.strip_prefix("data:") else {
                continue;
            };
            let data = payload.trim();
            if data == "[DONE]" {
                self.done = true;
                continue;
            }

            match serde_json::from_str::<Value>(data) {
                Ok(value) => self.dispatch(value),
                Err(_) => {
                    // incomplete payload: await more bytes
                    self.lines.put_back(&line);
                    break;
                }
            }
        }
    }

    fn dispatch(&mut self, value: Value) {
        match self.event_name.as_deref() {
            Some("citations") => {
                self.citations = Some(value);
            }
            Some("error") => {
                let message = value
                    .get("error")
                    .and_then(|v| v.as_str())
                    .unwrap_or("stream error")
                    .to_string();
                self.error = Some(message);
            }
            _ => {
                if let Some(content) = value
                    .get("choices")
                    .and_then(|v| v.as_array())
                    .and_then(|arr| arr.first())
                    .and_then(|choice| choice.get("delta"))
                    .and_then(|delta| delta.get("content"))
                    .and_then(|v| v.as_str())
                {
                    self.answer.push_str(content);
                }
            }
        }
    }
}
