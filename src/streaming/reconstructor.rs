//! Buffered SSE scanner that rebuilds a chat completion from its streamed chunks.
//!
//! The reconstructor never alters the stream: callers forward every raw chunk as
//! received and feed a copy here. Only complete lines are decoded; a `data:`
//! payload that is not valid JSON on its own is held and prepended to the next
//! payload, which recovers objects a backend split across several lines.

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::health::TokenUsage;

/// Largest partial JSON payload held while waiting for its continuation.
const MAX_PENDING_JSON_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Streaming,
    Done,
}

/// Logical events decoded from the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Content(String),
    Citations(Vec<Value>),
    Usage(TokenUsage),
    Done,
}

/// Completion metadata echoed by every chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionMetadata {
    pub id: Option<String>,
    pub model: Option<String>,
    pub created: Option<i64>,
    pub system_fingerprint: Option<String>,
}

#[derive(Debug)]
pub struct StreamReconstructor {
    line_buffer: Vec<u8>,
    pending_json: String,
    phase: StreamPhase,
    text: String,
    citations: Vec<Value>,
    usage: Option<TokenUsage>,
    metadata: CompletionMetadata,
    finish_reason: Option<String>,
    started_new_thread: bool,
}

impl Default for StreamReconstructor {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamReconstructor {
    pub fn new() -> Self {
        Self {
            line_buffer: Vec::new(),
            pending_json: String::new(),
            phase: StreamPhase::Streaming,
            text: String::new(),
            citations: Vec::new(),
            usage: None,
            metadata: CompletionMetadata::default(),
            finish_reason: None,
            started_new_thread: false,
        }
    }

    /// Mark the stream as the first exchange of a new conversation thread.
    pub fn set_started_new_thread(&mut self, started: bool) {
        self.started_new_thread = started;
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub fn is_done(&self) -> bool {
        self.phase == StreamPhase::Done
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Consume one network chunk and return the events it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.is_done() {
            return events;
        }

        self.line_buffer.extend_from_slice(chunk);
        while let Some(pos) = self.line_buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.line_buffer.drain(..=pos).collect();
            self.process_line(&line[..pos], &mut events);
            if self.is_done() {
                self.line_buffer.clear();
                break;
            }
        }
        events
    }

    /// Flush any unterminated final line and return the reconstructed completion.
    pub fn finish(mut self) -> ReconstructedCompletion {
        if !self.line_buffer.is_empty() && !self.is_done() {
            let line = std::mem::take(&mut self.line_buffer);
            let mut events = Vec::new();
            self.process_line(&line, &mut events);
        }
        if !self.pending_json.is_empty() {
            warn!(
                pending_bytes = self.pending_json.len(),
                "Stream ended with an incomplete JSON payload"
            );
        }

        ReconstructedCompletion {
            text: self.text,
            citations: self.citations,
            usage: self.usage,
            metadata: self.metadata,
            finish_reason: self.finish_reason,
            started_new_thread: self.started_new_thread,
            completed: self.phase == StreamPhase::Done,
        }
    }

    fn process_line(&mut self, raw: &[u8], events: &mut Vec<StreamEvent>) {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() || line.starts_with(':') {
            return;
        }

        let payload = if let Some(data) = line.strip_prefix("data:") {
            data.strip_prefix(' ').unwrap_or(data)
        } else if !self.pending_json.is_empty() {
            // Continuation of a payload that was split without a field prefix
            line
        } else {
            // event:, id:, retry: carry nothing we reconstruct
            return;
        };

        if payload.trim() == "[DONE]" {
            self.pending_json.clear();
            self.phase = StreamPhase::Done;
            events.push(StreamEvent::Done);
            return;
        }

        let held = !self.pending_json.is_empty();
        let candidate = if held {
            let mut joined = std::mem::take(&mut self.pending_json);
            joined.push_str(payload);
            joined
        } else {
            payload.to_string()
        };

        let error = match serde_json::from_str::<Value>(&candidate) {
            Ok(value) => return self.apply(&value, events),
            Err(e) => e,
        };

        // A held fragment that never completed must not swallow a valid payload
        let standalone = held
            .then(|| serde_json::from_str::<Value>(payload).ok())
            .flatten();
        match standalone {
            Some(value) => {
                warn!(
                    bytes = candidate.len() - payload.len(),
                    "Discarding stale partial stream payload"
                );
                self.apply(&value, events);
            }
            None if candidate.len() <= MAX_PENDING_JSON_BYTES => {
                debug!(bytes = candidate.len(), "Holding partial stream payload");
                self.pending_json = candidate;
            }
            None => {
                warn!(bytes = candidate.len(), error = %error, "Dropping oversized unparseable stream payload");
            }
        }
    }

    fn apply(&mut self, chunk: &Value, events: &mut Vec<StreamEvent>) {
        self.capture_metadata(chunk);

        if let Some(usage) = chunk.get("usage").and_then(TokenUsage::from_value) {
            self.usage = Some(usage);
            events.push(StreamEvent::Usage(usage));
        }

        let Some(choice) = chunk
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
        else {
            return;
        };

        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.finish_reason = Some(reason.to_string());
        }

        let Some(delta) = choice.get("delta") else {
            return;
        };

        if let Some(content) = delta.get("content").and_then(Value::as_str) {
            if !content.is_empty() {
                self.text.push_str(content);
                events.push(StreamEvent::Content(content.to_string()));
            }
        }

        if let Some(citations) = delta.pointer("/context/citations").and_then(Value::as_array) {
            if !citations.is_empty() {
                self.citations.extend(citations.iter().cloned());
                events.push(StreamEvent::Citations(citations.clone()));
            }
        }
    }

    fn capture_metadata(&mut self, chunk: &Value) {
        let non_empty = |key: &str| {
            chunk
                .get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        if self.metadata.id.is_none() {
            self.metadata.id = non_empty("id");
        }
        if self.metadata.model.is_none() {
            self.metadata.model = non_empty("model");
        }
        if self.metadata.system_fingerprint.is_none() {
            self.metadata.system_fingerprint = non_empty("system_fingerprint");
        }
        if self.metadata.created.is_none() {
            self.metadata.created = chunk.get("created").and_then(Value::as_i64).filter(|c| *c > 0);
        }
    }
}

/// The logical completion rebuilt from a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconstructedCompletion {
    pub text: String,
    pub citations: Vec<Value>,
    pub usage: Option<TokenUsage>,
    pub metadata: CompletionMetadata,
    pub finish_reason: Option<String>,
    pub started_new_thread: bool,
    /// Whether the `[DONE]` marker was seen
    pub completed: bool,
}

impl ReconstructedCompletion {
    /// Render in the shape of a non-streamed `chat.completion` response.
    pub fn to_chat_completion(&self) -> Value {
        let mut message = Map::new();
        message.insert("role".to_string(), json!("assistant"));
        message.insert("content".to_string(), json!(self.text));
        if !self.citations.is_empty() {
            message.insert("context".to_string(), json!({ "citations": self.citations }));
        }

        let mut completion = json!({
            "id": self.metadata.id,
            "object": "chat.completion",
            "created": self.metadata.created,
            "model": self.metadata.model,
            "choices": [{
                "index": 0,
                "message": Value::Object(message),
                "finish_reason": self.finish_reason.as_deref().unwrap_or("stop"),
            }],
        });

        if let Some(fingerprint) = &self.metadata.system_fingerprint {
            completion["system_fingerprint"] = json!(fingerprint);
        }
        if let Some(usage) = &self.usage {
            completion["usage"] = usage.to_value();
        }
        completion
    }
}
