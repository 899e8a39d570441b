//! Collaborators the dispatcher consults around an outbound call.
//!
//! The semantic cache, conversation memory and persistence stores live outside this
//! crate; the dispatcher only sees these traits. Failures are logged by the caller
//! and never abort a dispatch.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::info;

/// Request fields that do not change the completion a backend produces.
const CACHE_KEY_IGNORED_FIELDS: [&str; 3] = ["stream", "stream_options", "user"];

/// Result of a semantic cache lookup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheLookup {
    /// Cached completion for a sufficiently similar request
    pub response: Option<Value>,
    /// Prompt embedding computed during lookup, handed back on store
    pub embedding: Option<Vec<f32>>,
}

#[async_trait]
pub trait SemanticCache: Send + Sync {
    async fn lookup(&self, app_id: &str, request: &Value) -> anyhow::Result<CacheLookup>;

    /// Store `response` for `request`; `ttl` bounds how long it may be served.
    async fn store(
        &self,
        app_id: &str,
        request: &Value,
        embedding: Option<Vec<f32>>,
        response: &Value,
        ttl: Option<Duration>,
    ) -> anyhow::Result<()>;
}

/// Messages of a conversation thread and the endpoint it is pinned to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub messages: Vec<Value>,
    pub endpoint_index: usize,
}

#[async_trait]
pub trait ConversationMemory: Send + Sync {
    async fn load(&self, thread_id: &str) -> anyhow::Result<Option<ConversationRecord>>;

    /// Replace the thread's record; `ttl` bounds how long the thread is kept.
    async fn save(
        &self,
        thread_id: &str,
        record: ConversationRecord,
        ttl: Option<Duration>,
    ) -> anyhow::Result<()>;
}

/// Drop the oldest non-system messages until at most `max` remain.
pub fn trim_messages(messages: &mut Vec<Value>, max: usize) {
    while messages.len() > max {
        let oldest = messages
            .iter()
            .position(|m| m.get("role").and_then(Value::as_str) != Some("system"));
        match oldest {
            Some(index) => {
                messages.remove(index);
            }
            None => break,
        }
    }
}

/// One completed exchange, handed to [`Persistence`] after the response is known.
#[derive(Debug, Clone, Serialize)]
pub struct PersistRecord {
    pub request_id: String,
    pub app_id: String,
    pub thread_id: Option<String>,
    pub endpoint_index: usize,
    pub endpoint: String,
    pub status: u16,
    pub latency_ms: u64,
    /// Caller request headers, credentials removed
    pub headers: BTreeMap<String, String>,
    pub request: Value,
    pub response: Value,
}

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn persist(&self, record: PersistRecord) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Option<Duration>, now: Instant) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| now + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Remove expired entries from `map`, returning how many were dropped.
fn evict<T>(map: &DashMap<String, Expiring<T>>, now: Instant) -> usize {
    let before = map.len();
    map.retain(|_, entry| !entry.is_expired(now));
    before.saturating_sub(map.len())
}

/// Process-local conversation memory.
///
/// Expired threads are dropped on access and by [`evict_expired`](Self::evict_expired).
#[derive(Debug, Default)]
pub struct InMemoryConversationMemory {
    threads: DashMap<String, Expiring<ConversationRecord>>,
}

impl InMemoryConversationMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Instant::now())
    }

    pub fn evict_expired_at(&self, now: Instant) -> usize {
        evict(&self.threads, now)
    }
}

#[async_trait]
impl ConversationMemory for InMemoryConversationMemory {
    async fn load(&self, thread_id: &str) -> anyhow::Result<Option<ConversationRecord>> {
        let now = Instant::now();
        self.threads
            .remove_if(thread_id, |_, entry| entry.is_expired(now));
        Ok(self.threads.get(thread_id).map(|entry| entry.value.clone()))
    }

    async fn save(
        &self,
        thread_id: &str,
        record: ConversationRecord,
        ttl: Option<Duration>,
    ) -> anyhow::Result<()> {
        self.threads.insert(
            thread_id.to_string(),
            Expiring::new(record, ttl, Instant::now()),
        );
        Ok(())
    }
}

/// Exact-match cache keyed by the request body.
///
/// Stands in for a semantic cache where no embedding service is available.
/// Expired entries are dropped on lookup and by [`evict_expired`](Self::evict_expired).
#[derive(Debug, Default)]
pub struct ExactMatchCache {
    entries: DashMap<String, Expiring<Value>>,
}

impl ExactMatchCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Instant::now())
    }

    pub fn evict_expired_at(&self, now: Instant) -> usize {
        evict(&self.entries, now)
    }

    fn key(app_id: &str, request: &Value) -> String {
        let mut body = request.clone();
        if let Some(object) = body.as_object_mut() {
            for field in CACHE_KEY_IGNORED_FIELDS {
                object.remove(field);
            }
        }
        format!("{}:{}", app_id, body)
    }
}

#[async_trait]
impl SemanticCache for ExactMatchCache {
    async fn lookup(&self, app_id: &str, request: &Value) -> anyhow::Result<CacheLookup> {
        let key = Self::key(app_id, request);
        let now = Instant::now();
        self.entries.remove_if(&key, |_, entry| entry.is_expired(now));
        Ok(CacheLookup {
            response: self.entries.get(&key).map(|entry| entry.value.clone()),
            embedding: None,
        })
    }

    async fn store(
        &self,
        app_id: &str,
        request: &Value,
        _embedding: Option<Vec<f32>>,
        response: &Value,
        ttl: Option<Duration>,
    ) -> anyhow::Result<()> {
        self.entries.insert(
            Self::key(app_id, request),
            Expiring::new(response.clone(), ttl, Instant::now()),
        );
        Ok(())
    }
}

/// Persistence that writes each exchange as a structured log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPersistence;

#[async_trait]
impl Persistence for LogPersistence {
    async fn persist(&self, record: PersistRecord) -> anyhow::Result<()> {
        let usage = record.response.get("usage");
        let tokens = |field: &str| {
            usage
                .and_then(|u| u.get(field))
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0)
        };
        let prompt_tokens = tokens("prompt_tokens");
        let completion_tokens = tokens("completion_tokens");
        info!(
            request_id = %record.request_id,
            app_id = %record.app_id,
            thread_id = record.thread_id.as_deref().unwrap_or(""),
            endpoint_index = record.endpoint_index,
            endpoint = %record.endpoint,
            status = record.status,
            latency_ms = record.latency_ms,
            prompt_tokens,
            completion_tokens,
            "Completion exchange"
        );
        Ok(())
    }
}
