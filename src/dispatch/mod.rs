//! Dispatch loop.
//!
//! A caller request is tried against an application's endpoints, starting at the
//! pinned or strategy-suggested index and then every other endpoint in configured
//! order, until one answers or all are exhausted. Throttled and unavailable
//! endpoints contribute their retry-after; the smallest one is surfaced when no
//! endpoint could serve the request.

pub mod collaborators;
pub mod outbound;
pub mod poller;

pub use collaborators::{
    trim_messages, CacheLookup, ConversationMemory, ConversationRecord, ExactMatchCache,
    InMemoryConversationMemory, LogPersistence, PersistRecord, Persistence, SemanticCache,
};
pub use outbound::{
    build_endpoint_request, call_endpoint, parse_retry_after, AttemptOutcome, Completion,
    DEFAULT_RETRY_AFTER_SECS,
};
pub use poller::{poll_job, PollSettings};

use anyhow::Context;
use axum::http::HeaderMap;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn, Instrument};

use crate::core::config::{AppConfig, EndpointConfig};
use crate::core::error::{format_retry_after, ERROR_TYPE_API, ERROR_TYPE_RATE_LIMIT};
use crate::core::logging::{generate_request_id, ENDPOINT_CONTEXT};
use crate::core::metrics::get_metrics;
use crate::core::tokenizer::{count_prompt_tokens, count_tokens, encoding_for_family};
use crate::endpoint_span;
use crate::health::TokenUsage;
use crate::registry::ApplicationRuntime;
use crate::routing::{RoutingRequest, RoutingStrategy};
use crate::streaming::StreamSink;
use outbound::error_body;

/// Message returned when every endpoint failed for reasons other than throttling.
pub const EXHAUSTED_MESSAGE: &str = "Internal server error. Unable to process request.";

const OUTCOME_SUCCESS: &str = "success";
const OUTCOME_THROTTLED: &str = "throttled";
const OUTCOME_CALLER_ERROR: &str = "caller_error";
const OUTCOME_FAILED: &str = "failed";
const OUTCOME_SKIPPED: &str = "skipped";

/// Caller headers never written to persistence.
const REDACTED_HEADERS: [&str; 4] = ["authorization", "api-key", "x-api-key", "cookie"];

#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub request_id: String,
    pub body: Value,
    /// Caller headers, visible to header-based routing
    pub headers: HeaderMap,
    pub thread_id: Option<String>,
    pub use_cache: bool,
}

impl DispatchRequest {
    pub fn new(body: Value) -> Self {
        Self {
            request_id: generate_request_id(),
            body,
            headers: HeaderMap::new(),
            thread_id: None,
            use_cache: true,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_thread_id(mut self, thread_id: Option<String>) -> Self {
        self.thread_id = thread_id;
        self
    }

    pub fn with_use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }
}

/// Outcome of a dispatch as seen by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchResult {
    pub status: u16,
    pub body: Value,
    pub thread_id: Option<String>,
    /// Seconds the caller should wait, set on 429
    pub retry_after: Option<f64>,
    /// Index of the endpoint that produced the response
    pub served_from: Option<usize>,
    pub cached: bool,
    /// Whether the body was relayed to the stream sink as it arrived
    pub streamed: bool,
}

impl DispatchResult {
    fn failure(status: u16, body: Value, thread_id: Option<String>) -> Self {
        Self {
            status,
            body,
            thread_id,
            retry_after: None,
            served_from: None,
            cached: false,
            streamed: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == 200
    }
}

#[derive(Debug, Default)]
struct ThreadContext {
    thread_id: Option<String>,
    pinned: Option<usize>,
    started_new_thread: bool,
    prior: Vec<Value>,
}

/// What the success path needs to know about the request that was sent.
struct Exchange<'a> {
    request_id: &'a str,
    headers: &'a BTreeMap<String, String>,
    sent: &'a Value,
    cache_request: Option<&'a Value>,
    embedding: Option<Vec<f32>>,
    thread: ThreadContext,
}

/// Marks an endpoint connection open for the lifetime of one attempt.
struct ConnectionGuard<'a> {
    strategy: &'a dyn RoutingStrategy,
    index: usize,
}

impl<'a> ConnectionGuard<'a> {
    fn open(strategy: &'a dyn RoutingStrategy, index: usize) -> Self {
        strategy.connection_opened(index);
        Self { strategy, index }
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.strategy.connection_closed(self.index);
    }
}

pub struct Dispatcher {
    client: reqwest::Client,
    cache: Option<Arc<dyn SemanticCache>>,
    memory: Option<Arc<dyn ConversationMemory>>,
    persistence: Option<Arc<dyn Persistence>>,
    poll: PollSettings,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("cache", &self.cache.is_some())
            .field("memory", &self.memory.is_some())
            .field("persistence", &self.persistence.is_some())
            .field("poll", &self.poll)
            .finish()
    }
}

/// Shared HTTP client honouring the configured timeout and TLS verification.
pub fn build_client(config: &AppConfig) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(!config.verify_ssl)
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .build()
        .context("Failed to build HTTP client")
}

impl Dispatcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            cache: None,
            memory: None,
            persistence: None,
            poll: PollSettings::default(),
        }
    }

    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        Ok(Self::new(build_client(config)?))
    }

    pub fn with_cache(mut self, cache: Arc<dyn SemanticCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn ConversationMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_poll_settings(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Serve `request` from the first endpoint of `runtime` able to answer.
    ///
    /// When `sink` is given and an endpoint streams, raw chunks are relayed to it as
    /// they arrive; the sink is dropped once the stream ends.
    pub async fn dispatch(
        &self,
        runtime: &ApplicationRuntime,
        request: DispatchRequest,
        sink: Option<StreamSink>,
    ) -> DispatchResult {
        let started = Instant::now();
        let result = self.run(runtime, request, sink).await;

        let metrics = get_metrics();
        metrics
            .dispatch_requests
            .with_label_values(&[runtime.app_id(), &result.status.to_string()])
            .inc();
        metrics
            .dispatch_duration
            .with_label_values(&[runtime.app_id()])
            .observe(started.elapsed().as_secs_f64());
        result
    }

    async fn run(
        &self,
        runtime: &ApplicationRuntime,
        request: DispatchRequest,
        mut sink: Option<StreamSink>,
    ) -> DispatchResult {
        let app_id = runtime.app_id();
        let endpoint_count = runtime.endpoints.len();
        let DispatchRequest {
            request_id,
            mut body,
            headers,
            thread_id,
            use_cache,
        } = request;

        if endpoint_count == 0 {
            error!(app_id, "Application has no endpoints configured");
            return DispatchResult::failure(
                500,
                error_body(500, "No endpoints configured for application"),
                thread_id,
            );
        }

        let cache = self
            .cache
            .as_ref()
            .filter(|_| runtime.config.cache_enabled && use_cache);
        let mut embedding = None;
        if let Some(cache) = cache {
            match cache.lookup(app_id, &body).await {
                Ok(CacheLookup {
                    response: Some(response),
                    ..
                }) => {
                    info!(app_id, "Serving completion from semantic cache");
                    get_metrics().cache_hits.with_label_values(&[app_id]).inc();
                    return DispatchResult {
                        status: 200,
                        body: response,
                        thread_id,
                        retry_after: None,
                        served_from: None,
                        cached: true,
                        streamed: false,
                    };
                }
                Ok(lookup) => embedding = lookup.embedding,
                Err(e) => warn!(app_id, error = %e, "Semantic cache lookup failed"),
            }
        }
        let cache_request = cache.map(|_| body.clone());

        let thread = self.open_thread(runtime, thread_id).await;
        if !thread.prior.is_empty() {
            let incoming = body
                .get("messages")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            if let Some(object) = body.as_object_mut() {
                object.insert(
                    "messages".to_string(),
                    Value::Array(merge_messages(&thread.prior, &incoming)),
                );
            }
        }

        let start = match thread.pinned {
            Some(index) => {
                debug!(app_id, index, "Conversation thread pinned to endpoint");
                index
            }
            None => {
                let routing = RoutingRequest::new(&body, &headers);
                runtime
                    .strategy
                    .select_endpoint(&routing)
                    .min(endpoint_count - 1)
            }
        };

        let persisted_headers = persistable_headers(&headers);
        let metrics = get_metrics();
        let order = std::iter::once(start).chain((0..endpoint_count).filter(|i| *i != start));
        let mut tried = vec![false; endpoint_count];
        let mut min_retry_after: Option<f64> = None;
        let mut last_error: Option<(u16, Value)> = None;

        for index in order {
            if std::mem::replace(&mut tried[index], true) {
                continue;
            }
            let health = &runtime.endpoints[index];
            let endpoint = &runtime.config.endpoints[index];
            let label = endpoint.label();

            let (available, retry_after) = health.is_healthy();
            metrics
                .endpoint_available
                .with_label_values(&[app_id, label])
                .set(if available { 1.0 } else { 0.0 });
            if !available {
                debug!(endpoint = %label, retry_after, "Endpoint out of rotation, skipping");
                metrics
                    .endpoint_attempts
                    .with_label_values(&[app_id, label, OUTCOME_SKIPPED])
                    .inc();
                min_retry_after = Some(min_retry(min_retry_after, retry_after));
                continue;
            }

            let outcome = {
                let _connection = ConnectionGuard::open(runtime.strategy.as_ref(), index);
                ENDPOINT_CONTEXT
                    .scope(
                        label.to_string(),
                        call_endpoint(
                            &self.client,
                            endpoint,
                            &body,
                            sink.as_ref(),
                            thread.started_new_thread,
                            self.poll,
                        ),
                    )
                    .instrument(endpoint_span!("endpoint_attempt", label))
                    .await
            };

            match outcome {
                AttemptOutcome::Success(completion) => {
                    drop(sink.take());
                    metrics
                        .endpoint_attempts
                        .with_label_values(&[app_id, label, OUTCOME_SUCCESS])
                        .inc();
                    let exchange = Exchange {
                        request_id: &request_id,
                        headers: &persisted_headers,
                        sent: &body,
                        cache_request: cache_request.as_ref(),
                        embedding,
                        thread,
                    };
                    return self
                        .on_success(runtime, index, exchange, cache, completion)
                        .await;
                }
                AttemptOutcome::Throttled {
                    retry_after,
                    body: _,
                } => {
                    warn!(endpoint = %label, retry_after, "Endpoint throttled, trying next");
                    health.record_failure(429, retry_after);
                    metrics
                        .endpoint_attempts
                        .with_label_values(&[app_id, label, OUTCOME_THROTTLED])
                        .inc();
                    min_retry_after = Some(min_retry(min_retry_after, retry_after));
                }
                AttemptOutcome::CallerError {
                    status,
                    body: endpoint_error,
                } => {
                    warn!(endpoint = %label, status, "Endpoint rejected request");
                    health.record_failure(status, 0.0);
                    metrics
                        .endpoint_attempts
                        .with_label_values(&[app_id, label, OUTCOME_CALLER_ERROR])
                        .inc();
                    self.persist(PersistRecord {
                        request_id: request_id.clone(),
                        app_id: app_id.to_string(),
                        thread_id: thread.thread_id.clone(),
                        endpoint_index: index,
                        endpoint: label.to_string(),
                        status,
                        latency_ms: 0,
                        headers: persisted_headers.clone(),
                        request: body.clone(),
                        response: endpoint_error.clone(),
                    });
                    return DispatchResult {
                        status,
                        body: endpoint_error,
                        thread_id: thread.thread_id,
                        retry_after: None,
                        served_from: Some(index),
                        cached: false,
                        streamed: false,
                    };
                }
                AttemptOutcome::Failed {
                    status,
                    body: endpoint_error,
                } => {
                    warn!(endpoint = %label, status, "Endpoint failed, trying next");
                    health.record_failure(status, 0.0);
                    metrics
                        .endpoint_attempts
                        .with_label_values(&[app_id, label, OUTCOME_FAILED])
                        .inc();
                    last_error = Some((status, endpoint_error));
                }
            }
        }

        match last_error {
            Some((status, endpoint_error)) => {
                error!(app_id, last_status = status, "All endpoints failed");
                DispatchResult::failure(
                    500,
                    json!({
                        "error": {
                            "message": EXHAUSTED_MESSAGE,
                            "type": ERROR_TYPE_API,
                            "code": 500,
                            "endpoint_status": status,
                            "endpoint_error": endpoint_error,
                        }
                    }),
                    thread.thread_id,
                )
            }
            None => {
                let retry_after = min_retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECS);
                warn!(app_id, retry_after, "All endpoints throttled or out of rotation");
                DispatchResult {
                    retry_after: Some(retry_after),
                    ..DispatchResult::failure(
                        429,
                        json!({
                            "error": {
                                "message": format!(
                                    "All endpoints are busy. Please retry after {} seconds.",
                                    format_retry_after(retry_after)
                                ),
                                "type": ERROR_TYPE_RATE_LIMIT,
                                "code": 429,
                            }
                        }),
                        thread.thread_id,
                    )
                }
            }
        }
    }

    async fn open_thread(
        &self,
        runtime: &ApplicationRuntime,
        requested: Option<String>,
    ) -> ThreadContext {
        let memory = match &self.memory {
            Some(memory) if runtime.config.memory_enabled => memory,
            _ => {
                return ThreadContext {
                    thread_id: requested,
                    ..Default::default()
                }
            }
        };

        let Some(thread_id) = requested else {
            let thread_id = uuid::Uuid::new_v4().to_string();
            debug!(thread_id = %thread_id, "Starting conversation thread");
            return ThreadContext {
                thread_id: Some(thread_id),
                started_new_thread: true,
                ..Default::default()
            };
        };

        match memory.load(&thread_id).await {
            Ok(Some(record)) => {
                let pinned = (record.endpoint_index < runtime.endpoints.len())
                    .then_some(record.endpoint_index);
                ThreadContext {
                    thread_id: Some(thread_id),
                    pinned,
                    started_new_thread: false,
                    prior: record.messages,
                }
            }
            Ok(None) => ThreadContext {
                thread_id: Some(thread_id),
                started_new_thread: true,
                ..Default::default()
            },
            Err(e) => {
                warn!(thread_id = %thread_id, error = %e, "Failed to load conversation thread");
                ThreadContext {
                    thread_id: Some(thread_id),
                    ..Default::default()
                }
            }
        }
    }

    async fn on_success(
        &self,
        runtime: &ApplicationRuntime,
        index: usize,
        exchange: Exchange<'_>,
        cache: Option<&Arc<dyn SemanticCache>>,
        completion: Completion,
    ) -> DispatchResult {
        let app_id = runtime.app_id();
        let endpoint = &runtime.config.endpoints[index];
        let label = endpoint.label();
        let thread = exchange.thread;

        let usage = completion
            .usage
            .unwrap_or_else(|| estimate_usage(endpoint, exchange.sent, &completion));
        runtime.endpoints[index].record_success(
            Some(&usage),
            completion.latency_ms,
            thread.started_new_thread,
        );
        runtime.strategy.record_latency(index, completion.latency_ms);

        let metrics = get_metrics();
        metrics
            .endpoint_latency
            .with_label_values(&[app_id, label])
            .observe(completion.latency_ms as f64 / 1000.0);
        metrics
            .token_usage
            .with_label_values(&[app_id, label, "prompt"])
            .inc_by(usage.prompt_tokens);
        metrics
            .token_usage
            .with_label_values(&[app_id, label, "completion"])
            .inc_by(usage.completion_tokens);

        info!(
            endpoint = %label,
            latency_ms = completion.latency_ms,
            streamed = completion.streamed,
            total_tokens = usage.total_tokens,
            "Endpoint served request"
        );

        if let (Some(memory), Some(thread_id)) = (
            self.memory.as_ref().filter(|_| runtime.config.memory_enabled),
            thread.thread_id.as_deref(),
        ) {
            let mut messages = exchange
                .sent
                .get("messages")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            messages.push(json!({"role": "assistant", "content": completion.text}));
            let settings = &runtime.config.memory_settings;
            if let Some(max) = settings.msg_count {
                trim_messages(&mut messages, max);
            }
            let record = ConversationRecord {
                messages,
                endpoint_index: index,
            };
            if let Err(e) = memory.save(thread_id, record, settings.entry_ttl()).await {
                warn!(thread_id, error = %e, "Failed to save conversation thread");
            }
        }

        if let (Some(cache), Some(request)) = (cache, exchange.cache_request) {
            if completion.complete {
                if let Err(e) = cache
                    .store(
                        app_id,
                        request,
                        exchange.embedding,
                        &completion.body,
                        runtime.config.cache_settings.entry_ttl(),
                    )
                    .await
                {
                    warn!(app_id, error = %e, "Failed to store completion in semantic cache");
                }
            }
        }

        self.persist(PersistRecord {
            request_id: exchange.request_id.to_string(),
            app_id: app_id.to_string(),
            thread_id: thread.thread_id.clone(),
            endpoint_index: index,
            endpoint: label.to_string(),
            status: 200,
            latency_ms: completion.latency_ms,
            headers: exchange.headers.clone(),
            request: exchange.sent.clone(),
            response: completion.body.clone(),
        });

        DispatchResult {
            status: 200,
            body: completion.body,
            thread_id: thread.thread_id,
            retry_after: None,
            served_from: Some(index),
            cached: false,
            streamed: completion.streamed,
        }
    }

    fn persist(&self, record: PersistRecord) {
        let Some(persistence) = self.persistence.clone() else {
            return;
        };
        tokio::spawn(async move {
            let request_id = record.request_id.clone();
            if let Err(e) = persistence.persist(record).await {
                warn!(request_id = %request_id, error = %e, "Failed to persist exchange");
            }
        });
    }
}

fn min_retry(current: Option<f64>, candidate: f64) -> f64 {
    match current {
        Some(current) => current.min(candidate),
        None => candidate,
    }
}

/// Caller headers worth keeping with a persisted exchange, credentials removed.
fn persistable_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| !REDACTED_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn is_system(message: &Value) -> bool {
    message.get("role").and_then(Value::as_str) == Some("system")
}

/// Prior thread messages followed by the new ones; a new system prompt is
/// dropped when the thread already carries one.
fn merge_messages(prior: &[Value], incoming: &[Value]) -> Vec<Value> {
    let prior_has_system = prior.iter().any(is_system);
    prior
        .iter()
        .chain(
            incoming
                .iter()
                .filter(|m| !(prior_has_system && is_system(m))),
        )
        .cloned()
        .collect()
}

fn estimate_usage(endpoint: &EndpointConfig, request: &Value, completion: &Completion) -> TokenUsage {
    let family = completion
        .body
        .get("model")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .or(endpoint.model_family.as_deref())
        .or_else(|| request.get("model").and_then(Value::as_str))
        .unwrap_or_default();
    let encoding = encoding_for_family(family);
    TokenUsage::new(
        count_prompt_tokens(request, encoding) as u64,
        count_tokens(&completion.text, encoding) as u64,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{ApplicationConfig, RouterKind, RoutingConfig};
    use crate::health::HealthSettings;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn message(role: &str, content: &str) -> Value {
        json!({"role": role, "content": content})
    }

    fn completion_body(content: &str) -> Value {
        json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "model": "gpt-4o",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": content}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
        })
    }

    fn runtime(uris: &[String], memory_enabled: bool, cache_enabled: bool) -> ApplicationRuntime {
        ApplicationRuntime::new(config(uris, memory_enabled, cache_enabled), HealthSettings::default())
    }

    fn config(uris: &[String], memory_enabled: bool, cache_enabled: bool) -> ApplicationConfig {
        ApplicationConfig {
            app_id: "dispatch-unit".to_string(),
            description: None,
            endpoints: uris
                .iter()
                .map(|uri| EndpointConfig {
                    uri: uri.clone(),
                    ..Default::default()
                })
                .collect(),
            cache_enabled,
            memory_enabled,
            cache_settings: Default::default(),
            memory_settings: Default::default(),
            routing: RoutingConfig {
                strategy: RouterKind::Priority,
                ..Default::default()
            },
        }
    }

    struct RecordingPersistence(tokio::sync::mpsc::UnboundedSender<PersistRecord>);

    #[async_trait::async_trait]
    impl Persistence for RecordingPersistence {
        async fn persist(&self, record: PersistRecord) -> anyhow::Result<()> {
            self.0.send(record)?;
            Ok(())
        }
    }

    #[test]
    fn test_merge_messages_keeps_single_system_prompt() {
        let prior = vec![message("system", "be brief"), message("user", "hi"), message("assistant", "hello")];
        let incoming = vec![message("system", "be brief"), message("user", "again")];
        let merged = merge_messages(&prior, &incoming);
        assert_eq!(merged.len(), 4);
        assert_eq!(merged[3], message("user", "again"));
    }

    #[test]
    fn test_min_retry() {
        assert_eq!(min_retry(None, 30.0), 30.0);
        assert_eq!(min_retry(Some(30.0), 5.0), 5.0);
        assert_eq!(min_retry(Some(5.0), 30.0), 5.0);
    }

    #[test]
    fn test_connection_guard_closes_on_drop() {
        let router = crate::routing::LeastConnectionsRouter::new(2);
        {
            let _guard = ConnectionGuard::open(&router, 1);
            assert_eq!(router.active_connections(), vec![0, 1]);
        }
        assert_eq!(router.active_connections(), vec![0, 0]);
    }

    #[tokio::test]
    async fn test_no_endpoints_is_internal_error() {
        let dispatcher = Dispatcher::new(reqwest::Client::new());
        let result = dispatcher
            .dispatch(&runtime(&[], false, false), DispatchRequest::new(json!({})), None)
            .await;
        assert_eq!(result.status, 500);
        assert_eq!(result.served_from, None);
    }

    #[tokio::test]
    async fn test_new_thread_is_pinned_to_serving_endpoint() {
        let down = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&down)
            .await;
        let up = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("hello")))
            .mount(&up)
            .await;

        let memory = Arc::new(InMemoryConversationMemory::new());
        let dispatcher = Dispatcher::new(reqwest::Client::new()).with_memory(memory.clone());
        let runtime = runtime(&[down.uri(), up.uri()], true, false);

        let request = DispatchRequest::new(json!({"messages": [message("user", "hi")]}));
        let result = dispatcher.dispatch(&runtime, request, None).await;

        assert_eq!(result.status, 200);
        assert_eq!(result.served_from, Some(1));
        let thread_id = result.thread_id.expect("thread id");
        let record = memory.load(&thread_id).await.unwrap().unwrap();
        assert_eq!(record.endpoint_index, 1);
        assert_eq!(
            record.messages,
            vec![message("user", "hi"), message("assistant", "hello")]
        );
        assert_eq!(runtime.endpoints[1].snapshot().current.thread_count, 1);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_endpoints() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("fresh")))
            .expect(1)
            .mount(&server)
            .await;

        let dispatcher =
            Dispatcher::new(reqwest::Client::new()).with_cache(Arc::new(ExactMatchCache::new()));
        let runtime = runtime(&[server.uri()], false, true);
        let body = json!({"messages": [message("user", "cached?")]});

        let first = dispatcher
            .dispatch(&runtime, DispatchRequest::new(body.clone()), None)
            .await;
        assert!(!first.cached);

        let second = dispatcher
            .dispatch(&runtime, DispatchRequest::new(body.clone()), None)
            .await;
        assert!(second.cached);
        assert_eq!(second.status, 200);
        assert_eq!(second.body, first.body);
    }

    #[tokio::test]
    async fn test_use_cache_false_goes_to_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("fresh")))
            .expect(2)
            .mount(&server)
            .await;

        let dispatcher =
            Dispatcher::new(reqwest::Client::new()).with_cache(Arc::new(ExactMatchCache::new()));
        let runtime = runtime(&[server.uri()], false, true);
        let body = json!({"messages": [message("user", "cached?")]});

        let first = dispatcher
            .dispatch(&runtime, DispatchRequest::new(body.clone()), None)
            .await;
        assert!(!first.cached);

        let bypass = dispatcher
            .dispatch(&runtime, DispatchRequest::new(body).with_use_cache(false), None)
            .await;
        assert_eq!(bypass.status, 200);
        assert!(!bypass.cached);
        assert_eq!(bypass.served_from, Some(0));
    }

    #[tokio::test]
    async fn test_usage_estimated_when_missing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "gpt-4o",
                "choices": [{"message": {"role": "assistant", "content": "a short answer"}}]
            })))
            .mount(&server)
            .await;

        let dispatcher = Dispatcher::new(reqwest::Client::new());
        let runtime = runtime(&[server.uri()], false, false);
        let request = DispatchRequest::new(json!({"messages": [message("user", "a question")]}));
        let result = dispatcher.dispatch(&runtime, request, None).await;

        assert_eq!(result.status, 200);
        let counters = runtime.endpoints[0].snapshot().current;
        assert!(counters.total_tokens > 0);
    }

    #[tokio::test]
    async fn test_accepted_job_is_polled() {
        let server = MockServer::start().await;
        let status_uri = format!("{}/jobs/7", server.uri());
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202).insert_header("operation-location", status_uri.as_str()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "completed",
                "result": completion_body("from job")
            })))
            .mount(&server)
            .await;

        let dispatcher = Dispatcher::new(reqwest::Client::new()).with_poll_settings(PollSettings {
            interval: Duration::from_millis(5),
            max_attempts: 2,
        });
        let runtime = runtime(&[server.uri()], false, false);
        let result = dispatcher
            .dispatch(&runtime, DispatchRequest::new(json!({"messages": []})), None)
            .await;

        assert_eq!(result.status, 200);
        assert_eq!(result.body["choices"][0]["message"]["content"], "from job");
    }

    #[tokio::test]
    async fn test_persisted_exchange_omits_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("stored")))
            .mount(&server)
            .await;

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let dispatcher =
            Dispatcher::new(reqwest::Client::new()).with_persistence(Arc::new(RecordingPersistence(tx)));
        let runtime = runtime(&[server.uri()], false, false);

        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer secret".parse().unwrap());
        headers.insert("api-key", "secret".parse().unwrap());
        headers.insert("x-team", "support".parse().unwrap());
        let request = DispatchRequest::new(json!({"messages": [message("user", "hi")]}))
            .with_request_id("req-headers")
            .with_headers(headers);
        let result = dispatcher.dispatch(&runtime, request, None).await;
        assert_eq!(result.status, 200);

        let record = rx.recv().await.expect("persisted record");
        assert_eq!(record.request_id, "req-headers");
        assert_eq!(
            record.headers,
            BTreeMap::from([("x-team".to_string(), "support".to_string())])
        );
    }

    #[tokio::test]
    async fn test_saved_thread_is_trimmed_to_msg_count() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("third")))
            .mount(&server)
            .await;

        let mut config = config(&[server.uri()], true, false);
        config.memory_settings.msg_count = Some(3);
        let runtime = ApplicationRuntime::new(config, HealthSettings::default());
        let memory = Arc::new(InMemoryConversationMemory::new());
        let dispatcher = Dispatcher::new(reqwest::Client::new()).with_memory(memory.clone());

        let request = DispatchRequest::new(json!({"messages": [
            message("system", "be brief"),
            message("user", "first"),
            message("assistant", "second"),
            message("user", "again"),
        ]}));
        let result = dispatcher.dispatch(&runtime, request, None).await;

        let thread_id = result.thread_id.expect("thread id");
        let record = memory.load(&thread_id).await.unwrap().unwrap();
        assert_eq!(
            record.messages,
            vec![
                message("system", "be brief"),
                message("user", "again"),
                message("assistant", "third"),
            ]
        );
    }
}
