//! HTTP request handlers for the gateway API.

use arc_swap::ArcSwap;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use prometheus::{Encoder, TextEncoder};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use super::models::{DispatchQuery, FeedbackRequest, HealthResponse};
use crate::core::config::AppConfig;
use crate::core::error::format_retry_after;
use crate::core::logging::generate_request_id;
use crate::core::{AppError, Result};
use crate::dispatch::{DispatchRequest, DispatchResult, Dispatcher};
use crate::health::HealthSettings;
use crate::registry::{ApplicationMetrics, ApplicationRuntime, Registry};
use crate::streaming::{sse_response, stream_channel};
use crate::with_request_context;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const THREAD_ID_HEADER: &str = "x-thread-id";
pub const CACHE_HEADER: &str = "x-cache";

/// Shared gateway state.
pub struct GatewayState {
    config: ArcSwap<AppConfig>,
    pub registry: Registry,
    pub dispatcher: Arc<Dispatcher>,
}

impl GatewayState {
    pub fn new(config: AppConfig, dispatcher: Dispatcher) -> Self {
        let settings = HealthSettings::from(&config.metrics);
        Self {
            config: ArcSwap::from_pointee(config),
            registry: Registry::new(settings),
            dispatcher: Arc::new(dispatcher),
        }
    }

    pub fn config(&self) -> Arc<AppConfig> {
        self.config.load_full()
    }

    /// Swap in a new configuration and drop all endpoint state built from the old one.
    pub fn reload(&self, config: AppConfig) -> usize {
        let settings = HealthSettings::from(&config.metrics);
        let applications = config.applications.len();
        self.config.store(Arc::new(config));
        let dropped = self.registry.reset(settings);
        info!(applications, dropped, "Configuration reloaded");
        dropped
    }

    pub fn runtime(&self, app_id: &str) -> Result<Arc<ApplicationRuntime>> {
        let config = self.config.load();
        let application = config
            .application(app_id)
            .ok_or_else(|| AppError::ApplicationNotFound(app_id.to_string()))?;
        Ok(self.registry.get_or_create(application))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn context_headers(request_id: &str, thread_id: Option<&str>) -> Vec<(HeaderName, HeaderValue)> {
    let mut headers = Vec::with_capacity(2);
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.push((HeaderName::from_static(REQUEST_ID_HEADER), value));
    }
    if let Some(value) = thread_id.and_then(|t| HeaderValue::from_str(t).ok()) {
        headers.push((HeaderName::from_static(THREAD_ID_HEADER), value));
    }
    headers
}

fn result_response(request_id: &str, result: DispatchResult) -> Response {
    let status = StatusCode::from_u16(result.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Json(result.body)).into_response();

    let headers = response.headers_mut();
    for (name, value) in context_headers(request_id, result.thread_id.as_deref()) {
        headers.insert(name, value);
    }
    if let Some(secs) = result.retry_after {
        if let Ok(value) = HeaderValue::from_str(&format_retry_after(secs)) {
            headers.insert(header::RETRY_AFTER, value);
        }
    }
    if result.cached {
        headers.insert(
            HeaderName::from_static(CACHE_HEADER),
            HeaderValue::from_static("hit"),
        );
    }
    response
}

/// Handle a chat completion request for one application.
///
/// Streaming requests get an SSE response as soon as the first chunk arrives;
/// if no endpoint streams, the dispatch result is returned as JSON.
pub async fn dispatch_completion(
    State(state): State<Arc<GatewayState>>,
    Path(app_id): Path<String>,
    Query(query): Query<DispatchQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let request_id = header_str(&headers, REQUEST_ID_HEADER)
        .map(str::to_string)
        .unwrap_or_else(generate_request_id);

    with_request_context!(request_id.clone(), app_id.clone(), async move {
        let runtime = state.runtime(&app_id)?;

        let payload: Value = serde_json::from_slice(&body)
            .map_err(|e| AppError::BadRequest(format!("Invalid JSON body: {}", e)))?;
        if !payload.is_object() {
            return Err(AppError::BadRequest(
                "Request body must be a JSON object".to_string(),
            ));
        }

        let mut thread_id = header_str(&headers, THREAD_ID_HEADER).map(str::to_string);
        if thread_id.is_none() && runtime.config.memory_enabled {
            thread_id = Some(uuid::Uuid::new_v4().to_string());
        }

        let stream = payload.get("stream").and_then(Value::as_bool).unwrap_or(false);
        debug!(stream, use_cache = query.use_cache(), "Dispatching completion request");

        let request = DispatchRequest::new(payload)
            .with_request_id(request_id.clone())
            .with_headers(headers)
            .with_thread_id(thread_id.clone())
            .with_use_cache(query.use_cache());

        if !stream {
            let result = state.dispatcher.dispatch(&runtime, request, None).await;
            return Ok(result_response(&request_id, result));
        }

        let (tx, mut rx) = stream_channel();
        let dispatcher = state.dispatcher.clone();
        let task_request_id = request_id.clone();
        let task_app_id = app_id.clone();
        let task = tokio::spawn(async move {
            with_request_context!(task_request_id, task_app_id, async move {
                dispatcher.dispatch(&runtime, request, Some(tx)).await
            })
        });

        match rx.recv().await {
            Some(first) => Ok(sse_response(
                Some(first),
                rx,
                context_headers(&request_id, thread_id.as_deref()),
            )),
            None => {
                let result = task
                    .await
                    .map_err(|e| AppError::Internal(format!("Dispatch task failed: {}", e)))?;
                Ok(result_response(&request_id, result))
            }
        }
    })
}

/// Per-endpoint health and call metrics of one application.
pub async fn application_metrics(
    State(state): State<Arc<GatewayState>>,
    Path(app_id): Path<String>,
) -> Result<Json<ApplicationMetrics>> {
    Ok(Json(state.runtime(&app_id)?.metrics()))
}

/// Record +1/-1 user feedback against an endpoint.
pub async fn record_feedback(
    State(state): State<Arc<GatewayState>>,
    Path(app_id): Path<String>,
    Json(feedback): Json<FeedbackRequest>,
) -> Result<StatusCode> {
    if feedback.value != 1 && feedback.value != -1 {
        return Err(AppError::BadRequest(
            "Feedback value must be 1 or -1".to_string(),
        ));
    }
    let runtime = state.runtime(&app_id)?;
    let endpoint = runtime.endpoints.get(feedback.endpoint_index).ok_or_else(|| {
        AppError::BadRequest(format!(
            "Application {} has no endpoint {}",
            app_id, feedback.endpoint_index
        ))
    })?;
    endpoint.record_feedback(feedback.value);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn health(State(state): State<Arc<GatewayState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        applications: state.config.load().applications.len(),
        active_applications: state.registry.len(),
    })
}

/// Prometheus metrics in text exposition format.
pub async fn metrics_handler() -> Result<Response> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| AppError::Internal(e.to_string()))?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response())
}
