//! HTTP API of the gateway.

pub mod handlers;
pub mod models;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;

pub use handlers::{
    application_metrics, dispatch_completion, health, metrics_handler, record_feedback,
    GatewayState, CACHE_HEADER, REQUEST_ID_HEADER, THREAD_ID_HEADER,
};
pub use models::{DispatchQuery, FeedbackRequest, HealthResponse};

/// Largest accepted completion request body.
pub const MAX_REQUEST_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Build the gateway router.
pub fn create_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/api/v1/lb/:app_id", post(dispatch_completion))
        .route("/api/v1/metrics/:app_id", get(application_metrics))
        .route("/api/v1/feedback/:app_id", post(record_feedback))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .with_state(state)
}
