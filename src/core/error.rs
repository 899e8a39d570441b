//! Error types and handling for the AI application gateway.
//!
//! [`AppError`] is the HTTP-facing error; [`RoutingConfigError`] and [`PollError`]
//! are raised by strategy construction and job polling respectively.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::core::config::RouterKind;

pub const ERROR_TYPE_API: &str = "api_error";
pub const ERROR_TYPE_INVALID_REQUEST: &str = "invalid_request_error";
pub const ERROR_TYPE_RATE_LIMIT: &str = "rate_limit_error";

/// Main error type for the application.
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration-related errors (file not found, parse errors, etc.)
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    /// HTTP request errors from the reqwest client
    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Client provided invalid data
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// No application is configured under the requested id
    #[error("Application not found: {0}")]
    ApplicationNotFound(String),

    /// Every endpoint is throttled or out of rotation
    #[error("Rate limit exceeded: {message}")]
    RateLimitExceeded { message: String, retry_after: f64 },

    /// Generic internal server errors with custom message
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Config(_) | AppError::Serialization(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Request(e) => {
                if e.is_timeout() {
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    StatusCode::BAD_GATEWAY
                }
            }
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::ApplicationNotFound(_) => StatusCode::NOT_FOUND,
            AppError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) | AppError::ApplicationNotFound(_) => {
                ERROR_TYPE_INVALID_REQUEST
            }
            AppError::RateLimitExceeded { .. } => ERROR_TYPE_RATE_LIMIT,
            _ => ERROR_TYPE_API,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let retry_after = match &self {
            AppError::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        };

        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "code": status.as_u16()
            }
        }));

        let mut response = (status, body).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&format_retry_after(secs)) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Render a retry-after value in whole seconds, rounding up.
pub fn format_retry_after(secs: f64) -> String {
    let secs = if secs.is_finite() { secs.max(0.0) } else { 0.0 };
    format!("{}", secs.ceil() as u64)
}

/// Convenience type alias for Results using [`AppError`].
pub type Result<T> = std::result::Result<T, AppError>;

/// Raised when an application's endpoint attributes do not satisfy its routing strategy.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RoutingConfigError {
    #[error("{kind} router requires a `{attribute}` on endpoint {index}")]
    MissingAttribute {
        kind: RouterKind,
        attribute: &'static str,
        index: usize,
    },

    #[error("{kind} router requires endpoint weights summing to 100, got {sum}")]
    WeightSum { kind: RouterKind, sum: u32 },

    #[error("{kind} router requires unique endpoint ids, `{id}` is repeated")]
    DuplicateId { kind: RouterKind, id: String },

    #[error("{kind} router: invalid active window on endpoint {index}: {reason}")]
    InvalidWindow {
        kind: RouterKind,
        index: usize,
        reason: String,
    },
}

/// Failures while polling a long-running backend job.
#[derive(Error, Debug)]
pub enum PollError {
    #[error("Job poll request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Job poll returned status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("Job ended with status `{status}`")]
    JobFailed {
        status: String,
        body: serde_json::Value,
    },

    #[error("Job did not complete after {attempts} attempts")]
    Exhausted { attempts: u32 },
}
