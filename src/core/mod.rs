//! Core functionality for the gateway.
//!
//! This module contains fundamental components used throughout the application:
//! - Configuration management
//! - Error handling
//! - Logging context
//! - Metrics collection
//! - Token counting

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod tokenizer;

// Re-export commonly used types
pub use config::{AppConfig, ApplicationConfig, EndpointConfig, RouterKind, ServerConfig};
pub use error::{AppError, PollError, Result, RoutingConfigError};
pub use logging::{generate_request_id, get_request_id, REQUEST_ID};
pub use metrics::{get_metrics, init_metrics, Metrics};
