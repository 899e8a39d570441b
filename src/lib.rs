//! AI Application Gateway - routing, resilience and streaming for AI chat completions
//!
//! Each configured AI application fronts several backend replicas of a chat
//! completion API. The gateway picks an endpoint per request and fails over
//! through the remaining ones:
//!
//! - **Routing Strategies**: priority, round robin, weighted random or latency
//!   weighted, least connections, payload size, header value, model aware, token
//!   aware and time aware selection
//! - **Endpoint Health**: circuit breaker on throttling, RPM ceilings, optional
//!   latency/error health policy, rolling call metrics with bounded history
//! - **Streaming Support**: raw SSE relay with in-flight reconstruction of the
//!   completion for memory, cache and persistence
//! - **Session Affinity**: conversation threads pinned to the endpoint that started them
//! - **Metrics & Monitoring**: Prometheus metrics for observability
//!
//! # Architecture
//!
//! - [`core`]: configuration, errors, logging context, metrics, tokenizer
//! - [`health`]: per-endpoint admission control and call metrics
//! - [`routing`]: endpoint selection strategies
//! - [`streaming`]: SSE reconstruction and relay
//! - [`registry`]: per-application runtime state
//! - [`dispatch`]: the failover loop and its collaborators
//! - [`api`]: HTTP handlers and router
//!
//! # Configuration
//!
//! Applications and endpoints are read from a YAML file (`CONFIG_PATH`, default
//! `config.yaml`). Optional environment variables:
//! - `HOST`: Server bind address (default: 0.0.0.0)
//! - `PORT`: Server port (default: 8000)
//! - `VERIFY_SSL`: Verify SSL certificates for backends (default: true)
//! - `REQUEST_TIMEOUT_SECS`: Request timeout in seconds (default: 300)

pub mod api;
pub mod core;
pub mod dispatch;
pub mod health;
pub mod registry;
pub mod routing;
pub mod streaming;

// Re-export commonly used types for convenience
pub use api::{create_router, GatewayState};
pub use core::{AppConfig, AppError, ApplicationConfig, EndpointConfig, Result, RouterKind};
pub use dispatch::{DispatchRequest, DispatchResult, Dispatcher};
pub use health::{EndpointHealth, HealthSettings};
pub use registry::{ApplicationRuntime, Registry};
pub use routing::RoutingStrategy;
pub use streaming::StreamReconstructor;
