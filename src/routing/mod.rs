//! Endpoint routing strategies.
//!
//! A strategy suggests the index of the endpoint a request should try first; the
//! dispatcher then fails over through the remaining endpoints in configured order.
//! Strategies are built once per application by [`build_strategy`], which validates
//! the endpoint attributes each strategy needs and falls back to [`PriorityRouter`]
//! when they are missing.

mod header;
mod least_connections;
mod model_aware;
mod payload;
mod priority;
mod round_robin;
mod time_aware;
mod token_aware;
mod weighted;

use axum::http::HeaderMap;
use chrono::{DateTime, Local};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::config::{EndpointConfig, RouterKind, RoutingConfig};
use crate::core::error::RoutingConfigError;

pub use header::{HeaderValueRouter, DEFAULT_ENDPOINT_HEADER};
pub use least_connections::LeastConnectionsRouter;
pub use model_aware::{ModelAwareRouter, DEFAULT_MESSAGE_ROLE};
pub use payload::PayloadSizeRouter;
pub use priority::PriorityRouter;
pub use round_robin::RoundRobinRouter;
pub use time_aware::TimeAwareRouter;
pub use token_aware::TokenAwareRouter;
pub use weighted::{WeightTable, WeightedDynamicRouter, WeightedRandomRouter, DEFAULT_LATENCY_MS};

/// The parts of an inbound request a routing strategy may inspect.
#[derive(Debug, Clone)]
pub struct RoutingRequest<'a> {
    pub body: &'a Value,
    pub headers: &'a HeaderMap,
    /// Request body size in bytes
    pub content_length: usize,
    pub now: DateTime<Local>,
}

impl<'a> RoutingRequest<'a> {
    /// Build a routing view, taking the content length from the `content-length`
    /// header when present and from the serialized body otherwise.
    pub fn new(body: &'a Value, headers: &'a HeaderMap) -> Self {
        let content_length = headers
            .get(axum::http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or_else(|| serde_json::to_vec(body).map(|b| b.len()).unwrap_or(0));

        Self {
            body,
            headers,
            content_length,
            now: Local::now(),
        }
    }

    pub fn with_now(mut self, now: DateTime<Local>) -> Self {
        self.now = now;
        self
    }

    pub fn with_content_length(mut self, content_length: usize) -> Self {
        self.content_length = content_length;
        self
    }
}

/// A load balancing algorithm selecting the first endpoint to try.
pub trait RoutingStrategy: Send + Sync {
    fn kind(&self) -> RouterKind;

    /// Index of the endpoint to try first.
    fn select_endpoint(&self, request: &RoutingRequest<'_>) -> usize;

    /// Called before a call is sent to endpoint `index`.
    fn connection_opened(&self, _index: usize) {}

    /// Called after a call to endpoint `index` finished, whatever the outcome.
    fn connection_closed(&self, _index: usize) {}

    /// Latest observed latency of a successful call to endpoint `index`.
    fn record_latency(&self, _index: usize, _latency_ms: u64) {}

    /// Selection weights per endpoint, for strategies that keep a weighted table.
    fn current_weights(&self) -> Option<Vec<u32>> {
        None
    }
}

/// Build and validate the strategy configured for an application.
pub fn try_build_strategy(
    routing: &RoutingConfig,
    endpoints: &[EndpointConfig],
) -> Result<Arc<dyn RoutingStrategy>, RoutingConfigError> {
    let strategy: Arc<dyn RoutingStrategy> = match routing.strategy {
        RouterKind::Priority => Arc::new(PriorityRouter),
        RouterKind::RoundRobin => Arc::new(RoundRobinRouter::new(endpoints.len())),
        RouterKind::LeastConnections => Arc::new(LeastConnectionsRouter::new(endpoints.len())),
        RouterKind::WeightedRandom => Arc::new(WeightedRandomRouter::new(endpoints)?),
        RouterKind::WeightedDynamic => Arc::new(WeightedDynamicRouter::new(endpoints)?),
        RouterKind::PayloadSize => Arc::new(PayloadSizeRouter::new(endpoints)?),
        RouterKind::HeaderValue => {
            Arc::new(HeaderValueRouter::new(endpoints, routing.header_name.as_deref())?)
        }
        RouterKind::ModelAware => {
            Arc::new(ModelAwareRouter::new(endpoints, routing.message_role.as_deref())?)
        }
        RouterKind::TokenAware => Arc::new(TokenAwareRouter::new(endpoints)?),
        RouterKind::TimeAware => Arc::new(TimeAwareRouter::new(endpoints)?),
    };
    Ok(strategy)
}

/// Build the strategy configured for `app_id`, falling back to priority routing
/// when the endpoints lack attributes the strategy requires.
pub fn build_strategy(
    app_id: &str,
    routing: &RoutingConfig,
    endpoints: &[EndpointConfig],
) -> Arc<dyn RoutingStrategy> {
    match try_build_strategy(routing, endpoints) {
        Ok(strategy) => {
            info!(app_id, strategy = %strategy.kind(), endpoints = endpoints.len(), "Routing strategy ready");
            strategy
        }
        Err(e) => {
            warn!(
                app_id,
                strategy = %routing.strategy,
                error = %e,
                "Invalid routing configuration, falling back to priority routing"
            );
            Arc::new(PriorityRouter)
        }
    }
}

/// Fetch attribute `T` from every endpoint or report the first one missing it.
pub(crate) fn require_all<T>(
    kind: RouterKind,
    attribute: &'static str,
    endpoints: &[EndpointConfig],
    get: impl Fn(&EndpointConfig) -> Option<T>,
) -> Result<Vec<T>, RoutingConfigError> {
    endpoints
        .iter()
        .enumerate()
        .map(|(index, endpoint)| {
            get(endpoint).ok_or(RoutingConfigError::MissingAttribute {
                kind,
                attribute,
                index,
            })
        })
        .collect()
}


#[cfg(test)]
mod tests {
    use super::test_support::endpoints;
    use super::*;
    use serde_json::json;

    fn routing(kind: RouterKind) -> RoutingConfig {
        RoutingConfig {
            strategy: kind,
            ..Default::default()
        }
    }

    #[test]
    fn test_content_length_from_header_or_body() {
        let body = json!({"messages": []});
        let mut headers = HeaderMap::new();
        let request = RoutingRequest::new(&body, &headers);
        assert_eq!(request.content_length, serde_json::to_vec(&body).unwrap().len());

        headers.insert("content-length", "4096".parse().unwrap());
        let request = RoutingRequest::new(&body, &headers);
        assert_eq!(request.content_length, 4096);
    }

    #[test]
    fn test_build_strategy_kinds() {
        let eps = endpoints(2);
        for kind in [
            RouterKind::Priority,
            RouterKind::RoundRobin,
            RouterKind::LeastConnections,
        ] {
            assert_eq!(build_strategy("app", &routing(kind), &eps).kind(), kind);
        }
    }

    #[test]
    fn test_invalid_config_falls_back_to_priority() {
        let eps = endpoints(3);
        for kind in [
            RouterKind::WeightedRandom,
            RouterKind::WeightedDynamic,
            RouterKind::PayloadSize,
            RouterKind::HeaderValue,
            RouterKind::ModelAware,
            RouterKind::TokenAware,
            RouterKind::TimeAware,
        ] {
            assert!(try_build_strategy(&routing(kind), &eps).is_err(), "{kind} accepted bare endpoints");
            let strategy = build_strategy("app", &routing(kind), &eps);
            assert_eq!(strategy.kind(), RouterKind::Priority);
        }
    }

    #[test]
    fn test_require_all_reports_first_missing() {
        let mut eps = endpoints(3);
        eps[0].rpm = Some(10);
        let err = require_all(RouterKind::PayloadSize, "rpm", &eps, |e| e.rpm).unwrap_err();
        assert_eq!(
            err,
            RoutingConfigError::MissingAttribute {
                kind: RouterKind::PayloadSize,
                attribute: "rpm",
                index: 1
            }
        );
    }
}
