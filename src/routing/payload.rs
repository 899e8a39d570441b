use super::{require_all, RoutingRequest, RoutingStrategy};
use crate::core::config::{EndpointConfig, RouterKind};
use crate::core::error::RoutingConfigError;

/// Sends a request to the first endpoint whose payload threshold fits its body size;
/// oversized requests go to the last endpoint.
#[derive(Debug)]
pub struct PayloadSizeRouter {
    thresholds: Vec<usize>,
}

impl PayloadSizeRouter {
    pub fn new(endpoints: &[EndpointConfig]) -> Result<Self, RoutingConfigError> {
        let thresholds = require_all(
            RouterKind::PayloadSize,
            "payload_threshold_bytes",
            endpoints,
            |e| e.payload_threshold_bytes,
        )?;
        Ok(Self { thresholds })
    }
}

impl RoutingStrategy for PayloadSizeRouter {
    fn kind(&self) -> RouterKind {
        RouterKind::PayloadSize
    }

    fn select_endpoint(&self, request: &RoutingRequest<'_>) -> usize {
        self.thresholds
            .iter()
            .position(|threshold| *threshold >= request.content_length)
            .unwrap_or_else(|| self.thresholds.len().saturating_sub(1))
    }
}
