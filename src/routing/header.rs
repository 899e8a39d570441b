use std::collections::HashSet;

use super::{require_all, RoutingRequest, RoutingStrategy};
use crate::core::config::{EndpointConfig, RouterKind};
use crate::core::error::RoutingConfigError;

/// Header consulted when the application does not configure one.
pub const DEFAULT_ENDPOINT_HEADER: &str = "x-endpoint-id";

/// Routes to the endpoint whose `id` equals the value of a request header.
#[derive(Debug)]
pub struct HeaderValueRouter {
    header_name: String,
    ids: Vec<String>,
}

impl HeaderValueRouter {
    pub fn new(endpoints: &[EndpointConfig], header_name: Option<&str>) -> Result<Self, RoutingConfigError> {
        let kind = RouterKind::HeaderValue;
        let ids = require_all(kind, "id", endpoints, |e| e.id.clone())?;

        let mut seen = HashSet::new();
        if let Some(dup) = ids.iter().find(|id| !seen.insert(id.as_str())) {
            return Err(RoutingConfigError::DuplicateId {
                kind,
                id: dup.clone(),
            });
        }

        Ok(Self {
            header_name: header_name
                .unwrap_or(DEFAULT_ENDPOINT_HEADER)
                .to_ascii_lowercase(),
            ids,
        })
    }

    pub fn header_name(&self) -> &str {
        &self.header_name
    }
}

impl RoutingStrategy for HeaderValueRouter {
    fn kind(&self) -> RouterKind {
        RouterKind::HeaderValue
    }

    fn select_endpoint(&self, request: &RoutingRequest<'_>) -> usize {
        let Some(value) = request
            .headers
            .get(self.header_name.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
        else {
            return 0;
        };

        self.ids.iter().position(|id| id == value).unwrap_or(0)
    }
}
