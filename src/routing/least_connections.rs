use std::sync::atomic::{AtomicUsize, Ordering};

use super::{RoutingRequest, RoutingStrategy};
use crate::core::config::RouterKind;

/// Picks the endpoint with the fewest in-flight calls (lowest index on ties).
#[derive(Debug)]
pub struct LeastConnectionsRouter {
    active: Vec<AtomicUsize>,
}

impl LeastConnectionsRouter {
    pub fn new(endpoint_count: usize) -> Self {
        Self {
            active: (0..endpoint_count).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    pub fn active_connections(&self) -> Vec<usize> {
        self.active.iter().map(|c| c.load(Ordering::Relaxed)).collect()
    }
}

impl RoutingStrategy for LeastConnectionsRouter {
    fn kind(&self) -> RouterKind {
        RouterKind::LeastConnections
    }

    fn select_endpoint(&self, _request: &RoutingRequest<'_>) -> usize {
        self.active
            .iter()
            .enumerate()
            .min_by_key(|(i, count)| (count.load(Ordering::Relaxed), *i))
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    fn connection_opened(&self, index: usize) {
        if let Some(count) = self.active.get(index) {
            count.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn connection_closed(&self, index: usize) {
        if let Some(count) = self.active.get(index) {
            let _ = count.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                Some(c.saturating_sub(1))
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;
    use serde_json::json;

    #[test]
    fn test_selects_least_busy() {
        let router = LeastConnectionsRouter::new(3);
        let body = json!({});
        let headers = HeaderMap::new();
        let request = RoutingRequest::new(&body, &headers);

        assert_eq!(router.select_endpoint(&request), 0);
        router.connection_opened(0);
        assert_eq!(router.select_endpoint(&request), 1);
        router.connection_opened(1);
        router.connection_opened(1);
        assert_eq!(router.select_endpoint(&request), 2);
        router.connection_opened(2);
        assert_eq!(router.select_endpoint(&request), 0);

        router.connection_closed(1);
        router.connection_closed(1);
        assert_eq!(router.select_endpoint(&request), 1);
        assert_eq!(router.active_connections(), vec![1, 0, 1]);
    }

    #[test]
    fn test_close_never_underflows() {
        let router = LeastConnectionsRouter::new(1);
        router.connection_closed(0);
        router.connection_closed(7);
        assert_eq!(router.active_connections(), vec![0]);
    }
}
