use super::{RoutingRequest, RoutingStrategy};
use crate::core::config::RouterKind;

/// Always starts with the first configured endpoint; failover follows list order.
#[derive(Debug, Default, Clone, Copy)]
pub struct PriorityRouter;

impl RoutingStrategy for PriorityRouter {
    fn kind(&self) -> RouterKind {
        RouterKind::Priority
    }

    fn select_endpoint(&self, _request: &RoutingRequest<'_>) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;
    use serde_json::json;

    #[test]
    fn test_priority_always_first() {
        let body = json!({});
        let headers = HeaderMap::new();
        let request = RoutingRequest::new(&body, &headers);
        for _ in 0..5 {
            assert_eq!(PriorityRouter.select_endpoint(&request), 0);
        }
    }
}
