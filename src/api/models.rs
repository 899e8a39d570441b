//! Request and response models of the gateway HTTP API.

use serde::{Deserialize, Serialize};

/// Query parameters of the dispatch endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct DispatchQuery {
    /// Any value other than `false` consults the semantic cache
    pub use_cache: Option<String>,
}

impl DispatchQuery {
    pub fn use_cache(&self) -> bool {
        !self
            .use_cache
            .as_deref()
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("false"))
    }
}

/// User feedback on a served completion.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeedbackRequest {
    pub endpoint_index: usize,
    /// 1 for positive, -1 for negative
    pub value: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    /// Applications present in the configuration
    pub applications: usize,
    /// Applications with live routing state
    pub active_applications: usize,
}
