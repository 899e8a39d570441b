//! Token usage as reported by chat completion backends, and its cost.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::config::ModelPricing;

/// Token usage of one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    /// Prompt tokens served from the backend's prompt cache
    #[serde(default)]
    pub cached_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            cached_tokens: 0,
        }
    }

    /// Parse a `usage` object, tolerating missing fields.
    pub fn from_value(usage: &Value) -> Option<Self> {
        let obj = usage.as_object()?;
        let field = |name: &str| obj.get(name).and_then(Value::as_u64).unwrap_or(0);

        let prompt_tokens = field("prompt_tokens");
        let completion_tokens = field("completion_tokens");
        let total_tokens = match obj.get("total_tokens").and_then(Value::as_u64) {
            Some(total) => total,
            None => prompt_tokens + completion_tokens,
        };
        let cached_tokens = usage
            .pointer("/prompt_tokens_details/cached_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        Some(Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
            cached_tokens,
        })
    }

    /// Render as an OpenAI style `usage` object.
    pub fn to_value(&self) -> Value {
        let mut usage = serde_json::json!({
            "prompt_tokens": self.prompt_tokens,
            "completion_tokens": self.completion_tokens,
            "total_tokens": self.total_tokens,
        });
        if self.cached_tokens > 0 {
            usage["prompt_tokens_details"] = serde_json::json!({ "cached_tokens": self.cached_tokens });
        }
        usage
    }

    /// Cost of this usage under `pricing` (prices are per 1k tokens).
    pub fn cost(&self, pricing: &ModelPricing) -> f64 {
        let cached = self.cached_tokens.min(self.prompt_tokens);
        let uncached = self.prompt_tokens - cached;

        (uncached as f64 * pricing.input_cost_per_1k
            + cached as f64 * pricing.cached_input_cost_per_1k
            + self.completion_tokens as f64 * pricing.output_cost_per_1k)
            / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pricing() -> ModelPricing {
        ModelPricing {
            model_name: Some("gpt-4o".to_string()),
            input_cost_per_1k: 0.005,
            cached_input_cost_per_1k: 0.0025,
            output_cost_per_1k: 0.015,
        }
    }

    #[test]
    fn test_from_value_full() {
        let usage = TokenUsage::from_value(&json!({
            "prompt_tokens": 120,
            "completion_tokens": 30,
            "total_tokens": 150,
            "prompt_tokens_details": {"cached_tokens": 100}
        }))
        .unwrap();
        assert_eq!(usage.prompt_tokens, 120);
        assert_eq!(usage.completion_tokens, 30);
        assert_eq!(usage.total_tokens, 150);
        assert_eq!(usage.cached_tokens, 100);
    }

    #[test]
    fn test_from_value_derives_total() {
        let usage = TokenUsage::from_value(&json!({"prompt_tokens": 7, "completion_tokens": 3})).unwrap();
        assert_eq!(usage.total_tokens, 10);
        assert!(TokenUsage::from_value(&json!(null)).is_none());
    }

    #[test]
    fn test_cost_without_cache() {
        let cost = TokenUsage::new(1000, 1000).cost(&pricing());
        assert!((cost - 0.020).abs() < 1e-9);
    }

    #[test]
    fn test_cost_with_cached_prompt_tokens() {
        let usage = TokenUsage {
            prompt_tokens: 1000,
            completion_tokens: 0,
            total_tokens: 1000,
            cached_tokens: 400,
        };
        // 600 uncached at 0.005 plus 400 cached at 0.0025
        let cost = usage.cost(&pricing());
        assert!((cost - 0.004).abs() < 1e-9);
    }

    #[test]
    fn test_to_value_includes_cached_details() {
        let usage = TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 2,
            total_tokens: 12,
            cached_tokens: 4,
        };
        let value = usage.to_value();
        assert_eq!(value["total_tokens"], 12);
        assert_eq!(value["prompt_tokens_details"]["cached_tokens"], 4);
        assert!(TokenUsage::new(1, 1).to_value().get("prompt_tokens_details").is_none());
    }
}
