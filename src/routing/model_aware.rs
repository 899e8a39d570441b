use serde_json::Value;

use super::{RoutingRequest, RoutingStrategy};
use crate::core::config::{EndpointConfig, RouterKind};
use crate::core::error::RoutingConfigError;
use crate::core::tokenizer::append_content;

/// Message role scanned when the application does not configure one.
pub const DEFAULT_MESSAGE_ROLE: &str = "system";

/// Routes by task: the first endpoint with a keyword found in the messages of the
/// configured role wins. Matching is case-insensitive.
#[derive(Debug)]
pub struct ModelAwareRouter {
    message_role: String,
    keywords: Vec<Vec<String>>,
}

impl ModelAwareRouter {
    pub fn new(endpoints: &[EndpointConfig], message_role: Option<&str>) -> Result<Self, RoutingConfigError> {
        let mut keywords = Vec::with_capacity(endpoints.len());
        for (index, endpoint) in endpoints.iter().enumerate() {
            let words: Vec<String> = endpoint
                .task_keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect();
            if words.is_empty() {
                return Err(RoutingConfigError::MissingAttribute {
                    kind: RouterKind::ModelAware,
                    attribute: "task_keywords",
                    index,
                });
            }
            keywords.push(words);
        }

        Ok(Self {
            message_role: message_role.unwrap_or(DEFAULT_MESSAGE_ROLE).to_string(),
            keywords,
        })
    }

    fn role_text(&self, body: &Value) -> String {
        let mut text = String::new();
        if let Some(messages) = body.get("messages").and_then(Value::as_array) {
            for message in messages
                .iter()
                .filter(|m| m.get("role").and_then(Value::as_str) == Some(self.message_role.as_str()))
            {
                if let Some(content) = message.get("content") {
                    append_content(&mut text, content);
                }
            }
        }
        text.to_lowercase()
    }
}

impl RoutingStrategy for ModelAwareRouter {
    fn kind(&self) -> RouterKind {
        RouterKind::ModelAware
    }

    fn select_endpoint(&self, request: &RoutingRequest<'_>) -> usize {
        let text = self.role_text(request.body);
        if text.is_empty() {
            return 0;
        }

        self.keywords
            .iter()
            .position(|words| words.iter().any(|w| text.contains(w.as_str())))
            .unwrap_or(0)
    }
}
