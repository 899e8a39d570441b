use super::{RoutingRequest, RoutingStrategy};
use crate::core::config::{EndpointConfig, RouterKind};
use crate::core::error::RoutingConfigError;
use crate::core::tokenizer::{count_tokens, encoding_for_family, prompt_text, Encoding};

#[derive(Debug)]
struct TokenLimit {
    encoding: Encoding,
    threshold: usize,
}

/// Sends a request to the first endpoint whose token threshold fits the prompt,
/// counted with that endpoint's model family encoding. Larger prompts go to the
/// last endpoint.
#[derive(Debug)]
pub struct TokenAwareRouter {
    limits: Vec<TokenLimit>,
}

impl TokenAwareRouter {
    pub fn new(endpoints: &[EndpointConfig]) -> Result<Self, RoutingConfigError> {
        let kind = RouterKind::TokenAware;
        let mut limits = Vec::with_capacity(endpoints.len());
        for (index, endpoint) in endpoints.iter().enumerate() {
            let family = endpoint
                .model_family
                .as_deref()
                .filter(|f| !f.trim().is_empty())
                .ok_or(RoutingConfigError::MissingAttribute {
                    kind,
                    attribute: "model_family",
                    index,
                })?;
            let threshold = endpoint.token_threshold.ok_or(RoutingConfigError::MissingAttribute {
                kind,
                attribute: "token_threshold",
                index,
            })?;
            limits.push(TokenLimit {
                encoding: encoding_for_family(family),
                threshold,
            });
        }
        Ok(Self { limits })
    }
}

impl RoutingStrategy for TokenAwareRouter {
    fn kind(&self) -> RouterKind {
        RouterKind::TokenAware
    }

    fn select_endpoint(&self, request: &RoutingRequest<'_>) -> usize {
        let text = prompt_text(request.body);
        let mut counts: Vec<(Encoding, usize)> = Vec::with_capacity(2);

        for (index, limit) in self.limits.iter().enumerate() {
            let tokens = match counts.iter().find(|(e, _)| *e == limit.encoding) {
                Some((_, n)) => *n,
                None => {
                    let n = count_tokens(&text, limit.encoding);
                    counts.push((limit.encoding, n));
                    n
                }
            };
            if tokens <= limit.threshold {
                tracing::debug!(index, tokens, threshold = limit.threshold, "Token aware route");
                return index;
            }
        }
        self.limits.len().saturating_sub(1)
    }
}
