//! One outbound call to a backend endpoint, classified for the dispatch loop.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use serde_json::{json, Value};
use std::time::Instant;
use tracing::{debug, warn};

use super::poller::{poll_job, PollSettings};
use crate::core::config::{EndpointAuth, EndpointConfig};
use crate::health::TokenUsage;
use crate::streaming::{StreamReconstructor, StreamSink};

/// Retry delay assumed when a throttled endpoint sends no usable hint.
pub const DEFAULT_RETRY_AFTER_SECS: f64 = 60.0;

const MAX_ERROR_MESSAGE_LEN: usize = 512;

/// Classified result of a single endpoint attempt.
#[derive(Debug)]
pub enum AttemptOutcome {
    Success(Completion),
    /// 429 with the endpoint's retry hint in seconds
    Throttled { retry_after: f64, body: Value },
    /// 400 or 422; not retried elsewhere
    CallerError { status: u16, body: Value },
    /// Any other status, an unreadable 200, a job that did not complete or a
    /// transport error
    Failed { status: u16, body: Value },
}

/// A successful completion, buffered or reconstructed from a stream.
#[derive(Debug)]
pub struct Completion {
    pub body: Value,
    /// Assistant text, used for conversation memory and usage estimates
    pub text: String,
    pub usage: Option<TokenUsage>,
    /// Time to the full body, or to the response head for streams
    pub latency_ms: u64,
    pub streamed: bool,
    /// False when a stream ended without `[DONE]`
    pub complete: bool,
}

/// Build a POST to the endpoint with its configured credential.
pub fn build_endpoint_request(
    client: &reqwest::Client,
    endpoint: &EndpointConfig,
    payload: &Value,
) -> reqwest::RequestBuilder {
    let request = authorize(client.post(&endpoint.uri), endpoint);
    request.json(payload)
}

pub(crate) fn authorize(
    request: reqwest::RequestBuilder,
    endpoint: &EndpointConfig,
) -> reqwest::RequestBuilder {
    if endpoint.api_key.is_empty() {
        return request;
    }
    match endpoint.auth {
        EndpointAuth::ApiKey => request.header("api-key", &endpoint.api_key),
        EndpointAuth::Bearer => {
            request.header("Authorization", format!("Bearer {}", endpoint.api_key))
        }
    }
}

/// Seconds to wait before retrying, from `retry-after-ms` or `retry-after`.
///
/// `retry-after` may be a number of seconds or an HTTP date.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<f64> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    if let Some(ms) = header("retry-after-ms").and_then(|v| v.trim().parse::<f64>().ok()) {
        if ms.is_finite() && ms >= 0.0 {
            return Some(ms / 1000.0);
        }
    }
    parse_retry_after_seconds(header("retry-after"))
}

fn parse_retry_after_seconds(value: Option<&str>) -> Option<f64> {
    let raw = value?.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(seconds) = raw.parse::<f64>() {
        return (seconds.is_finite() && seconds >= 0.0).then_some(seconds);
    }

    let parsed = DateTime::parse_from_rfc2822(raw).ok()?;
    let now = Utc::now();
    if parsed.with_timezone(&Utc) <= now {
        return Some(0.0);
    }

    let delta = parsed.with_timezone(&Utc) - now;
    Some(delta.num_milliseconds() as f64 / 1000.0)
}

fn operation_location(headers: &HeaderMap) -> Option<String> {
    ["operation-location", "location"]
        .iter()
        .find_map(|name| headers.get(*name).and_then(|v| v.to_str().ok()))
        .map(str::to_string)
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/event-stream"))
}

/// Send `payload` to `endpoint` and classify the response.
///
/// An event-stream 200 is relayed chunk by chunk to `sink` (when given) while
/// being reconstructed into a single completion. A 202 carrying a status location
/// is polled with `poll` until the job settles.
pub async fn call_endpoint(
    client: &reqwest::Client,
    endpoint: &EndpointConfig,
    payload: &Value,
    sink: Option<&StreamSink>,
    started_new_thread: bool,
    poll: PollSettings,
) -> AttemptOutcome {
    let started = Instant::now();

    let response = match build_endpoint_request(client, endpoint, payload).send().await {
        Ok(response) => response,
        Err(e) => {
            warn!(endpoint = %endpoint.label(), error = %e, "Endpoint request failed");
            let status = if e.is_timeout() { 504 } else { 502 };
            return AttemptOutcome::Failed {
                status,
                body: error_body(status, &e.to_string()),
            };
        }
    };

    let status = response.status().as_u16();
    debug!(endpoint = %endpoint.label(), status, "Endpoint responded");

    match status {
        200 if is_event_stream(response.headers()) => {
            let latency_ms = started.elapsed().as_millis() as u64;
            relay_stream(response, sink, started_new_thread, latency_ms).await
        }
        200 => match response.bytes().await {
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(body) => {
                    let usage = body.get("usage").and_then(TokenUsage::from_value);
                    let text = completion_text(&body);
                    AttemptOutcome::Success(Completion {
                        body,
                        text,
                        usage,
                        latency_ms: started.elapsed().as_millis() as u64,
                        streamed: false,
                        complete: true,
                    })
                }
                Err(e) => AttemptOutcome::Failed {
                    status: 502,
                    body: error_body(502, &format!("Endpoint returned invalid JSON: {}", e)),
                },
            },
            Err(e) => AttemptOutcome::Failed {
                status: 502,
                body: error_body(502, &format!("Failed to read endpoint response: {}", e)),
            },
        },
        202 => match operation_location(response.headers()) {
            Some(poll_uri) => follow_job(client, endpoint, &poll_uri, poll, started).await,
            None => AttemptOutcome::Failed {
                status: 502,
                body: error_body(502, "Endpoint accepted the request without a status location"),
            },
        },
        429 => {
            let retry_after =
                parse_retry_after(response.headers()).unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            let body = read_error_body(response, status).await;
            AttemptOutcome::Throttled { retry_after, body }
        }
        400 | 422 => AttemptOutcome::CallerError {
            status,
            body: read_error_body(response, status).await,
        },
        _ => AttemptOutcome::Failed {
            status,
            body: read_error_body(response, status).await,
        },
    }
}

async fn follow_job(
    client: &reqwest::Client,
    endpoint: &EndpointConfig,
    poll_uri: &str,
    poll: PollSettings,
    started: Instant,
) -> AttemptOutcome {
    debug!(endpoint = %endpoint.label(), poll_uri, "Endpoint accepted job, polling");
    match poll_job(client, poll_uri, endpoint, poll).await {
        Ok(job) => {
            let body = job.get("result").cloned().unwrap_or(job);
            let usage = body.get("usage").and_then(TokenUsage::from_value);
            AttemptOutcome::Success(Completion {
                text: completion_text(&body),
                body,
                usage,
                latency_ms: started.elapsed().as_millis() as u64,
                streamed: false,
                complete: true,
            })
        }
        Err(e) => {
            warn!(endpoint = %endpoint.label(), error = %e, "Endpoint job did not complete");
            AttemptOutcome::Failed {
                status: 502,
                body: error_body(502, &e.to_string()),
            }
        }
    }
}

async fn relay_stream(
    response: reqwest::Response,
    sink: Option<&StreamSink>,
    started_new_thread: bool,
    latency_ms: u64,
) -> AttemptOutcome {
    let mut reconstructor = StreamReconstructor::new();
    reconstructor.set_started_new_thread(started_new_thread);

    let mut chunks = response.bytes_stream();
    while let Some(chunk) = chunks.next().await {
        let chunk: Bytes = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(error = %e, "Endpoint stream interrupted");
                break;
            }
        };
        reconstructor.feed(&chunk);
        if let Some(sink) = sink {
            if sink.send(chunk).await.is_err() {
                debug!("Caller went away, stopping stream relay");
                break;
            }
        }
    }

    let completion = reconstructor.finish();
    AttemptOutcome::Success(Completion {
        body: completion.to_chat_completion(),
        text: completion.text.clone(),
        usage: completion.usage,
        latency_ms,
        streamed: true,
        complete: completion.completed,
    })
}

pub(crate) fn completion_text(body: &Value) -> String {
    body.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Endpoint error body, parsed as JSON when possible.
async fn read_error_body(response: reqwest::Response, status: u16) -> Value {
    match response.bytes().await {
        Ok(bytes) => serde_json::from_slice::<Value>(&bytes).unwrap_or_else(|_| {
            let text = String::from_utf8_lossy(&bytes);
            if text.trim().is_empty() {
                error_body(status, &format!("HTTP {}", status))
            } else {
                error_body(status, &truncate_message(&text))
            }
        }),
        Err(e) => error_body(status, &format!("Failed to read response: {}", e)),
    }
}

pub(crate) fn error_body(status: u16, message: &str) -> Value {
    json!({
        "error": {
            "message": message,
            "type": "api_error",
            "code": status
        }
    })
}

fn truncate_message(message: &str) -> String {
    let mut chars = message.chars();
    let truncated: String = chars.by_ref().take(MAX_ERROR_MESSAGE_LEN).collect();
    if chars.next().is_some() {
        format!("{}...", truncated)
    } else {
        truncated
    }
}
