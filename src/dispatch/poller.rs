//! Polling of long-running backend jobs (agent runs, batch completions).

use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

use super::outbound::authorize;
use crate::core::config::EndpointConfig;
use crate::core::error::PollError;

const TERMINAL_FAILURES: [&str; 3] = ["failed", "cancelled", "expired"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: 6,
        }
    }
}

/// GET `uri` until the job reports `completed`, returning the final status body.
///
/// Sleeps `interval` between attempts; dropping the future cancels the poll.
pub async fn poll_job(
    client: &reqwest::Client,
    uri: &str,
    endpoint: &EndpointConfig,
    settings: PollSettings,
) -> Result<Value, PollError> {
    for attempt in 1..=settings.max_attempts {
        let response = authorize(client.get(uri), endpoint).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PollError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = response.json().await?;
        let job_status = body
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_ascii_lowercase();
        debug!(attempt, status = %job_status, "Polled job status");

        if job_status == "completed" {
            info!(attempts = attempt, "Job completed");
            return Ok(body);
        }
        if TERMINAL_FAILURES.contains(&job_status.as_str()) {
            return Err(PollError::JobFailed {
                status: job_status,
                body,
            });
        }

        if attempt < settings.max_attempts {
            tokio::time::sleep(settings.interval).await;
        }
    }

    Err(PollError::Exhausted {
        attempts: settings.max_attempts,
    })
}
