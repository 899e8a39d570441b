//! Per-endpoint admission control and call metrics.
//!
//! Each backend endpoint owns one [`EndpointHealth`] handle. The handle combines
//! a timestamp circuit breaker (`unavailable_until`), a fixed one-minute RPM window
//! and rolling call counters that are periodically closed into a bounded history.
//!
//! Checks and updates are individually atomic but a check followed by an outbound
//! call is not: concurrent requests may both pass an RPM check just under the
//! ceiling. The RPM ceiling is a soft limit.

pub mod history;
pub mod usage;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::core::config::{EndpointConfig, HealthPolicy, MetricsConfig, ModelPricing};
use crate::core::logging::get_request_id;

pub use history::{CallCounters, MetricsBucket, MetricsHistory};
pub use usage::TokenUsage;

const RPM_WINDOW: Duration = Duration::from_secs(60);

/// Upper bound applied to retry-after values received from backends.
const MAX_RETRY_AFTER_SECS: f64 = 24.0 * 60.0 * 60.0;

/// Metrics collection settings shared by all endpoints of a registry.
#[derive(Debug, Clone, Copy)]
pub struct HealthSettings {
    pub collection_interval: Duration,
    pub history_count: usize,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self::from(&MetricsConfig::default())
    }
}

impl From<&MetricsConfig> for HealthSettings {
    fn from(config: &MetricsConfig) -> Self {
        Self {
            collection_interval: config.collection_interval(),
            history_count: config.history_count,
        }
    }
}

#[derive(Debug)]
struct EndpointHealthState {
    unavailable_until: Instant,
    rpm_window_start: Instant,
    rpm_count: u32,
    consecutive_violations: u32,
    counters: CallCounters,
    bucket_start: Instant,
    bucket_started_at: DateTime<Local>,
    history: MetricsHistory,
}

/// Health and metrics state of one backend endpoint.
#[derive(Debug)]
pub struct EndpointHealth {
    label: String,
    id: Option<String>,
    uri: String,
    rpm_limit: Option<u32>,
    policy: Option<HealthPolicy>,
    pricing: Option<ModelPricing>,
    settings: HealthSettings,
    state: Mutex<EndpointHealthState>,
}

/// Point-in-time view of an endpoint's counters.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    /// Seconds until the circuit breaker marker elapses (0 when elapsed)
    pub unavailable_for_secs: f64,
    pub rpm_limit: Option<u32>,
    pub rpm_count: u32,
    pub current: CallCounters,
    pub history: Vec<MetricsBucket>,
}

impl EndpointHealth {
    pub fn new(config: &EndpointConfig, settings: HealthSettings) -> Self {
        Self::new_at(config, settings, Instant::now())
    }

    pub fn new_at(config: &EndpointConfig, settings: HealthSettings, now: Instant) -> Self {
        let health = Self {
            label: config.label().to_string(),
            id: config.id.clone(),
            uri: config.uri.clone(),
            rpm_limit: config.rpm.filter(|limit| *limit > 0),
            policy: config.health_policy.clone(),
            pricing: config.pricing.clone(),
            settings,
            state: Mutex::new(EndpointHealthState {
                unavailable_until: now,
                rpm_window_start: now,
                rpm_count: 0,
                consecutive_violations: 0,
                counters: CallCounters::default(),
                bucket_start: now,
                bucket_started_at: Local::now(),
                history: MetricsHistory::new(settings.history_count),
            }),
        };

        debug!(
            endpoint = %health.label,
            uri = %health.uri,
            rpm_limit = ?health.rpm_limit,
            collection_interval_secs = settings.collection_interval.as_secs(),
            history_count = settings.history_count,
            "Endpoint health tracker created"
        );
        health
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Whether the endpoint may receive a call now, and if not, how many seconds until it may.
    pub fn is_healthy(&self) -> (bool, f64) {
        self.is_healthy_at(Instant::now())
    }

    pub fn is_healthy_at(&self, now: Instant) -> (bool, f64) {
        let mut state = self.state.lock();

        if now < state.unavailable_until {
            let retry = state.unavailable_until.saturating_duration_since(now);
            return (false, retry.as_secs_f64());
        }

        if let Some(limit) = self.rpm_limit {
            let elapsed = now.saturating_duration_since(state.rpm_window_start);
            if elapsed > RPM_WINDOW {
                state.rpm_window_start = now;
                state.rpm_count = 0;
            } else if state.rpm_count >= limit {
                let retry = RPM_WINDOW.saturating_sub(elapsed).as_secs_f64();
                warn!(
                    request_id = %get_request_id(),
                    endpoint = %self.label,
                    rpm_limit = limit,
                    retry_after = retry,
                    "Hit max configured RPM for this endpoint"
                );
                return (false, retry);
            }
        }

        (true, 0.0)
    }

    /// Record a successful call.
    ///
    /// `usage` feeds the token and cost counters. With a health policy, a call slower
    /// than the latency threshold still succeeds but counts as a violation; enough
    /// consecutive violations take the endpoint out of rotation.
    pub fn record_success(&self, usage: Option<&TokenUsage>, latency_ms: u64, started_new_thread: bool) {
        self.record_success_at(usage, latency_ms, started_new_thread, Instant::now())
    }

    pub fn record_success_at(
        &self,
        usage: Option<&TokenUsage>,
        latency_ms: u64,
        started_new_thread: bool,
        now: Instant,
    ) {
        let mut state = self.state.lock();
        self.roll_bucket(&mut state, now);

        if started_new_thread {
            state.counters.thread_count += 1;
        }

        if let Some(usage) = usage.filter(|u| u.total_tokens > 0) {
            state.counters.total_tokens += usage.total_tokens;
            if let Some(pricing) = &self.pricing {
                state.counters.total_cost += usage.cost(pricing);
            }
        }

        state.counters.latency_ms_total += latency_ms;
        state.counters.api_calls += 1;
        state.counters.total_api_calls += 1;

        if self.rpm_limit.is_some() {
            if now.saturating_duration_since(state.rpm_window_start) > RPM_WINDOW {
                state.rpm_window_start = now;
                state.rpm_count = 0;
            }
            state.rpm_count += 1;
        }

        if let Some(policy) = &self.policy {
            if latency_ms > policy.latency_threshold_ms {
                state.consecutive_violations += 1;
                if state.consecutive_violations >= policy.max_calls_before_unhealthy.max(1) {
                    self.demote(&mut state, policy, now, "latency threshold exceeded");
                }
            } else {
                state.consecutive_violations = 0;
            }
        }
    }

    /// Record a failed call.
    ///
    /// The endpoint stays out of rotation for `retry_after_secs`; the marker never moves
    /// backwards. 429 counts as throttled and 400 as filtered.
    pub fn record_failure(&self, status: u16, retry_after_secs: f64) {
        self.record_failure_at(status, retry_after_secs, Instant::now())
    }

    pub fn record_failure_at(&self, status: u16, retry_after_secs: f64, now: Instant) {
        let mut state = self.state.lock();
        self.roll_bucket(&mut state, now);

        let until = now + secs_to_duration(retry_after_secs);
        if until > state.unavailable_until {
            state.unavailable_until = until;
        }

        state.counters.failed_api_calls += 1;
        match status {
            429 => state.counters.throttled_api_calls += 1,
            400 => state.counters.filtered_api_calls += 1,
            _ => {}
        }
        state.counters.total_api_calls += 1;

        if let Some(policy) = &self.policy {
            if (200..500).contains(&status) {
                state.consecutive_violations = 0;
            } else {
                state.consecutive_violations += 1;
                if state.consecutive_violations >= policy.max_calls_before_unhealthy.max(1) {
                    self.demote(&mut state, policy, now, "consecutive backend failures");
                }
            }
        }
    }

    /// Record a user feedback vote (+1 / -1) for responses served by this endpoint.
    pub fn record_feedback(&self, delta: i64) {
        let mut state = self.state.lock();
        self.roll_bucket(&mut state, Instant::now());
        state.counters.feedback_count += delta;
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> HealthSnapshot {
        let mut state = self.state.lock();
        self.roll_bucket(&mut state, now);

        HealthSnapshot {
            endpoint: self.label.clone(),
            id: self.id.clone(),
            uri: self.uri.clone(),
            model_name: self.pricing.as_ref().and_then(|p| p.model_name.clone()),
            unavailable_for_secs: state
                .unavailable_until
                .saturating_duration_since(now)
                .as_secs_f64(),
            rpm_limit: self.rpm_limit,
            rpm_count: state.rpm_count,
            current: state.counters.clone(),
            history: state.history.to_vec(),
        }
    }

    fn demote(&self, state: &mut EndpointHealthState, policy: &HealthPolicy, now: Instant, reason: &str) {
        let until = now + secs_to_duration(policy.unhealthy_window_minutes as f64 * 60.0);
        if until > state.unavailable_until {
            state.unavailable_until = until;
        }
        info!(
            request_id = %get_request_id(),
            endpoint = %self.label,
            violations = state.consecutive_violations,
            unhealthy_window_minutes = policy.unhealthy_window_minutes,
            reason,
            "Endpoint marked unhealthy by health policy"
        );
    }

    /// Close the current bucket when its interval has passed; empty buckets are dropped.
    fn roll_bucket(&self, state: &mut EndpointHealthState, now: Instant) {
        let interval = self.settings.collection_interval;
        if now.saturating_duration_since(state.bucket_start) <= interval {
            return;
        }

        let counters = std::mem::take(&mut state.counters);
        if counters.total_api_calls > 0 {
            let bucket = MetricsBucket::close(state.bucket_started_at, counters, interval);
            state.history.push(bucket);
        }
        state.bucket_start = now;
        state.bucket_started_at = Local::now();
    }
}

/// Convert a backend supplied retry-after to a duration, clamping invalid values.
fn secs_to_duration(secs: f64) -> Duration {
    if !secs.is_finite() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(secs.min(MAX_RETRY_AFTER_SECS))
}
