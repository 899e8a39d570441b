//! Prometheus metrics for monitoring the gateway.
//!
//! A single registry of dispatch, endpoint and token metrics, created on first use.

use prometheus::{
    register_gauge_vec, register_histogram_vec, register_int_counter_vec, GaugeVec, HistogramVec,
    IntCounterVec,
};
use std::sync::OnceLock;

/// Container for all gateway metrics.
pub struct Metrics {
    /// Dispatched requests by application and final status
    pub dispatch_requests: IntCounterVec,

    /// Dispatch duration histogram in seconds, including failover
    pub dispatch_duration: HistogramVec,

    /// Endpoint attempts by outcome (success, throttled, caller_error, failed, skipped)
    pub endpoint_attempts: IntCounterVec,

    /// Endpoint response latency histogram in seconds
    pub endpoint_latency: HistogramVec,

    /// Endpoint availability (1=admissible, 0=out of rotation)
    pub endpoint_available: GaugeVec,

    /// Total token usage by application, endpoint, and token type
    pub token_usage: IntCounterVec,

    /// Semantic cache hits by application
    pub cache_hits: IntCounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Initialize the metrics registry.
///
/// Subsequent calls return the same instance.
///
/// # Examples
///
/// ```no_run
/// use ai_app_gateway::core::metrics::init_metrics;
///
/// let metrics = init_metrics();
/// metrics.dispatch_requests.with_label_values(&["chat-app", "200"]).inc();
/// ```
pub fn init_metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let dispatch_requests = register_int_counter_vec!(
            "ai_gateway_dispatch_requests_total",
            "Total number of dispatched requests",
            &["app_id", "status_code"]
        )
        .expect("Failed to register dispatch_requests metric");

        let dispatch_duration = register_histogram_vec!(
            "ai_gateway_dispatch_duration_seconds",
            "Dispatch duration in seconds including failover",
            &["app_id"],
            vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]
        )
        .expect("Failed to register dispatch_duration metric");

        let endpoint_attempts = register_int_counter_vec!(
            "ai_gateway_endpoint_attempts_total",
            "Endpoint attempts by outcome",
            &["app_id", "endpoint", "outcome"]
        )
        .expect("Failed to register endpoint_attempts metric");

        let endpoint_latency = register_histogram_vec!(
            "ai_gateway_endpoint_latency_seconds",
            "Endpoint response latency in seconds",
            &["app_id", "endpoint"],
            vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]
        )
        .expect("Failed to register endpoint_latency metric");

        let endpoint_available = register_gauge_vec!(
            "ai_gateway_endpoint_available",
            "Endpoint availability (1=admissible, 0=out of rotation)",
            &["app_id", "endpoint"]
        )
        .expect("Failed to register endpoint_available metric");

        let token_usage = register_int_counter_vec!(
            "ai_gateway_tokens_total",
            "Total number of tokens used",
            &["app_id", "endpoint", "token_type"]
        )
        .expect("Failed to register token_usage metric");

        let cache_hits = register_int_counter_vec!(
            "ai_gateway_cache_hits_total",
            "Semantic cache hits",
            &["app_id"]
        )
        .expect("Failed to register cache_hits metric");

        Metrics {
            dispatch_requests,
            dispatch_duration,
            endpoint_attempts,
            endpoint_latency,
            endpoint_available,
            token_usage,
            cache_hits,
        }
    })
}

/// Get the global metrics instance, initializing it on first use.
pub fn get_metrics() -> &'static Metrics {
    init_metrics()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        let metrics = init_metrics();
        let metrics2 = get_metrics();
        assert!(std::ptr::eq(metrics, metrics2));
    }

    #[test]
    fn test_endpoint_attempts_metric() {
        let metrics = get_metrics();
        let labels = ["metrics-test-app", "metrics-test-ep", "throttled"];

        let initial = metrics.endpoint_attempts.with_label_values(&labels).get();
        metrics.endpoint_attempts.with_label_values(&labels).inc();
        let after = metrics.endpoint_attempts.with_label_values(&labels).get();

        assert_eq!(after, initial + 1);
    }

    #[test]
    fn test_endpoint_available_metric() {
        let metrics = get_metrics();
        let gauge = metrics
            .endpoint_available
            .with_label_values(&["metrics-test-app", "metrics-test-ep"]);

        gauge.set(1.0);
        assert_eq!(gauge.get(), 1.0);
        gauge.set(0.0);
        assert_eq!(gauge.get(), 0.0);
    }

    #[test]
    fn test_token_usage_metric() {
        let metrics = get_metrics();
        let labels = ["metrics-test-app", "metrics-test-ep", "prompt"];

        let initial = metrics.token_usage.with_label_values(&labels).get();
        metrics.token_usage.with_label_values(&labels).inc_by(100);
        assert_eq!(metrics.token_usage.with_label_values(&labels).get(), initial + 100);
    }
}
