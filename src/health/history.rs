//! Rolling call counters and the bounded history of closed collection buckets.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// Counters accumulated during one collection interval.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CallCounters {
    pub thread_count: u64,
    pub api_calls: u64,
    pub failed_api_calls: u64,
    pub throttled_api_calls: u64,
    pub filtered_api_calls: u64,
    pub total_api_calls: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub feedback_count: i64,
    #[serde(skip)]
    pub latency_ms_total: u64,
}

impl CallCounters {
    pub fn avg_latency_secs(&self) -> f64 {
        if self.api_calls == 0 {
            0.0
        } else {
            self.latency_ms_total as f64 / self.api_calls as f64 / 1000.0
        }
    }

    pub fn avg_tokens_per_call(&self) -> f64 {
        if self.api_calls == 0 {
            0.0
        } else {
            self.total_tokens as f64 / self.api_calls as f64
        }
    }
}

/// Throughput figures derived when a bucket closes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Throughput {
    pub avg_tokens_per_call: f64,
    pub tokens_per_minute: f64,
    pub requests_per_minute: f64,
}

/// One closed collection interval.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsBucket {
    pub collection_time: DateTime<Local>,
    pub collected_metrics: CallCounters,
    pub throughput: Throughput,
    pub avg_response_time_secs: f64,
}

impl MetricsBucket {
    pub fn close(started: DateTime<Local>, counters: CallCounters, interval: Duration) -> Self {
        let minutes = (interval.as_secs_f64() / 60.0).max(1.0 / 60.0);
        Self {
            collection_time: started,
            throughput: Throughput {
                avg_tokens_per_call: counters.avg_tokens_per_call(),
                tokens_per_minute: counters.total_tokens as f64 / minutes,
                requests_per_minute: counters.api_calls as f64 / minutes,
            },
            avg_response_time_secs: counters.avg_latency_secs(),
            collected_metrics: counters,
        }
    }
}

/// FIFO of closed buckets capped at `capacity`; the oldest entry is evicted first.
#[derive(Debug, Clone)]
pub struct MetricsHistory {
    items: VecDeque<MetricsBucket>,
    capacity: usize,
}

impl MetricsHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, bucket: MetricsBucket) {
        if self.capacity == 0 {
            return;
        }
        while self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(bucket);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn to_vec(&self) -> Vec<MetricsBucket> {
        self.items.iter().cloned().collect()
    }
}
