//! Property-based tests for endpoint selection and admission control.
//!
//! These tests use proptest to verify properties that should hold for all
//! endpoint configurations, particularly the weighted lookup tables.

use ai_app_gateway::{
    core::config::{EndpointConfig, RouterKind, RoutingConfig},
    health::{EndpointHealth, HealthSettings},
    routing::{try_build_strategy, RoundRobinRouter, RoutingRequest, RoutingStrategy, WeightTable, WeightedDynamicRouter},
};
use axum::http::HeaderMap;
use proptest::prelude::*;
use serde_json::json;
use std::time::{Duration, Instant};

fn endpoints(weights: &[u32]) -> Vec<EndpointConfig> {
    weights
        .iter()
        .enumerate()
        .map(|(i, w)| EndpointConfig {
            uri: format!("http://backend-{}/chat", i),
            weight: Some(*w),
            ..Default::default()
        })
        .collect()
}

/// Weights summing to exactly 100, built from sorted cut points.
fn weights_summing_to_100() -> impl Strategy<Value = Vec<u32>> {
    prop::collection::btree_set(1u32..100, 0..8).prop_map(|cuts| {
        let mut weights = Vec::with_capacity(cuts.len() + 1);
        let mut previous = 0;
        for cut in cuts {
            weights.push(cut - previous);
            previous = cut;
        }
        weights.push(100 - previous);
        weights
    })
}

fn select(strategy: &dyn RoutingStrategy) -> usize {
    let body = json!({"messages": [{"role": "user", "content": "hi"}]});
    let headers = HeaderMap::new();
    strategy.select_endpoint(&RoutingRequest::new(&body, &headers))
}

proptest! {
    /// Property: endpoint i occupies exactly weights[i] table entries
    #[test]
    fn prop_table_entries_match_weights(weights in prop::collection::vec(0u32..50, 1..10)) {
        let table = WeightTable::new(weights.clone());
        prop_assert_eq!(table.len() as u32, weights.iter().sum::<u32>());
        for (i, w) in weights.iter().enumerate() {
            prop_assert_eq!(table.entries_for(i), *w as usize);
        }
    }

    /// Property: weighted selection never picks an endpoint with zero weight
    #[test]
    fn prop_weighted_random_picks_weighted_endpoint(weights in weights_summing_to_100()) {
        let routing = RoutingConfig { strategy: RouterKind::WeightedRandom, ..Default::default() };
        let strategy = try_build_strategy(&routing, &endpoints(&weights)).unwrap();
        for _ in 0..20 {
            let index = select(strategy.as_ref());
            prop_assert!(index < weights.len());
            prop_assert!(weights[index] > 0);
        }
    }

    /// Property: every strategy without attribute requirements returns a valid index
    #[test]
    fn prop_selection_in_range(count in 1usize..12, rounds in 1usize..30) {
        let eps = endpoints(&vec![1; count]);
        for kind in [RouterKind::Priority, RouterKind::RoundRobin, RouterKind::LeastConnections] {
            let routing = RoutingConfig { strategy: kind, ..Default::default() };
            let strategy = try_build_strategy(&routing, &eps).unwrap();
            for _ in 0..rounds {
                prop_assert!(select(strategy.as_ref()) < count);
            }
        }
    }

    /// Property: round robin visits every endpoint equally often
    #[test]
    fn prop_round_robin_is_fair(count in 1usize..10, cycles in 1usize..5) {
        let router = RoundRobinRouter::new(count);
        let mut seen = vec![0usize; count];
        for _ in 0..count * cycles {
            seen[select(&router)] += 1;
        }
        prop_assert!(seen.iter().all(|n| *n == cycles));
    }

    /// Property: after latency updates, the fastest endpoint holds the largest weight
    #[test]
    fn prop_fastest_endpoint_has_largest_weight(latencies in prop::collection::vec(1u64..20_000, 2..6)) {
        let weights = vec![100 / latencies.len() as u32; latencies.len()];
        let mut eps = endpoints(&weights);
        let remainder = 100 - weights.iter().sum::<u32>();
        eps[0].weight = Some(weights[0] + remainder);

        let router = WeightedDynamicRouter::new(&eps).unwrap();
        for (i, latency) in latencies.iter().enumerate() {
            router.record_latency(i, *latency);
        }

        let weights = router.weights();
        let fastest = latencies
            .iter()
            .enumerate()
            .min_by_key(|(_, l)| **l)
            .map(|(i, _)| i)
            .unwrap();
        prop_assert!(weights.iter().all(|w| *w >= 1));
        prop_assert!(weights.iter().all(|w| *w <= weights[fastest]));
    }

    /// Property: the circuit breaker marker never moves backwards
    #[test]
    fn prop_breaker_marker_is_monotonic(first in 0.0f64..600.0, second in 0.0f64..600.0) {
        let start = Instant::now();
        let health = EndpointHealth::new_at(&endpoints(&[1])[0], HealthSettings::default(), start);

        health.record_failure_at(429, first, start);
        health.record_failure_at(429, second, start);

        let longest = first.max(second);
        let (available, retry) = health.is_healthy_at(start);
        if longest > 0.001 {
            prop_assert!(!available);
            prop_assert!((retry - longest).abs() < 0.01);
        }
        let after = start + Duration::from_secs_f64(longest + 0.01);
        prop_assert!(health.is_healthy_at(after).0);
    }
}
