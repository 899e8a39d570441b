use parking_lot::RwLock;
use rand::seq::SliceRandom;

use super::{require_all, RoutingRequest, RoutingStrategy};
use crate::core::config::{EndpointConfig, RouterKind};
use crate::core::error::RoutingConfigError;

/// Observed latency assumed for every endpoint before its first completed call.
pub const DEFAULT_LATENCY_MS: u64 = 5000;

/// Flattened weighted lookup table: endpoint `i` appears `weights[i]` times, so a
/// uniformly random entry selects `i` with probability `weights[i] / sum`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightTable {
    weights: Vec<u32>,
    table: Vec<usize>,
}

impl WeightTable {
    pub fn new(weights: Vec<u32>) -> Self {
        let table = weights
            .iter()
            .enumerate()
            .flat_map(|(i, w)| std::iter::repeat(i).take(*w as usize))
            .collect();
        Self { weights, table }
    }

    pub fn weights(&self) -> &[u32] {
        &self.weights
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Number of table entries pointing at `index`.
    pub fn entries_for(&self, index: usize) -> usize {
        self.table.iter().filter(|i| **i == index).count()
    }

    pub fn pick(&self) -> usize {
        self.table
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(0)
    }
}

fn seed_weights(kind: RouterKind, endpoints: &[EndpointConfig]) -> Result<Vec<u32>, RoutingConfigError> {
    let weights = require_all(kind, "weight", endpoints, |e| e.weight)?;
    let sum: u32 = weights.iter().sum();
    if sum != 100 {
        return Err(RoutingConfigError::WeightSum { kind, sum });
    }
    Ok(weights)
}

/// Random selection with static per-endpoint weights summing to 100.
#[derive(Debug)]
pub struct WeightedRandomRouter {
    table: WeightTable,
}

impl WeightedRandomRouter {
    pub fn new(endpoints: &[EndpointConfig]) -> Result<Self, RoutingConfigError> {
        let weights = seed_weights(RouterKind::WeightedRandom, endpoints)?;
        Ok(Self {
            table: WeightTable::new(weights),
        })
    }

    pub fn table(&self) -> &WeightTable {
        &self.table
    }
}

impl RoutingStrategy for WeightedRandomRouter {
    fn kind(&self) -> RouterKind {
        RouterKind::WeightedRandom
    }

    fn select_endpoint(&self, _request: &RoutingRequest<'_>) -> usize {
        self.table.pick()
    }

    fn current_weights(&self) -> Option<Vec<u32>> {
        Some(self.table.weights().to_vec())
    }
}

#[derive(Debug)]
struct DynamicWeights {
    latencies: Vec<u64>,
    table: WeightTable,
}

/// Random selection with weights recomputed from observed latency.
///
/// After each completed call, every endpoint's weight becomes
/// `max(1, round((1 - latency / max_latency) * 100))`, so faster endpoints
/// receive a larger share. The configured weights seed the table.
#[derive(Debug)]
pub struct WeightedDynamicRouter {
    state: RwLock<DynamicWeights>,
}

impl WeightedDynamicRouter {
    pub fn new(endpoints: &[EndpointConfig]) -> Result<Self, RoutingConfigError> {
        let weights = seed_weights(RouterKind::WeightedDynamic, endpoints)?;
        Ok(Self {
            state: RwLock::new(DynamicWeights {
                latencies: vec![DEFAULT_LATENCY_MS; weights.len()],
                table: WeightTable::new(weights),
            }),
        })
    }

    pub fn weights(&self) -> Vec<u32> {
        self.state.read().table.weights().to_vec()
    }
}

fn latency_weights(latencies: &[u64]) -> Vec<u32> {
    let max = latencies.iter().copied().max().unwrap_or(0);
    if max == 0 {
        return vec![1; latencies.len()];
    }
    latencies
        .iter()
        .map(|l| {
            let w = ((1.0 - *l as f64 / max as f64) * 100.0).round() as u32;
            w.max(1)
        })
        .collect()
}

impl RoutingStrategy for WeightedDynamicRouter {
    fn kind(&self) -> RouterKind {
        RouterKind::WeightedDynamic
    }

    fn select_endpoint(&self, _request: &RoutingRequest<'_>) -> usize {
        self.state.read().table.pick()
    }

    fn record_latency(&self, index: usize, latency_ms: u64) {
        let mut state = self.state.write();
        let Some(slot) = state.latencies.get_mut(index) else {
            return;
        };
        *slot = latency_ms;

        let weights = latency_weights(&state.latencies);
        tracing::debug!(index, latency_ms, weights = ?weights, "Rebuilt latency weighted table");
        state.table = WeightTable::new(weights);
    }

    fn current_weights(&self) -> Option<Vec<u32>> {
        Some(self.weights())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::endpoints;
    use super::*;
    use axum::http::HeaderMap;
    use serde_json::json;

    fn weighted(weights: &[u32]) -> Vec<EndpointConfig> {
        let mut eps = endpoints(weights.len());
        for (ep, w) in eps.iter_mut().zip(weights) {
            ep.weight = Some(*w);
        }
        eps
    }

    #[test]
    fn test_table_matches_weights() {
        let table = WeightTable::new(vec![70, 30]);
        assert_eq!(table.len(), 100);
        assert_eq!(table.entries_for(0), 70);
        assert_eq!(table.entries_for(1), 30);
    }

    #[test]
    fn test_weights_must_sum_to_100() {
        let err = WeightedRandomRouter::new(&weighted(&[50, 40])).unwrap_err();
        assert_eq!(
            err,
            RoutingConfigError::WeightSum {
                kind: RouterKind::WeightedRandom,
                sum: 90
            }
        );
        assert!(WeightedDynamicRouter::new(&weighted(&[50, 50])).is_ok());
    }

    #[test]
    fn test_weighted_random_distribution() {
        let router = WeightedRandomRouter::new(&weighted(&[70, 30])).unwrap();
        let body = json!({});
        let headers = HeaderMap::new();
        let request = RoutingRequest::new(&body, &headers);

        let trials = 10_000;
        let first = (0..trials)
            .filter(|_| router.select_endpoint(&request) == 0)
            .count();
        let share = first as f64 / trials as f64;
        assert!((0.65..0.75).contains(&share), "share was {share}");
    }

    #[test]
    fn test_zero_weight_endpoint_never_selected() {
        let router = WeightedRandomRouter::new(&weighted(&[100, 0])).unwrap();
        let body = json!({});
        let headers = HeaderMap::new();
        let request = RoutingRequest::new(&body, &headers);
        assert!((0..500).all(|_| router.select_endpoint(&request) == 0));
    }

    #[test]
    fn test_dynamic_weights_follow_latency() {
        let router = WeightedDynamicRouter::new(&weighted(&[50, 50])).unwrap();
        router.record_latency(0, 100);
        router.record_latency(1, 1000);

        let weights = router.weights();
        assert!(weights[0] > weights[1], "weights were {weights:?}");
        assert_eq!(weights, vec![90, 1]);
    }

    #[test]
    fn test_dynamic_weights_floor_at_one() {
        assert_eq!(latency_weights(&[5000, 5000, 2500]), vec![1, 1, 50]);
        assert_eq!(latency_weights(&[0, 0]), vec![1, 1]);
    }

    #[test]
    fn test_dynamic_ignores_unknown_index() {
        let router = WeightedDynamicRouter::new(&weighted(&[60, 40])).unwrap();
        router.record_latency(9, 10);
        assert_eq!(router.weights(), vec![60, 40]);
    }
}
