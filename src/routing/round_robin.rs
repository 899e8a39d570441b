use parking_lot::Mutex;

use super::{RoutingRequest, RoutingStrategy};
use crate::core::config::RouterKind;

#[derive(Debug)]
struct UsageClock {
    tick: u64,
    last_used: Vec<u64>,
}

/// Least recently used selection.
///
/// Every selection stamps the chosen endpoint with a logical tick; the endpoint with
/// the oldest stamp is chosen next (lowest index on ties), which cycles through the
/// endpoints in order.
#[derive(Debug)]
pub struct RoundRobinRouter {
    clock: Mutex<UsageClock>,
}

impl RoundRobinRouter {
    pub fn new(endpoint_count: usize) -> Self {
        Self {
            clock: Mutex::new(UsageClock {
                tick: 0,
                last_used: vec![0; endpoint_count],
            }),
        }
    }
}

impl RoutingStrategy for RoundRobinRouter {
    fn kind(&self) -> RouterKind {
        RouterKind::RoundRobin
    }

    fn select_endpoint(&self, _request: &RoutingRequest<'_>) -> usize {
        let mut clock = self.clock.lock();
        let Some((index, _)) = clock
            .last_used
            .iter()
            .enumerate()
            .min_by_key(|(i, used)| (**used, *i))
        else {
            return 0;
        };

        clock.tick += 1;
        let tick = clock.tick;
        clock.last_used[index] = tick;
        index
    }
}
