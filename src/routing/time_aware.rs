use chrono::{Datelike, Timelike};

use super::{require_all, RoutingRequest, RoutingStrategy};
use crate::core::config::{ActiveWindow, EndpointConfig, RouterKind};
use crate::core::error::RoutingConfigError;

/// Routes to the first endpoint whose active window contains the current local
/// weekday and hour; outside every window the first endpoint is used.
#[derive(Debug)]
pub struct TimeAwareRouter {
    windows: Vec<ActiveWindow>,
}

impl TimeAwareRouter {
    pub fn new(endpoints: &[EndpointConfig]) -> Result<Self, RoutingConfigError> {
        let kind = RouterKind::TimeAware;
        let windows = require_all(kind, "active_window", endpoints, |e| e.active_window.clone())?;

        for (index, window) in windows.iter().enumerate() {
            let reason = if window.days.is_empty() {
                Some("no active days")
            } else if window.start_hour > 23 || window.end_hour > 24 {
                Some("hours must be within 0-24")
            } else if window.start_hour == window.end_hour {
                Some("start and end hour are equal")
            } else {
                None
            };
            if let Some(reason) = reason {
                return Err(RoutingConfigError::InvalidWindow {
                    kind,
                    index,
                    reason: reason.to_string(),
                });
            }
        }

        Ok(Self { windows })
    }
}

impl RoutingStrategy for TimeAwareRouter {
    fn kind(&self) -> RouterKind {
        RouterKind::TimeAware
    }

    fn select_endpoint(&self, request: &RoutingRequest<'_>) -> usize {
        let day = request.now.weekday();
        let hour = request.now.hour();
        self.windows
            .iter()
            .position(|w| w.contains(day, hour))
            .unwrap_or(0)
    }
}
