//! Application registry: per-application endpoint health handles and routing strategy.
//!
//! Runtimes are created lazily on first use and live until the registry is reset
//! by a configuration reload.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::core::config::ApplicationConfig;
use crate::health::{EndpointHealth, HealthSettings, HealthSnapshot};
use crate::routing::{build_strategy, RoutingStrategy};

/// Runtime state of one application.
pub struct ApplicationRuntime {
    pub config: ApplicationConfig,
    pub endpoints: Vec<Arc<EndpointHealth>>,
    pub strategy: Arc<dyn RoutingStrategy>,
}

impl ApplicationRuntime {
    pub fn new(config: ApplicationConfig, settings: HealthSettings) -> Self {
        let endpoints = config
            .endpoints
            .iter()
            .map(|endpoint| Arc::new(EndpointHealth::new(endpoint, settings)))
            .collect();
        let strategy = build_strategy(&config.app_id, &config.routing, &config.endpoints);

        Self {
            config,
            endpoints,
            strategy,
        }
    }

    pub fn app_id(&self) -> &str {
        &self.config.app_id
    }

    pub fn metrics(&self) -> ApplicationMetrics {
        ApplicationMetrics {
            app_id: self.config.app_id.clone(),
            strategy: self.strategy.kind().to_string(),
            weights: self.strategy.current_weights(),
            endpoints: self.endpoints.iter().map(|e| e.snapshot()).collect(),
        }
    }
}

impl std::fmt::Debug for ApplicationRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplicationRuntime")
            .field("app_id", &self.config.app_id)
            .field("endpoints", &self.endpoints.len())
            .field("strategy", &self.strategy.kind())
            .finish()
    }
}

/// Endpoint metrics of one application.
#[derive(Debug, Clone, Serialize)]
pub struct ApplicationMetrics {
    pub app_id: String,
    pub strategy: String,
    /// Current selection weights of weighted strategies
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weights: Option<Vec<u32>>,
    pub endpoints: Vec<HealthSnapshot>,
}

#[derive(Debug, Default)]
pub struct Registry {
    apps: DashMap<String, Arc<ApplicationRuntime>>,
    settings: RwLock<HealthSettings>,
}

impl Registry {
    pub fn new(settings: HealthSettings) -> Self {
        Self {
            apps: DashMap::new(),
            settings: RwLock::new(settings),
        }
    }

    /// Runtime for `config.app_id`, created on first use.
    pub fn get_or_create(&self, config: &ApplicationConfig) -> Arc<ApplicationRuntime> {
        if let Some(runtime) = self.apps.get(&config.app_id) {
            return runtime.clone();
        }

        let settings = *self.settings.read();
        self.apps
            .entry(config.app_id.clone())
            .or_insert_with(|| {
                info!(
                    app_id = %config.app_id,
                    endpoints = config.endpoints.len(),
                    "Creating application runtime"
                );
                Arc::new(ApplicationRuntime::new(config.clone(), settings))
            })
            .clone()
    }

    pub fn get(&self, app_id: &str) -> Option<Arc<ApplicationRuntime>> {
        self.apps.get(app_id).map(|r| r.clone())
    }

    /// Drop every runtime; the next request rebuilds state with `settings`.
    pub fn reset(&self, settings: HealthSettings) -> usize {
        *self.settings.write() = settings;
        let dropped = self.apps.len();
        self.apps.clear();
        info!(dropped, "Application registry reset");
        dropped
    }

    pub fn reset_app(&self, app_id: &str) -> bool {
        self.apps.remove(app_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{EndpointConfig, RouterKind, RoutingConfig};

    fn app(app_id: &str, strategy: RouterKind) -> ApplicationConfig {
        ApplicationConfig {
            app_id: app_id.to_string(),
            description: None,
            endpoints: vec![
                EndpointConfig {
                    uri: "http://a".to_string(),
                    ..Default::default()
                },
                EndpointConfig {
                    uri: "http://b".to_string(),
                    ..Default::default()
                },
            ],
            cache_enabled: false,
            memory_enabled: false,
            cache_settings: Default::default(),
            memory_settings: Default::default(),
            routing: RoutingConfig {
                strategy,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_runtime_created_once() {
        let registry = Registry::new(HealthSettings::default());
        let config = app("chat", RouterKind::RoundRobin);

        let first = registry.get_or_create(&config);
        let second = registry.get_or_create(&config);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.endpoints.len(), 2);
        assert_eq!(first.strategy.kind(), RouterKind::RoundRobin);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_health_state_survives_until_reset() {
        let registry = Registry::new(HealthSettings::default());
        let config = app("chat", RouterKind::Priority);

        registry.get_or_create(&config).endpoints[0].record_failure(429, 30.0);
        assert!(!registry.get_or_create(&config).endpoints[0].is_healthy().0);

        assert_eq!(registry.reset(HealthSettings::default()), 1);
        assert!(registry.is_empty());
        assert!(registry.get_or_create(&config).endpoints[0].is_healthy().0);
    }

    #[test]
    fn test_reset_single_app() {
        let registry = Registry::new(HealthSettings::default());
        registry.get_or_create(&app("a", RouterKind::Priority));
        registry.get_or_create(&app("b", RouterKind::Priority));

        assert!(registry.reset_app("a"));
        assert!(!registry.reset_app("a"));
        assert!(registry.get("a").is_none());
        assert!(registry.get("b").is_some());
    }

    #[test]
    fn test_invalid_strategy_falls_back() {
        let registry = Registry::new(HealthSettings::default());
        let runtime = registry.get_or_create(&app("w", RouterKind::WeightedRandom));
        assert_eq!(runtime.strategy.kind(), RouterKind::Priority);

        let metrics = runtime.metrics();
        assert_eq!(metrics.strategy, "priority");
        assert_eq!(metrics.endpoints.len(), 2);
        assert_eq!(metrics.endpoints[1].uri, "http://b");
    }
}
