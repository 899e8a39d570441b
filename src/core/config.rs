//! Configuration management for the AI application gateway.
//!
//! This module handles loading and parsing configuration from YAML files,
//! with support for environment variable expansion.

use anyhow::{Context, Result};
use chrono::Weekday;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// Main gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// AI applications served by this gateway instance
    #[serde(default)]
    pub applications: Vec<ApplicationConfig>,

    /// Server configuration (host, port)
    #[serde(default)]
    pub server: ServerConfig,

    /// Whether to verify SSL certificates for upstream requests
    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,

    /// Request timeout in seconds for backend endpoints
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Endpoint metrics collection settings
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// A logical AI application and its ordered backend endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    pub app_id: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Backend endpoints in priority order
    pub endpoints: Vec<EndpointConfig>,

    /// Consult the semantic cache before dispatching
    #[serde(default)]
    pub cache_enabled: bool,

    /// Keep conversation threads and pin them to the endpoint that started them
    #[serde(default)]
    pub memory_enabled: bool,

    #[serde(default)]
    pub cache_settings: CacheSettings,

    #[serde(default)]
    pub memory_settings: MemorySettings,

    #[serde(default)]
    pub routing: RoutingConfig,
}

/// Retention of cached completions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Evict cached completions this many minutes after they were stored
    #[serde(default)]
    pub entry_expiry_minutes: Option<u64>,
}

impl CacheSettings {
    pub fn entry_ttl(&self) -> Option<Duration> {
        self.entry_expiry_minutes.map(|m| Duration::from_secs(m * 60))
    }
}

/// Retention of conversation threads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemorySettings {
    /// Messages kept per thread; the oldest non-system messages go first
    #[serde(default)]
    pub msg_count: Option<usize>,

    /// Evict threads this many minutes after their last save
    #[serde(default)]
    pub entry_expiry_minutes: Option<u64>,
}

impl MemorySettings {
    pub fn entry_ttl(&self) -> Option<Duration> {
        self.entry_expiry_minutes.map(|m| Duration::from_secs(m * 60))
    }
}

/// Routing strategy selection for an application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub strategy: RouterKind,

    /// Request header inspected by the header value router
    #[serde(default)]
    pub header_name: Option<String>,

    /// Message role scanned by the model aware router
    #[serde(default)]
    pub message_role: Option<String>,
}

/// Supported endpoint routing strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterKind {
    #[default]
    Priority,
    #[serde(alias = "lru")]
    RoundRobin,
    #[serde(alias = "least_active_connections")]
    LeastConnections,
    WeightedRandom,
    #[serde(alias = "latency_weighted")]
    WeightedDynamic,
    PayloadSize,
    HeaderValue,
    ModelAware,
    TokenAware,
    TimeAware,
}

impl RouterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Priority => "priority",
            Self::RoundRobin => "round_robin",
            Self::LeastConnections => "least_connections",
            Self::WeightedRandom => "weighted_random",
            Self::WeightedDynamic => "weighted_dynamic",
            Self::PayloadSize => "payload_size",
            Self::HeaderValue => "header_value",
            Self::ModelAware => "model_aware",
            Self::TokenAware => "token_aware",
            Self::TimeAware => "time_aware",
        }
    }
}

impl std::fmt::Display for RouterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the endpoint credential is presented to the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointAuth {
    /// `api-key: <key>` header
    #[default]
    ApiKey,
    /// `Authorization: Bearer <key>` header
    Bearer,
}

/// Configuration for a single backend endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Full URI of the backend chat completion API
    pub uri: String,

    /// Credential for the backend
    #[serde(default)]
    pub api_key: String,

    #[serde(default)]
    pub auth: EndpointAuth,

    /// Optional unique id (header value routing, audit logs)
    #[serde(default)]
    pub id: Option<String>,

    /// Static weight for weighted routers (all weights of an app sum to 100)
    #[serde(default)]
    pub weight: Option<u32>,

    /// Requests per minute ceiling enforced by the gateway
    #[serde(default)]
    pub rpm: Option<u32>,

    /// Largest request body (bytes) this endpoint should receive
    #[serde(default)]
    pub payload_threshold_bytes: Option<usize>,

    /// Task keywords matched by the model aware router
    #[serde(default)]
    pub task_keywords: Vec<String>,

    /// Model family used to pick a tokenizer (e.g. gpt-4o, gpt-35-turbo)
    #[serde(default)]
    pub model_family: Option<String>,

    /// Largest prompt (tokens) this endpoint should receive
    #[serde(default)]
    pub token_threshold: Option<usize>,

    #[serde(default)]
    pub active_window: Option<ActiveWindow>,

    #[serde(default)]
    pub health_policy: Option<HealthPolicy>,

    #[serde(default)]
    pub pricing: Option<ModelPricing>,
}

impl EndpointConfig {
    /// Identifier used in logs and metrics labels.
    pub fn label(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.uri)
    }
}

/// Days and hours during which an endpoint is preferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveWindow {
    pub days: Vec<Weekday>,
    /// Inclusive start hour (0-23)
    pub start_hour: u32,
    /// Exclusive end hour (1-24); a value below `start_hour` wraps past midnight
    pub end_hour: u32,
}

impl ActiveWindow {
    pub fn contains(&self, day: Weekday, hour: u32) -> bool {
        if !self.days.contains(&day) {
            return false;
        }
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// Latency/failure based self-demotion policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthPolicy {
    /// Calls slower than this count as policy violations
    pub latency_threshold_ms: u64,

    /// How long the endpoint stays out of rotation once demoted
    pub unhealthy_window_minutes: u64,

    /// Consecutive violations before the endpoint is demoted
    #[serde(default = "default_max_calls_before_unhealthy")]
    pub max_calls_before_unhealthy: u32,
}

/// Per 1k token prices used for cost tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    #[serde(default)]
    pub model_name: Option<String>,
    pub input_cost_per_1k: f64,
    #[serde(default)]
    pub cached_input_cost_per_1k: f64,
    pub output_cost_per_1k: f64,
}

/// Endpoint metrics collection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Length of one metrics bucket in minutes
    #[serde(default = "default_collection_interval")]
    pub collection_interval_minutes: u64,

    /// Number of closed buckets kept per endpoint
    #[serde(default = "default_history_count")]
    pub history_count: usize,
}

impl MetricsConfig {
    pub fn collection_interval(&self) -> Duration {
        Duration::from_secs(self.collection_interval_minutes.max(1) * 60)
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            collection_interval_minutes: default_collection_interval(),
            history_count: default_history_count(),
        }
    }
}

/// Server-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_verify_ssl() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    300
}

fn default_max_calls_before_unhealthy() -> u32 {
    1
}

fn default_collection_interval() -> u64 {
    60
}

fn default_history_count() -> usize {
    5
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use ai_app_gateway::core::config::AppConfig;
    ///
    /// let config = AppConfig::load("config.yaml").expect("Failed to load config");
    /// ```
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let mut config = Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        // Environment variables take precedence over the file
        if let Ok(host) = std::env::var("HOST") {
            config.server.host = host;
        }

        if let Ok(port_str) = std::env::var("PORT") {
            if let Ok(port) = port_str.parse::<u16>() {
                config.server.port = port;
            }
        }

        if let Ok(verify_ssl_str) = std::env::var("VERIFY_SSL") {
            config.verify_ssl = str_to_bool(&verify_ssl_str);
        }

        if let Ok(timeout_str) = std::env::var("REQUEST_TIMEOUT_SECS") {
            if let Ok(timeout) = timeout_str.parse::<u64>() {
                config.request_timeout_secs = timeout;
            }
        }

        Ok(config)
    }

    /// Parse configuration from YAML text after expanding environment variables.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: AppConfig = serde_yaml::from_str(&expanded)?;
        Ok(config)
    }

    /// Find an application by id.
    pub fn application(&self, app_id: &str) -> Option<&ApplicationConfig> {
        self.applications.iter().find(|app| app.app_id == app_id)
    }
}

static ENV_VAR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\$\{([^}:]+)(?::-?([^}]*))?\}"#).expect("env var pattern is valid")
});

/// Expand environment variables in configuration content.
///
/// Supports patterns: ${VAR}, ${VAR:-default}, ${VAR:default}
fn expand_env_vars(content: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default_value.to_string())
        })
        .to_string()
}

/// Convert string to boolean.
///
/// Accepts: "true", "1", "yes", "on" (case-insensitive)
fn str_to_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}
