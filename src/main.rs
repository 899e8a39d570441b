//! AI Application Gateway - Main entry point
//!
//! This binary loads the application configuration and serves the gateway API.

use ai_app_gateway::{
    api::{create_router, GatewayState},
    core::{init_metrics, logging::wants_json_logs, AppConfig},
    dispatch::{Dispatcher, ExactMatchCache, InMemoryConversationMemory, LogPersistence},
};
use anyhow::{Context, Result};
use chrono::Local;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

fn main() -> Result<()> {
    // Load .env file if present (before reading any environment variables)
    dotenvy::dotenv().ok();

    // Detect optimal worker threads from environment or cgroup
    let worker_threads = std::env::var("TOKIO_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or_else(|| detect_cpu_limit().unwrap_or(1));

    println!("Tokio runtime: using {} worker threads", worker_threads);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(async_main())
}

/// Custom time formatter that uses local timezone (respects TZ environment variable)
struct LocalTime;

impl tracing_subscriber::fmt::time::FormatTime for LocalTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S"))
    }
}

fn init_tracing() {
    // NO_COLOR disables ANSI codes for file logging
    let no_color = std::env::var("NO_COLOR").is_ok();

    let base_filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,ai_app_gateway=debug".to_string());

    // Always suppress noisy HTTP library logs regardless of RUST_LOG setting
    let filter_str = format!(
        "{},hyper=warn,hyper::proto=warn,h2=warn,reqwest=warn",
        base_filter
    );
    let filter = tracing_subscriber::EnvFilter::new(filter_str);

    let json = wants_json_logs(std::env::var("LOG_FORMAT").ok().as_deref());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_timer(LocalTime)
                    .with_current_span(true),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_timer(LocalTime)
                    .with_ansi(!no_color),
            )
            .init();
    }
}

async fn async_main() -> Result<()> {
    init_tracing();
    init_metrics();

    let config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = AppConfig::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;
    tracing::info!(
        "Configuration loaded: {} applications from {}",
        config.applications.len(),
        config_path
    );
    for application in &config.applications {
        tracing::info!(
            app_id = %application.app_id,
            endpoints = application.endpoints.len(),
            strategy = %application.routing.strategy,
            cache = application.cache_enabled,
            memory = application.memory_enabled,
            "Application configured"
        );
    }

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server host or port")?;

    let cache = Arc::new(ExactMatchCache::new());
    let memory = Arc::new(InMemoryConversationMemory::new());
    spawn_eviction(cache.clone(), memory.clone());

    let dispatcher = Dispatcher::from_config(&config)?
        .with_cache(cache)
        .with_memory(memory)
        .with_persistence(Arc::new(LogPersistence));
    let state = Arc::new(GatewayState::new(config, dispatcher));

    #[cfg(unix)]
    spawn_reload_on_hangup(state.clone(), config_path);

    let app = create_router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    tracing::info!("Starting AI Application Gateway on {}", addr);
    tracing::info!("Dispatch API: POST /api/v1/lb/:app_id");
    tracing::info!("Application metrics: GET /api/v1/metrics/:app_id");
    tracing::info!("Metrics endpoint: /metrics");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Periodically drop expired cache entries and conversation threads.
fn spawn_eviction(cache: Arc<ExactMatchCache>, memory: Arc<InMemoryConversationMemory>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(EVICTION_INTERVAL);
        loop {
            ticker.tick().await;
            let cached = cache.evict_expired();
            let threads = memory.evict_expired();
            if cached + threads > 0 {
                tracing::debug!(cached, threads, "Evicted expired cache entries and threads");
            }
        }
    });
}

/// Reload the configuration file on SIGHUP.
#[cfg(unix)]
fn spawn_reload_on_hangup(state: Arc<GatewayState>, config_path: String) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            tracing::warn!("SIGHUP handler unavailable, reload disabled: {}", e);
            return;
        }
    };

    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            match AppConfig::load(&config_path) {
                Ok(config) => {
                    state.reload(config);
                }
                Err(e) => tracing::error!("Configuration reload failed, keeping current: {}", e),
            }
        }
    });
}

/// Detect CPU limit from cgroup (for containerized environments)
fn detect_cpu_limit() -> Option<usize> {
    // Try cgroup v2 first
    if let Ok(max) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        let parts: Vec<&str> = max.split_whitespace().collect();
        if parts.len() == 2 {
            if let (Ok(quota), Ok(period)) = (parts[0].parse::<i64>(), parts[1].parse::<i64>()) {
                if quota > 0 {
                    let cores = ((quota as f64 / period as f64).ceil() as usize).max(1);
                    println!("Detected CPU limit from cgroup v2: {} cores", cores);
                    return Some(cores);
                }
            }
        }
    }

    // Fallback to cgroup v1
    let quota = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us")
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()?;

    let period = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us")
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()?;

    if quota > 0 {
        let cores = ((quota as f64 / period as f64).ceil() as usize).max(1);
        println!("Detected CPU limit from cgroup v1: {} cores", cores);
        Some(cores)
    } else {
        None
    }
}
