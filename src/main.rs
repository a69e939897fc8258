mod aggregator;
mod api;
mod catalog;
mod config;
mod docker;
mod gpu;
mod gpu_config;
mod lifecycle;
mod optimizer;
mod registry;
mod resolver;
mod scrape;
mod watchdog;

use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::aggregator::MetricAggregator;
use crate::config::AppConfig;
use crate::docker::ContainerDriver;
use crate::gpu::GpuProbe;
use crate::lifecycle::Lifecycle;
use crate::optimizer::Optimizer;
use crate::registry::Registry;

/// Shared application state available to all handlers.
pub struct AppState {
    pub config: AppConfig,
    pub driver: Arc<ContainerDriver>,
    pub registry: Registry,
    pub aggregator: MetricAggregator,
    pub lifecycle: Arc<Lifecycle>,
    pub optimizer: Arc<Optimizer>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Preload `BLACKBOX_ROOT/.env` if present (not required).
    if let Ok(root) = std::env::var("BLACKBOX_ROOT") {
        let _ = dotenvy::from_path(std::path::Path::new(&root).join(".env"));
    } else {
        dotenvy::dotenv().ok();
    }

    let config = AppConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.tracing_filter().into()),
        )
        .init();

    info!("starting blackbox-server v{}", env!("CARGO_PKG_VERSION"));

    let probe = Arc::new(GpuProbe::init());
    let mut driver = ContainerDriver::new();
    if config.use_sudo_docker {
        driver.force_sudo().await;
    }
    let driver = Arc::new(driver);
    let registry = Registry::new();

    let aggregator = MetricAggregator::new(
        probe.clone(),
        registry.clone(),
        driver.clone(),
        config.vllm_host.clone(),
    );

    let lifecycle = Arc::new(Lifecycle::new(
        config.clone(),
        probe.clone(),
        driver.clone(),
        registry.clone(),
    ));

    let temp_config_dir = config.configs_dir().join("optimized");
    if let Err(e) = tokio::fs::create_dir_all(&temp_config_dir).await {
        warn!(error = %e, "failed to create optimized-config directory");
    }
    let optimizer = Arc::new(Optimizer::new(
        registry.clone(),
        driver.clone(),
        lifecycle.clone(),
        temp_config_dir,
    ));

    // Rediscover any deployments that survived a restart. The registry is
    // memory-only; this relies on `prune_stale`'s name-prefix match against
    // currently-running containers.
    registry.prune_stale(&driver).await;

    watchdog::spawn(registry.clone(), driver.clone(), config.vllm_host.clone());

    let state = Arc::new(AppState {
        config: config.clone(),
        driver,
        registry,
        aggregator,
        lifecycle,
        optimizer,
    });

    let app = build_router(state);

    let args: Vec<String> = std::env::args().collect();
    let port = AppConfig::listen_port(&args);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    api::routes(state).layer(TraceLayer::new_for_http())
}
