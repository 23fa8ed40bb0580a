//! Fragment cache server
//!
//! Loads the engine configuration, sets up logging, runs the expiry sweep and
//! serves the metrics and invalidation endpoint.

use anyhow::{Context, Result};
use fragment_cache::{
    CacheCoordinator, FragmentCacheConfig, InvalidationHandler, InvalidationMetrics,
    MetricsEndpoint,
};
use prometheus::Registry;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Main entry point for the fragment cache server
///
/// # Usage
/// ```bash
/// # Start with default config (fragment_cache.yaml)
/// fragment-cache
///
/// # Start with custom config
/// fragment-cache /path/to/config.yaml
/// ```
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    if let Err(e) = run().await {
        error!("Fragment cache server failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    info!("Starting fragment cache server");

    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "fragment_cache.yaml".to_string());
    info!("Loading configuration from: {}", config_path);

    let config = FragmentCacheConfig::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path))?;
    info!("Configuration loaded successfully");
    info!("  - Instance: {}", config.instance_name);
    info!("  - Max entries: {}", config.max_entries);
    info!("  - Cacheable resources: {}", config.cache_entries.len());
    info!("  - External caches: {}", config.external_caches.len());

    let coordinator = Arc::new(
        CacheCoordinator::from_config(&config).context("building the cache coordinator")?,
    );
    let _expiry = coordinator.spawn_expiry_task(Duration::from_secs(config.expiry_interval_secs));

    let endpoint = match config.endpoint.as_ref().filter(|e| e.enabled) {
        Some(endpoint) => endpoint,
        None => {
            warn!("Endpoint disabled; serving nothing but the expiry sweep");
            tokio::signal::ctrl_c().await?;
            coordinator.flush_external().await;
            return Ok(());
        }
    };

    let addr: SocketAddr = endpoint
        .address
        .parse()
        .with_context(|| format!("invalid endpoint address {}", endpoint.address))?;

    let mut handler = match &endpoint.auth_token {
        Some(token) => InvalidationHandler::with_auth(coordinator.clone(), token.clone()),
        None => InvalidationHandler::new(coordinator.clone()),
    };
    let mut server = MetricsEndpoint::new(coordinator.clone(), addr);
    if endpoint.enable_metrics {
        let registry = Registry::new();
        let metrics = InvalidationMetrics::with_registry(&registry)
            .context("registering invalidation metrics")?;
        handler = handler.with_metrics(Arc::new(metrics));
        server = server.with_registry(registry);
    }
    server = server.with_invalidation(handler);

    tokio::select! {
        result = server.start() => {
            result.map_err(|e| anyhow::anyhow!(e)).context("endpoint stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    coordinator.flush_external().await;
    Ok(())
}
