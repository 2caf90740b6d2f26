mod api;
mod config;

use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use discovery_client::cache::db::CacheDb;
use discovery_client::store::hash::compute_hash;
use discovery_client::{CacheHandle, DiscoveryClient, ListChangeHandler, UpstreamAction};
use shared::types::RobotRecord;
use crate::config::Config;

const DEFAULT_CONFIG_PATH: &str = "/etc/robot-discovery/discoveryd.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    tracing_subscriber::EnvFilter::new("discoveryd=info,discovery_client=info")
                })
        )
        .init();

    tracing::info!("Starting discoveryd");

    // Load config. An explicit path must exist; the default one may not.
    let config = match std::env::args().nth(1) {
        Some(path) => {
            let config = Config::load(&path)
                .with_context(|| format!("Failed to load config from {}", path))?;
            tracing::info!("Loaded config from {}", path);
            config
        }
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            let config = Config::load(DEFAULT_CONFIG_PATH)?;
            tracing::info!("Loaded config from {}", DEFAULT_CONFIG_PATH);
            config
        }
        None => {
            tracing::info!("No config file at {}, using defaults", DEFAULT_CONFIG_PATH);
            Config::default()
        }
    };

    // Open SQLite cache unless disabled
    let cache_handle = if config.discovery.disable_cache {
        tracing::info!("Robot cache disabled");
        None
    } else {
        let db = CacheDb::open(&config.cache.db_path)?;
        tracing::info!("Opened database at {:?}", config.cache.db_path);
        Some(CacheHandle::spawn(db))
    };

    // Hash of the list last delivered to subscribers
    let (hash_tx, hash_rx) = watch::channel(compute_hash(&[]));
    let on_list_change: ListChangeHandler = Arc::new(move |robots: &[RobotRecord]| {
        let hash = compute_hash(robots);
        let connectable = robots.iter().filter(|r| r.is_connectable()).count();
        tracing::info!(
            "Robot list changed: {} robots ({} connectable), hash {}",
            robots.len(),
            connectable,
            hash
        );
        hash_tx.send_replace(hash);
    });

    let client = Arc::new(
        DiscoveryClient::new(config.discovery.clone(), cache_handle.clone(), on_list_change)
            .context("Failed to create discovery client")?,
    );
    client.handle(UpstreamAction::UiInitialized).await;

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Build API router
    let app_state = api::routes::AppState {
        client: client.clone(),
        hash_rx,
    };
    let app = api::routes::router(app_state);

    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    // Run server with graceful shutdown
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    cancel.cancel();
    let _ = server_handle.await;

    // Stops the poller and the mDNS browser
    client.stop();

    // Shutdown cache thread
    if let Some(cache) = cache_handle {
        if let Err(e) = cache.shutdown().await {
            tracing::error!("Failed to shutdown cache: {}", e);
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
