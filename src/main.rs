//! Wallet transaction watcher - finality tracking for submitted extrinsics
//!
//! Computes the hash of each signed extrinsic the wallet submits, follows the
//! network's block headers until the extrinsic settles, and keeps the stored
//! transaction history consistent per sender nonce.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

mod api;
mod chain;
mod config;
mod coordination;
mod error;
mod events;
mod metrics;
mod notify;
mod state;
mod tx;

use chain::ChainManager;
use config::Settings;
use coordination::{StatusReconciler, WatchCoordinator};
use metrics::MetricsServer;
use notify::{LogNotifier, TracingReporter};
use state::{MemoryRecordStore, PgRecordStore, RecordStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting wallet transaction watcher v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} networks",
        settings.enabled_networks().len()
    );

    // Record storage
    let store: Arc<dyn RecordStore> = if settings.uses_memory_store() {
        warn!("No database URL configured - records are kept in memory only");
        Arc::new(MemoryRecordStore::new())
    } else {
        let pg = PgRecordStore::new(&settings.database).await?;
        info!("Database connection established");
        pg.run_migrations().await?;
        info!("Database migrations complete");
        Arc::new(pg)
    };

    // Settle whatever the previous process left in flight before new watches start
    let reconciler = Arc::new(StatusReconciler::new(
        store.clone(),
        settings.watcher.retention_limit,
    ));
    reconciler.reconcile_on_restart().await?;

    // Initialize metrics server
    let metrics_server = if settings.metrics.enabled {
        Some(MetricsServer::new(settings.metrics.port))
    } else {
        None
    };

    // Network connections
    let chain_manager = Arc::new(ChainManager::new(&settings).await?);
    info!(
        "Connected networks: {}",
        chain_manager.connected_networks().join(", ")
    );

    let coordinator = Arc::new(WatchCoordinator::new(
        chain_manager.clone(),
        reconciler.clone(),
        Arc::new(LogNotifier::new(settings.notifications.enabled)),
        Arc::new(TracingReporter),
        Duration::from_secs(settings.watcher.timeout_secs),
    ));
    info!("Watch coordinator initialized");

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = api::AppState {
            store: store.clone(),
            chain_manager: chain_manager.clone(),
            coordinator: coordinator.clone(),
        };
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = metrics_server.map(|server| {
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let chain_manager = chain_manager.clone();
        let store = store.clone();
        let reconciler = reconciler.clone();
        let coordinator = coordinator.clone();
        let interval = settings.watcher.health_check_interval_secs.max(1);
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(interval)).await;

                let mut healthy = true;

                // Check network connections
                for (network, ok) in chain_manager.health_check().await {
                    if !ok {
                        warn!("Network {} health check failed", network);
                        healthy = false;
                    }
                }

                // Pick up runtime upgrades before new blocks need decoding
                chain_manager.refresh_runtimes().await;

                // Check record storage
                if let Err(e) = store.health_check().await {
                    warn!("Record store health check failed: {}", e);
                    healthy = false;
                }

                // Retention also releases idle slot locks
                if let Err(e) = reconciler.prune(&coordinator.protected_hashes()).await {
                    warn!("Periodic prune failed: {}", e);
                }

                if healthy {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
    });

    info!("Wallet transaction watcher is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Pending records left behind are settled by the next restart
    coordinator.stop();

    // Abort background tasks
    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Wallet transaction watcher stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,wallet_tx_watcher=debug,sqlx=warn,hyper=warn")
    });

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_current_span(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
