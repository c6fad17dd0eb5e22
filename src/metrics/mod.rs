//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Network connection status, reconnects and runtime version
//! - Watches and their outcomes
//! - Blocks scanned and subscription errors
//! - Reconciliation and retention

use crate::error::{WatcherError, WatcherResult};

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, register_int_counter,
    register_int_gauge, CounterVec, Encoder, GaugeVec, HistogramVec, IntCounter, IntGauge,
    TextEncoder,
};
use std::net::SocketAddr;
use tracing::{error, info};

lazy_static! {
    // Network metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "tx_watcher_chain_connected",
        "Network connection status (1=connected, 0=disconnected)",
        &["network"]
    ).unwrap();

    pub static ref CHAIN_RECONNECTS: CounterVec = register_counter_vec!(
        "tx_watcher_chain_reconnects_total",
        "WebSocket reconnections after a dropped connection",
        &["network"]
    ).unwrap();

    pub static ref RUNTIME_SPEC_VERSION: GaugeVec = register_gauge_vec!(
        "tx_watcher_runtime_spec_version",
        "Runtime spec version whose metadata decodes events",
        &["network"]
    ).unwrap();

    // Watch metrics
    pub static ref WATCHES_STARTED: CounterVec = register_counter_vec!(
        "tx_watcher_watches_started_total",
        "Total watches started",
        &["network"]
    ).unwrap();

    pub static ref WATCHES_ACTIVE: IntGauge = register_int_gauge!(
        "tx_watcher_watches_active",
        "Watches currently holding subscriptions"
    ).unwrap();

    pub static ref OUTCOMES: CounterVec = register_counter_vec!(
        "tx_watcher_outcomes_total",
        "Statuses written by watches",
        &["network", "status"]
    ).unwrap();

    pub static ref WATCH_LATENCY: HistogramVec = register_histogram_vec!(
        "tx_watcher_watch_latency_seconds",
        "Time from submission to a settled status",
        &["network"],
        vec![1.0, 6.0, 12.0, 18.0, 30.0, 45.0, 60.0, 90.0, 120.0]
    ).unwrap();

    pub static ref TIMEOUT_FALLBACKS: CounterVec = register_counter_vec!(
        "tx_watcher_timeout_fallbacks_total",
        "Watches that hit the timeout, by result of the last check",
        &["network", "result"]
    ).unwrap();

    // Chain traffic
    pub static ref BLOCKS_SCANNED: CounterVec = register_counter_vec!(
        "tx_watcher_blocks_scanned_total",
        "Blocks searched for watched extrinsics",
        &["network", "channel"]
    ).unwrap();

    pub static ref SUBSCRIPTION_ERRORS: CounterVec = register_counter_vec!(
        "tx_watcher_subscription_errors_total",
        "Errors delivered on head subscriptions",
        &["network", "channel"]
    ).unwrap();

    // Reconciliation
    pub static ref CASCADE_UPDATES: CounterVec = register_counter_vec!(
        "tx_watcher_cascade_updates_total",
        "Sibling records updated when a nonce slot settles",
        &["network", "kind"]
    ).unwrap();

    pub static ref RECORDS_PRUNED: IntCounter = register_int_counter!(
        "tx_watcher_records_pruned_total",
        "Records removed by the retention policy"
    ).unwrap();

    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "tx_watcher_errors_total",
        "Errors passed to the error reporter",
        &["kind"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "tx_watcher_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "tx_watcher_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> WatcherResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| WatcherError::Internal(format!("metrics bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| WatcherError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> String {
    render()
}

/// Text exposition of the default registry
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

// Helper functions to record metrics

pub fn record_chain_health(network: &str, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[network])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_reconnect(network: &str) {
    CHAIN_RECONNECTS.with_label_values(&[network]).inc();
}

pub fn record_runtime_version(network: &str, spec_version: u32) {
    RUNTIME_SPEC_VERSION
        .with_label_values(&[network])
        .set(spec_version as f64);
}

pub fn record_outcome(network: &str, status: &str) {
    OUTCOMES.with_label_values(&[network, status]).inc();
}

pub fn record_block_scanned(network: &str, channel: &str) {
    BLOCKS_SCANNED.with_label_values(&[network, channel]).inc();
}

pub fn record_subscription_error(network: &str, channel: &str) {
    SUBSCRIPTION_ERRORS
        .with_label_values(&[network, channel])
        .inc();
}

pub fn record_cascade(network: &str, kind: &str, count: usize) {
    if count > 0 {
        CASCADE_UPDATES
            .with_label_values(&[network, kind])
            .inc_by(count as f64);
    }
}

pub fn record_error(kind: &str) {
    ERRORS.with_label_values(&[kind]).inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
