// src/observability/mod.rs
//! Logging and metrics setup
//!
//! Logging goes through `tracing`; the filter comes from `RUST_LOG`
//! (default `info`). Metrics use the `metrics` facade and are exported for
//! Prometheus scraping when an address is configured.

use crate::utils::config::{LogFormat, ObservabilityConfig};
use crate::utils::errors::{ControllerError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

pub const FRAMES_DECODED: &str = "controller_frames_decoded_total";
pub const PROTOCOL_ERRORS: &str = "controller_protocol_errors_total";
pub const DISPATCHES: &str = "controller_dispatches_total";
pub const DISPATCH_DURATION_MS: &str = "controller_dispatch_duration_ms";
pub const RUNNERS_SPAWNED: &str = "controller_runners_spawned_total";
pub const RUNNERS_KILLED: &str = "controller_runners_killed_total";
pub const RUNNERS_ACTIVE: &str = "controller_runners";
pub const DANGLING_RUNNERS: &str = "controller_dangling_runners_total";
pub const PENDING_TRANSACTIONS: &str = "controller_pending_transactions";

/// Install the global tracing subscriber
pub fn init_tracing(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match format {
        LogFormat::Pretty => fmt().with_env_filter(filter).with_target(true).try_init(),
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .try_init(),
    };

    result.map_err(|e| ControllerError::ConfigError(format!("Failed to init tracing: {}", e)))
}

/// Install the Prometheus exporter, if an address is configured
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    let Some(addr) = config.metrics_addr.as_deref() else {
        return Ok(());
    };

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| ControllerError::ConfigError(format!("Invalid metrics address {}: {}", addr, e)))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| ControllerError::ConfigError(format!("Failed to install metrics exporter: {}", e)))?;

    info!(%addr, "Prometheus exporter listening");
    Ok(())
}
