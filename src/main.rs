// src/main.rs
//! Runner Controller
//!
//! Starts the protocol listener and reconciliation loop for the actions in
//! the configured manifest and runs until SIGINT or SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use runner_controller::catalog::{InMemoryActionStore, InMemoryKeyValueStore};
use runner_controller::observability::{init_metrics, init_tracing};
use runner_controller::runtime::launcher_from_config;
use runner_controller::{BuildInfo, Controller, ControllerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "runner-controller", version, about = "Runner control plane")]
struct Args {
    /// Configuration file (defaults to config/controller.*)
    #[arg(short, long, env = "RUNNER_CONTROLLER_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ControllerConfig::load_from(path),
        None => ControllerConfig::load(),
    }
    .context("Failed to load configuration")?;

    init_tracing(config.observability.log_format)?;
    init_metrics(&config.observability)?;

    let build = BuildInfo::current();
    info!(
        version = build.version,
        git_hash = build.git_hash,
        rustc = build.rustc_version,
        "Starting runner controller"
    );

    let actions = match &config.catalog.actions_file {
        Some(path) => InMemoryActionStore::from_manifest(path)
            .await
            .with_context(|| format!("Failed to load actions from {:?}", path))?,
        None => InMemoryActionStore::new(),
    };

    let launcher = launcher_from_config(&config.launcher);
    let controller = Controller::start(
        config,
        launcher,
        Arc::new(actions),
        Arc::new(InMemoryKeyValueStore::new()),
    )
    .await
    .context("Failed to start controller")?;

    wait_for_shutdown_signal().await?;
    controller.shutdown().await;
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
        _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
    }
    Ok(())
}
