// src/runtime/mod.rs
//! Runner runtime
//!
//! This module tracks and drives the runner population:
//!
//! - **Lifecycle**: pure state machine, `pending → starting → ready → closing → closed`
//! - **Runner / Registry**: tracked runner records, in-flight accounting, readiness waits
//! - **Process Manager**: launcher contract plus the local process launcher
//! - **Docker**: container launcher with instance labels for dangling detection
//! - **Resource Limiter**: memory / CPU / pid limits handed to launchers
//! - **Orchestrator**: spawning, lifecycle effects, controller-wide shutdown
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     RunnerManager                       │
//! │                                                         │
//! │  ProtocolEvent ──┐                    ┌── LaunchSpec     │
//! │  ProcessExit  ───┼──▶ lifecycle ──▶ effects ──▶ launcher │
//! │  reconcile    ───┘        │                              │
//! │                           ▼                              │
//! │                    RunnerRegistry                       │
//! │         (status, in-flight, timestamps, handles)        │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod docker;
pub mod lifecycle;
pub mod orchestrator;
pub mod process_manager;
pub mod registry;
pub mod resource_limiter;
pub mod runner;

// Re-export commonly used types
pub use docker::DockerLauncher;
pub use lifecycle::{LifecycleEffect, LifecycleInput, RunnerStatus};
pub use orchestrator::{ControllerEndpoint, RunnerManager};
pub use process_manager::{LaunchSpec, ProcessExit, ProcessHandle, ProcessLauncher, RunnerLauncher};
pub use registry::{InFlightGuard, RunnerRegistry};
pub use resource_limiter::ResourceLimits;
pub use runner::Runner;

use crate::utils::config::{LauncherConfig, LauncherKind};
use std::sync::Arc;

/// Build the launcher selected by configuration
pub fn launcher_from_config(config: &LauncherConfig) -> Arc<dyn RunnerLauncher> {
    match config.kind {
        LauncherKind::Process => Arc::new(ProcessLauncher::new(config)),
        LauncherKind::Docker => Arc::new(DockerLauncher::new(config)),
    }
}
