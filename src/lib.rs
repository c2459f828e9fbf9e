// src/lib.rs
//! Runner Controller Library
//!
//! Control plane for job runners: a length-framed TCP protocol between the
//! controller and its runner processes, plus the orchestration that spawns,
//! tracks, load-balances, autoscales and tears those runners down.
//!
//! # Architecture
//!
//! The crate is structured into several modules:
//!
//! - **transport**: magic + length framing, chunked single-writer flush loop
//! - **protocol**: transactions, chunk reassembly, trace-id correlation, handshake
//! - **runtime**: runner lifecycle, registry, launchers, orchestration
//! - **dispatch**: standard / run-once routing and least-loaded selection
//! - **reconcile**: autoscaling, retirement and dangling detection
//! - **catalog**: action metadata and the per-job key/value store
//! - **observability**: tracing and metrics setup
//! - **utils**: configuration and errors

// Public module exports
pub mod catalog;
pub mod controller;
pub mod dispatch;
pub mod observability;
pub mod protocol;
pub mod reconcile;
pub mod runtime;
pub mod transport;
pub mod utils;

// Re-export commonly used types
pub use controller::Controller;
pub use dispatch::{JobRequest, JobResponse};
pub use utils::config::ControllerConfig;
pub use utils::errors::{ControllerError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Controller build information
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}
