// src/utils/config.rs
//! Controller configuration
//!
//! Loaded from an optional file layered under environment variables:
//!
//! ```text
//! config/controller.toml            (optional)
//! RUNNER_CONTROLLER__SERVER__PORT=7440
//! RUNNER_CONTROLLER__RECONCILE__SCALE_FACTOR=1.5
//! ```

use crate::runtime::resource_limiter::ResourceLimits;
use crate::utils::errors::{ControllerError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "RUNNER_CONTROLLER";
const DEFAULT_CONFIG_FILE: &str = "config/controller";

/// Top-level controller configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub server: ServerConfig,
    pub protocol: ProtocolConfig,
    pub dispatch: DispatchConfig,
    pub reconcile: ReconcileConfig,
    pub launcher: LauncherConfig,
    pub catalog: CatalogConfig,
    pub observability: ObservabilityConfig,
}

impl ControllerConfig {
    /// Load from `config/controller.*` (if present) and the environment
    pub fn load() -> Result<Self> {
        Self::build(None)
    }

    /// Load from an explicit file, still honouring environment overrides
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        Self::build(Some(path.as_ref()))
    }

    fn build(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let config: ControllerConfig = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the controller cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.protocol.write_chunk_size == 0 {
            return Err(ControllerError::ConfigError(
                "protocol.write_chunk_size must be positive".into(),
            ));
        }
        if self.protocol.large_payload_threshold == 0 {
            return Err(ControllerError::ConfigError(
                "protocol.large_payload_threshold must be positive".into(),
            ));
        }
        let durations = [
            ("protocol.handshake_timeout_secs", self.protocol.handshake_timeout_secs),
            ("protocol.partial_ttl_secs", self.protocol.partial_ttl_secs),
            ("protocol.late_response_retention_secs", self.protocol.late_response_retention_secs),
            ("dispatch.default_timeout_secs", self.dispatch.default_timeout_secs),
            ("dispatch.ready_wait_secs", self.dispatch.ready_wait_secs),
            ("reconcile.interval_ms", self.reconcile.interval_ms),
            ("reconcile.dangling_interval_secs", self.reconcile.dangling_interval_secs),
            ("reconcile.spawn_ready_wait_secs", self.reconcile.spawn_ready_wait_secs),
            ("reconcile.shutdown_grace_secs", self.reconcile.shutdown_grace_secs),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, value)| *value == 0) {
            return Err(ControllerError::ConfigError(format!("{} must be positive", name)));
        }
        if self.reconcile.scale_factor <= 0.0 {
            return Err(ControllerError::ConfigError(
                "reconcile.scale_factor must be positive".into(),
            ));
        }
        if self.reconcile.sync_target_load <= 0.0 || self.reconcile.async_target_load <= 0.0 {
            return Err(ControllerError::ConfigError(
                "reconcile target loads must be positive".into(),
            ));
        }
        self.launcher
            .limits
            .validate()
            .map_err(ControllerError::ConfigError)?;
        Ok(())
    }
}

/// TCP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface the protocol listener binds to
    pub host: String,

    /// Port the protocol listener binds to (0 picks a free port)
    pub port: u16,

    /// Host runners are told to dial; defaults to `host`
    pub advertise_host: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7440,
            advertise_host: None,
        }
    }
}

impl ServerConfig {
    pub fn advertised_host(&self) -> &str {
        self.advertise_host.as_deref().unwrap_or(&self.host)
    }
}

/// Framing and session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Bodies larger than this are split into chunk transactions
    pub large_payload_threshold: usize,

    /// Payload bytes handed to the socket per write call
    pub write_chunk_size: usize,

    /// Largest frame accepted on read
    pub max_frame_len: u64,

    /// Partial chunked transactions older than this are discarded
    pub partial_ttl_secs: u64,

    /// Upper bound on buffered bytes for one chunked transaction
    pub max_partial_bytes: usize,

    /// Time a runner gets between launch and completing the handshake
    pub handshake_timeout_secs: u64,

    /// How long a finished or timed out trace id is still recognised, so a
    /// late response is dropped quietly instead of reported as unknown
    pub late_response_retention_secs: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            large_payload_threshold: 1000,
            write_chunk_size: 1024,
            max_frame_len: 256 * 1024 * 1024,
            partial_ttl_secs: 120,
            max_partial_bytes: 512 * 1024 * 1024,
            handshake_timeout_secs: 60,
            late_response_retention_secs: 600,
        }
    }
}

impl ProtocolConfig {
    pub fn partial_ttl(&self) -> Duration {
        Duration::from_secs(self.partial_ttl_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn late_response_retention(&self) -> Duration {
        Duration::from_secs(self.late_response_retention_secs)
    }
}

/// Dispatch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Request timeout used when an action does not set one
    pub default_timeout_secs: u64,

    /// How long a dispatch waits for a fresh runner to become ready
    pub ready_wait_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 60,
            ready_wait_secs: 60,
        }
    }
}

impl DispatchConfig {
    pub fn ready_wait(&self) -> Duration {
        Duration::from_secs(self.ready_wait_secs)
    }
}

/// Reconciliation loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub interval_ms: u64,

    /// Interval between dangling worker sweeps
    pub dangling_interval_secs: u64,

    /// Headroom multiplier applied to observed load
    pub scale_factor: f64,

    /// In-flight requests one synchronous runner is expected to carry
    pub sync_target_load: f64,

    /// In-flight requests one asynchronous runner is expected to carry
    pub async_target_load: f64,

    /// A capacity rejection within this window keeps the target at one or more
    pub rejection_window_secs: u64,

    /// Bounded wait for a spawned runner to become ready
    pub spawn_ready_wait_secs: u64,

    /// Bounded wait for runners to drain during controller shutdown
    pub shutdown_grace_secs: u64,

    /// Use the running-average load formula of older deployments
    pub legacy_load_average: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            dangling_interval_secs: 60,
            scale_factor: 1.3,
            sync_target_load: 1.0,
            async_target_load: 10.0,
            rejection_window_secs: 30,
            spawn_ready_wait_secs: 60,
            shutdown_grace_secs: 60,
            legacy_load_average: false,
        }
    }
}

impl ReconcileConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn dangling_interval(&self) -> Duration {
        Duration::from_secs(self.dangling_interval_secs)
    }

    pub fn rejection_window(&self) -> Duration {
        Duration::from_secs(self.rejection_window_secs)
    }

    pub fn spawn_ready_wait(&self) -> Duration {
        Duration::from_secs(self.spawn_ready_wait_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Which launcher backs runner processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LauncherKind {
    Process,
    Docker,
}

/// Launcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    pub kind: LauncherKind,

    /// Runner executable (process launcher) or in-container command (docker)
    pub program: String,

    /// Extra arguments placed before the controller-supplied ones
    pub args: Vec<String>,

    /// Docker image for the docker launcher
    pub image: String,

    /// Tag identifying workers owned by this controller instance
    pub instance_tag: String,

    /// Docker network to attach runner containers to
    pub network: Option<String>,

    pub limits: ResourceLimits,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            kind: LauncherKind::Process,
            program: "runner-agent".to_string(),
            args: vec![],
            image: "runner-agent:latest".to_string(),
            instance_tag: "default".to_string(),
            network: None,
            limits: ResourceLimits::default(),
        }
    }
}

/// Action catalog settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// JSON manifest of actions loaded at startup
    pub actions_file: Option<PathBuf>,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_format: LogFormat,

    /// Address of the Prometheus scrape endpoint; disabled when unset
    pub metrics_addr: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Pretty,
            metrics_addr: None,
        }
    }
}
