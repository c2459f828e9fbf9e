// src/utils/errors.rs
//! Error types for the runner controller

use std::time::Duration;
use thiserror::Error;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum ControllerError {
    /// Malformed frame or transaction header
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unknown transaction name: {0}")]
    UnknownTransaction(String),

    #[error("Frame of {len} bytes exceeds the maximum of {max} bytes")]
    FrameTooLarge { len: u64, max: u64 },

    /// A runner id or trace id was registered twice without an intervening close
    #[error("Duplicate registration: {0}")]
    DuplicateRegistration(String),

    #[error("Runner not found: {0}")]
    RunnerNotFound(String),

    #[error("No connection registered for runner {0}")]
    ConnectionNotFound(String),

    #[error("Invalid transition for runner {runner_id}: {input} while {from}")]
    InvalidTransition {
        runner_id: String,
        from: String,
        input: String,
    },

    #[error("Capacity exhausted: {0}")]
    CapacityExhausted(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Runner failed to start: {0}")]
    RunnerStartFailed(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Process spawn failed: {0}")]
    ProcessSpawnFailed(String),

    #[error("Launcher error: {0}")]
    LauncherError(String),

    #[error("No current action for job {0}")]
    ActionNotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<config::ConfigError> for ControllerError {
    fn from(e: config::ConfigError) -> Self {
        ControllerError::ConfigError(e.to_string())
    }
}

impl ControllerError {
    /// Whether the error means the remote side is gone rather than misbehaving
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            ControllerError::ConnectionLost(_) | ControllerError::ConnectionNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;
