// src/runtime/lifecycle.rs
//! Runner lifecycle state machine
//!
//! ```text
//! pending ──launched──▶ starting ──ready──▶ ready ──shutdown──▶ closing
//!    │                     │                  │                    │
//!    └─────────────────────┴──── exit / close / kill ─────────────┴──▶ closed
//! ```
//!
//! [`transition`] is pure: it returns the next status and the effects the
//! caller must carry out. Every path into `closed` deregisters the runner,
//! and every path except an observed process exit also kills the process,
//! so teardown converges no matter which of exit or close arrives first.

use crate::utils::errors::{ControllerError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a tracked runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerStatus {
    Pending,
    Starting,
    Ready,
    Closing,
    Closed,
}

impl RunnerStatus {
    /// No further transitions leave this status
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunnerStatus::Closed)
    }

    /// Counted against an action's runner limit
    pub fn is_active(&self) -> bool {
        !matches!(self, RunnerStatus::Closing | RunnerStatus::Closed)
    }
}

impl fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunnerStatus::Pending => "pending",
            RunnerStatus::Starting => "starting",
            RunnerStatus::Ready => "ready",
            RunnerStatus::Closing => "closing",
            RunnerStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Something that happened to a runner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleInput {
    /// Process or container launched
    Launched,
    /// `ready` received over the protocol
    HandshakeReady,
    /// Graceful shutdown requested (reconciliation, run-once completion, soft age)
    ShutdownRequested,
    /// Handshake did not complete within the start grace period
    StartTimedOut,
    /// Forced termination (hard age, dangling cleanup, controller shutdown)
    Kill,
    /// The process exited on its own or after a kill
    ProcessExited,
    /// The protocol socket closed
    ConnectionClosed,
}

impl fmt::Display for LifecycleInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleInput::Launched => "launched",
            LifecycleInput::HandshakeReady => "handshake-ready",
            LifecycleInput::ShutdownRequested => "shutdown-requested",
            LifecycleInput::StartTimedOut => "start-timed-out",
            LifecycleInput::Kill => "kill",
            LifecycleInput::ProcessExited => "process-exited",
            LifecycleInput::ConnectionClosed => "connection-closed",
        };
        f.write_str(s)
    }
}

/// Work the caller performs after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEffect {
    /// Wake callers waiting for the runner to become ready
    NotifyReady,
    /// Send a `shutdown` transaction
    SendShutdown,
    /// Forcefully terminate the process
    KillProcess,
    /// Drop the protocol connection
    CloseConnection,
    /// Remove the runner from the registry
    Deregister,
}

/// Result of applying one input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: RunnerStatus,
    pub to: RunnerStatus,
    pub effects: Vec<LifecycleEffect>,
}

/// Compute the next status for `input`
///
/// Inputs that make no sense in the current status (a second `ready`, a
/// launch of a running runner) are rejected. Anything applied to a closed
/// runner is a no-op, which keeps teardown idempotent.
pub fn transition(runner_id: &str, from: RunnerStatus, input: LifecycleInput) -> Result<Transition> {
    use LifecycleEffect::*;
    use LifecycleInput::*;
    use RunnerStatus::*;

    let (to, effects) = match (from, input) {
        (from, _) if from.is_terminal() => (from, vec![]),

        (Pending, Launched) => (Starting, vec![]),
        (Starting, HandshakeReady) => (Ready, vec![NotifyReady]),

        (Ready, ShutdownRequested) => (Closing, vec![SendShutdown]),
        (Closing, ShutdownRequested) => (Closing, vec![]),
        // nothing to drain before the handshake completes
        (Pending | Starting, ShutdownRequested) => {
            (Closed, vec![KillProcess, CloseConnection, Deregister])
        }

        (Pending | Starting, StartTimedOut) => (Closed, vec![KillProcess, CloseConnection, Deregister]),
        (Ready | Closing, StartTimedOut) => (from, vec![]),

        (_, Kill) => (Closed, vec![KillProcess, CloseConnection, Deregister]),
        (_, ConnectionClosed) => (Closed, vec![KillProcess, Deregister]),
        (_, ProcessExited) => (Closed, vec![CloseConnection, Deregister]),

        (from, input) => {
            return Err(ControllerError::InvalidTransition {
                runner_id: runner_id.to_string(),
                from: from.to_string(),
                input: input.to_string(),
            })
        }
    };

    debug_assert!(to >= from, "runner status regressed from {} to {}", from, to);
    Ok(Transition { from, to, effects })
}
