// src/protocol/session.rs
//! Per-runner protocol sessions
//!
//! A connection is registered (`Pending`) before its runner is launched so
//! that the runner's `init` has a registration to find. The first `init`
//! binds a socket and moves it to `Starting`; `ready` moves it to `Ready`;
//! a controller shutdown request moves it to `Closing`. The entry is removed
//! when the socket closes.

use crate::transport::FrameSender;
use crate::utils::errors::{ControllerError, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Protocol state of a runner connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Registered, no socket yet
    Pending,
    /// Socket bound, handshake in progress
    Starting,
    Ready,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Pending => "pending",
            ConnectionState::Starting => "starting",
            ConnectionState::Ready => "ready",
            ConnectionState::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// Session state for one runner
pub struct Connection {
    pub runner_id: String,
    pub job_id: String,
    pub state: ConnectionState,
    pub registered_at: Instant,
    archive: Bytes,
    sender: Option<FrameSender>,
    close: CancellationToken,
}

impl Connection {
    pub fn sender(&self) -> Option<&FrameSender> {
        self.sender.as_ref()
    }
}

/// Everything the socket task needs after a successful `init`
pub struct BoundSession {
    pub job_id: String,
    pub archive: Bytes,
    pub close: CancellationToken,
}

/// Registry of connections keyed by runner id
///
/// All mutations happen under one lock with no await inside, so each
/// read-decide-write step is atomic with respect to other tasks.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Register a connection ahead of launching its runner
    pub fn register_pending(&self, runner_id: &str, job_id: &str, archive: Bytes) -> Result<()> {
        let mut connections = self.connections.lock();
        if connections.contains_key(runner_id) {
            return Err(ControllerError::DuplicateRegistration(format!(
                "connection for runner {} already registered",
                runner_id
            )));
        }

        connections.insert(
            runner_id.to_string(),
            Connection {
                runner_id: runner_id.to_string(),
                job_id: job_id.to_string(),
                state: ConnectionState::Pending,
                registered_at: Instant::now(),
                archive,
                sender: None,
                close: CancellationToken::new(),
            },
        );
        Ok(())
    }

    /// Bind a socket to a pending connection (`init` received)
    ///
    /// A second `init` for the same runner is rejected: at most one live
    /// socket per runner id.
    pub fn bind(&self, runner_id: &str, sender: FrameSender) -> Result<BoundSession> {
        let mut connections = self.connections.lock();
        let conn = connections
            .get_mut(runner_id)
            .ok_or_else(|| ControllerError::ConnectionNotFound(runner_id.to_string()))?;

        if conn.state != ConnectionState::Pending {
            return Err(ControllerError::DuplicateRegistration(format!(
                "runner {} already bound (state {})",
                runner_id, conn.state
            )));
        }

        conn.state = ConnectionState::Starting;
        conn.sender = Some(sender);
        Ok(BoundSession {
            job_id: conn.job_id.clone(),
            archive: std::mem::take(&mut conn.archive),
            close: conn.close.clone(),
        })
    }

    /// Handshake completed (`ready` received)
    pub fn mark_ready(&self, runner_id: &str) -> Result<()> {
        let mut connections = self.connections.lock();
        let conn = connections
            .get_mut(runner_id)
            .ok_or_else(|| ControllerError::ConnectionNotFound(runner_id.to_string()))?;

        if conn.state != ConnectionState::Starting {
            return Err(ControllerError::Protocol(format!(
                "ready from runner {} while {}",
                runner_id, conn.state
            )));
        }
        conn.state = ConnectionState::Ready;
        Ok(())
    }

    /// Move to `Closing`, returning the sender if a shutdown frame should go out
    ///
    /// Returns `Ok(None)` when the connection is already closing.
    pub fn begin_closing(&self, runner_id: &str) -> Result<Option<FrameSender>> {
        let mut connections = self.connections.lock();
        let conn = connections
            .get_mut(runner_id)
            .ok_or_else(|| ControllerError::ConnectionNotFound(runner_id.to_string()))?;

        match conn.state {
            ConnectionState::Closing => Ok(None),
            ConnectionState::Pending => Err(ControllerError::ConnectionNotFound(format!(
                "runner {} has not connected",
                runner_id
            ))),
            ConnectionState::Starting | ConnectionState::Ready => {
                conn.state = ConnectionState::Closing;
                Ok(conn.sender.clone())
            }
        }
    }

    /// Sender for a connection that may carry requests
    pub fn sender(&self, runner_id: &str) -> Result<FrameSender> {
        let connections = self.connections.lock();
        let conn = connections
            .get(runner_id)
            .ok_or_else(|| ControllerError::ConnectionNotFound(runner_id.to_string()))?;

        match (&conn.sender, conn.state) {
            (Some(sender), ConnectionState::Ready) | (Some(sender), ConnectionState::Closing) => {
                Ok(sender.clone())
            }
            _ => Err(ControllerError::ConnectionNotFound(format!(
                "runner {} is {}",
                runner_id, conn.state
            ))),
        }
    }

    pub fn state(&self, runner_id: &str) -> Option<ConnectionState> {
        self.connections.lock().get(runner_id).map(|conn| conn.state)
    }

    /// Remove a connection and stop its socket task
    pub fn remove(&self, runner_id: &str) -> Option<ConnectionState> {
        let conn = self.connections.lock().remove(runner_id)?;
        conn.close.cancel();
        Some(conn.state)
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
