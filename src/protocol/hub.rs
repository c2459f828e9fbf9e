// src/protocol/hub.rs
//! Controller-side request/response correlation
//!
//! The hub owns the connection registry and the pending request table and
//! offers the operations the rest of the controller uses: send a `handle`
//! and wait for its `response`, or ask a runner to shut down.

use crate::dispatch::request::{HandleReply, JobRequest};
use crate::protocol::chunking;
use crate::protocol::message::{new_trace_id, Transaction, TransactionName};
use crate::protocol::pending::PendingRequests;
use crate::protocol::session::ConnectionRegistry;
use crate::transport::FrameSender;
use crate::utils::config::ProtocolConfig;
use crate::utils::errors::Result;
use std::time::Duration;
use tracing::{debug, info};

/// Encode `tx` (chunked if large) onto a connection's frame queue
pub fn send_transaction(sender: &FrameSender, tx: Transaction, threshold: usize) -> Result<()> {
    for piece in chunking::split(tx, threshold) {
        sender.send(piece.encode()?)?;
    }
    Ok(())
}

pub struct SessionHub {
    connections: ConnectionRegistry,
    pending: PendingRequests,
    config: ProtocolConfig,
}

impl SessionHub {
    pub fn new(config: ProtocolConfig) -> Self {
        Self {
            connections: ConnectionRegistry::new(),
            pending: PendingRequests::with_retention(config.late_response_retention()),
            config,
        }
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Send `tx` to a ready runner and wait for the response with its trace id
    ///
    /// The waiter is registered before the connection is looked up, so a
    /// socket that closes in between fails the request instead of leaving
    /// it to time out.
    pub async fn request(&self, runner_id: &str, tx: Transaction, timeout: Duration) -> Result<Transaction> {
        let pending = self.pending.register(tx.trace_id(), runner_id)?;
        let sender = match self.connections.sender(runner_id) {
            Ok(sender) => sender,
            Err(e) => {
                self.pending.expire(pending.trace_id());
                return Err(e);
            }
        };

        if let Err(e) = send_transaction(&sender, tx, self.config.large_payload_threshold) {
            self.pending.expire(pending.trace_id());
            return Err(e);
        }

        self.pending.wait(pending, timeout).await
    }

    /// Forward a job request as a `handle` transaction
    pub async fn handle(&self, runner_id: &str, request: &JobRequest, timeout: Duration) -> Result<HandleReply> {
        let trace_id = new_trace_id();
        debug!(runner_id, trace_id = %trace_id, kind = request.kind(), "Sending handle");

        let tx = Transaction::json(TransactionName::Handle, runner_id, trace_id, request)?;
        let reply = self.request(runner_id, tx, timeout).await?;
        reply.parse_json()
    }

    /// Ask a runner to drain and close its socket
    ///
    /// Returns `Ok(false)` if a shutdown was already sent. The connection is
    /// marked closing immediately, so no new requests are routed to it.
    pub fn shutdown(&self, runner_id: &str) -> Result<bool> {
        let Some(sender) = self.connections.begin_closing(runner_id)? else {
            return Ok(false);
        };

        info!(runner_id, "Sending shutdown");
        let tx = Transaction::empty(TransactionName::Shutdown, runner_id, new_trace_id());
        send_transaction(&sender, tx, self.config.large_payload_threshold)?;
        Ok(true)
    }
}
