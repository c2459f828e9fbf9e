// src/protocol/pending.rs
//! Pending request table
//!
//! Maps a trace id to the one-shot channel of the caller waiting for its
//! response. The wait is a race between that channel and a timer; a timed
//! out entry is removed and remembered for the retention period so that a
//! late response can be told apart from a response nobody ever asked for.

use crate::observability::PENDING_TRANSACTIONS;
use crate::protocol::message::Transaction;
use crate::utils::errors::{ControllerError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;

const DEFAULT_RETENTION: Duration = Duration::from_secs(600);

type Reply = Result<Transaction>;

struct PendingEntry {
    runner_id: String,
    reply: oneshot::Sender<Reply>,
}

/// Outcome of routing a response to its waiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Handed to the waiting caller
    Delivered,
    /// The caller already gave up (timeout or duplicate response)
    Late,
    /// No request with this trace id was ever outstanding
    Unknown,
}

/// A registered request awaiting its response
pub struct PendingReply {
    trace_id: String,
    rx: oneshot::Receiver<Reply>,
}

impl PendingReply {
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }
}

/// Trace-id keyed table of outstanding requests
pub struct PendingRequests {
    entries: DashMap<String, PendingEntry>,
    /// Finished trace ids and when they stop being recognised
    finished: DashMap<String, Instant>,
    /// Same ids in the order they finished, for pruning
    finished_order: Mutex<VecDeque<(Instant, String)>>,
    retention: Duration,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    /// Table that recognises late responses for `retention` after a request ends
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            finished: DashMap::new(),
            finished_order: Mutex::new(VecDeque::new()),
            retention,
        }
    }

    /// Register a waiter for `trace_id`; a trace id may only be outstanding once
    pub fn register(&self, trace_id: &str, runner_id: &str) -> Result<PendingReply> {
        let (tx, rx) = oneshot::channel();

        match self.entries.entry(trace_id.to_string()) {
            Entry::Occupied(_) => Err(ControllerError::DuplicateRegistration(format!(
                "trace id {} already pending",
                trace_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(PendingEntry {
                    runner_id: runner_id.to_string(),
                    reply: tx,
                });
                metrics::gauge!(PENDING_TRANSACTIONS).set(self.entries.len() as f64);
                Ok(PendingReply {
                    trace_id: trace_id.to_string(),
                    rx,
                })
            }
        }
    }

    /// Route a response to its waiter; the waiter is removed on first delivery
    pub fn resolve(&self, response: Transaction) -> Resolution {
        let trace_id = response.header.trace_id.clone();

        match self.entries.remove(&trace_id) {
            Some((_, entry)) => {
                metrics::gauge!(PENDING_TRANSACTIONS).set(self.entries.len() as f64);
                self.remember(trace_id);
                if entry.reply.send(Ok(response)).is_err() {
                    // caller dropped its future between timeout and removal
                    return Resolution::Late;
                }
                Resolution::Delivered
            }
            None if self.was_expired(&trace_id) => Resolution::Late,
            None => Resolution::Unknown,
        }
    }

    /// Remove a waiter without delivering anything
    pub fn expire(&self, trace_id: &str) {
        if self.entries.remove(trace_id).is_some() {
            metrics::gauge!(PENDING_TRANSACTIONS).set(self.entries.len() as f64);
            self.remember(trace_id.to_string());
        }
    }

    /// Fail every waiter bound to `runner_id`, returning how many were failed
    pub fn fail_runner(&self, runner_id: &str, reason: &str) -> usize {
        let trace_ids: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.value().runner_id == runner_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut failed = 0;
        for trace_id in trace_ids {
            if let Some((trace_id, entry)) = self.entries.remove(&trace_id) {
                let _ = entry
                    .reply
                    .send(Err(ControllerError::ConnectionLost(reason.to_string())));
                self.remember(trace_id);
                failed += 1;
            }
        }

        if failed > 0 {
            debug!(runner_id, failed, "Failed pending requests for closed connection");
            metrics::gauge!(PENDING_TRANSACTIONS).set(self.entries.len() as f64);
        }
        failed
    }

    /// Wait for the reply, bounded by `timeout`
    pub async fn wait(&self, pending: PendingReply, timeout: Duration) -> Result<Transaction> {
        let PendingReply { trace_id, rx } = pending;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                self.expire(&trace_id);
                Err(ControllerError::ConnectionLost(format!(
                    "waiter for trace {} dropped",
                    trace_id
                )))
            }
            Err(_) => {
                self.expire(&trace_id);
                Err(ControllerError::Timeout(timeout))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remember(&self, trace_id: String) {
        let now = Instant::now();
        let mut order = self.finished_order.lock();
        while let Some((until, _)) = order.front() {
            if *until > now {
                break;
            }
            if let Some((until, stale)) = order.pop_front() {
                self.finished.remove_if(&stale, |_, at| *at == until);
            }
        }

        let until = now + self.retention;
        self.finished.insert(trace_id.clone(), until);
        order.push_back((until, trace_id));
    }

    fn was_expired(&self, trace_id: &str) -> bool {
        self.finished
            .get(trace_id)
            .map(|until| *until > Instant::now())
            .unwrap_or(false)
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}
