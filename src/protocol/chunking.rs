// src/protocol/chunking.rs
//! Large-payload chunking and reassembly
//!
//! Bodies above a threshold are split into several transactions sharing one
//! trace id. The receiver buffers pieces per trace id until the `is-end`
//! piece arrives. Partial transactions are bounded in size and age so an
//! unterminated sequence cannot leak memory.

use crate::protocol::message::{ChunkMarker, DataType, Transaction};
use crate::utils::errors::{ControllerError, Result};
use bytes::BytesMut;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Split `tx` into chunk transactions if its body exceeds `threshold`
pub fn split(tx: Transaction, threshold: usize) -> Vec<Transaction> {
    let threshold = threshold.max(1);
    if tx.body.len() <= threshold {
        return vec![tx];
    }

    let encoding = tx.header.data_type;
    let count = tx.body.len().div_ceil(threshold);

    (0..count)
        .map(|i| {
            let start = i * threshold;
            let end = (start + threshold).min(tx.body.len());
            let mut header = tx.header.clone();
            header.data_type = DataType::Buffer;
            header.chunk = Some(ChunkMarker {
                is_start: i == 0,
                is_end: i + 1 == count,
                encoding,
            });
            Transaction {
                header,
                body: tx.body.slice(start..end),
            }
        })
        .collect()
}

struct Partial {
    first: Transaction,
    body: BytesMut,
    started_at: Instant,
}

/// Reassembles chunked transactions for one connection
pub struct ChunkAssembler {
    partials: HashMap<String, Partial>,
    ttl: Duration,
    max_bytes: usize,
}

impl ChunkAssembler {
    pub fn new(ttl: Duration, max_bytes: usize) -> Self {
        Self {
            partials: HashMap::new(),
            ttl,
            max_bytes,
        }
    }

    /// Accept one transaction; returns the complete transaction when available
    ///
    /// Unchunked transactions pass straight through. A chunk that cannot be
    /// placed (no start seen, size limit exceeded) is an error and its
    /// partial state is discarded.
    pub fn accept(&mut self, tx: Transaction) -> Result<Option<Transaction>> {
        let Some(marker) = tx.header.chunk else {
            return Ok(Some(tx));
        };
        let trace_id = tx.header.trace_id.clone();

        if marker.is_start {
            if self.partials.contains_key(&trace_id) {
                warn!(trace_id = %trace_id, "Chunk sequence restarted, dropping earlier pieces");
            }
            let mut body = BytesMut::with_capacity(tx.body.len());
            body.extend_from_slice(&tx.body);
            self.partials.insert(
                trace_id.clone(),
                Partial {
                    first: tx,
                    body,
                    started_at: Instant::now(),
                },
            );
        } else {
            let partial = self.partials.get_mut(&trace_id).ok_or_else(|| {
                ControllerError::Protocol(format!("chunk for trace {} without a start", trace_id))
            })?;
            partial.body.extend_from_slice(&tx.body);
        }

        let buffered = self.partials.get(&trace_id).map(|p| p.body.len()).unwrap_or(0);
        if buffered > self.max_bytes {
            self.partials.remove(&trace_id);
            return Err(ControllerError::FrameTooLarge {
                len: buffered as u64,
                max: self.max_bytes as u64,
            });
        }

        if !marker.is_end {
            return Ok(None);
        }

        let Some(partial) = self.partials.remove(&trace_id) else {
            return Ok(None);
        };

        let mut header = partial.first.header;
        header.data_type = marker.encoding;
        header.chunk = None;
        debug!(trace_id = %trace_id, bytes = partial.body.len(), "Reassembled chunked transaction");

        Ok(Some(Transaction {
            header,
            body: partial.body.freeze(),
        }))
    }

    /// Drop partial transactions older than the TTL, returning their trace ids
    pub fn evict_expired(&mut self) -> Vec<String> {
        let ttl = self.ttl;
        let expired: Vec<String> = self
            .partials
            .iter()
            .filter(|(_, partial)| partial.started_at.elapsed() > ttl)
            .map(|(trace_id, _)| trace_id.clone())
            .collect();

        for trace_id in &expired {
            warn!(trace_id = %trace_id, "Discarding unterminated chunked transaction");
            self.partials.remove(trace_id);
        }
        expired
    }

    pub fn pending(&self) -> usize {
        self.partials.len()
    }
}
