// src/protocol/server.rs
//! TCP accept loop and per-socket session task
//!
//! ```text
//! runner                         controller
//!   │ ── init{runnerId} ─────────▶ │  Pending → Starting, bind socket
//!   │ ◀──────── response{archive} ─ │
//!   │ ── ready ──────────────────▶ │  Starting → Ready, RunnerReady event
//!   │ ◀──────────────── handle ─── │
//!   │ ── response ───────────────▶ │  resolve pending trace id
//!   │ ◀────────────── shutdown ─── │  Ready → Closing
//!   │ ── (socket close) ─────────▶ │  ConnectionClosed event
//! ```
//!
//! Malformed frames and unknown transaction names are logged and dropped;
//! the socket is only torn down when the byte stream itself is unusable.

use crate::catalog::store::{KeyValueStore, StoreReply, StoreRequest};
use crate::observability::PROTOCOL_ERRORS;
use crate::protocol::chunking::ChunkAssembler;
use crate::protocol::hub::{send_transaction, SessionHub};
use crate::protocol::message::{Transaction, TransactionName};
use crate::protocol::pending::Resolution;
use crate::transport::{spawn_writer, FrameCodec, FrameReader, FrameSender};
use crate::utils::errors::{ControllerError, Result};
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Session events consumed by the runner lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// Handshake finished, runner can take requests
    RunnerReady(String),
    /// Socket for a bound runner closed
    ConnectionClosed(String),
}

pub struct ProtocolServer {
    hub: Arc<SessionHub>,
    store: Arc<dyn KeyValueStore>,
    events: mpsc::UnboundedSender<ProtocolEvent>,
}

impl ProtocolServer {
    pub fn new(
        hub: Arc<SessionHub>,
        store: Arc<dyn KeyValueStore>,
        events: mpsc::UnboundedSender<ProtocolEvent>,
    ) -> Self {
        Self { hub, store, events }
    }

    /// Accept runner connections until `cancel` fires
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "Protocol server listening");
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Protocol server stopping");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&self);
                        tokio::spawn(async move { server.handle_socket(stream, peer).await });
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
    }

    async fn handle_socket(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let config = self.hub.config().clone();
        let _ = stream.set_nodelay(true);

        let (read, write) = stream.into_split();
        let mut frames = FrameReader::new(read, FrameCodec::new(config.max_frame_len));
        let (sender, _writer) = spawn_writer(write, config.write_chunk_size);
        let mut assembler = ChunkAssembler::new(config.partial_ttl(), config.max_partial_bytes);

        let init = match tokio::time::timeout(
            config.handshake_timeout(),
            next_transaction(&mut frames, &mut assembler),
        )
        .await
        {
            Ok(Some(tx)) => tx,
            Ok(None) => {
                debug!(%peer, "Socket closed before init");
                return;
            }
            Err(_) => {
                warn!(%peer, "No init received within handshake timeout");
                return;
            }
        };

        if init.name() != TransactionName::Init {
            warn!(%peer, name = %init.name(), "First transaction was not init, closing");
            metrics::counter!(PROTOCOL_ERRORS, "kind" => "no_init").increment(1);
            return;
        }

        let runner_id = init.runner_id().to_string();
        let session = match self.hub.connections().bind(&runner_id, sender.clone()) {
            Ok(session) => session,
            Err(e) => {
                // a second socket for a bound runner, or a runner we never launched
                error!(%peer, runner_id = %runner_id, error = %e, "Rejecting init");
                metrics::counter!(PROTOCOL_ERRORS, "kind" => "rejected_init").increment(1);
                return;
            }
        };

        let archive = Transaction::buffer(
            TransactionName::Response,
            runner_id.as_str(),
            init.trace_id(),
            session.archive,
        );
        if let Err(e) = send_transaction(&sender, archive, config.large_payload_threshold) {
            warn!(runner_id = %runner_id, error = %e, "Failed to send code archive");
        }
        info!(runner_id = %runner_id, %peer, "Runner connected");

        let mut sweep = tokio::time::interval(config.partial_ttl().max(Duration::from_secs(2)) / 2);
        loop {
            tokio::select! {
                _ = session.close.cancelled() => {
                    debug!(runner_id = %runner_id, "Connection closed by controller");
                    break;
                }
                _ = sweep.tick() => {
                    assembler.evict_expired();
                }
                frame = frames.next() => match frame {
                    None => {
                        debug!(runner_id = %runner_id, "Runner closed socket");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(runner_id = %runner_id, error = %e, "Unrecoverable stream error");
                        metrics::counter!(PROTOCOL_ERRORS, "kind" => "stream").increment(1);
                        break;
                    }
                    Some(Ok(payload)) => {
                        let tx = match Transaction::decode(payload) {
                            Ok(tx) => tx,
                            Err(e) => {
                                warn!(runner_id = %runner_id, error = %e, "Dropping malformed transaction");
                                metrics::counter!(PROTOCOL_ERRORS, "kind" => "malformed").increment(1);
                                continue;
                            }
                        };
                        if tx.runner_id() != runner_id {
                            warn!(
                                runner_id = %runner_id,
                                claimed = %tx.runner_id(),
                                "Dropping transaction with mismatched runner id"
                            );
                            metrics::counter!(PROTOCOL_ERRORS, "kind" => "runner_mismatch").increment(1);
                            continue;
                        }
                        match assembler.accept(tx) {
                            Ok(Some(tx)) => self.on_transaction(&runner_id, &session.job_id, tx, &sender),
                            Ok(None) => {}
                            Err(e) => {
                                warn!(runner_id = %runner_id, error = %e, "Dropping chunk");
                                metrics::counter!(PROTOCOL_ERRORS, "kind" => "chunk").increment(1);
                            }
                        }
                    }
                },
            }
        }

        drop(sender);
        self.hub.connections().remove(&runner_id);
        self.hub.pending().fail_runner(&runner_id, "connection closed");
        info!(runner_id = %runner_id, "Runner disconnected");
        let _ = self.events.send(ProtocolEvent::ConnectionClosed(runner_id));
    }

    fn on_transaction(self: &Arc<Self>, runner_id: &str, job_id: &str, tx: Transaction, sender: &FrameSender) {
        match tx.name() {
            TransactionName::Ready => match self.hub.connections().mark_ready(runner_id) {
                Ok(()) => {
                    info!(runner_id, "Runner ready");
                    let _ = self.events.send(ProtocolEvent::RunnerReady(runner_id.to_string()));
                }
                Err(e) => {
                    error!(runner_id, error = %e, "Ready for connection in invalid state");
                    metrics::counter!(PROTOCOL_ERRORS, "kind" => "invalid_state").increment(1);
                }
            },
            TransactionName::Response => match self.hub.pending().resolve(tx) {
                Resolution::Delivered => {}
                Resolution::Late => {
                    debug!(runner_id, "Dropping late response");
                }
                Resolution::Unknown => {
                    error!(runner_id, "Response with no matching trace id");
                    metrics::counter!(PROTOCOL_ERRORS, "kind" => "unknown_trace").increment(1);
                }
            },
            TransactionName::StoreGet | TransactionName::StoreSet | TransactionName::StoreDelete => {
                let server = Arc::clone(self);
                let sender = sender.clone();
                let job_id = job_id.to_string();
                tokio::spawn(async move {
                    let trace_id = tx.trace_id().to_string();
                    let runner_id = tx.runner_id().to_string();
                    let reply = server.store_operation(&job_id, &tx).await;
                    let reply = Transaction::json(TransactionName::Response, runner_id, trace_id, &reply);
                    let threshold = server.hub.config().large_payload_threshold;
                    if let Err(e) = reply.and_then(|reply| send_transaction(&sender, reply, threshold)) {
                        warn!(error = %e, "Failed to answer store operation");
                    }
                });
            }
            TransactionName::Init => {
                error!(runner_id, "Duplicate init on a bound connection");
                metrics::counter!(PROTOCOL_ERRORS, "kind" => "duplicate_init").increment(1);
            }
            TransactionName::Handle | TransactionName::Shutdown => {
                warn!(runner_id, name = %tx.name(), "Runner sent a controller-only transaction");
                metrics::counter!(PROTOCOL_ERRORS, "kind" => "wrong_direction").increment(1);
            }
        }
    }

    async fn store_operation(&self, job_id: &str, tx: &Transaction) -> StoreReply {
        let request: StoreRequest = match tx.parse_json() {
            Ok(request) => request,
            Err(e) => {
                return StoreReply {
                    value: None,
                    error: Some(e.to_string()),
                }
            }
        };

        let result: Result<Option<serde_json::Value>> = match tx.name() {
            TransactionName::StoreGet => self.store.get(job_id, &request.key).await,
            TransactionName::StoreSet => match request.value {
                Some(value) => self.store.set(job_id, &request.key, value).await.map(|_| None),
                None => Err(ControllerError::StoreError("store-set without a value".into())),
            },
            TransactionName::StoreDelete => self
                .store
                .delete(job_id, &request.key)
                .await
                .map(|existed| Some(serde_json::Value::Bool(existed))),
            _ => Err(ControllerError::StoreError(format!("not a store operation: {}", tx.name()))),
        };

        match result {
            Ok(value) => StoreReply { value, error: None },
            Err(e) => StoreReply {
                value: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Read until one complete transaction is available
async fn next_transaction(
    frames: &mut FrameReader<OwnedReadHalf>,
    assembler: &mut ChunkAssembler,
) -> Option<Transaction> {
    while let Some(frame) = frames.next().await {
        let payload = match frame {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Stream error during handshake");
                return None;
            }
        };
        match Transaction::decode(payload).and_then(|tx| assembler.accept(tx)) {
            Ok(Some(tx)) => return Some(tx),
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "Dropping transaction during handshake");
                metrics::counter!(PROTOCOL_ERRORS, "kind" => "malformed").increment(1);
            }
        }
    }
    None
}
