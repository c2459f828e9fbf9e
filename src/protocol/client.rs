// src/protocol/client.rs
//! Runner side of the protocol
//!
//! A runner dials the controller, sends `init`, receives its code archive,
//! announces `ready` and then serves `handle` transactions concurrently
//! until the controller sends `shutdown`. On shutdown it stops taking work,
//! lets in-flight handlers finish and closes its socket.

use crate::catalog::store::{StoreReply, StoreRequest};
use crate::dispatch::request::{HandleReply, JobRequest};
use crate::protocol::chunking::ChunkAssembler;
use crate::protocol::hub::send_transaction;
use crate::protocol::message::{new_trace_id, Transaction, TransactionName};
use crate::protocol::pending::PendingRequests;
use crate::transport::{spawn_writer, FrameCodec, FrameReader, FrameSender};
use crate::utils::config::ProtocolConfig;
use crate::utils::errors::{ControllerError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

const STORE_TIMEOUT: Duration = Duration::from_secs(30);

/// Executes job requests inside a runner
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, request: JobRequest, ctx: RunnerContext) -> HandleReply;
}

/// Per-request context handed to a [`JobHandler`]
#[derive(Clone)]
pub struct RunnerContext {
    pub runner_id: String,
    pub store: StoreClient,
}

/// Access to the controller's key/value store from inside a runner
#[derive(Clone)]
pub struct StoreClient {
    runner_id: String,
    sender: FrameSender,
    pending: Arc<PendingRequests>,
    threshold: usize,
}

impl StoreClient {
    async fn call(&self, name: TransactionName, request: StoreRequest) -> Result<Option<Value>> {
        let tx = Transaction::json(name, self.runner_id.as_str(), new_trace_id(), &request)?;
        let pending = self.pending.register(tx.trace_id(), &self.runner_id)?;
        send_transaction(&self.sender, tx, self.threshold)?;

        let reply: StoreReply = self.pending.wait(pending, STORE_TIMEOUT).await?.parse_json()?;
        match reply.error {
            Some(error) => Err(ControllerError::StoreError(error)),
            None => Ok(reply.value),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.call(
            TransactionName::StoreGet,
            StoreRequest {
                key: key.to_string(),
                value: None,
            },
        )
        .await
    }

    pub async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.call(
            TransactionName::StoreSet,
            StoreRequest {
                key: key.to_string(),
                value: Some(value),
            },
        )
        .await
        .map(|_| ())
    }

    /// Returns whether the key existed
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let existed = self
            .call(
                TransactionName::StoreDelete,
                StoreRequest {
                    key: key.to_string(),
                    value: None,
                },
            )
            .await?;
        Ok(matches!(existed, Some(Value::Bool(true))))
    }
}

/// Connection from a runner to its controller
pub struct RunnerClient {
    runner_id: String,
    frames: FrameReader<OwnedReadHalf>,
    sender: FrameSender,
    writer: JoinHandle<Result<()>>,
    pending: Arc<PendingRequests>,
    assembler: ChunkAssembler,
    config: ProtocolConfig,
}

impl RunnerClient {
    /// Dial the controller
    pub async fn connect(addr: impl ToSocketAddrs, runner_id: &str, config: ProtocolConfig) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();
        let (sender, writer) = spawn_writer(write, config.write_chunk_size);

        Ok(Self {
            runner_id: runner_id.to_string(),
            frames: FrameReader::new(read, FrameCodec::new(config.max_frame_len)),
            sender,
            writer,
            pending: Arc::new(PendingRequests::new()),
            assembler: ChunkAssembler::new(config.partial_ttl(), config.max_partial_bytes),
            config,
        })
    }

    pub fn runner_id(&self) -> &str {
        &self.runner_id
    }

    /// Send `init` and wait for the code archive
    pub async fn handshake(&mut self) -> Result<Bytes> {
        let trace_id = new_trace_id();
        let init = Transaction::empty(TransactionName::Init, self.runner_id.as_str(), trace_id.as_str());
        send_transaction(&self.sender, init, self.config.large_payload_threshold)?;

        let timeout = self.config.handshake_timeout();
        let archive = tokio::time::timeout(timeout, self.await_response(&trace_id))
            .await
            .map_err(|_| ControllerError::Timeout(timeout))??;

        debug!(runner_id = %self.runner_id, bytes = archive.len(), "Received code archive");
        Ok(archive)
    }

    /// Announce readiness and serve requests until shutdown
    pub async fn serve<H: JobHandler>(mut self, handler: Arc<H>) -> Result<()> {
        let ready = Transaction::empty(TransactionName::Ready, self.runner_id.as_str(), new_trace_id());
        send_transaction(&self.sender, ready, self.config.large_payload_threshold)?;
        info!(runner_id = %self.runner_id, "Runner ready");

        let store = StoreClient {
            runner_id: self.runner_id.clone(),
            sender: self.sender.clone(),
            pending: Arc::clone(&self.pending),
            threshold: self.config.large_payload_threshold,
        };

        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut draining = false;

        loop {
            if draining && in_flight.is_empty() {
                break;
            }

            tokio::select! {
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "Handler task failed");
                    }
                }
                frame = self.frames.next() => {
                    let tx = match frame {
                        None => {
                            if !draining {
                                warn!(runner_id = %self.runner_id, "Controller closed the connection");
                            }
                            break;
                        }
                        Some(Err(e)) => {
                            in_flight.abort_all();
                            return Err(e);
                        }
                        Some(Ok(payload)) => match Transaction::decode(payload)
                            .and_then(|tx| self.assembler.accept(tx))
                        {
                            Ok(Some(tx)) => tx,
                            Ok(None) => continue,
                            Err(e) => {
                                warn!(error = %e, "Dropping transaction");
                                continue;
                            }
                        },
                    };

                    match tx.name() {
                        TransactionName::Handle => {
                            let handler = Arc::clone(&handler);
                            let ctx = RunnerContext {
                                runner_id: self.runner_id.clone(),
                                store: store.clone(),
                            };
                            let sender = self.sender.clone();
                            let threshold = self.config.large_payload_threshold;
                            in_flight.spawn(async move {
                                let reply = match tx.parse_json::<JobRequest>() {
                                    Ok(request) => handler.handle(request, ctx).await,
                                    Err(e) => HandleReply::error(format!("invalid request: {}", e)),
                                };
                                let response = Transaction::json(
                                    TransactionName::Response,
                                    tx.runner_id(),
                                    tx.trace_id(),
                                    &reply,
                                );
                                if let Err(e) = response.and_then(|r| send_transaction(&sender, r, threshold)) {
                                    warn!(error = %e, "Failed to send response");
                                }
                            });
                        }
                        TransactionName::Response => {
                            self.pending.resolve(tx);
                        }
                        TransactionName::Shutdown => {
                            info!(
                                runner_id = %self.runner_id,
                                in_flight = in_flight.len(),
                                "Shutdown requested, draining"
                            );
                            draining = true;
                        }
                        other => {
                            warn!(name = %other, "Unexpected transaction from controller");
                        }
                    }
                }
            }
        }

        in_flight.abort_all();
        while in_flight.join_next().await.is_some() {}

        self.pending.fail_runner(&self.runner_id, "runner shutting down");
        drop(store);
        let Self { sender, writer, .. } = self;
        drop(sender);
        match writer.await {
            Ok(result) => result,
            Err(e) => Err(ControllerError::ConnectionLost(format!("writer task failed: {}", e))),
        }
    }

    async fn await_response(&mut self, trace_id: &str) -> Result<Bytes> {
        loop {
            let tx = self.next_transaction().await?;
            if tx.name() == TransactionName::Response && tx.trace_id() == trace_id {
                return Ok(tx.body);
            }
            warn!(name = %tx.name(), "Ignoring transaction before handshake completed");
        }
    }

    async fn next_transaction(&mut self) -> Result<Transaction> {
        loop {
            let payload = match self.frames.next().await {
                Some(frame) => frame?,
                None => {
                    return Err(ControllerError::ConnectionLost(
                        "controller closed the connection".into(),
                    ))
                }
            };
            match Transaction::decode(payload).and_then(|tx| self.assembler.accept(tx)) {
                Ok(Some(tx)) => return Ok(tx),
                Ok(None) => continue,
                Err(e) => warn!(error = %e, "Dropping transaction"),
            }
        }
    }
}
