// src/protocol/mod.rs
//! Session protocol
//!
//! Transactions (`header JSON || "\n" || body`) carried in frames, with
//! trace-id correlation, chunking of large payloads and the
//! `init` / `ready` / `shutdown` handshake on both sides of the socket.

pub mod chunking;
pub mod client;
pub mod hub;
pub mod message;
pub mod pending;
pub mod server;
pub mod session;

pub use client::{JobHandler, RunnerClient, RunnerContext, StoreClient};
pub use hub::SessionHub;
pub use message::{DataType, Transaction, TransactionName};
pub use pending::{PendingRequests, Resolution};
pub use server::{ProtocolEvent, ProtocolServer};
pub use session::{ConnectionRegistry, ConnectionState};
