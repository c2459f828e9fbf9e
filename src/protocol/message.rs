// src/protocol/message.rs
//! Transactions exchanged over frames
//!
//! A frame payload is a compact JSON header, a `\n`, then the body:
//!
//! ```text
//! {"name":"handle","runnerId":"01H…","traceId":"01H…","dataType":"json"}\n{…}
//! ```

use crate::utils::errors::{ControllerError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transaction kinds understood by both ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionName {
    Init,
    Ready,
    Handle,
    Response,
    Shutdown,
    StoreGet,
    StoreSet,
    StoreDelete,
}

impl TransactionName {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionName::Init => "init",
            TransactionName::Ready => "ready",
            TransactionName::Handle => "handle",
            TransactionName::Response => "response",
            TransactionName::Shutdown => "shutdown",
            TransactionName::StoreGet => "store-get",
            TransactionName::StoreSet => "store-set",
            TransactionName::StoreDelete => "store-delete",
        }
    }
}

impl fmt::Display for TransactionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionName {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "init" => Ok(TransactionName::Init),
            "ready" => Ok(TransactionName::Ready),
            "handle" => Ok(TransactionName::Handle),
            "response" => Ok(TransactionName::Response),
            "shutdown" => Ok(TransactionName::Shutdown),
            "store-get" => Ok(TransactionName::StoreGet),
            "store-set" => Ok(TransactionName::StoreSet),
            "store-delete" => Ok(TransactionName::StoreDelete),
            other => Err(ControllerError::UnknownTransaction(other.to_string())),
        }
    }
}

/// Encoding of a transaction body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Buffer,
    Json,
}

/// Marks one piece of a body split across several frames
///
/// On the wire these are the flat `is-start`, `is-end` and
/// `is-encoding-json` header tags, present on every piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMarker {
    pub is_start: bool,
    pub is_end: bool,
    /// Encoding of the reassembled body
    pub encoding: DataType,
}

/// Decoded transaction header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: TransactionName,
    pub runner_id: String,
    pub trace_id: String,
    pub data_type: DataType,
    pub chunk: Option<ChunkMarker>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireHeader {
    name: String,
    runner_id: String,
    trace_id: String,
    data_type: DataType,
    #[serde(rename = "is-encoding-json", default, skip_serializing_if = "Option::is_none")]
    is_encoding_json: Option<bool>,
    #[serde(rename = "is-start", default, skip_serializing_if = "Option::is_none")]
    is_start: Option<bool>,
    #[serde(rename = "is-end", default, skip_serializing_if = "Option::is_none")]
    is_end: Option<bool>,
}

impl WireHeader {
    fn chunk(&self) -> Option<ChunkMarker> {
        if self.is_start.is_none() && self.is_end.is_none() && self.is_encoding_json.is_none() {
            return None;
        }
        Some(ChunkMarker {
            is_start: self.is_start.unwrap_or(false),
            is_end: self.is_end.unwrap_or(false),
            encoding: if self.is_encoding_json.unwrap_or(false) {
                DataType::Json
            } else {
                DataType::Buffer
            },
        })
    }
}

/// One request or response unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub header: Header,
    pub body: Bytes,
}

/// Generate a trace id unique for the lifetime of the process
pub fn new_trace_id() -> String {
    ulid::Ulid::new().to_string()
}

impl Transaction {
    /// Transaction with a raw byte body
    pub fn buffer(
        name: TransactionName,
        runner_id: impl Into<String>,
        trace_id: impl Into<String>,
        body: Bytes,
    ) -> Self {
        Self {
            header: Header {
                name,
                runner_id: runner_id.into(),
                trace_id: trace_id.into(),
                data_type: DataType::Buffer,
                chunk: None,
            },
            body,
        }
    }

    /// Transaction with a JSON-encoded body
    pub fn json<T: Serialize>(
        name: TransactionName,
        runner_id: impl Into<String>,
        trace_id: impl Into<String>,
        value: &T,
    ) -> Result<Self> {
        let body = serde_json::to_vec(value)?;
        let mut tx = Self::buffer(name, runner_id, trace_id, Bytes::from(body));
        tx.header.data_type = DataType::Json;
        Ok(tx)
    }

    /// Transaction with an empty body
    pub fn empty(
        name: TransactionName,
        runner_id: impl Into<String>,
        trace_id: impl Into<String>,
    ) -> Self {
        Self::buffer(name, runner_id, trace_id, Bytes::new())
    }

    pub fn name(&self) -> TransactionName {
        self.header.name
    }

    pub fn trace_id(&self) -> &str {
        &self.header.trace_id
    }

    pub fn runner_id(&self) -> &str {
        &self.header.runner_id
    }

    /// Parse the body as JSON
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T> {
        if self.header.data_type != DataType::Json {
            return Err(ControllerError::Protocol(format!(
                "{} body for trace {} is not JSON",
                self.header.name, self.header.trace_id
            )));
        }
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Serialize into a frame payload
    pub fn encode(&self) -> Result<Bytes> {
        let header = WireHeader {
            name: self.header.name.as_str().to_string(),
            runner_id: self.header.runner_id.clone(),
            trace_id: self.header.trace_id.clone(),
            data_type: self.header.data_type,
            is_encoding_json: self.header.chunk.map(|c| c.encoding == DataType::Json),
            is_start: self.header.chunk.map(|c| c.is_start),
            is_end: self.header.chunk.map(|c| c.is_end),
        };
        let header = serde_json::to_vec(&header)?;

        let mut buf = BytesMut::with_capacity(header.len() + 1 + self.body.len());
        buf.put_slice(&header);
        buf.put_u8(b'\n');
        buf.put_slice(&self.body);
        Ok(buf.freeze())
    }

    /// Parse a frame payload
    pub fn decode(payload: Bytes) -> Result<Self> {
        let split = payload
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| ControllerError::Protocol("frame has no header terminator".into()))?;

        let wire: WireHeader = serde_json::from_slice(&payload[..split])
            .map_err(|e| ControllerError::Protocol(format!("malformed header: {}", e)))?;
        let name = wire.name.parse()?;
        let chunk = wire.chunk();

        Ok(Self {
            header: Header {
                name,
                runner_id: wire.runner_id,
                trace_id: wire.trace_id,
                data_type: wire.data_type,
                chunk,
            },
            body: payload.slice(split + 1..),
        })
    }
}
