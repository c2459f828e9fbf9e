// src/dispatch/request.rs
//! Request and response shapes at the dispatch boundary
//!
//! Triggers hand the dispatcher a [`JobRequest`]; they always get a
//! [`JobResponse`] back, never an error value.

use crate::utils::errors::ControllerError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Inbound request from a trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JobRequest {
    Http(HttpRequest),
    Schedule,
    Mqtt(MqttMessage),
}

impl JobRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            JobRequest::Http(_) => "http",
            JobRequest::Schedule => "schedule",
            JobRequest::Mqtt(_) => "mqtt",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttMessage {
    pub topic: String,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

/// Body of a runner's `response` to a `handle` transaction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandleReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mqtt: Option<MqttMessage>,
    /// Set when the job's own code failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HandleReply {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Category of a dispatch failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchErrorKind {
    CapacityExhausted,
    Timeout,
    RunnerStartFailed,
    ConnectionLost,
    /// The job has no current action to run
    ActionNotFound,
    /// The runner answered with a body that is not a valid reply
    InvalidResponse,
}

impl fmt::Display for DispatchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DispatchErrorKind::CapacityExhausted => "capacity-exhausted",
            DispatchErrorKind::Timeout => "timeout",
            DispatchErrorKind::RunnerStartFailed => "runner-start-failed",
            DispatchErrorKind::ConnectionLost => "connection-lost",
            DispatchErrorKind::ActionNotFound => "action-not-found",
            DispatchErrorKind::InvalidResponse => "invalid-response",
        };
        f.write_str(s)
    }
}

/// Failure returned to triggers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchError {
    pub kind: DispatchErrorKind,
    pub message: String,
    /// Milliseconds spent, or -1 when not meaningfully measured
    pub duration: i64,
}

impl DispatchError {
    pub fn new(kind: DispatchErrorKind, message: impl Into<String>, duration: i64) -> Self {
        Self {
            kind,
            message: message.into(),
            duration,
        }
    }

    /// Classify an internal error; timeouts always carry `-1`
    pub fn from_controller(err: &ControllerError, duration: i64) -> Self {
        let kind = match err {
            ControllerError::CapacityExhausted(_) => DispatchErrorKind::CapacityExhausted,
            ControllerError::Timeout(_) => DispatchErrorKind::Timeout,
            ControllerError::RunnerStartFailed(_)
            | ControllerError::ProcessSpawnFailed(_)
            | ControllerError::LauncherError(_)
            | ControllerError::RunnerNotFound(_) => DispatchErrorKind::RunnerStartFailed,
            ControllerError::ActionNotFound(_) => DispatchErrorKind::ActionNotFound,
            ControllerError::Protocol(_)
            | ControllerError::Serialization(_)
            | ControllerError::UnknownTransaction(_) => DispatchErrorKind::InvalidResponse,
            _ => DispatchErrorKind::ConnectionLost,
        };
        let duration = if kind == DispatchErrorKind::Timeout { -1 } else { duration };
        Self::new(kind, err.to_string(), duration)
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Result handed back to triggers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    pub success: bool,
    /// Milliseconds, or -1 when not meaningfully measured
    pub duration: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mqtt: Option<MqttMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<DispatchErrorKind>,
}

impl JobResponse {
    /// Build from a runner reply; a reply carrying an error is a failure
    pub fn from_reply(reply: HandleReply, duration: i64) -> Self {
        Self {
            success: reply.error.is_none(),
            duration,
            http: reply.http,
            mqtt: reply.mqtt,
            error: reply.error,
            error_kind: None,
        }
    }
}

impl From<DispatchError> for JobResponse {
    fn from(err: DispatchError) -> Self {
        Self {
            success: false,
            duration: err.duration,
            http: None,
            mqtt: None,
            error: Some(err.message),
            error_kind: Some(err.kind),
        }
    }
}
