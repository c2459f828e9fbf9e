// src/runtime/runner.rs
//! Tracked runner record

use crate::catalog::{Action, RunnerMode};
use crate::runtime::lifecycle::RunnerStatus;
use crate::runtime::process_manager::ProcessHandle;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// One worker instance executing a job's code
#[derive(Clone)]
pub struct Runner {
    pub id: String,
    pub job_id: String,
    pub action_id: String,
    pub mode: RunnerMode,
    pub asynchronous: bool,
    /// Environment snapshot hash taken at spawn
    pub env_hash: Option<String>,
    pub status: RunnerStatus,
    /// Concurrent in-flight requests
    pub requests_processing: usize,
    /// Spawned for a specific dispatch, which takes the first slot once ready
    pub reserved: bool,
    pub created_at: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
    pub closing_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub max_age: Option<Duration>,
    pub max_age_hard: Option<Duration>,
    pub(crate) process: Option<Arc<dyn ProcessHandle>>,
}

impl Runner {
    pub fn new(id: impl Into<String>, action: &Action, env_hash: Option<String>) -> Self {
        let secs = |s: u64| (s > 0).then(|| Duration::from_secs(s));
        Self {
            id: id.into(),
            job_id: action.job_id.clone(),
            action_id: action.id.clone(),
            mode: action.runner_mode,
            asynchronous: action.runner_asynchronous,
            env_hash,
            status: RunnerStatus::Pending,
            requests_processing: 0,
            reserved: false,
            created_at: Utc::now(),
            ready_at: None,
            closing_at: None,
            closed_at: None,
            max_age: secs(action.runner_max_age),
            max_age_hard: secs(action.runner_max_age_hard),
            process: None,
        }
    }

    /// Time since the handshake completed
    pub fn ready_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.ready_at.and_then(|at| (now - at).to_std().ok())
    }

    /// Time since the record was created
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or_default()
    }

    pub fn is_idle(&self) -> bool {
        self.requests_processing == 0
    }

    /// Whether the balancer may route a new request here
    pub fn accepts_requests(&self) -> bool {
        self.status == RunnerStatus::Ready
            && !self.reserved
            && (self.asynchronous || self.requests_processing == 0)
    }

    pub fn has_process(&self) -> bool {
        self.process.is_some()
    }
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("id", &self.id)
            .field("action_id", &self.action_id)
            .field("status", &self.status)
            .field("requests_processing", &self.requests_processing)
            .field("reserved", &self.reserved)
            .field("created_at", &self.created_at)
            .field("ready_at", &self.ready_at)
            .finish()
    }
}

/// Generate a unique runner id
pub fn new_runner_id() -> String {
    ulid::Ulid::new().to_string().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_action;

    #[test]
    fn test_ages_from_action() {
        let mut action = test_action("a1", "j1", RunnerMode::Standard);
        action.runner_max_age = 30;
        let runner = Runner::new("r1", &action, None);

        assert_eq!(runner.max_age, Some(Duration::from_secs(30)));
        assert_eq!(runner.max_age_hard, None);
        assert_eq!(runner.status, RunnerStatus::Pending);
        assert!(runner.ready_age(Utc::now()).is_none());
    }

    #[test]
    fn test_accepts_requests() {
        let action = test_action("a1", "j1", RunnerMode::Standard);
        let mut runner = Runner::new("r1", &action, None);
        assert!(!runner.accepts_requests());

        runner.status = RunnerStatus::Ready;
        assert!(runner.accepts_requests());

        runner.reserved = true;
        assert!(!runner.accepts_requests());
        runner.reserved = false;

        runner.requests_processing = 1;
        assert!(!runner.accepts_requests());

        runner.asynchronous = true;
        assert!(runner.accepts_requests());

        runner.status = RunnerStatus::Closing;
        assert!(!runner.accepts_requests());
    }

    #[test]
    fn test_runner_ids_unique() {
        assert_ne!(new_runner_id(), new_runner_id());
    }
}
