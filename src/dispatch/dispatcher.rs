// src/dispatch/dispatcher.rs
//! Routes job requests to runners
//!
//! Standard actions share a pool: the least-loaded eligible runner takes
//! the request, and an empty pool triggers one synchronous spawn followed
//! by a single retry. Run-once actions get a fresh runner per request,
//! which is always asked to shut down afterwards.
//!
//! Callers always receive a [`JobResponse`]; internal errors are mapped to
//! the dispatch error taxonomy here.

use crate::catalog::{Action, RunnerMode};
use crate::dispatch::request::{DispatchError, DispatchErrorKind, HandleReply, JobRequest, JobResponse};
use crate::observability::{DISPATCHES, DISPATCH_DURATION_MS};
use crate::reconcile::autoscale::RejectionTracker;
use crate::runtime::orchestrator::RunnerManager;
use crate::runtime::registry::InFlightGuard;
use crate::utils::errors::{ControllerError, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub struct Dispatcher {
    manager: Arc<RunnerManager>,
    rejections: Arc<RejectionTracker>,
    default_timeout: Duration,
}

impl Dispatcher {
    pub fn new(manager: Arc<RunnerManager>, rejections: Arc<RejectionTracker>, default_timeout: Duration) -> Self {
        Self {
            manager,
            rejections,
            default_timeout,
        }
    }

    /// Dispatch to the current action of `job_id`
    pub async fn dispatch(&self, job_id: &str, request: &JobRequest) -> JobResponse {
        match self.manager.actions().current_action(job_id).await {
            Ok(Some(action)) => self.dispatch_action(&action, request).await,
            Ok(None) => {
                metrics::counter!(DISPATCHES, "mode" => "none", "outcome" => "action-not-found").increment(1);
                DispatchError::new(
                    DispatchErrorKind::ActionNotFound,
                    format!("No current action for job {}", job_id),
                    -1,
                )
                .into()
            }
            Err(e) => DispatchError::from_controller(&e, -1).into(),
        }
    }

    /// Dispatch to a specific action
    pub async fn dispatch_action(&self, action: &Action, request: &JobRequest) -> JobResponse {
        let started = Instant::now();
        let result = match action.runner_mode {
            RunnerMode::Standard => self.dispatch_standard(action, request).await,
            RunnerMode::RunOnce => self.dispatch_run_once(action, request).await,
        };
        let elapsed = started.elapsed();
        let duration = elapsed.as_millis() as i64;

        let mode = match action.runner_mode {
            RunnerMode::Standard => "standard",
            RunnerMode::RunOnce => "run-once",
        };
        let response = match result {
            Ok(reply) => JobResponse::from_reply(reply, duration),
            Err(e) => {
                warn!(action_id = %action.id, job_id = %action.job_id, error = %e, "Dispatch failed");
                DispatchError::from_controller(&e, duration).into()
            }
        };

        let outcome = match &response.error_kind {
            None if response.success => "success".to_string(),
            None => "handler-error".to_string(),
            Some(kind) => kind.to_string(),
        };
        metrics::counter!(DISPATCHES, "mode" => mode, "outcome" => outcome).increment(1);
        metrics::histogram!(DISPATCH_DURATION_MS, "mode" => mode).record(elapsed.as_secs_f64() * 1000.0);
        response
    }

    async fn dispatch_standard(&self, action: &Action, request: &JobRequest) -> Result<HandleReply> {
        let registry = self.manager.registry();
        if let Some(guard) = registry.try_acquire_least_loaded(&action.id) {
            return self.forward(guard, action, request).await;
        }

        debug!(action_id = %action.id, "No eligible runner, spawning one");
        self.rejections.record(&action.id);
        let spawn_error = match self.manager.spawn_and_wait_ready(action).await {
            Ok(guard) => return self.forward(guard, action, request).await,
            Err(e) => {
                debug!(action_id = %action.id, error = %e, "On-demand spawn failed");
                e
            }
        };

        // a pool runner may have freed up while the spawn failed
        match registry.try_acquire_least_loaded(&action.id) {
            Some(guard) => self.forward(guard, action, request).await,
            None => Err(match spawn_error {
                ControllerError::CapacityExhausted(_) => ControllerError::CapacityExhausted(format!(
                    "no runner available for action {}",
                    action.id
                )),
                e => e,
            }),
        }
    }

    async fn dispatch_run_once(&self, action: &Action, request: &JobRequest) -> Result<HandleReply> {
        let guard = self.manager.spawn_and_wait_ready(action).await?;
        let runner_id = guard.runner_id().to_string();

        let result = self.forward(guard, action, request).await;
        self.manager.request_shutdown(&runner_id);
        result
    }

    async fn forward(&self, guard: InFlightGuard, action: &Action, request: &JobRequest) -> Result<HandleReply> {
        let timeout = action.timeout_or(self.default_timeout);
        debug!(runner_id = %guard.runner_id(), action_id = %action.id, kind = request.kind(), "Forwarding request");
        let reply = self
            .manager
            .hub()
            .handle(guard.runner_id(), request, timeout)
            .await;
        drop(guard);
        reply
    }
}
