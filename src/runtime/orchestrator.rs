// src/runtime/orchestrator.rs
//! Runner orchestration
//!
//! [`RunnerManager`] spawns runners through the configured launcher, feeds
//! protocol and process events into the lifecycle state machine and carries
//! out the effects each transition asks for.

use crate::catalog::{environment_hash, Action, ActionStore};
use crate::observability::{RUNNERS_KILLED, RUNNERS_SPAWNED};
use crate::protocol::{ProtocolEvent, SessionHub};
use crate::runtime::lifecycle::{LifecycleEffect, LifecycleInput, RunnerStatus};
use crate::runtime::process_manager::{LaunchSpec, ProcessExit, RunnerLauncher};
use crate::runtime::registry::{Applied, InFlightGuard, RunnerRegistry};
use crate::runtime::resource_limiter::ResourceLimits;
use crate::runtime::runner::{new_runner_id, Runner};
use crate::utils::errors::{ControllerError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Where launched runners dial back to
#[derive(Debug, Clone)]
pub struct ControllerEndpoint {
    pub host: String,
    pub port: u16,
}

pub struct RunnerManager {
    registry: Arc<RunnerRegistry>,
    hub: Arc<SessionHub>,
    launcher: Arc<dyn RunnerLauncher>,
    actions: Arc<dyn ActionStore>,
    exits: mpsc::UnboundedSender<ProcessExit>,
    endpoint: ControllerEndpoint,
    limits: ResourceLimits,
    ready_wait: Duration,
}

impl RunnerManager {
    pub fn new(
        hub: Arc<SessionHub>,
        launcher: Arc<dyn RunnerLauncher>,
        actions: Arc<dyn ActionStore>,
        exits: mpsc::UnboundedSender<ProcessExit>,
        endpoint: ControllerEndpoint,
        limits: ResourceLimits,
        ready_wait: Duration,
    ) -> Self {
        Self {
            registry: Arc::new(RunnerRegistry::new()),
            hub,
            launcher,
            actions,
            exits,
            endpoint,
            limits,
            ready_wait,
        }
    }

    pub fn registry(&self) -> &Arc<RunnerRegistry> {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<SessionHub> {
        &self.hub
    }

    pub fn launcher(&self) -> &Arc<dyn RunnerLauncher> {
        &self.launcher
    }

    pub fn actions(&self) -> &Arc<dyn ActionStore> {
        &self.actions
    }

    /// Create and launch one runner for `action`
    ///
    /// Fails with `CapacityExhausted` when the action already has
    /// `runner_max_count` active runners.
    pub async fn spawn(&self, action: &Action) -> Result<String> {
        self.launch_runner(action, false).await
    }

    async fn launch_runner(&self, action: &Action, reserved: bool) -> Result<String> {
        let env = self.actions.environment(&action.job_id).await?;
        let archive = self.actions.archive(action).await?;

        let runner_id = new_runner_id();
        let mut runner = Runner::new(runner_id.as_str(), action, environment_hash(&env));
        runner.reserved = reserved;
        self.registry.insert_within_limit(runner, action)?;

        // the runner's init must find its registration
        if let Err(e) = self
            .hub
            .connections()
            .register_pending(&runner_id, &action.job_id, archive)
        {
            self.kill(&runner_id);
            return Err(e);
        }

        self.apply(&runner_id, LifecycleInput::Launched);

        let spec = LaunchSpec {
            runner_id: runner_id.clone(),
            job_id: action.job_id.clone(),
            action_id: action.id.clone(),
            controller_host: self.endpoint.host.clone(),
            controller_port: self.endpoint.port,
            env,
            limits: self.limits.clone(),
            exits: self.exits.clone(),
        };

        let process = match self.launcher.launch(spec).await {
            Ok(process) => process,
            Err(e) => {
                error!(runner_id = %runner_id, action_id = %action.id, error = %e, "Runner launch failed");
                self.kill(&runner_id);
                return Err(ControllerError::RunnerStartFailed(e.to_string()));
            }
        };

        if !self.registry.attach_process(&runner_id, Arc::clone(&process)) {
            // exited or killed while launching
            process.kill();
            return Err(ControllerError::RunnerStartFailed(format!(
                "runner {} closed during launch",
                runner_id
            )));
        }

        let mode = match action.runner_mode {
            crate::catalog::RunnerMode::Standard => "standard",
            crate::catalog::RunnerMode::RunOnce => "run-once",
        };
        metrics::counter!(RUNNERS_SPAWNED, "mode" => mode).increment(1);
        info!(runner_id = %runner_id, action_id = %action.id, job_id = %action.job_id, "Runner launched");
        Ok(runner_id)
    }

    /// Spawn a runner for one dispatch and take its first in-flight slot
    ///
    /// The runner stays reserved until the slot is taken, so neither other
    /// dispatches nor scale-down can claim it once it is ready. Kills it if
    /// it never gets ready.
    pub async fn spawn_and_wait_ready(&self, action: &Action) -> Result<InFlightGuard> {
        let runner_id = self.launch_runner(action, true).await?;
        let ready = self
            .registry
            .wait_ready_and_acquire(&runner_id, self.ready_wait)
            .await;
        self.ready_or_kill(&runner_id, ready)
    }

    /// Spawn a pool runner and wait up to `ready_wait` for its handshake
    pub async fn spawn_until_ready(&self, action: &Action, ready_wait: Duration) -> Result<String> {
        let runner_id = self.spawn(action).await?;
        let ready = self.registry.wait_ready(&runner_id, ready_wait).await;
        self.ready_or_kill(&runner_id, ready).map(|()| runner_id)
    }

    fn ready_or_kill<T>(&self, runner_id: &str, ready: Result<T>) -> Result<T> {
        ready.map_err(|e| {
            warn!(runner_id, error = %e, "Runner did not become ready");
            self.kill(runner_id);
            match e {
                ControllerError::Timeout(t) => ControllerError::RunnerStartFailed(format!(
                    "runner {} not ready after {:?}",
                    runner_id, t
                )),
                other => other,
            }
        })
    }

    /// Graceful shutdown: the runner drains and closes its socket
    pub fn request_shutdown(&self, runner_id: &str) {
        self.apply(runner_id, LifecycleInput::ShutdownRequested);
    }

    /// Immediate forced termination
    pub fn kill(&self, runner_id: &str) {
        self.apply(runner_id, LifecycleInput::Kill);
    }

    /// Handshake grace exceeded
    pub fn start_timed_out(&self, runner_id: &str) {
        self.apply(runner_id, LifecycleInput::StartTimedOut);
    }

    pub fn on_protocol_event(&self, event: ProtocolEvent) {
        match event {
            ProtocolEvent::RunnerReady(runner_id) => {
                self.apply(&runner_id, LifecycleInput::HandshakeReady);
            }
            ProtocolEvent::ConnectionClosed(runner_id) => {
                self.apply(&runner_id, LifecycleInput::ConnectionClosed);
            }
        }
    }

    pub fn on_process_exit(&self, exit: ProcessExit) {
        match self.registry.status(&exit.runner_id) {
            Some(RunnerStatus::Closing) | None => {
                debug!(runner_id = %exit.runner_id, code = ?exit.code, "Runner exited");
            }
            Some(status) => {
                warn!(runner_id = %exit.runner_id, code = ?exit.code, %status, "Runner exited unexpectedly");
            }
        }
        self.apply(&exit.runner_id, LifecycleInput::ProcessExited);
    }

    /// Feed protocol events and process exits into the lifecycle until cancelled
    pub async fn run_events(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ProtocolEvent>,
        mut exits: mpsc::UnboundedReceiver<ProcessExit>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(event) = events.recv() => self.on_protocol_event(event),
                Some(exit) = exits.recv() => self.on_process_exit(exit),
                else => break,
            }
        }
        debug!("Lifecycle event loop stopped");
    }

    fn apply(&self, runner_id: &str, input: LifecycleInput) {
        match self.registry.apply(runner_id, input) {
            Ok(Some(applied)) => self.execute(input, applied),
            Ok(None) => debug!(runner_id, %input, "Lifecycle input for untracked runner"),
            Err(e) => error!(runner_id, %input, error = %e, "Rejected lifecycle input"),
        }
    }

    fn execute(&self, input: LifecycleInput, applied: Applied) {
        let runner = &applied.runner;
        for effect in &applied.transition.effects {
            match effect {
                LifecycleEffect::NotifyReady => {
                    info!(runner_id = %runner.id, action_id = %runner.action_id, "Runner ready");
                }
                LifecycleEffect::SendShutdown => match self.hub.shutdown(&runner.id) {
                    Ok(true) => {}
                    Ok(false) => debug!(runner_id = %runner.id, "Shutdown already sent"),
                    Err(e) => warn!(runner_id = %runner.id, error = %e, "Failed to send shutdown"),
                },
                LifecycleEffect::KillProcess => {
                    if let Some(process) = &runner.process {
                        debug!(runner_id = %runner.id, %input, "Killing runner");
                        process.kill();
                        metrics::counter!(RUNNERS_KILLED, "reason" => input.to_string()).increment(1);
                    }
                }
                LifecycleEffect::CloseConnection => {
                    self.hub.connections().remove(&runner.id);
                }
                LifecycleEffect::Deregister => {
                    info!(runner_id = %runner.id, %input, "Runner closed");
                }
            }
        }
    }

    /// Gracefully stop every runner, then kill stragglers
    ///
    /// Never waits longer than twice `grace`.
    pub async fn shutdown_all(&self, grace: Duration) {
        let runners = self.registry.snapshot();
        if runners.is_empty() {
            return;
        }

        info!(count = runners.len(), "Shutting down runners");
        for runner in &runners {
            self.request_shutdown(&runner.id);
        }
        if self.registry.wait_for_empty(grace).await {
            return;
        }

        let stragglers = self.registry.snapshot();
        warn!(count = stragglers.len(), "Killing runners that did not shut down");
        for runner in &stragglers {
            self.kill(&runner.id);
        }
        if !self.registry.wait_for_empty(grace).await {
            error!(remaining = self.registry.len(), "Runners still tracked after kill");
        }
    }
}
