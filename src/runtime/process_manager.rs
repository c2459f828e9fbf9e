// src/runtime/process_manager.rs
//! Runner launchers
//!
//! A launcher turns a [`LaunchSpec`] into a running process or container
//! that dials the controller with `--runner-identifier`, `--controller-host`
//! and `--controller-port`. The controller only observes the exit (reported
//! on `LaunchSpec::exits`) and the stdout/stderr lines, which are
//! forwarded as `tracing` events under the `runner_output` target.

use crate::runtime::resource_limiter::ResourceLimits;
use crate::utils::config::LauncherConfig;
use crate::utils::errors::{ControllerError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Exit of a launched runner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub runner_id: String,
    pub code: Option<i32>,
}

/// Everything a launcher needs to start one runner
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub runner_id: String,
    pub job_id: String,
    pub action_id: String,
    pub controller_host: String,
    pub controller_port: u16,
    pub env: BTreeMap<String, String>,
    pub limits: ResourceLimits,
    pub exits: mpsc::UnboundedSender<ProcessExit>,
}

impl LaunchSpec {
    /// Runner command-line parameters
    pub fn runner_args(&self) -> Vec<String> {
        vec![
            "--runner-identifier".to_string(),
            self.runner_id.clone(),
            "--controller-host".to_string(),
            self.controller_host.clone(),
            "--controller-port".to_string(),
            self.controller_port.to_string(),
        ]
    }

    /// Job environment plus limit hints
    pub fn environment(&self) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        env.extend(self.limits.env_vars());
        env.insert("RUNNER_JOB_ID".to_string(), self.job_id.clone());
        env.insert("RUNNER_ACTION_ID".to_string(), self.action_id.clone());
        env
    }
}

/// Handle on a launched runner
pub trait ProcessHandle: Send + Sync {
    /// Forcefully terminate; must be safe to call more than once
    fn kill(&self);
}

#[async_trait]
pub trait RunnerLauncher: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> Result<Arc<dyn ProcessHandle>>;

    /// Runner ids of every worker this launcher can see for this controller
    async fn list_workers(&self) -> Result<Vec<String>>;

    /// Forcefully terminate a worker by runner id
    async fn kill_worker(&self, runner_id: &str) -> Result<()>;
}

/// Cancels the watcher task, which kills the child
pub struct ChildHandle {
    kill: CancellationToken,
}

impl ProcessHandle for ChildHandle {
    fn kill(&self) {
        self.kill.cancel();
    }
}

/// Forward each line of a child stream to tracing
pub(crate) fn forward_output<R>(runner_id: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    info!(target: "runner_output", runner_id = %runner_id, stream, "{}", line)
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(runner_id = %runner_id, stream, error = %e, "Output stream failed");
                    break;
                }
            }
        }
    });
}

/// Wait for the child to exit (or kill it on request) and report the exit
pub(crate) fn watch_child(
    runner_id: String,
    mut child: Child,
    exits: mpsc::UnboundedSender<ProcessExit>,
    on_exit: impl FnOnce() + Send + 'static,
) -> ChildHandle {
    let kill = CancellationToken::new();
    let token = kill.clone();

    if let Some(stdout) = child.stdout.take() {
        forward_output(runner_id.clone(), "stdout", stdout);
    }
    if let Some(stderr) = child.stderr.take() {
        forward_output(runner_id.clone(), "stderr", stderr);
    }

    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = token.cancelled() => {
                debug!(runner_id = %runner_id, "Killing runner process");
                if let Err(e) = child.start_kill() {
                    warn!(runner_id = %runner_id, error = %e, "Kill failed");
                }
                child.wait().await
            }
        };

        let code = match status {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(runner_id = %runner_id, error = %e, "Failed to reap runner process");
                None
            }
        };
        debug!(runner_id = %runner_id, code = ?code, "Runner process exited");
        on_exit();
        let _ = exits.send(ProcessExit { runner_id, code });
    });

    ChildHandle { kill }
}

/// Launches runners as local child processes
pub struct ProcessLauncher {
    program: String,
    args: Vec<String>,
    /// runner id -> pid of live children
    children: Arc<DashMap<String, u32>>,
}

impl ProcessLauncher {
    pub fn new(config: &LauncherConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            children: Arc::new(DashMap::new()),
        }
    }

    pub fn running(&self) -> usize {
        self.children.len()
    }
}

#[async_trait]
impl RunnerLauncher for ProcessLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<Arc<dyn ProcessHandle>> {
        spec.limits
            .validate()
            .map_err(ControllerError::LauncherError)?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .args(spec.runner_args())
            .envs(spec.environment())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| {
            ControllerError::ProcessSpawnFailed(format!("Failed to spawn {}: {}", self.program, e))
        })?;

        if let Some(pid) = child.id() {
            self.children.insert(spec.runner_id.clone(), pid);
        }
        debug!(runner_id = %spec.runner_id, pid = ?child.id(), "Runner process spawned");

        let children = Arc::clone(&self.children);
        let runner_id = spec.runner_id.clone();
        let handle = watch_child(spec.runner_id, child, spec.exits, move || {
            children.remove(&runner_id);
        });
        Ok(Arc::new(handle))
    }

    async fn list_workers(&self) -> Result<Vec<String>> {
        Ok(self.children.iter().map(|entry| entry.key().clone()).collect())
    }

    async fn kill_worker(&self, runner_id: &str) -> Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some((_, pid)) = self.children.remove(runner_id) else {
            return Ok(());
        };
        let pid = Pid::from_raw(pid as i32);
        debug!(runner_id, %pid, "Sending SIGKILL");
        match kill(pid, Signal::SIGKILL) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(ControllerError::LauncherError(format!(
                "Failed to kill {}: {}",
                pid, e
            ))),
        }
    }
}

/// Launcher whose runners never dial back; counts kills
#[cfg(test)]
#[derive(Default)]
pub(crate) struct SilentLauncher {
    pub launched: parking_lot::Mutex<Vec<String>>,
    pub kills: Arc<std::sync::atomic::AtomicUsize>,
    /// Workers reported by `list_workers` in addition to launched ones
    pub strays: parking_lot::Mutex<Vec<String>>,
    pub killed_workers: parking_lot::Mutex<Vec<String>>,
}

#[cfg(test)]
struct CountingHandle(Arc<std::sync::atomic::AtomicUsize>);

#[cfg(test)]
impl ProcessHandle for CountingHandle {
    fn kill(&self) {
        self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
#[async_trait]
impl RunnerLauncher for SilentLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<Arc<dyn ProcessHandle>> {
        self.launched.lock().push(spec.runner_id);
        Ok(Arc::new(CountingHandle(Arc::clone(&self.kills))))
    }

    async fn list_workers(&self) -> Result<Vec<String>> {
        let mut workers = self.launched.lock().clone();
        workers.extend(self.strays.lock().iter().cloned());
        Ok(workers)
    }

    async fn kill_worker(&self, runner_id: &str) -> Result<()> {
        self.killed_workers.lock().push(runner_id.to_string());
        Ok(())
    }
}
