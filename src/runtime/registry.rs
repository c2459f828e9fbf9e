// src/runtime/registry.rs
//! Registry of tracked runners
//!
//! Every read-decide-write step (capacity check plus insert, least-loaded
//! selection plus in-flight increment, lifecycle transition plus timestamp
//! update) runs under a single lock with no await inside. Waiters observe
//! changes through a watch channel carrying a version counter.

use crate::catalog::Action;
use crate::dispatch::balancer;
use crate::observability::RUNNERS_ACTIVE;
use crate::runtime::lifecycle::{transition, LifecycleEffect, LifecycleInput, RunnerStatus, Transition};
use crate::runtime::process_manager::ProcessHandle;
use crate::runtime::runner::Runner;
use crate::utils::errors::{ControllerError, Result};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Outcome of applying a lifecycle input to a tracked runner
#[derive(Debug, Clone)]
pub struct Applied {
    pub transition: Transition,
    /// Runner record after the transition (removed from the registry if deregistered)
    pub runner: Runner,
}

pub struct RunnerRegistry {
    runners: Mutex<HashMap<String, Runner>>,
    changes: watch::Sender<u64>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            runners: Mutex::new(HashMap::new()),
            changes,
        }
    }

    fn notify(&self, runners: &HashMap<String, Runner>) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
        for status in [
            RunnerStatus::Pending,
            RunnerStatus::Starting,
            RunnerStatus::Ready,
            RunnerStatus::Closing,
        ] {
            let count = runners.values().filter(|r| r.status == status).count();
            metrics::gauge!(RUNNERS_ACTIVE, "status" => status.to_string()).set(count as f64);
        }
    }

    /// Track a new runner unless its action is already at its active runner limit
    pub fn insert_within_limit(&self, runner: Runner, action: &Action) -> Result<()> {
        let mut runners = self.runners.lock();
        if runners.contains_key(&runner.id) {
            return Err(ControllerError::DuplicateRegistration(format!(
                "runner {} already tracked",
                runner.id
            )));
        }

        let active = runners
            .values()
            .filter(|r| r.action_id == runner.action_id && r.status.is_active())
            .count();
        if !action.has_capacity_for(active) {
            return Err(ControllerError::CapacityExhausted(format!(
                "action {} already has {} of {} runners",
                runner.action_id, active, action.runner_max_count
            )));
        }

        runners.insert(runner.id.clone(), runner);
        self.notify(&runners);
        Ok(())
    }

    /// Attach the launched process; returns `false` if the runner is already gone
    pub fn attach_process(&self, runner_id: &str, process: Arc<dyn ProcessHandle>) -> bool {
        match self.runners.lock().get_mut(runner_id) {
            Some(runner) => {
                runner.process = Some(process);
                true
            }
            None => false,
        }
    }

    /// Apply a lifecycle input; `Ok(None)` for runners no longer tracked
    pub fn apply(&self, runner_id: &str, input: LifecycleInput) -> Result<Option<Applied>> {
        let applied = {
            let mut runners = self.runners.lock();
            let Some(runner) = runners.get_mut(runner_id) else {
                return Ok(None);
            };

            let t = transition(runner_id, runner.status, input)?;
            let now = Utc::now();
            if t.to != t.from {
                runner.status = t.to;
                match t.to {
                    RunnerStatus::Ready => runner.ready_at = Some(now),
                    RunnerStatus::Closing => runner.closing_at = Some(now),
                    RunnerStatus::Closed => runner.closed_at = Some(now),
                    _ => {}
                }
            }

            let runner = if t.effects.contains(&LifecycleEffect::Deregister) {
                runners.remove(runner_id)
            } else {
                Some(runner.clone())
            };
            let Some(runner) = runner else {
                return Ok(None);
            };
            self.notify(&runners);
            Applied { transition: t, runner }
        };

        debug!(
            runner_id,
            input = %input,
            from = %applied.transition.from,
            to = %applied.transition.to,
            "Runner transition"
        );
        Ok(Some(applied))
    }

    /// Take an in-flight slot on a specific ready runner
    pub fn acquire(self: &Arc<Self>, runner_id: &str) -> Option<InFlightGuard> {
        {
            let mut runners = self.runners.lock();
            let runner = runners.get_mut(runner_id)?;
            if runner.status != RunnerStatus::Ready {
                return None;
            }
            runner.requests_processing += 1;
        }
        Some(InFlightGuard {
            registry: Arc::clone(self),
            runner_id: runner_id.to_string(),
        })
    }

    /// Select the least-loaded eligible runner of an action and take a slot on it
    pub fn try_acquire_least_loaded(self: &Arc<Self>, action_id: &str) -> Option<InFlightGuard> {
        let runner_id = {
            let mut runners = self.runners.lock();
            let id = balancer::select_least_loaded(
                runners.values().filter(|r| r.action_id == action_id),
            )?
            .id
            .clone();
            if let Some(runner) = runners.get_mut(&id) {
                runner.requests_processing += 1;
            }
            id
        };
        Some(InFlightGuard {
            registry: Arc::clone(self),
            runner_id,
        })
    }

    fn release(&self, runner_id: &str) {
        let mut runners = self.runners.lock();
        if let Some(runner) = runners.get_mut(runner_id) {
            debug_assert!(runner.requests_processing > 0, "in-flight underflow on {}", runner_id);
            runner.requests_processing = runner.requests_processing.saturating_sub(1);
        }
        self.notify(&runners);
    }

    pub fn get(&self, runner_id: &str) -> Option<Runner> {
        self.runners.lock().get(runner_id).cloned()
    }

    pub fn status(&self, runner_id: &str) -> Option<RunnerStatus> {
        self.runners.lock().get(runner_id).map(|r| r.status)
    }

    pub fn contains(&self, runner_id: &str) -> bool {
        self.runners.lock().contains_key(runner_id)
    }

    pub fn snapshot(&self) -> Vec<Runner> {
        self.runners.lock().values().cloned().collect()
    }

    pub fn for_action(&self, action_id: &str) -> Vec<Runner> {
        self.runners
            .lock()
            .values()
            .filter(|r| r.action_id == action_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.runners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.lock().is_empty()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Wait until a runner reaches `ready`
    ///
    /// Fails early if the runner closes or disappears first.
    pub async fn wait_ready(&self, runner_id: &str, timeout: Duration) -> Result<()> {
        self.wait_for_ready(runner_id, timeout, |_| ()).await
    }

    /// Wait until a reserved runner reaches `ready` and take its first slot
    ///
    /// The slot is taken under the same lock that observes `ready`, so no
    /// other dispatch or scale-down pass can claim the runner in between.
    pub async fn wait_ready_and_acquire(self: &Arc<Self>, runner_id: &str, timeout: Duration) -> Result<InFlightGuard> {
        self.wait_for_ready(runner_id, timeout, |runner| {
            runner.requests_processing += 1;
            runner.reserved = false;
            InFlightGuard {
                registry: Arc::clone(self),
                runner_id: runner.id.clone(),
            }
        })
        .await
    }

    async fn wait_for_ready<T>(
        &self,
        runner_id: &str,
        timeout: Duration,
        mut on_ready: impl FnMut(&mut Runner) -> T,
    ) -> Result<T> {
        let mut changes = self.subscribe();
        let wait = async {
            loop {
                let status = {
                    let mut runners = self.runners.lock();
                    match runners.get_mut(runner_id) {
                        Some(runner) if runner.status == RunnerStatus::Ready => return Ok(on_ready(runner)),
                        Some(runner) => Some(runner.status),
                        None => None,
                    }
                };
                match status {
                    Some(RunnerStatus::Pending | RunnerStatus::Starting) => {}
                    Some(status) => {
                        return Err(ControllerError::RunnerStartFailed(format!(
                            "runner {} is {} before becoming ready",
                            runner_id, status
                        )))
                    }
                    None => {
                        return Err(ControllerError::RunnerStartFailed(format!(
                            "runner {} exited before becoming ready",
                            runner_id
                        )))
                    }
                }
                if changes.changed().await.is_err() {
                    return Err(ControllerError::RunnerNotFound(runner_id.to_string()));
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ControllerError::Timeout(timeout))?
    }

    /// Wait until no runners are tracked; returns whether that happened in time
    pub async fn wait_for_empty(&self, timeout: Duration) -> bool {
        let mut changes = self.subscribe();
        let wait = async {
            while !self.is_empty() {
                if changes.changed().await.is_err() {
                    break;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok() && self.is_empty()
    }
}

impl Default for RunnerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// In-flight slot on a runner, released on drop
pub struct InFlightGuard {
    registry: Arc<RunnerRegistry>,
    runner_id: String,
}

impl InFlightGuard {
    pub fn runner_id(&self) -> &str {
        &self.runner_id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.release(&self.runner_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{test_action, RunnerMode};
    use LifecycleInput::*;

    fn ready_runner(registry: &RunnerRegistry, id: &str, action_id: &str) {
        let action = test_action(action_id, "j1", RunnerMode::Standard);
        registry.insert_within_limit(Runner::new(id, &action, None), &action).unwrap();
        registry.apply(id, Launched).unwrap();
        registry.apply(id, HandshakeReady).unwrap();
    }

    #[test]
    fn test_limit_enforced() {
        let registry = RunnerRegistry::new();
        let mut action = test_action("a1", "j1", RunnerMode::RunOnce);
        action.runner_max_count = 2;

        registry.insert_within_limit(Runner::new("r1", &action, None), &action).unwrap();
        registry.insert_within_limit(Runner::new("r2", &action, None), &action).unwrap();
        assert!(matches!(
            registry.insert_within_limit(Runner::new("r3", &action, None), &action),
            Err(ControllerError::CapacityExhausted(_))
        ));

        // closing runners do not count
        registry.apply("r1", Launched).unwrap();
        registry.apply("r1", HandshakeReady).unwrap();
        registry.apply("r1", ShutdownRequested).unwrap();
        registry.insert_within_limit(Runner::new("r3", &action, None), &action).unwrap();
    }

    #[test]
    fn test_duplicate_rejected() {
        let registry = RunnerRegistry::new();
        let action = test_action("a1", "j1", RunnerMode::Standard);
        registry.insert_within_limit(Runner::new("r1", &action, None), &action).unwrap();
        assert!(matches!(
            registry.insert_within_limit(Runner::new("r1", &action, None), &action),
            Err(ControllerError::DuplicateRegistration(_))
        ));
    }

    #[test]
    fn test_apply_updates_timestamps_and_deregisters() {
        let registry = RunnerRegistry::new();
        ready_runner(&registry, "r1", "a1");

        let runner = registry.get("r1").unwrap();
        assert!(runner.ready_at.is_some());

        let applied = registry.apply("r1", ShutdownRequested).unwrap().unwrap();
        assert_eq!(applied.runner.status, RunnerStatus::Closing);
        assert!(applied.runner.closing_at.is_some());

        let applied = registry.apply("r1", ConnectionClosed).unwrap().unwrap();
        assert_eq!(applied.runner.status, RunnerStatus::Closed);
        assert!(applied.runner.closed_at.is_some());
        assert!(!registry.contains("r1"));

        // later exit event for the same runner is a no-op
        assert!(registry.apply("r1", ProcessExited).unwrap().is_none());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let registry = Arc::new(RunnerRegistry::new());
        ready_runner(&registry, "r1", "a1");

        let guard = registry.acquire("r1").unwrap();
        assert_eq!(registry.get("r1").unwrap().requests_processing, 1);
        drop(guard);
        assert_eq!(registry.get("r1").unwrap().requests_processing, 0);
    }

    #[test]
    fn test_least_loaded_selection() {
        let registry = Arc::new(RunnerRegistry::new());
        for id in ["busy", "idle", "light"] {
            ready_runner(&registry, id, "a1");
        }
        // asynchronous so busy runners stay eligible
        for id in ["busy", "idle", "light"] {
            registry.runners.lock().get_mut(id).unwrap().asynchronous = true;
        }
        let _b: Vec<_> = (0..3).map(|_| registry.acquire("busy").unwrap()).collect();
        let _l = registry.acquire("light").unwrap();

        let guard = registry.try_acquire_least_loaded("a1").unwrap();
        assert_eq!(guard.runner_id(), "idle");
    }

    #[test]
    fn test_synchronous_runner_excluded_when_busy() {
        let registry = Arc::new(RunnerRegistry::new());
        ready_runner(&registry, "r1", "a1");

        let first = registry.try_acquire_least_loaded("a1").unwrap();
        assert!(registry.try_acquire_least_loaded("a1").is_none());
        drop(first);
        assert!(registry.try_acquire_least_loaded("a1").is_some());
    }

    #[test]
    fn test_other_actions_not_selected() {
        let registry = Arc::new(RunnerRegistry::new());
        ready_runner(&registry, "r1", "old-version");
        assert!(registry.try_acquire_least_loaded("new-version").is_none());
    }

    #[tokio::test]
    async fn test_wait_ready() {
        let registry = Arc::new(RunnerRegistry::new());
        let action = test_action("a1", "j1", RunnerMode::Standard);
        registry.insert_within_limit(Runner::new("r1", &action, None), &action).unwrap();
        registry.apply("r1", Launched).unwrap();

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.wait_ready("r1", Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        registry.apply("r1", HandshakeReady).unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reserved_runner_goes_to_its_waiter() {
        let registry = Arc::new(RunnerRegistry::new());
        let action = test_action("a1", "j1", RunnerMode::Standard);
        let mut runner = Runner::new("r1", &action, None);
        runner.reserved = true;
        registry.insert_within_limit(runner, &action).unwrap();
        registry.apply("r1", Launched).unwrap();

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry
                    .wait_ready_and_acquire("r1", Duration::from_secs(5))
                    .await
                    .map(|guard| guard.runner_id().to_string())
            })
        };
        registry.apply("r1", HandshakeReady).unwrap();
        // ready but still reserved: the balancer must not hand it out
        let stolen = registry.try_acquire_least_loaded("a1");
        let waited = waiter.await.unwrap();

        assert!(stolen.is_none());
        assert_eq!(waited.unwrap(), "r1");
        let runner = registry.get("r1").unwrap();
        assert!(!runner.reserved);
        // the waiter's guard was dropped with the task output
        assert_eq!(runner.requests_processing, 0);
    }

    #[tokio::test]
    async fn test_wait_ready_and_acquire_holds_slot() {
        let registry = Arc::new(RunnerRegistry::new());
        ready_runner(&registry, "r1", "a1");

        let guard = registry
            .wait_ready_and_acquire("r1", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(registry.get("r1").unwrap().requests_processing, 1);
        assert!(registry.try_acquire_least_loaded("a1").is_none());
        drop(guard);
        assert_eq!(registry.get("r1").unwrap().requests_processing, 0);
    }

    #[tokio::test]
    async fn test_wait_ready_fails_on_exit() {
        let registry = Arc::new(RunnerRegistry::new());
        let action = test_action("a1", "j1", RunnerMode::Standard);
        registry.insert_within_limit(Runner::new("r1", &action, None), &action).unwrap();
        registry.apply("r1", Launched).unwrap();
        registry.apply("r1", ProcessExited).unwrap();

        let result = registry.wait_ready("r1", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ControllerError::RunnerStartFailed(_))));
    }

    #[tokio::test]
    async fn test_wait_ready_times_out() {
        let registry = RunnerRegistry::new();
        let action = test_action("a1", "j1", RunnerMode::Standard);
        registry.insert_within_limit(Runner::new("r1", &action, None), &action).unwrap();

        let result = registry.wait_ready("r1", Duration::from_millis(20)).await;
        assert!(matches!(result, Err(ControllerError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_wait_for_empty() {
        let registry = Arc::new(RunnerRegistry::new());
        assert!(registry.wait_for_empty(Duration::from_millis(10)).await);

        ready_runner(&registry, "r1", "a1");
        assert!(!registry.wait_for_empty(Duration::from_millis(20)).await);

        let remover = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                registry.apply("r1", Kill).unwrap();
            })
        };
        assert!(registry.wait_for_empty(Duration::from_secs(5)).await);
        remover.await.unwrap();
    }
}
