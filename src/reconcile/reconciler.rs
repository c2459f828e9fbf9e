// src/reconcile/reconciler.rs
//! Periodic reconciliation of the runner population
//!
//! Each tick retires runners (start grace, age limits, version and
//! environment changes), then scales every standard-mode action towards its
//! autoscale target. Dangling detection runs on a slower interval.

use crate::catalog::{environment_hash, Action, RunnerMode};
use crate::observability::DANGLING_RUNNERS;
use crate::reconcile::autoscale::{clamp_target, observed_load, raw_target, RejectionTracker};
use crate::reconcile::planner::{plan_retirements, CurrentAction, RetirementReason};
use crate::runtime::lifecycle::RunnerStatus;
use crate::runtime::orchestrator::RunnerManager;
use crate::utils::config::ReconcileConfig;
use crate::utils::errors::{ControllerError, Result};
use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What a single autoscale pass decided for one action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleDecision {
    pub target: usize,
    pub active: usize,
    pub spawned: usize,
    pub retired: usize,
}

pub struct Reconciler {
    manager: Arc<RunnerManager>,
    rejections: Arc<RejectionTracker>,
    config: ReconcileConfig,
    start_grace: Duration,
}

impl Reconciler {
    pub fn new(
        manager: Arc<RunnerManager>,
        rejections: Arc<RejectionTracker>,
        config: ReconcileConfig,
        start_grace: Duration,
    ) -> Self {
        Self {
            manager,
            rejections,
            config,
            start_grace,
        }
    }

    /// Run until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticks = tokio::time::interval(self.config.interval());
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut dangling = tokio::time::interval(self.config.dangling_interval());
        dangling.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first dangling scan waits one full interval
        dangling.reset();

        info!(interval = ?self.config.interval(), "Reconciler started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticks.tick() => {
                    // spawns inside a tick may wait for readiness; stay responsive to cancel
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        result = self.tick() => {
                            if let Err(e) = result {
                                warn!(error = %e, "Reconcile tick failed");
                            }
                        }
                    }
                }
                _ = dangling.tick() => {
                    if let Err(e) = self.detect_dangling().await {
                        warn!(error = %e, "Dangling detection failed");
                    }
                }
            }
        }
        info!("Reconciler stopped");
    }

    /// One reconciliation pass
    pub async fn tick(&self) -> Result<()> {
        let store = self.manager.actions();
        let actions = store.current_actions().await?;

        let mut current = HashMap::with_capacity(actions.len());
        for action in &actions {
            let env = store.environment(&action.job_id).await?;
            current.insert(
                action.job_id.clone(),
                CurrentAction {
                    action_id: action.id.clone(),
                    env_hash: environment_hash(&env),
                },
            );
        }

        self.retire(&current);
        self.rejections.prune(self.config.rejection_window());

        let standard = actions
            .iter()
            .filter(|a| a.runner_mode == RunnerMode::Standard);
        join_all(standard.map(|action| self.autoscale(action))).await;
        Ok(())
    }

    fn retire(&self, current: &HashMap<String, CurrentAction>) {
        let snapshot = self.manager.registry().snapshot();
        for retirement in plan_retirements(&snapshot, current, Utc::now(), self.start_grace) {
            let runner_id = retirement.runner_id.as_str();
            match retirement.reason {
                RetirementReason::StartGrace => {
                    warn!(runner_id, "Runner did not complete handshake in time");
                    self.manager.start_timed_out(runner_id);
                }
                RetirementReason::HardAge => {
                    info!(runner_id, "Runner exceeded hard max age, killing");
                    self.manager.kill(runner_id);
                }
                reason => {
                    info!(runner_id, %reason, "Retiring runner");
                    self.manager.request_shutdown(runner_id);
                }
            }
        }
    }

    /// Move one standard-mode action towards its autoscale target
    pub async fn autoscale(&self, action: &Action) -> ScaleDecision {
        let runners = self.manager.registry().for_action(&action.id);
        let active = runners.iter().filter(|r| r.status.is_active()).count();
        let converging = runners
            .iter()
            .any(|r| matches!(r.status, RunnerStatus::Pending | RunnerStatus::Starting));
        let in_flight: Vec<usize> = runners
            .iter()
            .filter(|r| r.status == RunnerStatus::Ready)
            .map(|r| r.requests_processing)
            .collect();

        let target_load = if action.runner_asynchronous {
            self.config.async_target_load
        } else {
            self.config.sync_target_load
        };
        let load = observed_load(&in_flight, self.config.legacy_load_average);
        let raw = raw_target(load, target_load, self.config.scale_factor);
        let cold_start = self
            .rejections
            .recently_rejected(&action.id, self.config.rejection_window());
        let target = clamp_target(raw, action.runner_min_count, action.runner_max_count, cold_start);

        let mut decision = ScaleDecision {
            target,
            active,
            spawned: 0,
            retired: 0,
        };

        if target > active {
            let deficit = target - active;
            debug!(action_id = %action.id, target, active, deficit, "Scaling up");
            let ready_wait = self.config.spawn_ready_wait();
            let results = join_all((0..deficit).map(|_| self.manager.spawn_until_ready(action, ready_wait))).await;
            for result in results {
                match result {
                    Ok(_) => decision.spawned += 1,
                    Err(ControllerError::CapacityExhausted(_)) => {}
                    Err(e) => warn!(action_id = %action.id, error = %e, "Autoscale spawn failed"),
                }
            }
        } else if target < active && !converging {
            // runners that just got ready have not been offered any work yet
            let now = Utc::now();
            let settle = self.config.interval();
            let mut idle: Vec<_> = runners
                .iter()
                .filter(|r| r.status == RunnerStatus::Ready && r.is_idle() && !r.reserved)
                .filter(|r| r.ready_age(now).map_or(false, |age| age >= settle))
                .collect();
            idle.sort_by_key(|r| r.created_at);
            for runner in idle.into_iter().take(active - target) {
                debug!(runner_id = %runner.id, action_id = %action.id, target, "Scaling down idle runner");
                self.manager.request_shutdown(&runner.id);
                decision.retired += 1;
            }
        }

        decision
    }

    /// Kill launcher-visible workers with no tracked runner
    ///
    /// Returns the number of dangling workers found.
    pub async fn detect_dangling(&self) -> Result<usize> {
        let launcher = self.manager.launcher();
        let workers = launcher.list_workers().await?;

        let mut found = 0;
        for runner_id in workers {
            if self.manager.registry().contains(&runner_id) {
                continue;
            }
            found += 1;
            error!(
                runner_id = %runner_id,
                "Dangling runner with no registry entry, another controller or a crash left it behind; killing"
            );
            metrics::counter!(DANGLING_RUNNERS).increment(1);
            if let Err(e) = launcher.kill_worker(&runner_id).await {
                error!(runner_id = %runner_id, error = %e, "Failed to kill dangling runner");
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{test_action, InMemoryActionStore};
    use crate::runtime::lifecycle::LifecycleInput;
    use crate::runtime::orchestrator::tests::test_manager;
    use crate::runtime::process_manager::SilentLauncher;
    use crate::runtime::runner::Runner;
    use bytes::Bytes;

    struct Fixture {
        reconciler: Reconciler,
        manager: Arc<RunnerManager>,
        actions: Arc<InMemoryActionStore>,
        launcher: Arc<SilentLauncher>,
    }

    fn fixture(action: &Action) -> Fixture {
        let actions = Arc::new(InMemoryActionStore::new());
        actions.publish(action.clone(), Bytes::from_static(b"code"));
        let launcher = Arc::new(SilentLauncher::default());
        let manager = Arc::new(test_manager(actions.clone(), launcher.clone()));
        let config = ReconcileConfig {
            interval_ms: 20,
            spawn_ready_wait_secs: 1,
            ..ReconcileConfig::default()
        };
        let reconciler = Reconciler::new(
            manager.clone(),
            Arc::new(RejectionTracker::new()),
            config,
            Duration::from_secs(60),
        );
        Fixture {
            reconciler,
            manager,
            actions,
            launcher,
        }
    }

    /// Track a ready runner without a real connection
    fn ready_runner(manager: &RunnerManager, id: &str, action: &Action) {
        let registry = manager.registry();
        registry.insert_within_limit(Runner::new(id, action, None), action).unwrap();
        registry.apply(id, LifecycleInput::Launched).unwrap();
        registry.apply(id, LifecycleInput::HandshakeReady).unwrap();
    }

    #[tokio::test]
    async fn test_version_change_retires_runner() {
        let v1 = test_action("v1", "j1", RunnerMode::Standard);
        let f = fixture(&v1);
        ready_runner(&f.manager, "r1", &v1);

        let mut v2 = test_action("v2", "j1", RunnerMode::Standard);
        v2.runner_min_count = 0;
        f.actions.publish(v2, Bytes::from_static(b"code-v2"));

        f.reconciler.tick().await.unwrap();
        assert_eq!(f.manager.registry().status("r1"), Some(RunnerStatus::Closing));
    }

    #[tokio::test]
    async fn test_environment_change_retires_runner() {
        let action = test_action("a1", "j1", RunnerMode::Standard);
        let f = fixture(&action);
        ready_runner(&f.manager, "r1", &action);

        f.actions.set_environment(
            "j1",
            [("KEY".to_string(), "value".to_string())].into_iter().collect(),
        );
        f.reconciler.tick().await.unwrap();
        assert_eq!(f.manager.registry().status("r1"), Some(RunnerStatus::Closing));
    }

    #[tokio::test]
    async fn test_scale_down_idle_oldest_first() {
        let mut action = test_action("a1", "j1", RunnerMode::Standard);
        action.runner_min_count = 1;
        let f = fixture(&action);
        for id in ["oldest", "middle", "newest"] {
            ready_runner(&f.manager, id, &action);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;

        let decision = f.reconciler.autoscale(&action).await;
        assert_eq!(decision.target, 1);
        assert_eq!(decision.retired, 2);

        let registry = f.manager.registry();
        assert_eq!(registry.status("oldest"), Some(RunnerStatus::Closing));
        assert_eq!(registry.status("middle"), Some(RunnerStatus::Closing));
        assert_eq!(registry.status("newest"), Some(RunnerStatus::Ready));
    }

    #[tokio::test]
    async fn test_fresh_and_reserved_runners_not_scaled_down() {
        let action = test_action("a1", "j1", RunnerMode::Standard);
        let f = fixture(&action);
        let registry = f.manager.registry();

        let mut reserved = Runner::new("reserved", &action, None);
        reserved.reserved = true;
        registry.insert_within_limit(reserved, &action).unwrap();
        registry.apply("reserved", LifecycleInput::Launched).unwrap();
        registry.apply("reserved", LifecycleInput::HandshakeReady).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        ready_runner(&f.manager, "fresh", &action);

        // target is zero, but one runner waits for its dispatch and the
        // other has not been offered work yet
        let decision = f.reconciler.autoscale(&action).await;
        assert_eq!(decision.target, 0);
        assert_eq!(decision.retired, 0);
        assert_eq!(registry.status("reserved"), Some(RunnerStatus::Ready));
        assert_eq!(registry.status("fresh"), Some(RunnerStatus::Ready));

        tokio::time::sleep(Duration::from_millis(30)).await;
        let decision = f.reconciler.autoscale(&action).await;
        assert_eq!(decision.retired, 1);
        assert_eq!(registry.status("fresh"), Some(RunnerStatus::Closing));
        assert_eq!(registry.status("reserved"), Some(RunnerStatus::Ready));
    }

    #[tokio::test]
    async fn test_busy_runners_not_scaled_down() {
        let mut action = test_action("a1", "j1", RunnerMode::Standard);
        action.runner_asynchronous = true;
        let f = fixture(&action);
        ready_runner(&f.manager, "r1", &action);
        ready_runner(&f.manager, "r2", &action);
        let _g1 = f.manager.registry().acquire("r1").unwrap();
        let _g2 = f.manager.registry().acquire("r2").unwrap();

        // two requests against a target of 10 per runner rounds to zero,
        // but busy runners are never picked for scale-down
        let decision = f.reconciler.autoscale(&action).await;
        assert_eq!(decision.target, 0);
        assert_eq!(decision.active, 2);
        assert_eq!(decision.retired, 0);
    }

    #[tokio::test]
    async fn test_scale_up_stops_at_max() {
        let mut action = test_action("a1", "j1", RunnerMode::Standard);
        action.runner_min_count = 3;
        action.runner_max_count = 2;
        let f = fixture(&action);

        // silent runners never get ready and are killed after the ready wait
        let decision = f.reconciler.autoscale(&action).await;
        assert_eq!(decision.target, 2);
        assert_eq!(decision.spawned, 0);
        assert_eq!(f.launcher.launched.lock().len(), 2);
        assert!(f.manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_hard_age_kills_closing_runner() {
        let mut action = test_action("a1", "j1", RunnerMode::Standard);
        action.runner_max_age_hard = 1;
        let f = fixture(&action);
        ready_runner(&f.manager, "r1", &action);
        f.manager.request_shutdown("r1");

        tokio::time::sleep(Duration::from_millis(1100)).await;
        f.reconciler.tick().await.unwrap();
        assert!(!f.manager.registry().contains("r1"));
    }

    #[tokio::test]
    async fn test_dangling_workers_killed() {
        let action = test_action("a1", "j1", RunnerMode::Standard);
        let f = fixture(&action);
        let tracked = f.manager.spawn(&action).await.unwrap();
        f.launcher.strays.lock().push("ghost".to_string());

        assert_eq!(f.reconciler.detect_dangling().await.unwrap(), 1);
        assert_eq!(f.launcher.killed_workers.lock().as_slice(), &["ghost".to_string()]);
        assert!(f.manager.registry().contains(&tracked));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let action = test_action("a1", "j1", RunnerMode::Standard);
        let f = fixture(&action);
        let reconciler = Arc::new(f.reconciler);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(reconciler.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
