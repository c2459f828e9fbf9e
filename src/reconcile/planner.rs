// src/reconcile/planner.rs
//! Retirement planning
//!
//! Pure function of a registry snapshot, the current action per job and the
//! clock, so each tick's decisions are made against one consistent view.

use crate::catalog::RunnerMode;
use crate::runtime::lifecycle::RunnerStatus;
use crate::runtime::runner::Runner;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Current published state of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentAction {
    pub action_id: String,
    pub env_hash: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetirementReason {
    /// Handshake not completed within the start grace
    StartGrace,
    HardAge,
    SoftAge,
    /// Bound to an action that is no longer current
    Version,
    /// Environment changed since spawn
    Environment,
    /// Job no longer has a current action
    Unpublished,
}

impl RetirementReason {
    /// Forced kill rather than graceful drain
    pub fn is_forced(&self) -> bool {
        matches!(self, RetirementReason::StartGrace | RetirementReason::HardAge)
    }
}

impl fmt::Display for RetirementReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RetirementReason::StartGrace => "start-grace",
            RetirementReason::HardAge => "hard-age",
            RetirementReason::SoftAge => "soft-age",
            RetirementReason::Version => "version",
            RetirementReason::Environment => "environment",
            RetirementReason::Unpublished => "unpublished",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retirement {
    pub runner_id: String,
    pub reason: RetirementReason,
}

/// Decide which runners to retire this tick, at most one decision per runner
pub fn plan_retirements(
    runners: &[Runner],
    current: &HashMap<String, CurrentAction>,
    now: DateTime<Utc>,
    start_grace: Duration,
) -> Vec<Retirement> {
    runners
        .iter()
        .filter_map(|runner| {
            retirement_reason(runner, current.get(&runner.job_id), now, start_grace).map(|reason| {
                Retirement {
                    runner_id: runner.id.clone(),
                    reason,
                }
            })
        })
        .collect()
}

fn retirement_reason(
    runner: &Runner,
    current: Option<&CurrentAction>,
    now: DateTime<Utc>,
    start_grace: Duration,
) -> Option<RetirementReason> {
    match runner.status {
        RunnerStatus::Pending | RunnerStatus::Starting => {
            return (runner.age(now) > start_grace).then_some(RetirementReason::StartGrace);
        }
        RunnerStatus::Closed => return None,
        RunnerStatus::Ready | RunnerStatus::Closing => {}
    }

    // applies even while draining
    if let (Some(limit), Some(age)) = (runner.max_age_hard, runner.ready_age(now)) {
        if age > limit {
            return Some(RetirementReason::HardAge);
        }
    }

    if runner.status != RunnerStatus::Ready {
        return None;
    }

    if let (Some(limit), Some(age)) = (runner.max_age, runner.ready_age(now)) {
        if age > limit {
            return Some(RetirementReason::SoftAge);
        }
    }

    // run-once runners shut themselves down after their request
    if runner.mode == RunnerMode::RunOnce {
        return None;
    }

    let Some(current) = current else {
        return Some(RetirementReason::Unpublished);
    };
    if runner.action_id != current.action_id {
        return Some(RetirementReason::Version);
    }
    if runner.env_hash != current.env_hash {
        return Some(RetirementReason::Environment);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_action;

    const GRACE: Duration = Duration::from_secs(60);

    fn ready(id: &str, action_id: &str, ready_secs_ago: i64, now: DateTime<Utc>) -> Runner {
        let mut action = test_action(action_id, "j1", RunnerMode::Standard);
        action.runner_max_age = 100;
        action.runner_max_age_hard = 200;
        let mut runner = Runner::new(id, &action, None);
        runner.status = RunnerStatus::Ready;
        runner.created_at = now - chrono::Duration::seconds(ready_secs_ago + 1);
        runner.ready_at = Some(now - chrono::Duration::seconds(ready_secs_ago));
        runner
    }

    fn current(action_id: &str) -> HashMap<String, CurrentAction> {
        HashMap::from([(
            "j1".to_string(),
            CurrentAction {
                action_id: action_id.to_string(),
                env_hash: None,
            },
        )])
    }

    fn reasons(runners: &[Runner], current: &HashMap<String, CurrentAction>, now: DateTime<Utc>) -> Vec<RetirementReason> {
        plan_retirements(runners, current, now, GRACE)
            .into_iter()
            .map(|r| r.reason)
            .collect()
    }

    #[test]
    fn test_healthy_runner_kept() {
        let now = Utc::now();
        assert!(reasons(&[ready("r1", "a1", 10, now)], &current("a1"), now).is_empty());
    }

    #[test]
    fn test_soft_age_is_graceful() {
        let now = Utc::now();
        let r = reasons(&[ready("r1", "a1", 101, now)], &current("a1"), now);
        assert_eq!(r, vec![RetirementReason::SoftAge]);
        assert!(!r[0].is_forced());
    }

    #[test]
    fn test_hard_age_kills_even_when_closing() {
        let now = Utc::now();
        let mut runner = ready("r1", "a1", 201, now);
        runner.status = RunnerStatus::Closing;

        let r = reasons(&[runner], &current("a1"), now);
        assert_eq!(r, vec![RetirementReason::HardAge]);
        assert!(r[0].is_forced());
    }

    #[test]
    fn test_closing_runner_below_hard_age_left_alone() {
        let now = Utc::now();
        let mut runner = ready("r1", "old", 150, now);
        runner.status = RunnerStatus::Closing;
        assert!(reasons(&[runner], &current("a1"), now).is_empty());
    }

    #[test]
    fn test_version_retirement() {
        let now = Utc::now();
        let r = reasons(&[ready("r1", "a1", 10, now)], &current("a2"), now);
        assert_eq!(r, vec![RetirementReason::Version]);
    }

    #[test]
    fn test_environment_retirement() {
        let now = Utc::now();
        let mut changed = current("a1");
        changed.get_mut("j1").unwrap().env_hash = Some("abc".to_string());

        // absent -> present
        let r = reasons(&[ready("r1", "a1", 10, now)], &changed, now);
        assert_eq!(r, vec![RetirementReason::Environment]);

        // present -> absent
        let mut runner = ready("r2", "a1", 10, now);
        runner.env_hash = Some("abc".to_string());
        assert_eq!(
            reasons(&[runner], &current("a1"), now),
            vec![RetirementReason::Environment]
        );
    }

    #[test]
    fn test_unpublished_job() {
        let now = Utc::now();
        let r = reasons(&[ready("r1", "a1", 10, now)], &HashMap::new(), now);
        assert_eq!(r, vec![RetirementReason::Unpublished]);
    }

    #[test]
    fn test_stuck_in_starting() {
        let now = Utc::now();
        let action = test_action("a1", "j1", RunnerMode::Standard);
        let mut stuck = Runner::new("stuck", &action, None);
        stuck.status = RunnerStatus::Starting;
        stuck.created_at = now - chrono::Duration::seconds(61);
        let mut fresh = Runner::new("fresh", &action, None);
        fresh.status = RunnerStatus::Starting;

        let plan = plan_retirements(&[stuck, fresh], &current("a1"), now, GRACE);
        assert_eq!(
            plan,
            vec![Retirement {
                runner_id: "stuck".to_string(),
                reason: RetirementReason::StartGrace
            }]
        );
    }

    #[test]
    fn test_run_once_not_retired_for_version() {
        let now = Utc::now();
        let mut runner = ready("r1", "a1", 10, now);
        runner.mode = RunnerMode::RunOnce;
        assert!(reasons(&[runner], &current("a2"), now).is_empty());
    }
}
