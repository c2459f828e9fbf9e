// src/reconcile/autoscale.rs
//! Autoscale target computation

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Average in-flight requests per serving runner
///
/// The legacy form folds `(in_flight + prev) / 2`, a running average biased
/// towards the last runners visited. Either form yields NaN for an empty
/// pool, which [`clamp_target`] treats as zero.
pub fn observed_load(in_flight: &[usize], legacy: bool) -> f64 {
    if legacy {
        if in_flight.is_empty() {
            return f64::NAN;
        }
        return in_flight
            .iter()
            .fold(0.0, |prev, &n| (n as f64 + prev) / 2.0);
    }

    let total: usize = in_flight.iter().sum();
    total as f64 / in_flight.len() as f64
}

/// Unrounded runner target: `load_per_runner / target_load * scale_factor`
pub fn raw_target(load_per_runner: f64, target_load: f64, scale_factor: f64) -> f64 {
    load_per_runner / target_load * scale_factor
}

/// Round and bound a raw target to `[min, max]` (`max == 0` is unlimited)
///
/// NaN and negative targets count as zero. A recent capacity rejection
/// forces at least one runner.
pub fn clamp_target(raw: f64, min: usize, max: usize, cold_start: bool) -> usize {
    let mut target = if raw.is_nan() || raw <= 0.0 {
        0
    } else {
        raw.round().min(usize::MAX as f64) as usize
    };

    if cold_start {
        target = target.max(1);
    }
    target = target.max(min);
    if max > 0 {
        target = target.min(max);
    }
    target
}

/// Remembers when each action last turned a request away for lack of runners
#[derive(Default)]
pub struct RejectionTracker {
    last: DashMap<String, Instant>,
}

impl RejectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, action_id: &str) {
        self.last.insert(action_id.to_string(), Instant::now());
    }

    pub fn recently_rejected(&self, action_id: &str, window: Duration) -> bool {
        self.last
            .get(action_id)
            .map(|at| at.elapsed() <= window)
            .unwrap_or(false)
    }

    /// Drop entries older than `window`
    pub fn prune(&self, window: Duration) {
        self.last.retain(|_, at| at.elapsed() <= window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_mean_load() {
        assert_eq!(observed_load(&[3, 0, 1], false), 4.0 / 3.0);
        assert!(observed_load(&[], false).is_nan());
    }

    #[test]
    fn test_legacy_load_is_biased() {
        // (3 + 0) / 2 = 1.5, (0 + 1.5) / 2 = 0.75, (1 + 0.75) / 2 = 0.875
        assert_eq!(observed_load(&[3, 0, 1], true), 0.875);
        assert!(observed_load(&[], true).is_nan());
    }

    #[test]
    fn test_raw_target() {
        // busy synchronous runners with 30% headroom
        assert_eq!(raw_target(1.0, 1.0, 1.3), 1.3);
        // asynchronous runners averaging 20 in flight against a target of 10
        assert_eq!(raw_target(20.0, 10.0, 1.5), 3.0);
        // empty pool
        assert!(raw_target(f64::NAN, 1.0, 1.3).is_nan());
    }

    #[test]
    fn test_clamped_to_bounds() {
        assert_eq!(clamp_target(9.0, 2, 5, false), 5);
        assert_eq!(clamp_target(-3.0, 2, 5, false), 2);
        assert_eq!(clamp_target(f64::NAN, 2, 5, false), 2);
        assert_eq!(clamp_target(f64::NAN, 0, 5, false), 0);
        assert_eq!(clamp_target(3.4, 0, 0, false), 3);
    }

    #[test]
    fn test_cold_start_bias() {
        assert_eq!(clamp_target(0.0, 0, 3, true), 1);
        assert_eq!(clamp_target(f64::NAN, 0, 0, true), 1);
        assert_eq!(clamp_target(2.0, 0, 3, true), 2);
    }

    #[test]
    fn test_rejection_window() {
        let tracker = RejectionTracker::new();
        assert!(!tracker.recently_rejected("a1", Duration::from_secs(30)));

        tracker.record("a1");
        assert!(tracker.recently_rejected("a1", Duration::from_secs(30)));
        assert!(!tracker.recently_rejected("a2", Duration::from_secs(30)));

        std::thread::sleep(Duration::from_millis(5));
        tracker.prune(Duration::from_millis(1));
        assert!(!tracker.recently_rejected("a1", Duration::from_secs(30)));
    }

    proptest! {
        #[test]
        fn prop_target_within_bounds(raw in proptest::num::f64::ANY, min in 0usize..10, span in 0usize..10) {
            let max = min + span;
            let target = clamp_target(raw, min, max, false);
            prop_assert!(target >= min);
            if max > 0 {
                prop_assert!(target <= max);
            }
        }
    }
}
