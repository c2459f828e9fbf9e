// src/dispatch/balancer.rs
//! Least-loaded runner selection

use crate::runtime::runner::Runner;

/// Pick the runner that should take the next request
///
/// Only ready runners are eligible, and synchronous runners only while
/// idle. Among those the one with the fewest in-flight requests wins; ties
/// go to the oldest runner so younger ones can drain and scale down.
pub fn select_least_loaded<'a, I>(runners: I) -> Option<&'a Runner>
where
    I: IntoIterator<Item = &'a Runner>,
{
    runners
        .into_iter()
        .filter(|r| r.accepts_requests())
        .min_by(|a, b| {
            a.requests_processing
                .cmp(&b.requests_processing)
                .then(a.created_at.cmp(&b.created_at))
        })
}
