//! Whether a resource is due for a reconcile event.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use fleet_core::{EventReason, Phase, Resource};

#[derive(Debug, Clone, Copy)]
pub struct DecisionConfig {
    /// Backoff for resources in phase `Ready`.
    pub backoff_ready: Duration,
    /// Backoff for every other phase, and for a generation nobody reported on yet.
    pub backoff_not_ready: Duration,
    /// Sentinel tick period. A spec change younger than this is published
    /// without waiting for any backoff.
    pub poll_interval: Duration,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            backoff_ready: Duration::from_secs(30 * 60),
            backoff_not_ready: Duration::from_secs(10),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Decide whether to publish for `resource` at `now`.
///
/// Backoff is measured from `status.last_updated_time`, the last accepted
/// adapter report. Pure: everything it looks at comes from the resource as
/// read from the store on this tick.
pub fn decide(resource: &Resource, now: DateTime<Utc>, config: &DecisionConfig) -> Option<EventReason> {
    let status = &resource.status;
    if status.phase == Phase::Terminated {
        return None;
    }

    // No report since the spec changed: publish on the first tick after the
    // change, then no more often than the not-ready backoff.
    if resource.generation > status.observed_generation
        && status.last_updated_time <= resource.updated_time
    {
        let fresh = !elapsed(resource.updated_time, config.poll_interval, now);
        let due = elapsed(status.last_updated_time, config.backoff_not_ready, now);
        return (fresh || due).then_some(EventReason::GenerationChanged);
    }

    let backoff = if status.phase == Phase::Ready {
        config.backoff_ready
    } else {
        config.backoff_not_ready
    };
    elapsed(status.last_updated_time, backoff, now).then_some(EventReason::BackoffElapsed)
}

fn elapsed(since: DateTime<Utc>, period: Duration, now: DateTime<Utc>) -> bool {
    let period = TimeDelta::from_std(period).unwrap_or(TimeDelta::MAX);
    since
        .checked_add_signed(period)
        .is_some_and(|deadline| now >= deadline)
}
