//! Status merge policy.
//!
//! The store is the only writer of a resource's derived status. Every
//! accepted adapter report goes through [`check_report`] and then
//! [`recompute`]; spec mutations call [`recompute`] directly.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use fleet_core::{
    AdapterStatus, AdapterStatusReport, AggregateCondition, AggregateConditionType,
    ConditionStatus, ConditionType, Phase, Resource,
};
use thiserror::Error;

/// Why a report was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeRejection {
    /// Older than what the adapter already reported.
    #[error(
        "stale report from adapter '{adapter}': observed_generation {reported} < stored {stored}"
    )]
    Stale {
        adapter: String,
        reported: u64,
        stored: u64,
    },

    /// Claims a generation the resource never had.
    #[error(
        "report from adapter '{adapter}' observes generation {reported} but resource is at {current}"
    )]
    FutureGeneration {
        adapter: String,
        reported: u64,
        current: u64,
    },
}

/// Generation checks for an incoming report.
pub fn check_report(
    resource: &Resource,
    stored: Option<&AdapterStatus>,
    report: &AdapterStatusReport,
) -> Result<(), MergeRejection> {
    if report.observed_generation > resource.generation {
        return Err(MergeRejection::FutureGeneration {
            adapter: report.adapter.clone(),
            reported: report.observed_generation,
            current: resource.generation,
        });
    }
    if let Some(stored) = stored
        && report.observed_generation < stored.observed_generation
    {
        return Err(MergeRejection::Stale {
            adapter: report.adapter.clone(),
            reported: report.observed_generation,
            stored: stored.observed_generation,
        });
    }
    Ok(())
}

/// Reports without a definite `Available` only go to the history.
pub fn is_history_only(report: &AdapterStatusReport) -> bool {
    report.condition_status(ConditionType::Available) == ConditionStatus::Unknown
}

/// Adapters whose reports the aggregates depend on: the configured list,
/// or every adapter that has stored a status when none is configured.
pub fn registered_adapters<'a>(
    required: &'a [String],
    statuses: &'a BTreeMap<String, AdapterStatus>,
) -> Vec<&'a str> {
    if required.is_empty() {
        statuses.keys().map(String::as_str).collect()
    } else {
        required.iter().map(String::as_str).collect()
    }
}

/// Recompute `Available`, `Ready`, `observed_generation` and `phase`.
///
/// `trigger` is the status that was just stored, if any; only a `False`
/// report at exactly the generation currently marked Available retracts it.
pub fn recompute(
    resource: &mut Resource,
    statuses: &BTreeMap<String, AdapterStatus>,
    required: &[String],
    trigger: Option<&AdapterStatus>,
    now: DateTime<Utc>,
) {
    let generation = resource.generation;
    let registered = registered_adapters(required, statuses);
    let reported: Vec<(&str, Option<&AdapterStatus>)> = registered
        .iter()
        .map(|name| (*name, statuses.get(*name)))
        .collect();

    update_available(resource, &reported, trigger, now);

    // Ready: every registered adapter Available at the current generation.
    let pending: Vec<&str> = reported
        .iter()
        .filter(|(_, status)| {
            !status.is_some_and(|s| {
                s.observed_generation == generation
                    && s.condition_status(ConditionType::Available).is_true()
            })
        })
        .map(|(name, _)| *name)
        .collect();
    let ready = !registered.is_empty() && pending.is_empty();
    let (reason, message) = if registered.is_empty() {
        ("NoAdaptersRegistered", "no adapter has reported".to_string())
    } else if ready {
        (
            "AllAdaptersReady",
            format!("{} adapter(s) available at generation {generation}", registered.len()),
        )
    } else {
        (
            "AdaptersNotReady",
            format!(
                "waiting for generation {generation} from: {}",
                pending.join(", ")
            ),
        )
    };
    set_condition(
        resource.status.condition_mut(AggregateConditionType::Ready, now),
        ConditionStatus::from_bool(ready),
        generation,
        reason,
        message,
        now,
    );

    resource.status.observed_generation = reported
        .iter()
        .map(|(_, status)| status.map(|s| s.observed_generation))
        .min()
        .flatten()
        .unwrap_or(0);

    let at_current: Vec<&AdapterStatus> = reported
        .iter()
        .filter_map(|(_, status)| *status)
        .filter(|s| s.observed_generation == generation)
        .collect();
    let phase = if resource.is_deleting() && ready {
        Phase::Terminated
    } else if resource.is_deleting() {
        Phase::Terminating
    } else if ready {
        Phase::Ready
    } else if at_current
        .iter()
        .any(|s| s.condition_status(ConditionType::Health) == ConditionStatus::False)
    {
        Phase::Failed
    } else if at_current
        .iter()
        .any(|s| s.condition_status(ConditionType::Applied).is_true())
    {
        Phase::Provisioning
    } else {
        Phase::NotReady
    };

    if phase != resource.status.phase {
        resource.status.phase = phase;
        resource.status.last_transition_time = now;
    }
    resource.status.last_updated_time = now;
}

fn update_available(
    resource: &mut Resource,
    reported: &[(&str, Option<&AdapterStatus>)],
    trigger: Option<&AdapterStatus>,
    now: DateTime<Utc>,
) {
    let consensus = available_generation(reported);
    let available = resource
        .status
        .condition_mut(AggregateConditionType::Available, now);

    if let Some(g) = consensus {
        set_condition(
            available,
            ConditionStatus::True,
            g,
            "AllAdaptersAvailable",
            format!("{} adapter(s) available at generation {g}", reported.len()),
            now,
        );
        return;
    }

    if available.status.is_true() {
        let held = available.observed_generation;
        match trigger {
            Some(t)
                if t.observed_generation == held
                    && t.condition_status(ConditionType::Available) == ConditionStatus::False =>
            {
                set_condition(
                    available,
                    ConditionStatus::False,
                    held,
                    "AdapterUnavailable",
                    format!(
                        "adapter '{}' reported Available=False at generation {held}",
                        t.adapter
                    ),
                    now,
                );
            }
            // last known good
            _ => available.last_updated_time = now,
        }
        return;
    }

    let missing: Vec<&str> = reported
        .iter()
        .filter(|(_, s)| !s.is_some_and(|s| s.condition_status(ConditionType::Available).is_true()))
        .map(|(name, _)| *name)
        .collect();
    let (reason, message) = if reported.is_empty() {
        ("NoAdaptersRegistered", "no adapter has reported".to_string())
    } else if missing.is_empty() {
        (
            "MixedGenerations",
            "adapters are available at different generations".to_string(),
        )
    } else {
        (
            "AdaptersNotAvailable",
            format!("not available: {}", missing.join(", ")),
        )
    };
    let generation = available.observed_generation;
    set_condition(available, ConditionStatus::False, generation, reason, message, now);
}

/// The generation at which every registered adapter reports `Available=True`.
fn available_generation(reported: &[(&str, Option<&AdapterStatus>)]) -> Option<u64> {
    let mut generation = None;
    for (_, status) in reported {
        let status = (*status)?;
        if !status.condition_status(ConditionType::Available).is_true() {
            return None;
        }
        match generation {
            None => generation = Some(status.observed_generation),
            Some(g) if g != status.observed_generation => return None,
            Some(_) => {}
        }
    }
    generation
}

fn set_condition(
    condition: &mut AggregateCondition,
    status: ConditionStatus,
    observed_generation: u64,
    reason: &str,
    message: String,
    now: DateTime<Utc>,
) {
    if condition.status != status {
        condition.last_transition_time = now;
    }
    condition.status = status;
    condition.observed_generation = observed_generation;
    condition.reason = reason.to_string();
    condition.message = message;
    condition.last_updated_time = now;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use fleet_core::{Condition, ResourceKind, ResourceStatus};
    use serde_json::{Map, json};

    fn resource(generation: u64) -> Resource {
        let now = Utc::now();
        Resource {
            id: "c1".to_string(),
            kind: ResourceKind::Cluster,
            name: "prod".to_string(),
            owner_id: None,
            labels: BTreeMap::new(),
            generation,
            spec: json!({}),
            status: ResourceStatus::new(now),
            created_time: now,
            updated_time: now,
            deleted_time: None,
        }
    }

    fn status(adapter: &str, generation: u64, available: ConditionStatus) -> AdapterStatus {
        let now = Utc::now();
        AdapterStatus {
            adapter: adapter.to_string(),
            observed_generation: generation,
            conditions: vec![
                Condition::new(ConditionType::Applied, ConditionStatus::True, "", ""),
                Condition::new(ConditionType::Available, available, "", ""),
                Condition::new(ConditionType::Health, ConditionStatus::True, "", ""),
            ],
            data: Map::new(),
            created_time: now,
            last_transition_time: now,
        }
    }

    fn store(
        resource: &mut Resource,
        statuses: &mut BTreeMap<String, AdapterStatus>,
        required: &[String],
        report: AdapterStatus,
    ) {
        statuses.insert(report.adapter.clone(), report.clone());
        recompute(resource, statuses, required, Some(&report), Utc::now());
    }

    fn available(resource: &Resource) -> (ConditionStatus, u64) {
        let c = resource
            .status
            .condition(AggregateConditionType::Available)
            .unwrap();
        (c.status, c.observed_generation)
    }

    fn required() -> Vec<String> {
        vec!["a".to_string(), "b".to_string()]
    }

    #[test]
    fn test_check_report_generations() {
        let r = resource(3);
        let stored = status("a", 2, ConditionStatus::True);
        let report = |generation| AdapterStatusReport {
            adapter: "a".to_string(),
            observed_generation: generation,
            conditions: vec![],
            data: Map::new(),
        };

        assert!(check_report(&r, Some(&stored), &report(2)).is_ok());
        assert!(check_report(&r, Some(&stored), &report(3)).is_ok());
        assert!(matches!(
            check_report(&r, Some(&stored), &report(1)),
            Err(MergeRejection::Stale { reported: 1, stored: 2, .. })
        ));
        assert!(matches!(
            check_report(&r, None, &report(4)),
            Err(MergeRejection::FutureGeneration { current: 3, .. })
        ));
        assert!(is_history_only(&report(3)));
    }

    #[test]
    fn test_available_requires_all_adapters_at_same_generation() {
        let mut r = resource(1);
        let mut statuses = BTreeMap::new();

        store(&mut r, &mut statuses, &required(), status("a", 1, ConditionStatus::True));
        assert_eq!(available(&r).0, ConditionStatus::False);
        assert_eq!(r.status.observed_generation, 0);

        store(&mut r, &mut statuses, &required(), status("b", 1, ConditionStatus::True));
        assert_eq!(available(&r), (ConditionStatus::True, 1));
        assert!(r.status.is(AggregateConditionType::Ready));
        assert_eq!(r.status.phase, Phase::Ready);
        assert_eq!(r.status.observed_generation, 1);
    }

    #[test]
    fn test_false_at_available_generation_retracts() {
        let mut r = resource(1);
        let mut statuses = BTreeMap::new();
        store(&mut r, &mut statuses, &required(), status("a", 1, ConditionStatus::True));
        store(&mut r, &mut statuses, &required(), status("b", 1, ConditionStatus::True));

        store(&mut r, &mut statuses, &required(), status("a", 1, ConditionStatus::False));
        assert_eq!(available(&r), (ConditionStatus::False, 1));
        assert_eq!(
            r.status
                .condition(AggregateConditionType::Available)
                .unwrap()
                .reason,
            "AdapterUnavailable"
        );
    }

    #[test]
    fn test_false_at_other_generation_does_not_retract() {
        let mut r = resource(2);
        let mut statuses = BTreeMap::new();
        store(&mut r, &mut statuses, &required(), status("a", 2, ConditionStatus::True));
        store(&mut r, &mut statuses, &required(), status("b", 2, ConditionStatus::True));
        assert_eq!(available(&r), (ConditionStatus::True, 2));

        // An older False report (as if applied without the stale check).
        let late = status("c", 1, ConditionStatus::False);
        recompute(&mut r, &statuses, &required(), Some(&late), Utc::now());
        assert_eq!(available(&r), (ConditionStatus::True, 2));

        // A newer one, after a spec bump, does not retract gen 2 either.
        r.generation = 3;
        store(&mut r, &mut statuses, &required(), status("a", 3, ConditionStatus::False));
        assert_eq!(available(&r), (ConditionStatus::True, 2));
        assert!(!r.status.is(AggregateConditionType::Ready));
    }

    #[test]
    fn test_mixed_generations_keep_last_known_good() {
        let mut r = resource(1);
        let mut statuses = BTreeMap::new();
        store(&mut r, &mut statuses, &required(), status("a", 1, ConditionStatus::True));
        store(&mut r, &mut statuses, &required(), status("b", 1, ConditionStatus::True));
        let transitioned = r
            .status
            .condition(AggregateConditionType::Available)
            .unwrap()
            .last_transition_time;

        r.generation = 2;
        recompute(&mut r, &statuses, &required(), None, Utc::now() + Duration::seconds(1));
        assert!(!r.status.is(AggregateConditionType::Ready));

        store(&mut r, &mut statuses, &required(), status("b", 2, ConditionStatus::True));
        assert!(!r.status.is(AggregateConditionType::Ready));
        assert_eq!(available(&r), (ConditionStatus::True, 1));
        assert_eq!(
            r.status
                .condition(AggregateConditionType::Available)
                .unwrap()
                .last_transition_time,
            transitioned
        );
        assert_eq!(r.status.observed_generation, 1);
    }

    #[test]
    fn test_registered_defaults_to_reporting_adapters() {
        let mut r = resource(1);
        let mut statuses = BTreeMap::new();
        store(&mut r, &mut statuses, &[], status("only", 1, ConditionStatus::True));
        assert_eq!(available(&r), (ConditionStatus::True, 1));
        assert_eq!(r.status.phase, Phase::Ready);

        let mut empty = resource(1);
        recompute(&mut empty, &BTreeMap::new(), &[], None, Utc::now());
        assert_eq!(available(&empty).0, ConditionStatus::False);
        assert_eq!(empty.status.phase, Phase::NotReady);
    }

    #[test]
    fn test_phase_priority() {
        let mut r = resource(1);
        let mut statuses = BTreeMap::new();

        let applying = status("a", 1, ConditionStatus::False);
        store(&mut r, &mut statuses, &required(), applying);
        assert_eq!(r.status.phase, Phase::Provisioning);

        let mut faulty = status("b", 1, ConditionStatus::False);
        faulty.conditions[2].status = ConditionStatus::False;
        store(&mut r, &mut statuses, &required(), faulty);
        assert_eq!(r.status.phase, Phase::Failed);

        r.deleted_time = Some(Utc::now());
        r.generation = 2;
        recompute(&mut r, &statuses, &required(), None, Utc::now());
        assert_eq!(r.status.phase, Phase::Terminating);

        store(&mut r, &mut statuses, &required(), status("a", 2, ConditionStatus::True));
        store(&mut r, &mut statuses, &required(), status("b", 2, ConditionStatus::True));
        assert_eq!(r.status.phase, Phase::Terminated);
    }
}
