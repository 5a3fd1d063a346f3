//! Per-event reconciliation: preconditions, action, postconditions, report.

use std::time::Duration;

use fleet_core::{
    ActionState, AdapterStatusReport, Condition, ConditionStatus, ConditionType, ReconcileEvent,
    aggregate, render_template, rules,
};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::Adapter;
use super::action::{ActionError, ActionRecord};
use crate::client::{ClientError, UpsertOutcome};

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Store(#[from] ClientError),

    #[error(transparent)]
    Action(#[from] ActionError),

    #[error("event not processed within {0:?}")]
    Timeout(Duration),
}

/// What handling one event amounted to. Every variant means the event can
/// be acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The adapter does not serve this resource kind.
    Skipped,
    /// The resource no longer exists.
    ResourceGone,
    /// The event names a generation the resource has already moved past.
    StaleEvent {
        event_generation: u64,
        resource_generation: u64,
    },
    Reported {
        report: AdapterStatusReport,
        outcome: UpsertOutcome,
    },
}

fn conditions(
    applied: bool,
    available: bool,
    healthy: bool,
    reason: &str,
    message: impl Into<String>,
) -> Vec<Condition> {
    let message = message.into();
    vec![
        Condition::new(
            ConditionType::Applied,
            ConditionStatus::from_bool(applied),
            reason,
            message.clone(),
        ),
        Condition::new(
            ConditionType::Available,
            ConditionStatus::from_bool(available),
            reason,
            message.clone(),
        ),
        Condition::new(
            ConditionType::Health,
            ConditionStatus::from_bool(healthy),
            reason,
            message,
        ),
    ]
}

fn insert(context: &mut Value, key: &str, value: Value) {
    if let Value::Object(map) = context {
        map.insert(key.to_string(), value);
    }
}

impl Adapter {
    /// Reconcile the resource an event points at and report the result.
    ///
    /// Errors are transient (store or action backend unreachable); the event
    /// should be redelivered.
    pub async fn handle(&self, event: &ReconcileEvent) -> Result<Outcome, AdapterError> {
        let kind = event.resource_type;
        let id = event.resource_id.as_str();
        if !self.config.serves(kind) {
            debug!(adapter = %self.name(), %kind, "Kind not served, skipping");
            return Ok(Outcome::Skipped);
        }

        let Some(resource) = self.client.get_resource(kind, id).await? else {
            debug!(adapter = %self.name(), resource_id = %id, "Resource gone");
            return Ok(Outcome::ResourceGone);
        };
        let statuses = match self.client.list_statuses(kind, id).await {
            Ok(statuses) => statuses,
            Err(e) if e.is_not_found() => return Ok(Outcome::ResourceGone),
            Err(e) => return Err(e.into()),
        };

        if event.generation != resource.generation {
            debug!(
                adapter = %self.name(),
                resource_id = %id,
                event_generation = event.generation,
                resource_generation = resource.generation,
                "Event generation does not match resource, skipping"
            );
            return Ok(Outcome::StaleEvent {
                event_generation: event.generation,
                resource_generation: resource.generation,
            });
        }

        let mut context = json!({
            "event": event,
            "resource": resource,
            "adapters": statuses,
            "env": self.env,
        });

        let conditions = self.evaluate(event, &mut context).await?;
        let report = AdapterStatusReport {
            adapter: self.config.name.clone(),
            observed_generation: event.generation,
            conditions,
            data: self.status_data(&context),
        };

        let outcome = self.client.upsert_status(kind, id, &report).await?;
        match outcome {
            UpsertOutcome::Accepted => debug!(
                adapter = %self.name(),
                resource_id = %id,
                generation = event.generation,
                "Status reported"
            ),
            UpsertOutcome::Stale => info!(
                adapter = %self.name(),
                resource_id = %id,
                generation = event.generation,
                "Store already holds a newer status, report dropped"
            ),
        }
        Ok(Outcome::Reported { report, outcome })
    }

    async fn evaluate(
        &self,
        event: &ReconcileEvent,
        context: &mut Value,
    ) -> Result<Vec<Condition>, AdapterError> {
        match rules::evaluate(&self.config.preconditions, context) {
            Ok(true) => {}
            Ok(false) => {
                return Ok(conditions(
                    false,
                    false,
                    true,
                    "PreconditionNotMet",
                    "preconditions not met",
                ));
            }
            Err(e) => {
                warn!(adapter = %self.name(), resource_id = %event.resource_id, "Precondition evaluation failed: {e}");
                return Ok(conditions(
                    false,
                    false,
                    false,
                    "PreconditionEvaluationFailed",
                    e.to_string(),
                ));
            }
        }

        let resolution = self
            .actions
            .resolve(&event.resource_id, event.generation)
            .await?;

        let record = match (resolution.state, resolution.record) {
            (ActionState::Succeeded, Some(record)) => record,
            (ActionState::InProgress, record) => {
                if let Some(record) = record {
                    insert(context, "action", action_value(&record));
                }
                return Ok(conditions(
                    true,
                    false,
                    true,
                    "ActionInProgress",
                    format!("action {} in progress", resolution.name),
                ));
            }
            (ActionState::Failed, record) => {
                let detail = record.as_ref().map(|r| r.message.as_str()).unwrap_or("");
                let message = format!("action {} failed: {detail}", resolution.name);
                if let Some(record) = &record {
                    insert(context, "action", action_value(record));
                }
                return Ok(conditions(true, false, true, "ActionFailed", message));
            }
            // NotExists, or a backend that lost the record between calls
            _ => return self.create_action(event, context).await,
        };

        insert(context, "action", action_value(&record));
        let postconditions = &self.config.postconditions;
        match aggregate(
            &postconditions.applied,
            &postconditions.available,
            &postconditions.health.failure,
            context,
        ) {
            Ok(aggregated) => Ok(aggregated.into_vec()),
            Err(e) => {
                warn!(adapter = %self.name(), resource_id = %event.resource_id, "Postcondition evaluation failed: {e}");
                Ok(conditions(
                    true,
                    false,
                    false,
                    "PostconditionEvaluationFailed",
                    e.to_string(),
                ))
            }
        }
    }

    async fn create_action(
        &self,
        event: &ReconcileEvent,
        context: &mut Value,
    ) -> Result<Vec<Condition>, AdapterError> {
        let payload = match render_template(&self.config.action.template, context) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(adapter = %self.name(), resource_id = %event.resource_id, "Action template invalid: {e}");
                return Ok(conditions(
                    false,
                    false,
                    false,
                    "ActionTemplateInvalid",
                    e.to_string(),
                ));
            }
        };

        let record = match self
            .actions
            .ensure(&event.resource_id, event.generation, payload)
            .await
        {
            Ok(record) => record,
            Err(e @ ActionError::InvalidPayload { .. }) => {
                warn!(adapter = %self.name(), resource_id = %event.resource_id, "{e}");
                return Ok(conditions(
                    false,
                    false,
                    false,
                    "ActionTemplateInvalid",
                    e.to_string(),
                ));
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            adapter = %self.name(),
            resource_id = %event.resource_id,
            generation = event.generation,
            action = %record.name,
            "Action created"
        );
        let message = format!("action {} created", record.name);
        insert(context, "action", action_value(&record));
        Ok(conditions(true, false, true, "ActionCreated", message))
    }

    /// Resolve `status_data` against the final context. Missing paths are
    /// left out.
    fn status_data(&self, context: &Value) -> Map<String, Value> {
        self.config
            .status_data
            .iter()
            .filter_map(|(name, path)| {
                path.resolve(context)
                    .map(|value| (name.clone(), value.clone()))
            })
            .collect()
    }
}

fn action_value(record: &ActionRecord) -> Value {
    serde_json::to_value(record).unwrap_or(Value::Null)
}
