//! Shared reconciliation primitives: resource model, rule evaluation, status
//! aggregation, action identity and reconcile events.

pub mod action;
pub mod aggregate;
pub mod event;
pub mod model;
pub mod rules;

pub use action::{ActionState, action_name};
pub use aggregate::{AggregatedConditions, aggregate};
pub use event::{EventEnvelope, EventReason, RECONCILE_EVENT_TYPE, ReconcileEvent};
pub use model::{
    AdapterStatus, AdapterStatusReport, AggregateCondition, AggregateConditionType, Condition,
    ConditionStatus, ConditionType, LabelSelector, Phase, Resource, ResourceKind, ResourceStatus,
};
pub use rules::{EvaluationError, FieldPath, Rule, TemplateError, evaluate, render_template};
