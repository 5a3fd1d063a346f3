//! Reconcile events published by the sentinel and consumed by adapters.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::ResourceKind;

/// Envelope type for reconcile events.
pub const RECONCILE_EVENT_TYPE: &str = "fleet.reconcile.v1";

/// Why an event was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventReason {
    /// Spec mutated and no adapter has reported since.
    GenerationChanged,
    /// The phase-dependent backoff since the last update elapsed.
    BackoffElapsed,
    /// Published on operator request.
    Manual,
}

impl fmt::Display for EventReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventReason::GenerationChanged => write!(f, "GenerationChanged"),
            EventReason::BackoffElapsed => write!(f, "BackoffElapsed"),
            EventReason::Manual => write!(f, "Manual"),
        }
    }
}

/// Ephemeral "please reconcile" message. Carries no identity of its own;
/// consumers must treat duplicates as normal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileEvent {
    pub resource_type: ResourceKind,
    pub resource_id: String,
    pub generation: u64,
    pub reason: EventReason,
}

/// Transport envelope around a [`ReconcileEvent`], for traceability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    pub source: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub time: DateTime<Utc>,
    pub data: ReconcileEvent,
}

impl EventEnvelope {
    pub fn new(source: impl Into<String>, data: ReconcileEvent) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source: source.into(),
            event_type: RECONCILE_EVENT_TYPE.to_string(),
            time: Utc::now(),
            data,
        }
    }
}
