use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use fleet_core::{AdapterStatus, AdapterStatusReport, Condition, Resource, ResourceKind};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

/// Mutations applied to the store state machine.
///
/// IMPORTANT: ids and timestamps are assigned BEFORE the command is applied.
/// `FleetState::apply` must stay deterministic so a command replayed from the
/// idempotency cache yields the same response it did the first time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    CreateResource {
        request_id: String,
        /// Pre-generated resource ID
        id: String,
        timestamp: DateTime<Utc>,
        kind: ResourceKind,
        name: String,
        owner_id: Option<String>,
        labels: BTreeMap<String, String>,
        spec: Value,
    },
    /// Replace the desired state. Bumps the generation.
    ReplaceSpec {
        request_id: String,
        kind: ResourceKind,
        id: String,
        timestamp: DateTime<Utc>,
        spec: Value,
    },
    /// Replace the labels. Does not bump the generation.
    UpdateLabels {
        request_id: String,
        kind: ResourceKind,
        id: String,
        timestamp: DateTime<Utc>,
        labels: BTreeMap<String, String>,
    },
    /// Mark the resource for deletion. Bumps the generation once.
    RequestDeletion {
        request_id: String,
        kind: ResourceKind,
        id: String,
        timestamp: DateTime<Utc>,
    },
    UpsertStatus {
        request_id: String,
        kind: ResourceKind,
        resource_id: String,
        timestamp: DateTime<Utc>,
        report: AdapterStatusReport,
    },
}

impl Command {
    pub fn request_id(&self) -> &str {
        match self {
            Command::CreateResource { request_id, .. } => request_id,
            Command::ReplaceSpec { request_id, .. } => request_id,
            Command::UpdateLabels { request_id, .. } => request_id,
            Command::RequestDeletion { request_id, .. } => request_id,
            Command::UpsertStatus { request_id, .. } => request_id,
        }
    }

    /// Key of the idempotency cache: the client's request id scoped to the
    /// command type and its target, so a reused key never replays the
    /// response of a different write.
    pub fn idempotency_key(&self) -> String {
        match self {
            Command::CreateResource {
                request_id,
                kind,
                name,
                ..
            } => format!("create/{kind}/{name}/{request_id}"),
            Command::ReplaceSpec {
                request_id,
                kind,
                id,
                ..
            } => format!("spec/{kind}/{id}/{request_id}"),
            Command::UpdateLabels {
                request_id,
                kind,
                id,
                ..
            } => format!("labels/{kind}/{id}/{request_id}"),
            Command::RequestDeletion {
                request_id,
                kind,
                id,
                ..
            } => format!("delete/{kind}/{id}/{request_id}"),
            Command::UpsertStatus {
                request_id,
                kind,
                resource_id,
                report,
                ..
            } => format!(
                "status/{kind}/{resource_id}/{}/{request_id}",
                report.adapter
            ),
        }
    }
}

// =============================================================================
// Status history
// =============================================================================

/// What the merge policy did with a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum ReportOutcome {
    /// Replaced the adapter's stored status.
    Stored,
    /// `Available=Unknown`: kept in history only.
    Recorded,
}

/// One entry of a resource's status audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct StatusHistoryEntry {
    pub adapter: String,
    pub observed_generation: u64,
    pub conditions: Vec<Condition>,
    #[schema(value_type = Object)]
    pub data: Map<String, Value>,
    pub received_time: DateTime<Utc>,
    pub outcome: ReportOutcome,
}

// =============================================================================
// Response Types
// =============================================================================

/// Result of a status upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct UpsertStatusResult {
    pub outcome: ReportOutcome,
    /// The adapter's stored status after the merge (absent if it never stored one).
    pub adapter_status: Option<AdapterStatus>,
    /// The resource with recomputed aggregates.
    pub resource: Resource,
}

/// Response from applying a command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Resource(Resource),
    Status(Box<UpsertStatusResult>),
    Error { code: u32, message: String },
}
