//! Resource and status types shared by the store and the controllers.
//!
//! A [`Resource`] is owned by the store. Its `generation` is the only
//! authority on whether the desired state changed; adapters report
//! [`AdapterStatus`] entries against a generation, and the store derives the
//! aggregate `Available`/`Ready` conditions from those reports.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

// =============================================================================
// Resource kinds
// =============================================================================

/// Kind of a managed resource.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
pub enum ResourceKind {
    Cluster,
    NodePool,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 2] = [ResourceKind::Cluster, ResourceKind::NodePool];

    /// URL path segment for this kind (`clusters`, `nodepools`).
    pub fn segment(self) -> &'static str {
        match self {
            ResourceKind::Cluster => "clusters",
            ResourceKind::NodePool => "nodepools",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Cluster => write!(f, "Cluster"),
            ResourceKind::NodePool => write!(f, "NodePool"),
        }
    }
}

/// Error for unknown resource kind names.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown resource kind '{0}'")]
pub struct UnknownKind(pub String);

impl FromStr for ResourceKind {
    type Err = UnknownKind;

    /// Accepts the kind name (`Cluster`) or its path segment (`clusters`),
    /// case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cluster" | "clusters" => Ok(ResourceKind::Cluster),
            "nodepool" | "nodepools" | "node_pool" | "node-pool" => Ok(ResourceKind::NodePool),
            _ => Err(UnknownKind(s.to_string())),
        }
    }
}

// =============================================================================
// Conditions
// =============================================================================

/// Tri-state condition value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl ConditionStatus {
    pub fn from_bool(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }

    pub fn is_true(self) -> bool {
        self == ConditionStatus::True
    }
}

/// The canonical per-adapter condition triad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum ConditionType {
    /// Work for the generation was started.
    Applied,
    /// The workload serves correctly.
    Available,
    /// The adapter itself is not faulting.
    Health,
}

/// One condition reported by an adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: ConditionType,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

impl Condition {
    pub fn new(
        kind: ConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            status,
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// Condition types derived by the store on the resource itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum AggregateConditionType {
    Available,
    Ready,
}

/// A derived condition on a resource. Never written directly by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct AggregateCondition {
    #[serde(rename = "type")]
    pub kind: AggregateConditionType,
    pub status: ConditionStatus,
    /// Generation this condition was computed for.
    pub observed_generation: u64,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    /// Changes only when `status` flips.
    pub last_transition_time: DateTime<Utc>,
    pub last_updated_time: DateTime<Utc>,
}

impl AggregateCondition {
    pub fn new(kind: AggregateConditionType, now: DateTime<Utc>) -> Self {
        Self {
            kind,
            status: ConditionStatus::False,
            observed_generation: 0,
            reason: "AwaitingAdapters".to_string(),
            message: "no adapter has reported yet".to_string(),
            last_transition_time: now,
            last_updated_time: now,
        }
    }
}

// =============================================================================
// Adapter status
// =============================================================================

/// Status reported by one adapter for one resource.
///
/// The store keeps at most one per `(resource, adapter)` pair and replaces it
/// wholesale on every accepted write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct AdapterStatus {
    pub adapter: String,
    pub observed_generation: u64,
    pub conditions: Vec<Condition>,
    /// Adapter-specific values (e.g. a discovered DNS name).
    #[serde(default)]
    #[schema(value_type = Object)]
    pub data: Map<String, Value>,
    pub created_time: DateTime<Utc>,
    pub last_transition_time: DateTime<Utc>,
}

impl AdapterStatus {
    pub fn condition(&self, kind: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }

    /// Status of a condition, `Unknown` when the adapter did not report it.
    pub fn condition_status(&self, kind: ConditionType) -> ConditionStatus {
        self.condition(kind)
            .map(|c| c.status)
            .unwrap_or(ConditionStatus::Unknown)
    }
}

/// Body of a status upsert. Timestamps are assigned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct AdapterStatusReport {
    pub adapter: String,
    pub observed_generation: u64,
    pub conditions: Vec<Condition>,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub data: Map<String, Value>,
}

impl AdapterStatusReport {
    pub fn condition_status(&self, kind: ConditionType) -> ConditionStatus {
        self.conditions
            .iter()
            .find(|c| c.kind == kind)
            .map(|c| c.status)
            .unwrap_or(ConditionStatus::Unknown)
    }
}

// =============================================================================
// Resources
// =============================================================================

/// Lifecycle phase of a resource, derived by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
pub enum Phase {
    #[default]
    NotReady,
    Provisioning,
    Ready,
    Failed,
    Terminating,
    Terminated,
}

/// Aggregate status of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ResourceStatus {
    pub phase: Phase,
    /// Lowest generation observed by the registered adapters (0 until all reported).
    pub observed_generation: u64,
    /// Last phase change.
    pub last_transition_time: DateTime<Utc>,
    /// Last accepted adapter report or spec mutation.
    pub last_updated_time: DateTime<Utc>,
    pub conditions: Vec<AggregateCondition>,
}

impl ResourceStatus {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            phase: Phase::NotReady,
            observed_generation: 0,
            last_transition_time: now,
            last_updated_time: now,
            conditions: vec![
                AggregateCondition::new(AggregateConditionType::Available, now),
                AggregateCondition::new(AggregateConditionType::Ready, now),
            ],
        }
    }

    pub fn condition(&self, kind: AggregateConditionType) -> Option<&AggregateCondition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }

    /// Mutable access to a condition, inserting the initial value if absent.
    pub fn condition_mut(
        &mut self,
        kind: AggregateConditionType,
        now: DateTime<Utc>,
    ) -> &mut AggregateCondition {
        let idx = match self.conditions.iter().position(|c| c.kind == kind) {
            Some(idx) => idx,
            None => {
                self.conditions.push(AggregateCondition::new(kind, now));
                self.conditions.len() - 1
            }
        };
        &mut self.conditions[idx]
    }

    pub fn is(&self, kind: AggregateConditionType) -> bool {
        self.condition(kind).is_some_and(|c| c.status.is_true())
    }
}

/// A managed resource (Cluster, NodePool).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Resource {
    pub id: String,
    pub kind: ResourceKind,
    pub name: String,
    /// Owning cluster for NodePools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub generation: u64,
    #[schema(value_type = Object)]
    pub spec: Value,
    pub status: ResourceStatus,
    pub created_time: DateTime<Utc>,
    /// Last spec mutation.
    pub updated_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_time: Option<DateTime<Utc>>,
}

impl Resource {
    pub fn is_deleting(&self) -> bool {
        self.deleted_time.is_some()
    }
}

// =============================================================================
// Label selectors
// =============================================================================

/// Equality-based label selector: `env=prod,region=eu`.
///
/// An empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector(BTreeMap<String, String>);

/// Error for malformed label selectors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid label selector term '{0}', expected key=value")]
pub struct InvalidSelector(pub String);

impl LabelSelector {
    pub fn new(labels: BTreeMap<String, String>) -> Self {
        Self(labels)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }
}

impl FromStr for LabelSelector {
    type Err = InvalidSelector;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut labels = BTreeMap::new();
        for term in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (key, value) = term
                .split_once('=')
                .ok_or_else(|| InvalidSelector(term.to_string()))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(InvalidSelector(term.to_string()));
            }
            labels.insert(key.to_string(), value.trim().to_string());
        }
        Ok(Self(labels))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let terms: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{}", terms.join(","))
    }
}
