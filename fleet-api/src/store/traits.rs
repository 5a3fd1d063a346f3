//! DataStore trait definitions.
//!
//! These traits hide the command/state-machine layer, allowing handlers to
//! work with domain objects instead of commands.

use std::collections::BTreeMap;

use async_trait::async_trait;
use fleet_core::{AdapterStatus, AdapterStatusReport, LabelSelector, Resource, ResourceKind};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::command::{StatusHistoryEntry, UpsertStatusResult};

use super::error::Result;
use super::event::Event;

// =============================================================================
// Request DTOs
// =============================================================================

/// Request to create a resource.
#[derive(Debug, Clone)]
pub struct CreateResourceRequest {
    pub kind: ResourceKind,
    pub name: String,
    pub owner_id: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub spec: Value,
    /// Client-supplied idempotency key; a fresh one is generated when absent.
    pub request_id: Option<String>,
}

/// Request to change a resource. Either part may be omitted.
#[derive(Debug, Clone, Default)]
pub struct UpdateResourceRequest {
    /// Replaces the spec and bumps the generation.
    pub spec: Option<Value>,
    /// Replaces the labels without bumping the generation.
    pub labels: Option<BTreeMap<String, String>>,
    pub request_id: Option<String>,
}

/// Request to upsert an adapter status.
#[derive(Debug, Clone)]
pub struct UpsertStatusRequest {
    pub report: AdapterStatusReport,
    pub request_id: Option<String>,
}

// =============================================================================
// Domain Store Traits
// =============================================================================

/// Store trait for resource operations.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// List resources of a kind matching a label selector.
    async fn list_resources(
        &self,
        kind: ResourceKind,
        selector: &LabelSelector,
    ) -> Result<Vec<Resource>>;

    /// Get a resource by ID.
    async fn get_resource(&self, kind: ResourceKind, id: &str) -> Result<Option<Resource>>;

    /// Create a new resource at generation 1.
    async fn create_resource(&self, req: CreateResourceRequest) -> Result<Resource>;

    /// Replace spec and/or labels.
    async fn update_resource(
        &self,
        kind: ResourceKind,
        id: &str,
        req: UpdateResourceRequest,
    ) -> Result<Resource>;

    /// Mark a resource for deletion.
    async fn request_deletion(
        &self,
        kind: ResourceKind,
        id: &str,
        request_id: Option<String>,
    ) -> Result<Resource>;
}

/// Store trait for adapter status operations.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// All stored adapter statuses of a resource.
    async fn list_statuses(&self, kind: ResourceKind, resource_id: &str)
    -> Result<Vec<AdapterStatus>>;

    /// Apply an adapter report through the merge policy.
    async fn upsert_status(
        &self,
        kind: ResourceKind,
        resource_id: &str,
        req: UpsertStatusRequest,
    ) -> Result<UpsertStatusResult>;

    /// Received reports, oldest first.
    async fn status_history(
        &self,
        kind: ResourceKind,
        resource_id: &str,
    ) -> Result<Vec<StatusHistoryEntry>>;
}

// =============================================================================
// Composite DataStore Trait
// =============================================================================

/// Composite data store trait combining all domain stores.
///
/// This is the main trait that handlers should use.
pub trait DataStore: ResourceStore + StatusStore + Send + Sync {
    /// Subscribe to state change events.
    fn subscribe(&self) -> broadcast::Receiver<Event>;
}
