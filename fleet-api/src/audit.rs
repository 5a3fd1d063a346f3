use std::sync::Arc;

use fleet_core::{AdapterStatus, Resource, ResourceKind};
use tracing::{info, warn};

/// Target of audit records, so they can be routed with `RUST_LOG=audit=info`.
pub const AUDIT_TARGET: &str = "audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuditLevel {
    Audit,
    Warn,
}

/// Resource store audit logger
pub struct ApiAuditLogger {
    enabled: bool,
}

impl ApiAuditLogger {
    pub fn new() -> Self {
        Self { enabled: true }
    }

    pub fn new_noop() -> Self {
        Self { enabled: false }
    }

    fn log(&self, level: AuditLevel, message: String, object_ids: &[&str]) {
        if !self.enabled {
            return;
        }
        let objects = object_ids.join(",");
        match level {
            AuditLevel::Audit => info!(target: AUDIT_TARGET, objects = %objects, "{message}"),
            AuditLevel::Warn => warn!(target: AUDIT_TARGET, objects = %objects, "{message}"),
        }
    }

    // Resource events
    pub fn resource_created(&self, resource: &Resource) {
        self.log(
            AuditLevel::Audit,
            format!("{} created: {} ({})", resource.kind, resource.name, resource.id),
            &[resource.id.as_str()],
        );
    }

    pub fn spec_updated(&self, resource: &Resource) {
        self.log(
            AuditLevel::Audit,
            format!(
                "{} spec updated: {} now at generation {}",
                resource.kind, resource.id, resource.generation
            ),
            &[resource.id.as_str()],
        );
    }

    pub fn labels_updated(&self, resource: &Resource) {
        self.log(
            AuditLevel::Audit,
            format!("{} labels updated: {}", resource.kind, resource.id),
            &[resource.id.as_str()],
        );
    }

    pub fn deletion_requested(&self, resource: &Resource) {
        self.log(
            AuditLevel::Audit,
            format!(
                "{} deletion requested: {} (generation {})",
                resource.kind, resource.id, resource.generation
            ),
            &[resource.id.as_str()],
        );
    }

    // Status events
    pub fn status_accepted(&self, resource: &Resource, status: &AdapterStatus) {
        self.log(
            AuditLevel::Audit,
            format!(
                "Status from {} accepted for {} at generation {} (phase {:?})",
                status.adapter, resource.id, status.observed_generation, resource.status.phase
            ),
            &[resource.id.as_str(), status.adapter.as_str()],
        );
    }

    pub fn status_recorded(&self, resource_id: &str, adapter: &str, generation: u64) {
        self.log(
            AuditLevel::Audit,
            format!(
                "In-progress status from {adapter} recorded for {resource_id} at generation {generation}"
            ),
            &[resource_id, adapter],
        );
    }

    pub fn status_rejected(&self, kind: ResourceKind, resource_id: &str, adapter: &str, reason: &str) {
        self.log(
            AuditLevel::Warn,
            format!("Status from {adapter} for {kind} {resource_id} rejected: {reason}"),
            &[resource_id, adapter],
        );
    }
}

impl Default for ApiAuditLogger {
    fn default() -> Self {
        Self::new()
    }
}

pub fn create_audit_logger() -> Arc<ApiAuditLogger> {
    Arc::new(ApiAuditLogger::new())
}
