//! Events emitted by state machine changes.

use fleet_core::{AdapterStatus, Resource};

/// Events emitted when state changes occur.
///
/// These events are dispatched via a broadcast channel to subscribers.
#[derive(Debug, Clone)]
pub enum Event {
    /// A new resource was created.
    ResourceCreated(Resource),
    /// The spec was replaced (generation bumped).
    SpecUpdated {
        id: String,
        old: Resource,
        new: Resource,
    },
    /// Labels changed (generation unchanged).
    LabelsUpdated {
        id: String,
        old: Resource,
        new: Resource,
    },
    /// Deletion was requested (generation bumped).
    DeletionRequested(Resource),
    /// An adapter status was accepted and the aggregates recomputed.
    StatusUpdated {
        resource_id: String,
        status: AdapterStatus,
    },
}

impl Event {
    /// Get the resource ID for this event.
    pub fn resource_id(&self) -> &str {
        match self {
            Event::ResourceCreated(r) | Event::DeletionRequested(r) => &r.id,
            Event::SpecUpdated { id, .. } | Event::LabelsUpdated { id, .. } => id,
            Event::StatusUpdated { resource_id, .. } => resource_id,
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Event::ResourceCreated(_) => "resource_created",
            Event::SpecUpdated { .. } => "spec_updated",
            Event::LabelsUpdated { .. } => "labels_updated",
            Event::DeletionRequested(_) => "deletion_requested",
            Event::StatusUpdated { .. } => "status_updated",
        }
    }
}
