//! MemoryStore implementation - bridges DataStore traits to the state machine.

use async_trait::async_trait;
use chrono::Utc;
use fleet_core::{AdapterStatus, LabelSelector, Resource, ResourceKind};
use tokio::sync::{RwLock, broadcast};
use tracing::debug;

use crate::command::{Command, Response, StatusHistoryEntry, UpsertStatusResult};
use crate::state::FleetState;

use super::error::{Result, StoreError};
use super::event::Event;
use super::traits::{
    CreateResourceRequest, DataStore, ResourceStore, StatusStore, UpdateResourceRequest,
    UpsertStatusRequest,
};

/// In-process store. Commands are applied one at a time under a write lock,
/// which gives the same serialization a replicated log would.
pub struct MemoryStore {
    state: RwLock<FleetState>,
    events: broadcast::Sender<Event>,
}

impl MemoryStore {
    pub fn new(state: FleetState) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: RwLock::new(state),
            events,
        }
    }

    /// Apply a write command and publish its events.
    async fn write_command(&self, cmd: Command) -> Result<Response> {
        let (response, events) = self.state.write().await.apply(cmd);
        for event in events {
            debug!(event = event.name(), resource_id = event.resource_id(), "state changed");
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
        Ok(response)
    }

    async fn require_resource(&self, kind: ResourceKind, id: &str) -> Result<()> {
        let state = self.state.read().await;
        match state.get_resource(kind, id) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(format!("{kind} '{id}' not found"))),
        }
    }
}

fn request_id(key: Option<String>) -> String {
    key.unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn error_from(code: u32, message: String) -> StoreError {
    match code {
        400 => StoreError::InvalidRequest(message),
        404 => StoreError::NotFound(message),
        409 => StoreError::Conflict(message),
        _ => StoreError::Internal(message),
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn list_resources(
        &self,
        kind: ResourceKind,
        selector: &LabelSelector,
    ) -> Result<Vec<Resource>> {
        let state = self.state.read().await;
        Ok(state
            .list_resources(kind, selector)
            .into_iter()
            .cloned()
            .collect())
    }

    async fn get_resource(&self, kind: ResourceKind, id: &str) -> Result<Option<Resource>> {
        let state = self.state.read().await;
        Ok(state.get_resource(kind, id).cloned())
    }

    async fn create_resource(&self, req: CreateResourceRequest) -> Result<Resource> {
        let cmd = Command::CreateResource {
            request_id: request_id(req.request_id),
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind: req.kind,
            name: req.name,
            owner_id: req.owner_id,
            labels: req.labels,
            spec: req.spec,
        };

        match self.write_command(cmd).await? {
            Response::Resource(data) => Ok(data),
            Response::Error { code, message } => Err(error_from(code, message)),
            _ => Err(StoreError::Internal("unexpected response".into())),
        }
    }

    async fn update_resource(
        &self,
        kind: ResourceKind,
        id: &str,
        req: UpdateResourceRequest,
    ) -> Result<Resource> {
        if req.spec.is_none() && req.labels.is_none() {
            return Err(StoreError::InvalidRequest(
                "nothing to update: expected spec and/or labels".into(),
            ));
        }
        let key = req.request_id;
        let mut updated = None;

        if let Some(labels) = req.labels {
            let cmd = Command::UpdateLabels {
                request_id: request_id(key.as_ref().map(|k| format!("{k}/labels"))),
                kind,
                id: id.to_string(),
                timestamp: Utc::now(),
                labels,
            };
            updated = match self.write_command(cmd).await? {
                Response::Resource(data) => Some(data),
                Response::Error { code, message } => return Err(error_from(code, message)),
                _ => return Err(StoreError::Internal("unexpected response".into())),
            };
        }

        if let Some(spec) = req.spec {
            let cmd = Command::ReplaceSpec {
                request_id: request_id(key.as_ref().map(|k| format!("{k}/spec"))),
                kind,
                id: id.to_string(),
                timestamp: Utc::now(),
                spec,
            };
            updated = match self.write_command(cmd).await? {
                Response::Resource(data) => Some(data),
                Response::Error { code, message } => return Err(error_from(code, message)),
                _ => return Err(StoreError::Internal("unexpected response".into())),
            };
        }

        updated.ok_or_else(|| StoreError::Internal("no update applied".into()))
    }

    async fn request_deletion(
        &self,
        kind: ResourceKind,
        id: &str,
        key: Option<String>,
    ) -> Result<Resource> {
        let cmd = Command::RequestDeletion {
            request_id: request_id(key),
            kind,
            id: id.to_string(),
            timestamp: Utc::now(),
        };

        match self.write_command(cmd).await? {
            Response::Resource(data) => Ok(data),
            Response::Error { code, message } => Err(error_from(code, message)),
            _ => Err(StoreError::Internal("unexpected response".into())),
        }
    }
}

#[async_trait]
impl StatusStore for MemoryStore {
    async fn list_statuses(
        &self,
        kind: ResourceKind,
        resource_id: &str,
    ) -> Result<Vec<AdapterStatus>> {
        self.require_resource(kind, resource_id).await?;
        let state = self.state.read().await;
        Ok(state
            .list_statuses(resource_id)
            .into_iter()
            .cloned()
            .collect())
    }

    async fn upsert_status(
        &self,
        kind: ResourceKind,
        resource_id: &str,
        req: UpsertStatusRequest,
    ) -> Result<UpsertStatusResult> {
        let cmd = Command::UpsertStatus {
            request_id: request_id(req.request_id),
            kind,
            resource_id: resource_id.to_string(),
            timestamp: Utc::now(),
            report: req.report,
        };

        match self.write_command(cmd).await? {
            Response::Status(result) => Ok(*result),
            Response::Error { code: 409, message } => Err(StoreError::StaleGeneration(message)),
            Response::Error { code, message } => Err(error_from(code, message)),
            _ => Err(StoreError::Internal("unexpected response".into())),
        }
    }

    async fn status_history(
        &self,
        kind: ResourceKind,
        resource_id: &str,
    ) -> Result<Vec<StatusHistoryEntry>> {
        self.require_resource(kind, resource_id).await?;
        let state = self.state.read().await;
        Ok(state
            .status_history(resource_id)
            .into_iter()
            .cloned()
            .collect())
    }
}

impl DataStore for MemoryStore {
    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }
}
