//! Resource store state machine.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::num::NonZeroUsize;

use chrono::{DateTime, Utc};
use fleet_core::{
    AdapterStatus, AdapterStatusReport, LabelSelector, Resource, ResourceKind, ResourceStatus,
};
use lru::LruCache;

use crate::command::{
    Command, ReportOutcome, Response, StatusHistoryEntry, UpsertStatusResult,
};
use crate::merge::{self, MergeRejection};
use crate::store::Event;

const APPLIED_REQUESTS_CAPACITY: NonZeroUsize = match NonZeroUsize::new(1000) {
    Some(n) => n,
    None => NonZeroUsize::MIN,
};

/// Default number of reports kept per resource in the status history.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Which adapters must report before a resource of a kind is Available/Ready.
#[derive(Debug, Clone, Default)]
pub struct RequiredAdapters(HashMap<ResourceKind, Vec<String>>);

impl RequiredAdapters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kind: ResourceKind, adapter: impl Into<String>) {
        let adapters = self.0.entry(kind).or_default();
        let adapter = adapter.into();
        if !adapters.contains(&adapter) {
            adapters.push(adapter);
        }
    }

    pub fn for_kind(&self, kind: ResourceKind) -> &[String] {
        self.0.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl FromIterator<(ResourceKind, String)> for RequiredAdapters {
    fn from_iter<I: IntoIterator<Item = (ResourceKind, String)>>(iter: I) -> Self {
        let mut required = Self::new();
        for (kind, adapter) in iter {
            required.add(kind, adapter);
        }
        required
    }
}

/// Store state: resources, per-adapter statuses and the status audit trail.
#[derive(Debug)]
pub struct FleetState {
    resources: HashMap<String, Resource>,
    /// resource id -> adapter name -> status
    statuses: HashMap<String, BTreeMap<String, AdapterStatus>>,
    history: HashMap<String, VecDeque<StatusHistoryEntry>>,
    required: RequiredAdapters,
    history_limit: usize,
    /// Idempotency cache for request deduplication
    applied_requests: LruCache<String, Response>,
}

impl Default for FleetState {
    fn default() -> Self {
        Self::new(RequiredAdapters::default(), DEFAULT_HISTORY_LIMIT)
    }
}

impl FleetState {
    pub fn new(required: RequiredAdapters, history_limit: usize) -> Self {
        Self {
            resources: HashMap::new(),
            statuses: HashMap::new(),
            history: HashMap::new(),
            required,
            history_limit,
            applied_requests: LruCache::new(APPLIED_REQUESTS_CAPACITY),
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get_resource(&self, kind: ResourceKind, id: &str) -> Option<&Resource> {
        self.resources.get(id).filter(|r| r.kind == kind)
    }

    /// Resources of a kind matching the selector, oldest first.
    pub fn list_resources(&self, kind: ResourceKind, selector: &LabelSelector) -> Vec<&Resource> {
        let mut resources: Vec<&Resource> = self
            .resources
            .values()
            .filter(|r| r.kind == kind && selector.matches(&r.labels))
            .collect();
        resources.sort_by(|a, b| a.created_time.cmp(&b.created_time).then(a.id.cmp(&b.id)));
        resources
    }

    pub fn list_statuses(&self, resource_id: &str) -> Vec<&AdapterStatus> {
        self.statuses
            .get(resource_id)
            .map(|s| s.values().collect())
            .unwrap_or_default()
    }

    pub fn status_history(&self, resource_id: &str) -> Vec<&StatusHistoryEntry> {
        self.history
            .get(resource_id)
            .map(|h| h.iter().collect())
            .unwrap_or_default()
    }

    // =========================================================================
    // Apply
    // =========================================================================

    pub fn apply(&mut self, cmd: Command) -> (Response, Vec<Event>) {
        // Check idempotency cache
        let request_id = cmd.idempotency_key();
        if let Some(response) = self.applied_requests.peek(&request_id) {
            return (response.clone(), vec![]);
        }

        let (response, events) = match cmd {
            Command::CreateResource {
                id,
                timestamp,
                kind,
                name,
                owner_id,
                labels,
                spec,
                ..
            } => self.create_resource(id, timestamp, kind, name, owner_id, labels, spec),

            Command::ReplaceSpec {
                kind,
                id,
                timestamp,
                spec,
                ..
            } => {
                let old = match self.get_resource(kind, &id) {
                    Some(r) if r.is_deleting() => {
                        return conflict(format!("{kind} '{id}' is being deleted"));
                    }
                    Some(r) => r.clone(),
                    None => return not_found(kind, &id),
                };
                let mut new = old.clone();
                new.spec = spec;
                new.generation += 1;
                new.updated_time = timestamp;
                self.recompute(&mut new, None, timestamp);
                self.resources.insert(id.clone(), new.clone());
                (
                    Response::Resource(new.clone()),
                    vec![Event::SpecUpdated { id, old, new }],
                )
            }

            Command::UpdateLabels {
                kind, id, labels, ..
            } => match self.resources.get_mut(&id).filter(|r| r.kind == kind) {
                Some(resource) => {
                    let old = resource.clone();
                    resource.labels = labels;
                    let new = resource.clone();
                    (
                        Response::Resource(new.clone()),
                        vec![Event::LabelsUpdated { id, old, new }],
                    )
                }
                None => return not_found(kind, &id),
            },

            Command::RequestDeletion {
                kind,
                id,
                timestamp,
                ..
            } => {
                let mut new = match self.get_resource(kind, &id) {
                    // Already requested: nothing to bump.
                    Some(r) if r.is_deleting() => {
                        return (Response::Resource(r.clone()), vec![]);
                    }
                    Some(r) => r.clone(),
                    None => return not_found(kind, &id),
                };
                new.generation += 1;
                new.updated_time = timestamp;
                new.deleted_time = Some(timestamp);
                self.recompute(&mut new, None, timestamp);
                self.resources.insert(id.clone(), new.clone());
                (
                    Response::Resource(new.clone()),
                    vec![Event::DeletionRequested(new)],
                )
            }

            Command::UpsertStatus {
                kind,
                resource_id,
                timestamp,
                report,
                ..
            } => {
                let Some(resource) = self.get_resource(kind, &resource_id) else {
                    return not_found(kind, &resource_id);
                };
                let stored = self
                    .statuses
                    .get(&resource_id)
                    .and_then(|s| s.get(&report.adapter));

                if let Err(rejection) = merge::check_report(resource, stored, &report) {
                    let code = match rejection {
                        MergeRejection::Stale { .. } => 409,
                        MergeRejection::FutureGeneration { .. } => 400,
                    };
                    return (
                        Response::Error {
                            code,
                            message: rejection.to_string(),
                        },
                        vec![],
                    );
                }

                if merge::is_history_only(&report) {
                    let result = UpsertStatusResult {
                        outcome: ReportOutcome::Recorded,
                        adapter_status: stored.cloned(),
                        resource: resource.clone(),
                    };
                    self.record_history(&resource_id, &report, timestamp, ReportOutcome::Recorded);
                    (Response::Status(Box::new(result)), vec![])
                } else {
                    let status = AdapterStatus {
                        adapter: report.adapter.clone(),
                        observed_generation: report.observed_generation,
                        conditions: report.conditions.clone(),
                        data: report.data.clone(),
                        created_time: stored.map(|s| s.created_time).unwrap_or(timestamp),
                        last_transition_time: timestamp,
                    };
                    let mut resource = resource.clone();
                    self.statuses
                        .entry(resource_id.clone())
                        .or_default()
                        .insert(status.adapter.clone(), status.clone());
                    self.recompute(&mut resource, Some(&status), timestamp);
                    self.resources.insert(resource_id.clone(), resource.clone());
                    self.record_history(&resource_id, &report, timestamp, ReportOutcome::Stored);

                    let result = UpsertStatusResult {
                        outcome: ReportOutcome::Stored,
                        adapter_status: Some(status.clone()),
                        resource,
                    };
                    (
                        Response::Status(Box::new(result)),
                        vec![Event::StatusUpdated {
                            resource_id,
                            status,
                        }],
                    )
                }
            }
        };

        // Cache the response
        self.applied_requests.put(request_id, response.clone());

        (response, events)
    }

    #[allow(clippy::too_many_arguments)]
    fn create_resource(
        &mut self,
        id: String,
        timestamp: DateTime<Utc>,
        kind: ResourceKind,
        name: String,
        owner_id: Option<String>,
        labels: BTreeMap<String, String>,
        spec: serde_json::Value,
    ) -> (Response, Vec<Event>) {
        // Check for duplicate ID (idempotency)
        if let Some(existing) = self.resources.get(&id) {
            return (Response::Resource(existing.clone()), vec![]);
        }

        if self
            .resources
            .values()
            .any(|r| r.kind == kind && r.name == name)
        {
            return conflict(format!("{kind} with name '{name}' already exists"));
        }

        match (kind, &owner_id) {
            (ResourceKind::NodePool, None) => {
                return bad_request("a NodePool requires owner_id".to_string());
            }
            (ResourceKind::NodePool, Some(owner)) => {
                match self.get_resource(ResourceKind::Cluster, owner) {
                    None => return not_found(ResourceKind::Cluster, owner),
                    Some(cluster) if cluster.is_deleting() => {
                        return conflict(format!("Cluster '{owner}' is being deleted"));
                    }
                    Some(_) => {}
                }
            }
            (ResourceKind::Cluster, Some(_)) => {
                return bad_request("a Cluster has no owner".to_string());
            }
            (ResourceKind::Cluster, None) => {}
        }

        let mut resource = Resource {
            id: id.clone(),
            kind,
            name,
            owner_id,
            labels,
            generation: 1,
            spec,
            status: ResourceStatus::new(timestamp),
            created_time: timestamp,
            updated_time: timestamp,
            deleted_time: None,
        };
        self.recompute(&mut resource, None, timestamp);
        self.resources.insert(id, resource.clone());
        (
            Response::Resource(resource.clone()),
            vec![Event::ResourceCreated(resource)],
        )
    }

    fn recompute(&self, resource: &mut Resource, trigger: Option<&AdapterStatus>, now: DateTime<Utc>) {
        let empty = BTreeMap::new();
        let statuses = self.statuses.get(&resource.id).unwrap_or(&empty);
        merge::recompute(
            resource,
            statuses,
            self.required.for_kind(resource.kind),
            trigger,
            now,
        );
    }

    fn record_history(
        &mut self,
        resource_id: &str,
        report: &AdapterStatusReport,
        received_time: DateTime<Utc>,
        outcome: ReportOutcome,
    ) {
        let history = self.history.entry(resource_id.to_string()).or_default();
        history.push_back(StatusHistoryEntry {
            adapter: report.adapter.clone(),
            observed_generation: report.observed_generation,
            conditions: report.conditions.clone(),
            data: report.data.clone(),
            received_time,
            outcome,
        });
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }
}

fn not_found(kind: ResourceKind, id: &str) -> (Response, Vec<Event>) {
    (
        Response::Error {
            code: 404,
            message: format!("{kind} '{id}' not found"),
        },
        vec![],
    )
}

fn conflict(message: String) -> (Response, Vec<Event>) {
    (Response::Error { code: 409, message }, vec![])
}

fn bad_request(message: String) -> (Response, Vec<Event>) {
    (Response::Error { code: 400, message }, vec![])
}
