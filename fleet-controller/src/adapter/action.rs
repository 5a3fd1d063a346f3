//! Idempotent action manager.
//!
//! An adapter's side effect for `(resource_id, generation)` is an action named
//! by [`action_name`]. Redelivered events resolve to the same action; a new
//! generation always gets a new one and earlier generations are never re-run.
//! Backends drop finished actions of earlier generations once they are older
//! than the retention window.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use fleet_core::{ActionState, action_name};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{ActionConfig, BackendConfig, DEFAULT_RETAIN_FOR};

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("action backend unavailable: {0}")]
    Unavailable(String),

    #[error("invalid action payload for '{name}': {reason}")]
    InvalidPayload { name: String, reason: String },
}

/// Request to create an action.
#[derive(Debug, Clone)]
pub struct ActionSpec {
    pub name: String,
    pub resource_id: String,
    pub generation: u64,
    pub payload: Value,
}

/// An action as seen by its backend; exposed to postconditions as `action.*`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionRecord {
    pub name: String,
    pub state: ActionState,
    pub resource_id: String,
    pub generation: u64,
    /// Backend-specific result document.
    pub output: Value,
    pub message: String,
    pub created_time: DateTime<Utc>,
    pub completed_time: Option<DateTime<Utc>>,
}

impl ActionRecord {
    fn started(spec: &ActionSpec, now: DateTime<Utc>) -> Self {
        Self {
            name: spec.name.clone(),
            state: ActionState::InProgress,
            resource_id: spec.resource_id.clone(),
            generation: spec.generation,
            output: Value::Null,
            message: String::new(),
            created_time: now,
            completed_time: None,
        }
    }

    fn finish(&mut self, succeeded: bool, output: Value, message: String, at: DateTime<Utc>) {
        self.state = if succeeded {
            ActionState::Succeeded
        } else {
            ActionState::Failed
        };
        self.output = output;
        self.message = message;
        self.completed_time = Some(at);
    }

    /// Finished, belongs to an earlier generation of the resource `spec`
    /// targets, and completed at least `retain_for` before `now`.
    fn superseded_by(&self, spec: &ActionSpec, retain_for: TimeDelta, now: DateTime<Utc>) -> bool {
        self.resource_id == spec.resource_id
            && self.generation < spec.generation
            && self
                .completed_time
                .and_then(|t| t.checked_add_signed(retain_for))
                .is_some_and(|deadline| now >= deadline)
    }
}

fn retention(retain_for: Duration) -> TimeDelta {
    TimeDelta::from_std(retain_for).unwrap_or(TimeDelta::MAX)
}

/// Storage and execution of actions.
#[async_trait]
pub trait ActionBackend: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<ActionRecord>, ActionError>;

    /// Create the action. If `spec.name` already exists the existing record
    /// is returned unchanged.
    async fn create(&self, spec: ActionSpec) -> Result<ActionRecord, ActionError>;

    async fn delete(&self, name: &str) -> Result<(), ActionError>;
}

/// Build the backend an adapter config asks for.
pub fn build_backend(config: &ActionConfig) -> Arc<dyn ActionBackend> {
    match &config.backend {
        BackendConfig::Memory {
            complete_after,
            fail,
        } => {
            let backend =
                MemoryActionBackend::new(*complete_after).with_retention(config.retain_for);
            backend.set_fail(*fail);
            Arc::new(backend)
        }
        BackendConfig::Process => {
            Arc::new(ProcessActionBackend::new().with_retention(config.retain_for))
        }
    }
}

/// Result of [`ActionManager::resolve`].
#[derive(Debug, Clone)]
pub struct Resolution {
    pub name: String,
    pub state: ActionState,
    pub record: Option<ActionRecord>,
}

pub struct ActionManager {
    adapter: String,
    backend: Arc<dyn ActionBackend>,
    revalidate_after: Option<Duration>,
}

impl ActionManager {
    pub fn new(adapter: impl Into<String>, backend: Arc<dyn ActionBackend>) -> Self {
        Self {
            adapter: adapter.into(),
            backend,
            revalidate_after: None,
        }
    }

    /// Treat succeeded actions older than `ttl` as missing so they run again.
    pub fn with_revalidate_after(mut self, ttl: Option<Duration>) -> Self {
        self.revalidate_after = ttl;
        self
    }

    pub fn name(&self, resource_id: &str, generation: u64) -> String {
        action_name(&self.adapter, resource_id, generation)
    }

    pub async fn resolve(
        &self,
        resource_id: &str,
        generation: u64,
    ) -> Result<Resolution, ActionError> {
        let name = self.name(resource_id, generation);
        let record = match self.backend.get(&name).await? {
            Some(record) if self.is_expired(&record, Utc::now()) => {
                info!(action = %name, "Succeeded action past revalidation TTL, re-running");
                self.backend.delete(&name).await?;
                None
            }
            other => other,
        };

        Ok(Resolution {
            name,
            state: record
                .as_ref()
                .map(|r| r.state)
                .unwrap_or(ActionState::NotExists),
            record,
        })
    }

    pub async fn ensure(
        &self,
        resource_id: &str,
        generation: u64,
        payload: Value,
    ) -> Result<ActionRecord, ActionError> {
        let spec = ActionSpec {
            name: self.name(resource_id, generation),
            resource_id: resource_id.to_string(),
            generation,
            payload,
        };
        debug!(action = %spec.name, "Ensuring action");
        self.backend.create(spec).await
    }

    fn is_expired(&self, record: &ActionRecord, now: DateTime<Utc>) -> bool {
        let (Some(ttl), Some(completed)) = (self.revalidate_after, record.completed_time) else {
            return false;
        };
        if record.state != ActionState::Succeeded {
            return false;
        }
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
        completed
            .checked_add_signed(ttl)
            .is_some_and(|deadline| now >= deadline)
    }
}

// =============================================================================
// In-memory backend
// =============================================================================

struct SimulatedJob {
    record: ActionRecord,
    payload: Value,
    ready_at: DateTime<Utc>,
    fail: bool,
}

/// Simulated jobs that complete `complete_after` their creation. The rendered
/// payload becomes the job's `output`.
pub struct MemoryActionBackend {
    jobs: Mutex<HashMap<String, SimulatedJob>>,
    complete_after: TimeDelta,
    retain_for: TimeDelta,
    fail: AtomicBool,
    available: AtomicBool,
    created: AtomicUsize,
}

impl MemoryActionBackend {
    pub fn new(complete_after: Duration) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            complete_after: TimeDelta::from_std(complete_after).unwrap_or(TimeDelta::MAX),
            retain_for: retention(DEFAULT_RETAIN_FOR),
            fail: AtomicBool::new(false),
            available: AtomicBool::new(true),
            created: AtomicUsize::new(0),
        }
    }

    pub fn with_retention(mut self, retain_for: Duration) -> Self {
        self.retain_for = retention(retain_for);
        self
    }

    /// Number of jobs currently held.
    pub async fn job_count(&self) -> usize {
        self.jobs.lock().await.len()
    }

    /// Jobs created from now on fail instead of succeeding.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Simulate an outage: every call returns [`ActionError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of jobs actually created.
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Finish every running job now.
    pub async fn complete_all(&self) {
        let now = Utc::now();
        for job in self.jobs.lock().await.values_mut() {
            job.ready_at = job.ready_at.min(now);
        }
    }

    fn check_available(&self) -> Result<(), ActionError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ActionError::Unavailable("simulated outage".to_string()))
        }
    }

    fn advance(job: &mut SimulatedJob, now: DateTime<Utc>) {
        if job.record.state != ActionState::InProgress || now < job.ready_at {
            return;
        }
        if job.fail {
            job.record.finish(
                false,
                json!({"error": "simulated failure"}),
                "simulated failure".to_string(),
                job.ready_at,
            );
        } else {
            job.record
                .finish(true, job.payload.clone(), "completed".to_string(), job.ready_at);
        }
    }
}

#[async_trait]
impl ActionBackend for MemoryActionBackend {
    async fn get(&self, name: &str) -> Result<Option<ActionRecord>, ActionError> {
        self.check_available()?;
        let mut jobs = self.jobs.lock().await;
        Ok(jobs.get_mut(name).map(|job| {
            Self::advance(job, Utc::now());
            job.record.clone()
        }))
    }

    async fn create(&self, spec: ActionSpec) -> Result<ActionRecord, ActionError> {
        self.check_available()?;
        let now = Utc::now();
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(&spec.name) {
            Self::advance(job, now);
            return Ok(job.record.clone());
        }

        let before = jobs.len();
        jobs.retain(|_, job| {
            Self::advance(job, now);
            !job.record.superseded_by(&spec, self.retain_for, now)
        });
        if jobs.len() < before {
            debug!(action = %spec.name, dropped = before - jobs.len(), "Dropped superseded actions");
        }

        let job = SimulatedJob {
            record: ActionRecord::started(&spec, now),
            payload: spec.payload,
            ready_at: now
                .checked_add_signed(self.complete_after)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            fail: self.fail.load(Ordering::SeqCst),
        };
        self.created.fetch_add(1, Ordering::SeqCst);
        let record = job.record.clone();
        jobs.insert(spec.name, job);
        Ok(record)
    }

    async fn delete(&self, name: &str) -> Result<(), ActionError> {
        self.check_available()?;
        self.jobs.lock().await.remove(name);
        Ok(())
    }
}

// =============================================================================
// Process backend
// =============================================================================

/// Runs the payload's `command` argv as a local child process.
///
/// Payload: `{"command": ["prog", "arg"], "env": {"KEY": "value"}}`. The action
/// succeeds when the process exits 0. Output is
/// `{"exit_code", "stdout", "stderr", "result"}` where `result` is stdout
/// parsed as JSON, if it parses.
pub struct ProcessActionBackend {
    actions: Arc<Mutex<HashMap<String, ActionRecord>>>,
    retain_for: TimeDelta,
}

impl ProcessActionBackend {
    pub fn new() -> Self {
        Self {
            actions: Arc::new(Mutex::new(HashMap::new())),
            retain_for: retention(DEFAULT_RETAIN_FOR),
        }
    }

    pub fn with_retention(mut self, retain_for: Duration) -> Self {
        self.retain_for = retention(retain_for);
        self
    }

    fn command(spec: &ActionSpec) -> Result<Command, ActionError> {
        let invalid = |reason: &str| ActionError::InvalidPayload {
            name: spec.name.clone(),
            reason: reason.to_string(),
        };
        let argv: Vec<&str> = spec
            .payload
            .get("command")
            .and_then(Value::as_array)
            .ok_or_else(|| invalid("missing `command` array"))?
            .iter()
            .map(|v| v.as_str().ok_or_else(|| invalid("`command` entries must be strings")))
            .collect::<Result<_, _>>()?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| invalid("`command` is empty"))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env("FLEET_ACTION_NAME", &spec.name)
            .env("FLEET_RESOURCE_ID", &spec.resource_id)
            .env("FLEET_GENERATION", spec.generation.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(env) = spec.payload.get("env").and_then(Value::as_object) {
            for (key, value) in env {
                match value {
                    Value::String(s) => cmd.env(key, s),
                    other => cmd.env(key, other.to_string()),
                };
            }
        }
        Ok(cmd)
    }
}

impl Default for ProcessActionBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionBackend for ProcessActionBackend {
    async fn get(&self, name: &str) -> Result<Option<ActionRecord>, ActionError> {
        Ok(self.actions.lock().await.get(name).cloned())
    }

    async fn create(&self, spec: ActionSpec) -> Result<ActionRecord, ActionError> {
        let mut actions = self.actions.lock().await;
        if let Some(existing) = actions.get(&spec.name) {
            return Ok(existing.clone());
        }

        let now = Utc::now();
        let before = actions.len();
        actions.retain(|_, record| !record.superseded_by(&spec, self.retain_for, now));
        if actions.len() < before {
            debug!(action = %spec.name, dropped = before - actions.len(), "Dropped superseded actions");
        }

        let mut cmd = Self::command(&spec)?;
        let child = cmd.spawn().map_err(|e| {
            ActionError::Unavailable(format!("failed to spawn '{}': {e}", spec.name))
        })?;
        info!(action = %spec.name, pid = ?child.id(), "Started action process");

        let record = ActionRecord::started(&spec, now);
        actions.insert(spec.name.clone(), record.clone());

        let registry = Arc::clone(&self.actions);
        let name = spec.name;
        tokio::spawn(async move {
            let (succeeded, output, message) = match child.wait_with_output().await {
                Ok(out) => {
                    let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
                    let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
                    let result = serde_json::from_str::<Value>(stdout.trim()).unwrap_or(Value::Null);
                    let message = if out.status.success() {
                        "completed".to_string()
                    } else {
                        format!("exited with {}", out.status)
                    };
                    (
                        out.status.success(),
                        json!({
                            "exit_code": out.status.code(),
                            "stdout": stdout,
                            "stderr": stderr,
                            "result": result,
                        }),
                        message,
                    )
                }
                Err(e) => {
                    warn!(action = %name, "Failed to wait for action process: {e}");
                    (false, json!({"error": e.to_string()}), e.to_string())
                }
            };
            if let Some(record) = registry.lock().await.get_mut(&name) {
                record.finish(succeeded, output, message, Utc::now());
                info!(action = %name, state = %record.state, "Action process finished");
            }
        });

        Ok(record)
    }

    async fn delete(&self, name: &str) -> Result<(), ActionError> {
        self.actions.lock().await.remove(name);
        Ok(())
    }
}
