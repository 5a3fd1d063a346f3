//! Adapters: one reconciliation pipeline per adapter config, fed by a
//! broker subscription.

mod action;
mod pipeline;
mod worker;

use std::sync::Arc;

use serde_json::Value;

use crate::client::ResourceClient;
use crate::config::AdapterConfig;

pub use action::{
    ActionBackend, ActionError, ActionManager, ActionRecord, ActionSpec, MemoryActionBackend,
    ProcessActionBackend, Resolution, build_backend,
};
pub use pipeline::{AdapterError, Outcome};
pub use worker::{WorkerConfig, run_worker};

/// A configured adapter.
pub struct Adapter {
    config: Arc<AdapterConfig>,
    client: Arc<dyn ResourceClient>,
    actions: ActionManager,
    env: Value,
}

impl Adapter {
    /// Build an adapter with the backend its config names.
    pub fn new(config: Arc<AdapterConfig>, client: Arc<dyn ResourceClient>) -> Self {
        let backend = build_backend(&config.action);
        Self::with_backend(config, client, backend)
    }

    pub fn with_backend(
        config: Arc<AdapterConfig>,
        client: Arc<dyn ResourceClient>,
        backend: Arc<dyn ActionBackend>,
    ) -> Self {
        let actions = ActionManager::new(config.name.clone(), backend)
            .with_revalidate_after(config.action.revalidate_after);
        let env = config.env_context();
        Self {
            config,
            client,
            actions,
            env,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }
}
