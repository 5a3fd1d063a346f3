//! Adapter configuration.
//!
//! Loaded once from YAML at start-up and shared read-only.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fleet_core::rules::{self, EvaluationError};
use fleet_core::{FieldPath, ResourceKind, Rule};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse adapter config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid adapter config '{adapter}': {reason}")]
    Invalid { adapter: String, reason: String },

    #[error("invalid {section} rules in adapter '{adapter}': {source}")]
    Rule {
        adapter: String,
        section: &'static str,
        source: EvaluationError,
    },
}

/// Declarative description of one adapter.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdapterConfig {
    /// Adapter name; also the status key and the broker subscription.
    pub name: String,
    /// Kinds this adapter reconciles. Events for other kinds are acked and skipped.
    pub resource_kinds: Vec<ResourceKind>,
    /// Static values exposed as `env.*` in rule and template contexts.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Process environment variables copied into `env.*` at start-up.
    #[serde(default)]
    pub env_from: Vec<String>,
    #[serde(default)]
    pub preconditions: Vec<Rule>,
    pub action: ActionConfig,
    #[serde(default)]
    pub postconditions: Postconditions,
    /// Status `data` entries, each resolved from the reconcile context.
    #[serde(default)]
    pub status_data: BTreeMap<String, FieldPath>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    /// Payload rendered against the context with `{{ path }}` placeholders.
    #[serde(default)]
    pub template: Value,
    /// Re-run a succeeded action once it is older than this. Off when unset.
    #[serde(default, with = "humantime_serde")]
    pub revalidate_after: Option<Duration>,
    /// How long a finished action of a superseded generation is kept.
    #[serde(default = "default_retain_for", with = "humantime_serde")]
    pub retain_for: Duration,
}

/// Default window a superseded, finished action is kept for.
pub const DEFAULT_RETAIN_FOR: Duration = Duration::from_secs(3600);

fn default_retain_for() -> Duration {
    DEFAULT_RETAIN_FOR
}

/// Where actions run.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase", deny_unknown_fields)]
pub enum BackendConfig {
    /// Simulated jobs completing after `complete_after`.
    Memory {
        #[serde(default, with = "humantime_serde")]
        complete_after: Duration,
        #[serde(default)]
        fail: bool,
    },
    /// Local child process running the rendered `command` argv.
    Process,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Memory {
            complete_after: Duration::ZERO,
            fail: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Postconditions {
    #[serde(default)]
    pub applied: Vec<Rule>,
    #[serde(default)]
    pub available: Vec<Rule>,
    #[serde(default)]
    pub health: HealthRules,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthRules {
    /// Any passing rule marks the adapter unhealthy.
    #[serde(default)]
    pub failure: Vec<Rule>,
}

impl AdapterConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: AdapterConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&yaml)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::Invalid {
            adapter: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(invalid("name may only contain [A-Za-z0-9_-]"));
        }
        if self.resource_kinds.is_empty() {
            return Err(invalid("resource_kinds must not be empty"));
        }
        if self.action.backend == BackendConfig::Process
            && !self.action.template.get("command").is_some_and(Value::is_array)
        {
            return Err(invalid(
                "process actions need a `command` array in the template",
            ));
        }

        for (section, rules) in [
            ("precondition", &self.preconditions),
            ("applied", &self.postconditions.applied),
            ("available", &self.postconditions.available),
            ("health failure", &self.postconditions.health.failure),
        ] {
            rules::validate(rules).map_err(|source| ConfigError::Rule {
                adapter: self.name.clone(),
                section,
                source,
            })?;
        }
        Ok(())
    }

    pub fn serves(&self, kind: ResourceKind) -> bool {
        self.resource_kinds.contains(&kind)
    }

    /// The `env` document: static values overlaid with `env_from` variables.
    /// Unset variables are left out.
    pub fn env_context(&self) -> Value {
        let mut env: serde_json::Map<String, Value> = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        for name in &self.env_from {
            if let Ok(value) = std::env::var(name) {
                env.insert(name.clone(), Value::String(value));
            }
        }
        Value::Object(env)
    }
}
