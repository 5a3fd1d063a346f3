//! Generation-keyed identity for adapter side effects.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Observed state of an adapter's action for one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionState {
    NotExists,
    InProgress,
    Succeeded,
    Failed,
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionState::NotExists => write!(f, "NotExists"),
            ActionState::InProgress => write!(f, "InProgress"),
            ActionState::Succeeded => write!(f, "Succeeded"),
            ActionState::Failed => write!(f, "Failed"),
        }
    }
}

/// Name of the action an adapter runs for `(resource_id, generation)`.
///
/// Format: `{adapter}-{resource_id}-gen{generation}`, lower-cased, with every
/// character outside `[a-z0-9-]` replaced by `-`. Re-delivering an event
/// therefore always lands on the same action, and a new generation always
/// gets a new one.
pub fn action_name(adapter: &str, resource_id: &str, generation: u64) -> String {
    let raw = format!("{adapter}-{resource_id}-gen{generation}");
    raw.chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_name_format() {
        assert_eq!(action_name("dns", "c1", 1), "dns-c1-gen1");
        assert_eq!(
            action_name("Validation", "cluster_01.eu", 12),
            "validation-cluster-01-eu-gen12"
        );
    }

    #[test]
    fn test_generations_get_distinct_names() {
        assert_ne!(action_name("dns", "c1", 1), action_name("dns", "c1", 2));
        assert_eq!(action_name("dns", "c1", 2), action_name("dns", "c1", 2));
    }
}
