//! Persisted per-stack state.

use crate::core::{OutputMap, ResourceId};
use crate::stack::StackId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// A published output and the revision at which its value last changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedOutput {
    /// The output value.
    pub value: Value,
    /// Stack revision at which this value was first published.
    pub revision: u64,
}

/// What the last successful apply recorded for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Resource kind.
    pub kind: String,
    /// Optional scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Hash of the resolved specification.
    pub spec_hash: String,
    /// The resolved specification that was applied.
    pub applied_spec: Value,
    /// Outputs reported by the provider.
    #[serde(default)]
    pub outputs: OutputMap,
    /// Resources this one depended on; deletes run in reverse.
    #[serde(default)]
    pub dependencies: BTreeSet<ResourceId>,
    /// When the resource was last applied.
    pub applied_at: DateTime<Utc>,
}

/// An upstream output read by a stack during its last run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsumedOutput {
    /// The upstream stack.
    pub stack: StackId,
    /// The output name.
    pub output: String,
    /// Output revision observed.
    pub revision: u64,
}

/// Result of publishing one output into a state record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishEffect {
    /// The name was not published before.
    Created,
    /// The value changed; its revision was bumped.
    Updated,
    /// The same value was already published.
    Unchanged,
}

/// The persisted state of one stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackState {
    /// The stack this state belongs to.
    pub stack: StackId,
    /// Incremented on every successful write.
    pub revision: u64,
    /// Time of the last write.
    pub updated_at: DateTime<Utc>,
    /// Published outputs by name.
    #[serde(default)]
    pub outputs: BTreeMap<String, PublishedOutput>,
    /// Applied resources by logical name.
    #[serde(default)]
    pub resources: BTreeMap<ResourceId, ResourceRecord>,
    /// Upstream outputs read during the last run.
    #[serde(default)]
    pub consumed: Vec<ConsumedOutput>,
}

impl StackState {
    /// Creates an empty state at revision 0.
    #[must_use]
    pub fn new(stack: StackId) -> Self {
        Self {
            stack,
            revision: 0,
            updated_at: Utc::now(),
            outputs: BTreeMap::new(),
            resources: BTreeMap::new(),
            consumed: Vec::new(),
        }
    }

    /// Publishes an output at `revision`.
    ///
    /// Publishing an equal value keeps the existing entry and its revision.
    pub fn publish_output(&mut self, name: &str, value: Value, revision: u64) -> PublishEffect {
        match self.outputs.get_mut(name) {
            Some(existing) if existing.value == value => PublishEffect::Unchanged,
            Some(existing) => {
                existing.value = value;
                existing.revision = revision;
                PublishEffect::Updated
            }
            None => {
                self.outputs
                    .insert(name.to_string(), PublishedOutput { value, revision });
                PublishEffect::Created
            }
        }
    }

    /// Removes an output, returning whether it existed.
    pub fn remove_output(&mut self, name: &str) -> bool {
        self.outputs.remove(name).is_some()
    }

    /// Returns the value of an output, if published.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name).map(|o| &o.value)
    }

    /// Returns the stacks this stack read outputs from.
    #[must_use]
    pub fn upstream_stacks(&self) -> BTreeSet<StackId> {
        self.consumed.iter().map(|c| c.stack.clone()).collect()
    }

    /// Takes an immutable snapshot for readers.
    #[must_use]
    pub fn snapshot(&self) -> StackSnapshot {
        StackSnapshot {
            stack: self.stack.clone(),
            revision: self.revision,
            outputs: self.outputs.clone(),
            upstream: self.upstream_stacks(),
        }
    }
}

/// An immutable copy of a stack's outputs, shared between readers.
#[derive(Debug, Clone, PartialEq)]
pub struct StackSnapshot {
    /// The stack.
    pub stack: StackId,
    /// Stack revision at snapshot time.
    pub revision: u64,
    /// Published outputs.
    pub outputs: BTreeMap<String, PublishedOutput>,
    /// Stacks this stack consumed outputs from.
    pub upstream: BTreeSet<StackId>,
}

impl StackSnapshot {
    /// Returns an output with its revision.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&PublishedOutput> {
        self.outputs.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn state() -> StackState {
        StackState::new("mirrorboards/actaboards-api-db-postgres/dev".parse().unwrap())
    }

    #[test]
    fn test_publish_same_value_is_idempotent() {
        let mut state = state();
        assert_eq!(
            state.publish_output("DatabaseName", json!("actaboards"), 1),
            PublishEffect::Created
        );
        assert_eq!(
            state.publish_output("DatabaseName", json!("actaboards"), 2),
            PublishEffect::Unchanged
        );
        assert_eq!(state.outputs.len(), 1);
        assert_eq!(state.outputs["DatabaseName"].revision, 1);
    }

    #[test]
    fn test_publish_different_value_bumps_revision() {
        let mut state = state();
        state.publish_output("ConnectionSecretName", json!("pg-app"), 1);
        assert_eq!(
            state.publish_output("ConnectionSecretName", json!("pg-app-v2"), 3),
            PublishEffect::Updated
        );
        assert_eq!(state.output("ConnectionSecretName"), Some(&json!("pg-app-v2")));
        assert_eq!(state.outputs["ConnectionSecretName"].revision, 3);
    }

    #[test]
    fn test_snapshot_lists_upstream_stacks() {
        let mut state = state();
        let upstream: StackId = "mirrorboards/actaboards-api/dev".parse().unwrap();
        state.consumed.push(ConsumedOutput {
            stack: upstream.clone(),
            output: "Namespace".into(),
            revision: 4,
        });
        state.consumed.push(ConsumedOutput {
            stack: upstream.clone(),
            output: "ServiceName".into(),
            revision: 4,
        });

        let snapshot = state.snapshot();
        assert_eq!(snapshot.upstream, BTreeSet::from([upstream]));
        assert!(!state.remove_output("missing"));
    }

    #[test]
    fn test_state_serde() {
        let mut state = state();
        state.revision = 2;
        state.publish_output("DatabaseName", json!("actaboards"), 2);
        let json = serde_json::to_string(&state).unwrap();
        let back: StackState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
