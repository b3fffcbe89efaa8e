//! Resource status and planned-change enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The realization status of a resource within one apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// Declared, waiting for predecessors.
    #[default]
    Pending,
    /// Handed to the provider.
    Running,
    /// The provider realized the resource.
    Applied,
    /// The resolved spec matched the last applied spec; the provider was not called.
    Unchanged,
    /// The provider failed.
    Failed,
    /// A transitive predecessor failed, so the resource was never attempted.
    Skipped,
    /// The run was cancelled before or while realizing the resource.
    Cancelled,
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Applied => write!(f, "applied"),
            Self::Unchanged => write!(f, "unchanged"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl ResourceStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Returns true if the resource is realized with its desired spec.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Applied | Self::Unchanged)
    }

    /// Returns true if the resource ended without being realized.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Skipped | Self::Cancelled)
    }
}

/// What an apply would do to a resource, computed by preview.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannedChange {
    /// No record of the resource exists yet.
    Create,
    /// The recorded spec hash differs, or the spec is not fully known yet.
    Update,
    /// The recorded spec hash matches.
    Unchanged,
    /// The resource is recorded but no longer declared.
    Delete,
}

impl fmt::Display for PlannedChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Unchanged => write!(f, "unchanged"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_status_display() {
        assert_eq!(ResourceStatus::Applied.to_string(), "applied");
        assert_eq!(ResourceStatus::Skipped.to_string(), "skipped");
        assert_eq!(ResourceStatus::Unchanged.to_string(), "unchanged");
    }

    #[test]
    fn test_resource_status_is_terminal() {
        assert!(ResourceStatus::Applied.is_terminal());
        assert!(ResourceStatus::Skipped.is_terminal());
        assert!(ResourceStatus::Cancelled.is_terminal());
        assert!(!ResourceStatus::Pending.is_terminal());
        assert!(!ResourceStatus::Running.is_terminal());
    }

    #[test]
    fn test_resource_status_success_and_failure() {
        assert!(ResourceStatus::Unchanged.is_success());
        assert!(!ResourceStatus::Unchanged.is_failure());
        assert!(ResourceStatus::Skipped.is_failure());
        assert!(!ResourceStatus::Pending.is_failure());
    }

    #[test]
    fn test_status_serialize() {
        let json = serde_json::to_string(&ResourceStatus::Skipped).unwrap();
        assert_eq!(json, r#""skipped""#);
        let back: ResourceStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ResourceStatus::Skipped);
        assert_eq!(serde_json::to_string(&PlannedChange::Delete).unwrap(), r#""delete""#);
    }
}
