//! The provider seam: reconciliation of one resource against a cluster or
//! cloud API.
//!
//! The graph never interprets property bags. It resolves them to concrete
//! JSON, hands them to a [`ResourceProvider`] and records whatever outputs
//! the provider reports.

use crate::core::{OutputMap, ResourceId};
use crate::stack::StackId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A request to create or update one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyRequest {
    /// The owning stack.
    pub stack: StackId,
    /// Logical resource name.
    pub resource: ResourceId,
    /// Opaque resource kind, e.g. `kubernetes:apps/v1:Deployment`.
    pub kind: String,
    /// Optional scope such as a namespace.
    pub scope: Option<String>,
    /// Fully resolved property bag.
    pub properties: Value,
    /// Outputs recorded by the last successful apply, if any.
    pub previous_outputs: Option<OutputMap>,
}

/// A request to delete one previously applied resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteRequest {
    /// The owning stack.
    pub stack: StackId,
    /// Logical resource name.
    pub resource: ResourceId,
    /// Resource kind.
    pub kind: String,
    /// Optional scope.
    pub scope: Option<String>,
    /// Outputs recorded for the resource.
    pub outputs: OutputMap,
}

/// Realizes resources. Implementations talk to the actual APIs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Creates or updates a resource and returns its output properties.
    async fn apply(&self, request: &ApplyRequest) -> anyhow::Result<OutputMap>;

    /// Deletes a resource.
    async fn delete(&self, request: &DeleteRequest) -> anyhow::Result<()>;

    /// Whether an in-flight apply of `kind` may be dropped on cancellation.
    fn supports_interruption(&self, _kind: &str) -> bool {
        false
    }
}

/// A provider that reports the top-level properties back as outputs.
///
/// Useful for dry runs and for wiring tests where only output flow matters.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoProvider;

#[async_trait]
impl ResourceProvider for EchoProvider {
    async fn apply(&self, request: &ApplyRequest) -> anyhow::Result<OutputMap> {
        let mut outputs = OutputMap::new();
        if let Value::Object(map) = &request.properties {
            outputs.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        outputs.insert("id".to_string(), Value::String(request.resource.to_string()));
        Ok(outputs)
    }

    async fn delete(&self, _request: &DeleteRequest) -> anyhow::Result<()> {
        Ok(())
    }
}
