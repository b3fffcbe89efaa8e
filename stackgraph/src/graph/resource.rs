//! Resource declarations and the handles returned for them.

use crate::core::{Deferred, OutputMap, Property, ResourceId};
use crate::errors::{DeferredError, ErrorInfo, GraphValidationError};
use crate::stack::StackId;
use futures::FutureExt;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::oneshot;

/// A desired-state unit owned by one stack.
#[derive(Debug, Clone)]
pub struct ResourceDeclaration {
    /// Logical name, unique within the stack.
    pub id: ResourceId,
    /// Opaque kind, e.g. `kubernetes:networking.k8s.io/v1:Ingress`.
    pub kind: String,
    /// Optional scope such as a namespace.
    pub scope: Option<String>,
    /// The property bag.
    pub properties: Property,
    /// Explicit predecessors. May name resources declared later.
    pub predecessors: BTreeSet<ResourceId>,
}

impl ResourceDeclaration {
    /// Creates a declaration with no predecessors.
    #[must_use]
    pub fn new(kind: impl Into<String>, name: impl Into<ResourceId>, properties: impl Into<Property>) -> Self {
        Self {
            id: name.into(),
            kind: kind.into(),
            scope: None,
            properties: properties.into(),
            predecessors: BTreeSet::new(),
        }
    }

    /// Sets the scope.
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Adds explicit predecessors by name.
    #[must_use]
    pub fn with_predecessors<I, S>(mut self, predecessors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ResourceId>,
    {
        self.predecessors
            .extend(predecessors.into_iter().map(Into::into));
        self
    }

    /// Explicit predecessors plus every resource referenced in the properties.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<ResourceId> {
        let mut deps = self.predecessors.clone();
        deps.extend(self.properties.sources());
        deps
    }

    /// Validates the declaration on its own.
    ///
    /// # Errors
    ///
    /// Returns an error if the name or kind is empty.
    pub fn validate(&self) -> Result<(), GraphValidationError> {
        if self.id.as_str().trim().is_empty() {
            return Err(GraphValidationError::new(format!(
                "Resource of kind '{}' has an empty name",
                self.kind
            ))
            .with_error_info(
                ErrorInfo::new("GRAPH-005-EMPTY_NAME", "Resource name cannot be empty")
                    .with_fix_hint("Give every resource a non-empty logical name."),
            ));
        }

        if self.kind.trim().is_empty() {
            return Err(GraphValidationError::new(format!(
                "Resource '{}' has an empty kind",
                self.id
            ))
            .with_resources(vec![self.id.to_string()])
            .with_error_info(ErrorInfo::new(
                "GRAPH-005-EMPTY_NAME",
                "Resource kind cannot be empty",
            )));
        }

        Ok(())
    }
}

/// A reference to a declared resource, usable before it is realized.
#[derive(Debug, Clone)]
pub struct ResourceHandle {
    id: ResourceId,
    kind: String,
    stack: StackId,
    outputs: Deferred<Arc<OutputMap>>,
}

impl ResourceHandle {
    pub(crate) fn new(
        id: ResourceId,
        kind: String,
        stack: StackId,
        receiver: oneshot::Receiver<Arc<OutputMap>>,
    ) -> Self {
        let resource = id.to_string();
        let outputs = Deferred::from_future(
            BTreeSet::from([id.clone()]),
            receiver.map(move |r| r.map_err(|_| DeferredError::SourceUnavailable { resource })),
        );
        Self {
            id,
            kind,
            stack,
            outputs,
        }
    }

    /// Returns the resource name.
    #[must_use]
    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    /// Returns the resource kind.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Returns the owning stack.
    #[must_use]
    pub fn stack(&self) -> &StackId {
        &self.stack
    }

    /// Every output property of the realized resource.
    #[must_use]
    pub fn outputs(&self) -> Deferred<Arc<OutputMap>> {
        self.outputs.clone()
    }

    /// One output property of the realized resource.
    ///
    /// Fails with `MissingProperty` if the provider did not report it.
    #[must_use]
    pub fn output(&self, property: &str) -> Deferred<Value> {
        let resource = self.id.to_string();
        let property = property.to_string();
        self.outputs.clone().try_map(move |outputs| {
            outputs
                .get(&property)
                .cloned()
                .ok_or(DeferredError::MissingProperty { resource, property })
        })
    }
}

impl From<&ResourceHandle> for Property {
    /// Publishes every output of the resource as one JSON object.
    fn from(handle: &ResourceHandle) -> Self {
        Self::Deferred(
            handle
                .outputs()
                .map(|outputs| Value::Object(outputs.iter().map(|(k, v)| (k.clone(), v.clone())).collect())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn stack() -> StackId {
        "acme/api/dev".parse().unwrap()
    }

    #[test]
    fn test_dependencies_include_property_sources() {
        let (_tx, rx) = oneshot::channel();
        let namespace = ResourceHandle::new(
            ResourceId::new("namespace"),
            "kubernetes:core/v1:Namespace".into(),
            stack(),
            rx,
        );

        let decl = ResourceDeclaration::new(
            "kubernetes:apps/v1:Deployment",
            "deployment",
            Property::map([("namespace", Property::from(namespace.output("name")))]),
        )
        .with_predecessors(["secret"]);

        assert_eq!(
            decl.dependencies(),
            BTreeSet::from([ResourceId::new("namespace"), ResourceId::new("secret")])
        );
    }

    #[test]
    fn test_validate_rejects_empty_names() {
        let err = ResourceDeclaration::new("kind", "", Property::default())
            .validate()
            .unwrap_err();
        assert_eq!(err.code(), Some("GRAPH-005-EMPTY_NAME"));
        assert!(ResourceDeclaration::new(" ", "name", Property::default())
            .validate()
            .is_err());
    }

    #[tokio::test]
    async fn test_handle_output_lookup() {
        let (tx, rx) = oneshot::channel();
        let handle = ResourceHandle::new(ResourceId::new("secret"), "Secret".into(), stack(), rx);
        let name = handle.output("name");
        let missing = handle.output("uid");

        let mut outputs = OutputMap::new();
        outputs.insert("name".into(), json!("pg-app"));
        tx.send(Arc::new(outputs)).unwrap();

        assert_eq!(name.resolve().await.unwrap(), json!("pg-app"));
        assert_eq!(
            missing.resolve().await,
            Err(DeferredError::MissingProperty {
                resource: "secret".into(),
                property: "uid".into()
            })
        );
    }
}
