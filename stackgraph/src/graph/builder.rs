//! Graph builder with validation.

use super::dag::{GraphNode, ProvisioningGraph};
use super::resource::{ResourceDeclaration, ResourceHandle};
use super::topology::topological_order;
use crate::core::ResourceId;
use crate::errors::{CycleDetectedError, CycleScope, ErrorInfo, GraphValidationError, StackGraphError};
use crate::stack::StackId;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

/// Collects the resource declarations of one stack.
#[derive(Debug)]
pub struct GraphBuilder {
    stack: StackId,
    nodes: Vec<GraphNode>,
    index: HashMap<ResourceId, usize>,
}

impl GraphBuilder {
    /// Creates an empty builder for a stack.
    #[must_use]
    pub fn new(stack: StackId) -> Self {
        Self {
            stack,
            nodes: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Returns the stack the graph belongs to.
    #[must_use]
    pub fn stack(&self) -> &StackId {
        &self.stack
    }

    /// Returns the number of declared resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if nothing was declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns true if a resource with this name was declared.
    #[must_use]
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.index.contains_key(id)
    }

    /// Registers a resource without applying it.
    ///
    /// # Errors
    ///
    /// Returns an error if the declaration is invalid or the name is taken.
    pub fn declare(&mut self, declaration: ResourceDeclaration) -> Result<ResourceHandle, GraphValidationError> {
        declaration.validate()?;

        if self.index.contains_key(&declaration.id) {
            return Err(GraphValidationError::new(format!(
                "Resource '{}' is declared twice in stack '{}'",
                declaration.id, self.stack
            ))
            .with_resources(vec![declaration.id.to_string()])
            .with_error_info(
                ErrorInfo::new(
                    "GRAPH-002-DUPLICATE",
                    format!("Duplicate resource name '{}'", declaration.id),
                )
                .with_context_entry("stack", self.stack.to_string())
                .with_fix_hint("Logical resource names must be unique within a stack."),
            ));
        }

        let (sender, receiver) = oneshot::channel();
        let handle = ResourceHandle::new(
            declaration.id.clone(),
            declaration.kind.clone(),
            self.stack.clone(),
            receiver,
        );

        debug!(
            stack = %self.stack,
            resource = %declaration.id,
            kind = %declaration.kind,
            "Declared resource"
        );

        self.index.insert(declaration.id.clone(), self.nodes.len());
        self.nodes.push(GraphNode {
            declaration: Arc::new(declaration),
            sender: Some(sender),
        });

        Ok(handle)
    }

    /// Validates edges and freezes the graph.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a dependency on an undeclared resource and
    /// `CyclicDependency` if the resources form a cycle.
    pub fn build(self) -> Result<ProvisioningGraph, StackGraphError> {
        let mut predecessors: Vec<BTreeSet<usize>> = Vec::with_capacity(self.nodes.len());

        for node in &self.nodes {
            let decl = &node.declaration;
            let mut preds = BTreeSet::new();
            for dep in decl.dependencies() {
                let Some(&at) = self.index.get(&dep) else {
                    return Err(GraphValidationError::new(format!(
                        "Resource '{}' depends on unknown resource '{}'",
                        decl.id, dep
                    ))
                    .with_resources(vec![decl.id.to_string(), dep.to_string()])
                    .with_error_info(
                        ErrorInfo::new(
                            "GRAPH-003-UNKNOWN_PREDECESSOR",
                            format!("Dependency '{dep}' not found"),
                        )
                        .with_context_entry("stack", self.stack.to_string())
                        .with_fix_hint("Declare the predecessor in the same stack, or read it through a stack output."),
                    )
                    .into());
                };
                preds.insert(at);
            }
            predecessors.push(preds);
        }

        let execution_order = topological_order(&predecessors).map_err(|cycle| {
            CycleDetectedError::new(
                CycleScope::Resources,
                cycle
                    .into_iter()
                    .map(|i| self.nodes[i].declaration.id.to_string())
                    .collect(),
            )
        })?;

        debug!(
            stack = %self.stack,
            resources = self.nodes.len(),
            "Built provisioning graph"
        );

        Ok(ProvisioningGraph::new(
            self.stack,
            self.nodes,
            predecessors,
            execution_order,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Property;
    use pretty_assertions::assert_eq;

    fn builder() -> GraphBuilder {
        GraphBuilder::new("acme/api/dev".parse().unwrap())
    }

    fn decl(name: &str) -> ResourceDeclaration {
        ResourceDeclaration::new("test:Resource", name, Property::default())
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut b = builder();
        b.declare(decl("namespace")).unwrap();
        let err = b.declare(decl("namespace")).unwrap_err();
        assert_eq!(err.code(), Some("GRAPH-002-DUPLICATE"));
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn test_unknown_predecessor_rejected_at_build() {
        let mut b = builder();
        b.declare(decl("deployment").with_predecessors(["secret"]))
            .unwrap();
        let err = b.build().unwrap_err();
        match err {
            StackGraphError::Validation(e) => {
                assert_eq!(e.code(), Some("GRAPH-003-UNKNOWN_PREDECESSOR"));
                assert_eq!(e.resources, vec!["deployment".to_string(), "secret".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_cycle_rejected_with_path() {
        let mut b = builder();
        b.declare(decl("a").with_predecessors(["b"])).unwrap();
        b.declare(decl("b").with_predecessors(["a"])).unwrap();
        let err = b.build().unwrap_err();
        match err {
            StackGraphError::CyclicDependency(e) => {
                assert_eq!(e.scope, CycleScope::Resources);
                assert_eq!(e.cycle_path, vec!["a", "b", "a"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_deferred_edges_order_graph() {
        let mut b = builder();
        let deployment_props = |ns: &ResourceHandle| {
            Property::map([("namespace", Property::from(ns.output("name")))])
        };
        let ns = b.declare(decl("namespace")).unwrap();
        b.declare(ResourceDeclaration::new("Deployment", "deployment", deployment_props(&ns)))
            .unwrap();
        b.declare(decl("unrelated")).unwrap();

        let graph = b.build().unwrap();
        let order: Vec<&str> = graph
            .execution_order()
            .iter()
            .map(ResourceId::as_str)
            .collect();
        assert_eq!(order, vec!["namespace", "deployment", "unrelated"]);
    }

    #[test]
    fn test_empty_graph_builds() {
        let graph = builder().build().unwrap();
        assert!(graph.is_empty());
    }
}
