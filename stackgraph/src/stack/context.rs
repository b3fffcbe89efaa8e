//! The declaration surface a stack program runs against.

use super::StackId;
use crate::core::{Deferred, Property, ResourceId};
use crate::errors::{DeferredError, ErrorInfo, GraphValidationError, ResolutionError, StackGraphError};
use crate::graph::{GraphBuilder, ResourceDeclaration, ResourceHandle};
use futures::FutureExt;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::oneshot;
use tracing::debug;

/// A stack definition: declares resources, reads and publishes outputs.
///
/// Programs are synchronous. Values that are not known yet are carried as
/// [`Deferred`] values and resolved by the engine.
pub trait StackProgram: Send + Sync {
    /// Declares the stack's resources and outputs.
    ///
    /// # Errors
    ///
    /// Any error aborts the run before a resource is realized.
    fn define(&self, ctx: &mut StackContext) -> Result<(), StackGraphError>;
}

impl<F> StackProgram for F
where
    F: Fn(&mut StackContext) -> Result<(), StackGraphError> + Send + Sync,
{
    fn define(&self, ctx: &mut StackContext) -> Result<(), StackGraphError> {
        self(ctx)
    }
}

pub(crate) struct OutputReference {
    pub(crate) stack: StackId,
    pub(crate) output: String,
    pub(crate) sender: oneshot::Sender<Result<Value, DeferredError>>,
}

/// Everything a program declared, handed to the engine.
pub(crate) struct StackDefinition {
    pub(crate) stack: StackId,
    pub(crate) graph: GraphBuilder,
    pub(crate) references: Vec<OutputReference>,
    pub(crate) outputs: BTreeMap<String, Property>,
}

impl StackDefinition {
    /// Stacks this definition reads outputs from.
    pub(crate) fn upstream_stacks(&self) -> BTreeSet<StackId> {
        self.references.iter().map(|r| r.stack.clone()).collect()
    }
}

/// Collects one stack's declarations.
pub struct StackContext {
    stack: StackId,
    graph: GraphBuilder,
    references: Vec<OutputReference>,
    requested: HashMap<(StackId, String), Deferred<Value>>,
    outputs: BTreeMap<String, Property>,
}

impl std::fmt::Debug for StackContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackContext")
            .field("stack", &self.stack)
            .field("resources", &self.graph.len())
            .field("references", &self.references.len())
            .field("outputs", &self.outputs.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StackContext {
    /// Creates an empty context for a stack.
    #[must_use]
    pub fn new(stack: StackId) -> Self {
        Self {
            graph: GraphBuilder::new(stack.clone()),
            stack,
            references: Vec::new(),
            requested: HashMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    /// The stack being defined.
    #[must_use]
    pub fn stack(&self) -> &StackId {
        &self.stack
    }

    /// Reads an output of another stack.
    ///
    /// The engine resolves every reference before any resource of this stack
    /// is realized. Requesting the same reference twice returns the same
    /// value.
    pub fn require_output(&mut self, stack: &StackId, output: &str) -> Deferred<Value> {
        let key = (stack.clone(), output.to_string());
        if let Some(existing) = self.requested.get(&key) {
            return existing.clone();
        }

        let (sender, receiver) = oneshot::channel::<Result<Value, DeferredError>>();
        let upstream = stack.clone();
        let value = Deferred::from_future(
            BTreeSet::new(),
            receiver.map(move |r| {
                r.unwrap_or_else(|_| {
                    Err(DeferredError::Resolution(ResolutionError::UpstreamFailed {
                        stack: upstream,
                        reason: "reference was never resolved".to_string(),
                    }))
                })
            }),
        );

        debug!(stack = %self.stack, upstream = %stack, output, "Recorded output reference");
        self.references.push(OutputReference {
            stack: stack.clone(),
            output: output.to_string(),
            sender,
        });
        self.requested.insert(key, value.clone());
        value
    }

    /// Declares a resource without applying it.
    ///
    /// Edges are added for every handle in `predecessors` and for every
    /// resource whose output is referenced inside `properties`.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for an empty or duplicate name, or for a
    /// predecessor handle that belongs to another stack.
    pub fn declare_resource(
        &mut self,
        kind: impl Into<String>,
        name: impl Into<ResourceId>,
        properties: impl Into<Property>,
        predecessors: &[&ResourceHandle],
    ) -> Result<ResourceHandle, StackGraphError> {
        let declaration = ResourceDeclaration::new(kind, name, properties);

        if let Some(foreign) = predecessors.iter().find(|h| h.stack() != &self.stack) {
            return Err(GraphValidationError::new(format!(
                "Resource '{}' in stack '{}' cannot depend on '{}' from stack '{}'",
                declaration.id,
                self.stack,
                foreign.id(),
                foreign.stack()
            ))
            .with_resources(vec![declaration.id.to_string(), foreign.id().to_string()])
            .with_error_info(
                ErrorInfo::new("GRAPH-004-FOREIGN_HANDLE", "Predecessor belongs to another stack")
                    .with_fix_hint("Publish the value as a stack output and read it with require_output."),
            )
            .into());
        }

        let declaration = declaration.with_predecessors(predecessors.iter().map(|h| h.id().clone()));
        self.declare(declaration)
    }

    /// Declares a fully built resource declaration.
    ///
    /// # Errors
    ///
    /// See [`StackContext::declare_resource`].
    pub fn declare(&mut self, declaration: ResourceDeclaration) -> Result<ResourceHandle, StackGraphError> {
        Ok(self.graph.declare(declaration)?)
    }

    /// Publishes a named output. The last value published under a name wins.
    pub fn publish_output(&mut self, name: impl Into<String>, value: impl Into<Property>) {
        let name = name.into();
        if self.outputs.insert(name.clone(), value.into()).is_some() {
            debug!(stack = %self.stack, output = %name, "Output overwritten");
        }
    }

    /// Names of the outputs published so far.
    #[must_use]
    pub fn output_names(&self) -> Vec<&str> {
        self.outputs.keys().map(String::as_str).collect()
    }

    /// Number of declared resources.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.graph.len()
    }

    pub(crate) fn into_definition(self) -> StackDefinition {
        StackDefinition {
            stack: self.stack,
            graph: self.graph,
            references: self.references,
            outputs: self.outputs,
        }
    }
}
