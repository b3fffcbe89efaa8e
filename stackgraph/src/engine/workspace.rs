//! Applying several stacks together.
//!
//! Stacks that read each other's outputs are ordered by their references.
//! All stacks start at once; a consumer of a stack applied in the same run
//! awaits that stack's pending snapshot instead of reading stale state.

use super::engine::{Engine, StackReport};
use crate::cancellation::CancellationToken;
use crate::errors::{CycleDetectedError, CycleScope, ErrorInfo, GraphValidationError, StackGraphError};
use crate::graph::topological_order;
use crate::resolver::LiveStacks;
use crate::stack::{StackDefinition, StackId, StackProgram};
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

/// The result of a workspace apply.
#[derive(Debug)]
pub struct WorkspaceReport {
    /// Per-stack results.
    pub results: BTreeMap<StackId, Result<StackReport, StackGraphError>>,
    /// Stacks in dependency order.
    pub order: Vec<StackId>,
}

impl WorkspaceReport {
    /// Returns the report of a stack that applied without aborting.
    #[must_use]
    pub fn report(&self, stack: &StackId) -> Option<&StackReport> {
        self.results.get(stack).and_then(|r| r.as_ref().ok())
    }

    /// Returns the error of a stack that aborted.
    #[must_use]
    pub fn error(&self, stack: &StackId) -> Option<&StackGraphError> {
        self.results.get(stack).and_then(|r| r.as_ref().err())
    }

    /// Returns true if every stack applied completely.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.results
            .values()
            .all(|r| r.as_ref().is_ok_and(StackReport::is_success))
    }
}

/// A set of stack programs applied together.
pub struct Workspace {
    engine: Arc<Engine>,
    stacks: Vec<(StackId, Arc<dyn StackProgram>)>,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("stacks", &self.stacks.iter().map(|(s, _)| s).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Workspace {
    /// Creates an empty workspace.
    #[must_use]
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            stacks: Vec::new(),
        }
    }

    /// Adds a stack program.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the stack was already added.
    pub fn add(&mut self, stack: StackId, program: impl StackProgram + 'static) -> Result<&mut Self, StackGraphError> {
        if self.stacks.iter().any(|(s, _)| *s == stack) {
            return Err(GraphValidationError::new(format!("Stack '{stack}' was added twice"))
                .with_resources(vec![stack.to_string()])
                .with_error_info(
                    ErrorInfo::new("GRAPH-006-DUPLICATE_STACK", "Duplicate stack in workspace")
                        .with_context_entry("stack", stack.to_string()),
                )
                .into());
        }
        let program: Arc<dyn StackProgram> = Arc::new(program);
        self.stacks.push((stack, program));
        Ok(self)
    }

    /// Returns the number of stacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    /// Returns true if no stack was added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    /// Applies every stack.
    ///
    /// # Errors
    ///
    /// Returns `CyclicDependency` if the stacks reference each other in a
    /// cycle, or the first program error. In both cases no resource is
    /// realized. Per-stack failures are reported in [`WorkspaceReport`].
    pub async fn apply(&self) -> Result<WorkspaceReport, StackGraphError> {
        self.apply_with_cancel(CancellationToken::new()).await
    }

    /// Applies every stack with a shared cancellation token.
    ///
    /// # Errors
    ///
    /// See [`Workspace::apply`].
    pub async fn apply_with_cancel(&self, cancel: Arc<CancellationToken>) -> Result<WorkspaceReport, StackGraphError> {
        let mut definitions = Vec::with_capacity(self.stacks.len());
        for (stack, program) in &self.stacks {
            definitions.push(Engine::define(stack, program.as_ref())?);
        }

        let order = stack_order(&definitions)?;
        info!(stacks = ?order.iter().map(ToString::to_string).collect::<Vec<_>>(), "Applying workspace");

        let live = Arc::new(LiveStacks::new());
        for definition in &definitions {
            live.register(&definition.stack, definition.upstream_stacks());
        }

        let runs = definitions.into_iter().map(|definition| {
            let live = Arc::clone(&live);
            let cancel = Arc::clone(&cancel);
            let engine = Arc::clone(&self.engine);
            async move {
                let stack = definition.stack.clone();
                let resolver = engine.resolver().with_live(Arc::clone(&live));
                let result = engine
                    .run_defined(definition, &resolver, cancel, Some(live.as_ref()))
                    .await;
                if let Err(err) = &result {
                    warn!(stack = %stack, error = %err, "Workspace stack aborted");
                }
                (stack, result)
            }
        });

        let results = join_all(runs).await.into_iter().collect();
        Ok(WorkspaceReport { results, order })
    }
}

/// Orders stacks so every upstream comes before its consumers.
fn stack_order(definitions: &[StackDefinition]) -> Result<Vec<StackId>, StackGraphError> {
    let index: HashMap<&StackId, usize> = definitions
        .iter()
        .enumerate()
        .map(|(i, d)| (&d.stack, i))
        .collect();

    let predecessors: Vec<BTreeSet<usize>> = definitions
        .iter()
        .map(|d| {
            d.upstream_stacks()
                .iter()
                .filter_map(|s| index.get(s).copied())
                .collect()
        })
        .collect();

    match topological_order(&predecessors) {
        Ok(order) => Ok(order
            .into_iter()
            .map(|i| definitions[i].stack.clone())
            .collect()),
        Err(cycle) => {
            let path = cycle
                .into_iter()
                .map(|i| definitions[i].stack.to_string())
                .collect();
            Err(CycleDetectedError::new(CycleScope::Stacks, path).into())
        }
    }
}
