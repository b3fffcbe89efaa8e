//! One stack run: define, resolve references, apply, publish, persist.

use super::config::EngineConfig;
use crate::cancellation::CancellationToken;
use crate::core::{PlannedChange, ResourceId, ResourceStatus};
use crate::errors::{
    BackendError, CycleDetectedError, CycleScope, DeferredError, ResolutionError,
    ResourceApplyError, StackGraphError,
};
use crate::events::{EventSink, NoOpEventSink};
use crate::graph::{spec_hash, topological_order, AppliedState, ApplyOptions, ProvisioningGraph};
use crate::observability::stack_span;
use crate::provider::{DeleteRequest, ResourceProvider};
use crate::resolver::{with_retry_if, LiveStacks, OutputResolver, RetryExhausted};
use crate::stack::{OutputReference, StackContext, StackDefinition, StackId, StackProgram};
use crate::state::{
    FileStateBackend, PublishEffect, ResourceRecord, StackSnapshot, StackState, StateBackend,
};
use chrono::Utc;
use futures::future::try_join_all;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn, Instrument};

/// The result of applying one stack.
#[derive(Debug, Clone, Serialize)]
pub struct StackReport {
    /// The stack.
    pub stack: StackId,
    /// Per-resource outcomes.
    pub applied: AppliedState,
    /// Every output value after the run.
    pub outputs: BTreeMap<String, Value>,
    /// How each output published in this run changed the stored value.
    pub output_changes: BTreeMap<String, PublishEffect>,
    /// Outputs that were not published again and were removed.
    pub removed_outputs: Vec<String>,
    /// Outputs that could not be resolved; their previous value was kept.
    pub unresolved_outputs: BTreeMap<String, String>,
    /// Recorded resources deleted because they are no longer declared.
    pub pruned: Vec<ResourceId>,
    /// Deletes that failed while pruning.
    pub prune_failures: Vec<ResourceApplyError>,
    /// Stack revision written by this run.
    pub revision: u64,
}

impl StackReport {
    /// Returns true if every resource was realized and every output resolved.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.applied.is_success()
            && self.unresolved_outputs.is_empty()
            && self.prune_failures.is_empty()
    }

    /// Turns a partially applied stack into an error.
    ///
    /// # Errors
    ///
    /// Returns `ResourceApply` with the first provider failure, or
    /// `Cancelled` if the run was cancelled before every resource was
    /// realized.
    pub fn into_result(self) -> Result<Self, StackGraphError> {
        if let Some(failure) = self.applied.failures().first() {
            return Err(StackGraphError::ResourceApply((*failure).clone()));
        }
        if self.applied.cancelled {
            let pending = self.applied.ids_with_status(ResourceStatus::Cancelled);
            return Err(StackGraphError::Cancelled(format!(
                "stack '{}' stopped with {} resource(s) not realized",
                self.stack,
                pending.len()
            )));
        }
        Ok(self)
    }
}

/// One resource in a preview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedResource {
    /// Logical name.
    pub id: ResourceId,
    /// Resource kind.
    pub kind: String,
    /// What an apply would do.
    pub change: PlannedChange,
    /// False if some property depends on a value not known before apply.
    pub known: bool,
}

/// What an apply of a stack would do, computed without calling the provider.
#[derive(Debug, Clone, Serialize)]
pub struct StackPreview {
    /// The stack.
    pub stack: StackId,
    /// Declared resources in execution order, then deletions.
    pub changes: Vec<PlannedResource>,
    /// Outputs the program publishes.
    pub outputs: Vec<String>,
}

impl StackPreview {
    /// Returns the planned change for a resource.
    #[must_use]
    pub fn change_for(&self, id: &str) -> Option<PlannedChange> {
        self.changes
            .iter()
            .find(|c| c.id.as_str() == id)
            .map(|c| c.change)
    }

    /// Counts resources with a planned change.
    #[must_use]
    pub fn count(&self, change: PlannedChange) -> usize {
        self.changes.iter().filter(|c| c.change == change).count()
    }
}

/// The result of destroying a stack.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DestroyReport {
    /// Deleted resources, in deletion order.
    pub deleted: Vec<ResourceId>,
    /// Resources kept because they or a dependent failed to delete.
    pub retained: Vec<ResourceId>,
    /// Delete failures.
    pub failures: Vec<ResourceApplyError>,
    /// Whether the state record was removed.
    pub state_removed: bool,
}

impl DestroyReport {
    /// Returns true if every resource and the state record were removed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.state_removed
    }
}

/// A consumed output whose upstream value moved on since it was read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaleReference {
    /// The upstream stack.
    pub stack: StackId,
    /// The output name.
    pub output: String,
    /// Revision observed by the consumer.
    pub consumed_revision: u64,
    /// Current revision; `None` if the output or the stack is gone.
    pub current_revision: Option<u64>,
}

/// Runs stack programs against a state backend and a provider.
pub struct Engine {
    backend: Arc<dyn StateBackend>,
    provider: Arc<dyn ResourceProvider>,
    config: EngineConfig,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine with the default configuration.
    #[must_use]
    pub fn new(backend: Arc<dyn StateBackend>, provider: Arc<dyn ResourceProvider>) -> Self {
        Self {
            backend,
            provider,
            config: EngineConfig::default(),
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Creates an engine storing state under `config.state_dir`.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the configuration is invalid.
    pub fn from_config(config: EngineConfig, provider: Arc<dyn ResourceProvider>) -> Result<Self, StackGraphError> {
        config.validate()?;
        let backend = Arc::new(FileStateBackend::new(config.state_dir.clone()));
        Ok(Self::new(backend, provider).with_config(config))
    }

    /// Sets the configuration.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the state backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn StateBackend> {
        &self.backend
    }

    pub(crate) fn resolver(&self) -> OutputResolver {
        OutputResolver::new(Arc::clone(&self.backend), self.config.lookup_retry.clone())
    }

    pub(crate) fn define(stack: &StackId, program: &dyn StackProgram) -> Result<StackDefinition, StackGraphError> {
        let mut ctx = StackContext::new(stack.clone());
        program.define(&mut ctx)?;
        Ok(ctx.into_definition())
    }

    /// Applies one stack.
    ///
    /// # Errors
    ///
    /// Returns an error if the program fails, a reference cannot be resolved,
    /// the graph is invalid, or state cannot be persisted. Resource failures
    /// are reported in [`StackReport::applied`].
    pub async fn apply_stack(&self, stack: &StackId, program: &dyn StackProgram) -> Result<StackReport, StackGraphError> {
        self.apply_stack_with_cancel(stack, program, CancellationToken::new())
            .await
    }

    /// Applies one stack with a cancellation token.
    ///
    /// # Errors
    ///
    /// See [`Engine::apply_stack`].
    pub async fn apply_stack_with_cancel(
        &self,
        stack: &StackId,
        program: &dyn StackProgram,
        cancel: Arc<CancellationToken>,
    ) -> Result<StackReport, StackGraphError> {
        let definition = Self::define(stack, program)?;
        let resolver = self.resolver();
        self.run_defined(definition, &resolver, cancel, None).await
    }

    /// Runs a defined stack. In a workspace, `live` receives the outcome.
    pub(crate) async fn run_defined(
        &self,
        definition: StackDefinition,
        resolver: &OutputResolver,
        cancel: Arc<CancellationToken>,
        live: Option<&LiveStacks>,
    ) -> Result<StackReport, StackGraphError> {
        let stack = definition.stack.clone();
        let result = self
            .run(definition, resolver, cancel)
            .instrument(stack_span(&stack))
            .await;

        match &result {
            Ok((report, snapshot)) => {
                if let Some(live) = live {
                    if report.is_success() {
                        live.publish(&stack, Arc::clone(snapshot));
                    } else {
                        live.fail(&stack, failure_summary(report));
                    }
                }
                self.events.try_emit(
                    if report.is_success() { "stack.completed" } else { "stack.failed" },
                    Some(json!({
                        "stack": stack.to_string(),
                        "revision": report.revision,
                        "applied": report.applied.ids_with_status(ResourceStatus::Applied).len(),
                        "unchanged": report.applied.ids_with_status(ResourceStatus::Unchanged).len(),
                        "failed": report.applied.ids_with_status(ResourceStatus::Failed).len(),
                    })),
                );
            }
            Err(err) => {
                warn!(stack = %stack, error = %err, "Stack apply aborted");
                if let Some(live) = live {
                    live.fail(&stack, err.to_string());
                }
                self.events.try_emit(
                    "stack.failed",
                    Some(json!({
                        "stack": stack.to_string(),
                        "error": err.to_string(),
                    })),
                );
            }
        }

        result.map(|(report, _)| report)
    }

    async fn run(
        &self,
        definition: StackDefinition,
        resolver: &OutputResolver,
        cancel: Arc<CancellationToken>,
    ) -> Result<(StackReport, Arc<StackSnapshot>), StackGraphError> {
        let start = Instant::now();
        let StackDefinition {
            stack,
            graph,
            references,
            outputs,
        } = definition;

        info!(stack = %stack, references = references.len(), "Starting stack apply");
        self.events.try_emit("stack.started", Some(json!({"stack": stack.to_string()})));

        let graph = graph.build()?;
        let previous = self.read_state(&stack).await?;

        resolve_references(&stack, references, resolver).await?;

        let previous_records: HashMap<ResourceId, ResourceRecord> = previous
            .as_ref()
            .map(|s| s.resources.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        let declared: BTreeSet<ResourceId> = graph.declarations().map(|d| d.id.clone()).collect();

        let options = ApplyOptions::new(Arc::clone(&self.provider))
            .with_max_parallelism(self.config.max_parallelism)
            .with_previous(previous_records)
            .with_refresh(self.config.refresh)
            .with_cancel(Arc::clone(&cancel))
            .with_events(Arc::clone(&self.events));
        let applied = graph.apply(options).await?;

        let mut state = previous.unwrap_or_else(|| StackState::new(stack.clone()));
        let revision = state.revision + 1;

        let mut output_changes = BTreeMap::new();
        let mut unresolved_outputs = BTreeMap::new();
        for (name, property) in &outputs {
            match property.resolve().await {
                Ok(value) => {
                    output_changes.insert(name.clone(), state.publish_output(name, value, revision));
                }
                Err(err) => {
                    warn!(stack = %stack, output = %name, error = %err, "Output not resolved, keeping previous value");
                    unresolved_outputs.insert(name.clone(), err.to_string());
                }
            }
        }

        let now = Utc::now();
        for outcome in &applied.resources {
            if !outcome.status.is_success() {
                continue;
            }
            let (Some(spec), Some(hash)) = (outcome.spec.clone(), outcome.spec_hash.clone()) else {
                continue;
            };
            let applied_at = match (outcome.status, state.resources.get(&outcome.id)) {
                (ResourceStatus::Unchanged, Some(existing)) => existing.applied_at,
                _ => now,
            };
            state.resources.insert(
                outcome.id.clone(),
                ResourceRecord {
                    kind: outcome.kind.clone(),
                    scope: outcome.scope.clone(),
                    spec_hash: hash,
                    applied_spec: spec,
                    outputs: outcome.outputs.clone(),
                    dependencies: outcome.dependencies.clone(),
                    applied_at,
                },
            );
        }

        let mut removed_outputs = Vec::new();
        let mut pruned = Vec::new();
        let mut prune_failures = Vec::new();
        if applied.is_success() {
            let stale: Vec<String> = state
                .outputs
                .keys()
                .filter(|name| !outputs.contains_key(*name))
                .cloned()
                .collect();
            for name in stale {
                state.remove_output(&name);
                removed_outputs.push(name);
            }

            if self.config.prune {
                let orphans: BTreeMap<ResourceId, ResourceRecord> = state
                    .resources
                    .iter()
                    .filter(|(id, _)| !declared.contains(*id))
                    .map(|(id, r)| (id.clone(), r.clone()))
                    .collect();
                if !orphans.is_empty() {
                    let outcome = self.delete_records(&stack, &orphans).await;
                    for id in &outcome.deleted {
                        state.resources.remove(id);
                    }
                    pruned = outcome.deleted;
                    prune_failures = outcome.failures;
                }
            }
        }

        state.consumed = resolver.consumed_outputs();
        state.revision = revision;
        state.updated_at = now;
        self.write_state(&state).await?;

        info!(
            stack = %stack,
            revision,
            success = applied.is_success(),
            pruned = pruned.len(),
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Stack apply finished"
        );

        let report = StackReport {
            stack,
            outputs: state
                .outputs
                .iter()
                .map(|(k, v)| (k.clone(), v.value.clone()))
                .collect(),
            applied,
            output_changes,
            removed_outputs,
            unresolved_outputs,
            pruned,
            prune_failures,
            revision,
        };
        Ok((report, Arc::new(state.snapshot())))
    }

    /// Computes what an apply would change without calling the provider.
    ///
    /// # Errors
    ///
    /// Returns the same definition, resolution and graph errors as an apply.
    pub async fn preview_stack(&self, stack: &StackId, program: &dyn StackProgram) -> Result<StackPreview, StackGraphError> {
        let StackDefinition {
            stack: _,
            graph,
            references,
            outputs,
        } = Self::define(stack, program)?;

        let graph: ProvisioningGraph = graph.build()?;
        let previous = self.read_state(stack).await?;
        let resolver = self.resolver();
        resolve_references(stack, references, &resolver).await?;

        let records = previous.map(|s| s.resources).unwrap_or_default();
        let mut changes = Vec::with_capacity(graph.len());

        for id in graph.execution_order() {
            let Some(decl) = graph.declaration(id.as_str()) else {
                continue;
            };
            let record = records.get(id);
            let (change, known) = match decl.properties.try_now() {
                Some(Ok(properties)) => {
                    let hash = spec_hash(&decl.kind, &decl.id, decl.scope.as_deref(), &properties);
                    match record {
                        None => (PlannedChange::Create, true),
                        Some(r) if r.spec_hash == hash && !self.config.refresh => (PlannedChange::Unchanged, true),
                        Some(_) => (PlannedChange::Update, true),
                    }
                }
                Some(Err(_)) | None => (
                    if record.is_some() { PlannedChange::Update } else { PlannedChange::Create },
                    false,
                ),
            };
            changes.push(PlannedResource {
                id: id.clone(),
                kind: decl.kind.clone(),
                change,
                known,
            });
        }

        for (id, record) in &records {
            if graph.declaration(id.as_str()).is_none() {
                changes.push(PlannedResource {
                    id: id.clone(),
                    kind: record.kind.clone(),
                    change: PlannedChange::Delete,
                    known: true,
                });
            }
        }

        debug!(stack = %stack, changes = changes.len(), "Computed preview");
        Ok(StackPreview {
            stack: stack.clone(),
            changes,
            outputs: outputs.into_keys().collect(),
        })
    }

    /// Deletes every recorded resource of a stack, dependents first.
    ///
    /// If a delete fails, that resource and everything it depends on are
    /// kept, and the state record is rewritten with the survivors.
    ///
    /// # Errors
    ///
    /// Returns `UnresolvedStack` if the stack has no state.
    pub async fn destroy_stack(&self, stack: &StackId) -> Result<DestroyReport, StackGraphError> {
        let Some(mut state) = self.read_state(stack).await? else {
            return Err(ResolutionError::UnresolvedStack { stack: stack.clone() }.into());
        };

        info!(stack = %stack, resources = state.resources.len(), "Destroying stack");
        let mut report = self.delete_records(stack, &state.resources).await;

        if report.failures.is_empty() {
            report.state_removed = self
                .backend
                .delete(stack)
                .await
                .map_err(StackGraphError::Backend)?;
        } else {
            for id in &report.deleted {
                state.resources.remove(id);
            }
            state.revision += 1;
            state.updated_at = Utc::now();
            self.write_state(&state).await?;
        }

        self.events.try_emit(
            "stack.destroyed",
            Some(json!({
                "stack": stack.to_string(),
                "deleted": report.deleted.len(),
                "retained": report.retained.len(),
            })),
        );
        Ok(report)
    }

    async fn delete_records(&self, stack: &StackId, records: &BTreeMap<ResourceId, ResourceRecord>) -> DestroyReport {
        let ids: Vec<&ResourceId> = records.keys().collect();
        let position: HashMap<&ResourceId, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        let predecessors: Vec<BTreeSet<usize>> = records
            .values()
            .map(|r| {
                r.dependencies
                    .iter()
                    .filter_map(|d| position.get(d).copied())
                    .collect()
            })
            .collect();

        let order: Vec<usize> = match topological_order(&predecessors) {
            Ok(order) => order.into_iter().rev().collect(),
            Err(cycle) => {
                warn!(stack = %stack, cycle = ?cycle, "Recorded dependencies are cyclic, deleting in reverse name order");
                (0..ids.len()).rev().collect()
            }
        };

        let mut report = DestroyReport::default();
        let mut retained: BTreeSet<usize> = BTreeSet::new();

        for index in order {
            let id = ids[index];
            let record = &records[id];
            if retained.contains(&index) {
                report.retained.push(id.clone());
                continue;
            }

            let request = DeleteRequest {
                stack: stack.clone(),
                resource: id.clone(),
                kind: record.kind.clone(),
                scope: record.scope.clone(),
                outputs: record.outputs.clone(),
            };
            match self.provider.delete(&request).await {
                Ok(()) => {
                    debug!(stack = %stack, resource = %id, "Deleted resource");
                    self.events.try_emit(
                        "resource.deleted",
                        Some(json!({"stack": stack.to_string(), "resource": id.as_str()})),
                    );
                    report.deleted.push(id.clone());
                }
                Err(err) => {
                    warn!(stack = %stack, resource = %id, error = %format!("{err:#}"), "Delete failed");
                    report
                        .failures
                        .push(ResourceApplyError::new(id.as_str(), &record.kind, format!("{err:#}")));
                    report.retained.push(id.clone());
                    let mut stack_of = vec![index];
                    while let Some(node) = stack_of.pop() {
                        for &pred in &predecessors[node] {
                            if retained.insert(pred) {
                                stack_of.push(pred);
                            }
                        }
                    }
                }
            }
        }

        report
    }

    /// Lists outputs this stack consumed whose upstream value has changed.
    ///
    /// # Errors
    ///
    /// Returns `UnresolvedStack` if the stack has no state.
    pub async fn stale_references(&self, stack: &StackId) -> Result<Vec<StaleReference>, StackGraphError> {
        let Some(state) = self.read_state(stack).await? else {
            return Err(ResolutionError::UnresolvedStack { stack: stack.clone() }.into());
        };

        let resolver = self.resolver();
        let mut stale = Vec::new();
        for consumed in &state.consumed {
            let current = match resolver.snapshot(&consumed.stack).await {
                Ok(snapshot) => snapshot.get(&consumed.output).map(|o| o.revision),
                Err(StackGraphError::Resolution(ResolutionError::UnresolvedStack { .. })) => None,
                Err(err) => return Err(err),
            };
            if current != Some(consumed.revision) {
                stale.push(StaleReference {
                    stack: consumed.stack.clone(),
                    output: consumed.output.clone(),
                    consumed_revision: consumed.revision,
                    current_revision: current,
                });
            }
        }
        Ok(stale)
    }

    /// Returns the persisted outputs of a stack.
    ///
    /// # Errors
    ///
    /// Returns `UnresolvedStack` if the stack has no state.
    pub async fn read_outputs(&self, stack: &StackId) -> Result<BTreeMap<String, Value>, StackGraphError> {
        let snapshot = self.resolver().snapshot(stack).await?;
        Ok(snapshot
            .outputs
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect())
    }

    async fn read_state(&self, stack: &StackId) -> Result<Option<StackState>, StackGraphError> {
        with_retry_if(
            &self.config.lookup_retry,
            &stack.to_string(),
            || self.backend.read(stack),
            BackendError::is_transient,
        )
        .await
        .map_err(|RetryExhausted { error, .. }| StackGraphError::Backend(error))
    }

    async fn write_state(&self, state: &StackState) -> Result<(), StackGraphError> {
        with_retry_if(
            &self.config.lookup_retry,
            &state.stack.to_string(),
            || self.backend.write(state),
            BackendError::is_transient,
        )
        .await
        .map_err(|RetryExhausted { error, .. }| StackGraphError::Backend(error))
    }
}

/// Resolves every output reference of a stack before anything is realized.
async fn resolve_references(
    stack: &StackId,
    references: Vec<OutputReference>,
    resolver: &OutputResolver,
) -> Result<(), StackGraphError> {
    let upstream: BTreeSet<StackId> = references.iter().map(|r| r.stack.clone()).collect();
    for other in &upstream {
        if other == stack {
            return Err(CycleDetectedError::new(
                CycleScope::Stacks,
                vec![stack.to_string(), stack.to_string()],
            )
            .into());
        }
        resolver.check_cycle(stack, other).await?;
    }

    let lookups = try_join_all(
        references
            .iter()
            .map(|r| resolver.resolve_output(&r.stack, &r.output)),
    )
    .await?;

    let values = try_join_all(
        lookups
            .into_iter()
            .map(|value| async move { value.resolve().await.map_err(DeferredError::into_stack_error) }),
    )
    .await?;

    for (reference, value) in references.into_iter().zip(values) {
        debug!(stack = %stack, upstream = %reference.stack, output = %reference.output, "Reference resolved");
        let _ = reference.sender.send(Ok(value));
    }
    Ok(())
}

fn failure_summary(report: &StackReport) -> String {
    let failed = report.applied.ids_with_status(ResourceStatus::Failed);
    if let Some(first) = failed.first() {
        return format!("resource '{first}' failed");
    }
    if report.applied.cancelled {
        return "apply was cancelled".to_string();
    }
    if let Some(name) = report.unresolved_outputs.keys().next() {
        return format!("output '{name}' could not be resolved");
    }
    "apply did not complete".to_string()
}
