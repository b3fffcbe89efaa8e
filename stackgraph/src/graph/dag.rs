//! The provisioning DAG and its concurrent scheduler.
//!
//! Resources are realized as soon as every predecessor succeeded, with at
//! most `max_parallelism` provider calls in flight. The ready queue is
//! ordered by declaration index, so with a parallelism of one the
//! realization order equals the execution order.

use super::hash::spec_hash;
use super::resource::ResourceDeclaration;
use crate::cancellation::CancellationToken;
use crate::core::{OutputMap, ResourceId, ResourceStatus};
use crate::errors::{DeferredError, ResourceApplyError, StackGraphError};
use crate::events::{EventSink, NoOpEventSink};
use crate::provider::{ApplyRequest, ResourceProvider};
use crate::stack::StackId;
use crate::state::ResourceRecord;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tokio::task::JoinError;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug)]
pub(crate) struct GraphNode {
    pub(crate) declaration: Arc<ResourceDeclaration>,
    pub(crate) sender: Option<oneshot::Sender<Arc<OutputMap>>>,
}

/// A validated, acyclic graph of resource declarations for one stack.
#[derive(Debug)]
pub struct ProvisioningGraph {
    stack: StackId,
    nodes: Vec<GraphNode>,
    predecessors: Vec<BTreeSet<usize>>,
    successors: Vec<Vec<usize>>,
    execution_order: Vec<ResourceId>,
}

/// Options for one apply.
#[derive(Clone)]
pub struct ApplyOptions {
    /// Realizes resources.
    pub provider: Arc<dyn ResourceProvider>,
    /// Maximum provider calls in flight.
    pub max_parallelism: usize,
    /// Records from the last successful apply, for unchanged detection.
    pub previous: HashMap<ResourceId, ResourceRecord>,
    /// Re-apply resources whose spec hash did not change.
    pub refresh: bool,
    /// Stops dispatching when cancelled.
    pub cancel: Arc<CancellationToken>,
    /// Receives lifecycle events.
    pub events: Arc<dyn EventSink>,
}

impl ApplyOptions {
    /// Creates options with a parallelism of 16 and no previous state.
    #[must_use]
    pub fn new(provider: Arc<dyn ResourceProvider>) -> Self {
        Self {
            provider,
            max_parallelism: 16,
            previous: HashMap::new(),
            refresh: false,
            cancel: CancellationToken::new(),
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the parallelism bound.
    #[must_use]
    pub fn with_max_parallelism(mut self, max_parallelism: usize) -> Self {
        self.max_parallelism = max_parallelism;
        self
    }

    /// Sets the previously applied records.
    #[must_use]
    pub fn with_previous(mut self, previous: HashMap<ResourceId, ResourceRecord>) -> Self {
        self.previous = previous;
        self
    }

    /// Forces re-application of unchanged resources.
    #[must_use]
    pub fn with_refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    /// Sets the cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: Arc<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }
}

impl fmt::Debug for ApplyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplyOptions")
            .field("max_parallelism", &self.max_parallelism)
            .field("previous", &self.previous.len())
            .field("refresh", &self.refresh)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// The result of realizing one resource.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceOutcome {
    /// Logical name.
    pub id: ResourceId,
    /// Resource kind.
    pub kind: String,
    /// Optional scope.
    pub scope: Option<String>,
    /// Final status.
    pub status: ResourceStatus,
    /// The resolved specification, if resolution got that far.
    pub spec: Option<Value>,
    /// Hash of `spec`.
    pub spec_hash: Option<String>,
    /// Outputs reported by the provider or carried over when unchanged.
    pub outputs: OutputMap,
    /// The provider failure, for `Failed` resources.
    pub error: Option<ResourceApplyError>,
    /// Why the resource was skipped or cancelled.
    pub reason: Option<String>,
    /// Time spent realizing the resource.
    pub duration_ms: f64,
    /// Resources this one waited on.
    pub dependencies: BTreeSet<ResourceId>,
}

/// The result of applying a provisioning graph.
#[derive(Debug, Clone, Serialize)]
pub struct AppliedState {
    /// The stack.
    pub stack: StackId,
    /// Unique id of this apply.
    pub run_id: Uuid,
    /// Per-resource outcomes in declaration order.
    pub resources: Vec<ResourceOutcome>,
    /// Order in which resources were handed to the provider. Matches
    /// `execution_order` when `max_parallelism` is 1; above that it depends
    /// on when providers finish.
    pub realization_order: Vec<ResourceId>,
    /// The graph's topological order, ties broken by declaration order.
    /// Identical for every apply of the same declarations.
    pub execution_order: Vec<ResourceId>,
    /// Total time spent.
    pub duration_ms: f64,
    /// Whether the run was cancelled.
    pub cancelled: bool,
}

impl AppliedState {
    /// Returns the outcome for a resource.
    #[must_use]
    pub fn resource(&self, id: &str) -> Option<&ResourceOutcome> {
        self.resources.iter().find(|r| r.id.as_str() == id)
    }

    /// Returns the status of a resource.
    #[must_use]
    pub fn status(&self, id: &str) -> Option<ResourceStatus> {
        self.resource(id).map(|r| r.status)
    }

    /// Returns the names of resources with a status, in declaration order.
    #[must_use]
    pub fn ids_with_status(&self, status: ResourceStatus) -> Vec<ResourceId> {
        self.resources
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.id.clone())
            .collect()
    }

    /// Returns true if every resource was applied or unchanged.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.resources.iter().all(|r| r.status.is_success())
    }

    /// Returns true if any resource failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.resources
            .iter()
            .any(|r| r.status == ResourceStatus::Failed)
    }

    /// Returns every provider failure.
    #[must_use]
    pub fn failures(&self) -> Vec<&ResourceApplyError> {
        self.resources
            .iter()
            .filter_map(|r| r.error.as_ref())
            .collect()
    }
}

impl ProvisioningGraph {
    pub(crate) fn new(
        stack: StackId,
        nodes: Vec<GraphNode>,
        predecessors: Vec<BTreeSet<usize>>,
        order: Vec<usize>,
    ) -> Self {
        let mut successors = vec![Vec::new(); nodes.len()];
        for (node, preds) in predecessors.iter().enumerate() {
            for &pred in preds {
                successors[pred].push(node);
            }
        }
        let execution_order = order
            .into_iter()
            .map(|i| nodes[i].declaration.id.clone())
            .collect();

        Self {
            stack,
            nodes,
            predecessors,
            successors,
            execution_order,
        }
    }

    /// Returns the stack.
    #[must_use]
    pub fn stack(&self) -> &StackId {
        &self.stack
    }

    /// Returns the number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the topological order, ties broken by declaration order.
    #[must_use]
    pub fn execution_order(&self) -> &[ResourceId] {
        &self.execution_order
    }

    /// Returns the declarations in declaration order.
    pub fn declarations(&self) -> impl Iterator<Item = &ResourceDeclaration> {
        self.nodes.iter().map(|n| n.declaration.as_ref())
    }

    /// Returns a declaration by name.
    #[must_use]
    pub fn declaration(&self, id: &str) -> Option<&ResourceDeclaration> {
        self.position(id).map(|i| self.nodes[i].declaration.as_ref())
    }

    /// Returns the direct predecessors of a resource.
    #[must_use]
    pub fn dependencies(&self, id: &str) -> Option<BTreeSet<ResourceId>> {
        self.position(id).map(|i| self.names(&self.predecessors[i]))
    }

    /// Returns every resource that transitively depends on `id`.
    #[must_use]
    pub fn transitive_successors(&self, id: &str) -> BTreeSet<ResourceId> {
        self.position(id)
            .map(|i| self.names(&self.reachable_from(i)))
            .unwrap_or_default()
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| n.declaration.id.as_str() == id)
    }

    fn names(&self, indices: &BTreeSet<usize>) -> BTreeSet<ResourceId> {
        indices
            .iter()
            .map(|&i| self.nodes[i].declaration.id.clone())
            .collect()
    }

    fn reachable_from(&self, start: usize) -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<usize> = self.successors[start].iter().copied().collect();
        while let Some(node) = queue.pop_front() {
            if seen.insert(node) {
                queue.extend(self.successors[node].iter().copied());
            }
        }
        seen
    }

    /// Realizes every resource in dependency order.
    ///
    /// A failed resource marks all of its transitive successors `Skipped`;
    /// independent subgraphs still complete. Once cancelled, no further
    /// resource is dispatched and undispatched resources end `Cancelled`.
    ///
    /// # Errors
    ///
    /// Returns `Config` if `max_parallelism` is zero. Resource failures are
    /// recorded in the returned state, not returned as errors.
    pub async fn apply(mut self, options: ApplyOptions) -> Result<AppliedState, StackGraphError> {
        if options.max_parallelism == 0 {
            return Err(StackGraphError::Config(
                "max_parallelism must be at least 1".to_string(),
            ));
        }

        let run_id = Uuid::new_v4();
        let start = Instant::now();
        let n = self.nodes.len();

        info!(
            stack = %self.stack,
            run_id = %run_id,
            resources = n,
            max_parallelism = options.max_parallelism,
            "Applying provisioning graph"
        );

        let mut status = vec![ResourceStatus::Pending; n];
        let mut outcomes: Vec<Option<ResourceOutcome>> = (0..n).map(|_| None).collect();
        let mut remaining: Vec<usize> = self.predecessors.iter().map(BTreeSet::len).collect();
        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| remaining[i] == 0).collect();
        let mut in_flight = FuturesUnordered::new();
        let mut realization_order = Vec::with_capacity(n);
        let mut cancel_seen = false;

        loop {
            while !options.cancel.is_cancelled() && in_flight.len() < options.max_parallelism {
                let Some(index) = ready.pop_first() else {
                    break;
                };
                let declaration = Arc::clone(&self.nodes[index].declaration);
                status[index] = ResourceStatus::Running;
                realization_order.push(declaration.id.clone());

                debug!(stack = %self.stack, resource = %declaration.id, "Dispatching resource");
                options.events.try_emit(
                    "resource.started",
                    Some(json!({
                        "stack": self.stack.to_string(),
                        "resource": declaration.id.as_str(),
                        "kind": &declaration.kind,
                    })),
                );

                // Every declared source has completed by now, so properties
                // must resolve without waiting.
                let properties = declaration.properties.try_now().unwrap_or_else(|| {
                    Err(DeferredError::UndeclaredDependency {
                        resource: declaration.id.to_string(),
                    })
                });

                let task = NodeTask {
                    stack: self.stack.clone(),
                    properties,
                    previous: options.previous.get(&declaration.id).cloned(),
                    interruptible: options.provider.supports_interruption(&declaration.kind),
                    declaration,
                    provider: Arc::clone(&options.provider),
                    refresh: options.refresh,
                    cancel: Arc::clone(&options.cancel),
                };
                in_flight.push(spawn_node(index, task));
            }

            if in_flight.is_empty() {
                break;
            }

            let completed = if cancel_seen {
                in_flight.next().await
            } else {
                tokio::select! {
                    next = in_flight.next() => next,
                    () = options.cancel.cancelled() => {
                        cancel_seen = true;
                        warn!(
                            stack = %self.stack,
                            in_flight = in_flight.len(),
                            reason = ?options.cancel.reason(),
                            "Apply cancelled, waiting for in-flight resources"
                        );
                        continue;
                    }
                }
            };

            let Some((index, joined)) = completed else {
                break;
            };

            let declaration = Arc::clone(&self.nodes[index].declaration);
            let report = joined.unwrap_or_else(|err| {
                NodeReport::failed(&declaration, format!("task failed: {err}"), 0.0)
            });
            status[index] = report.status;

            match report.status {
                ResourceStatus::Applied | ResourceStatus::Unchanged => {
                    let outputs = Arc::new(report.outputs.clone());
                    if let Some(sender) = self.nodes[index].sender.take() {
                        let _ = sender.send(outputs);
                    }

                    let event = if report.status == ResourceStatus::Applied {
                        "resource.applied"
                    } else {
                        "resource.unchanged"
                    };
                    info!(
                        stack = %self.stack,
                        resource = %declaration.id,
                        status = %report.status,
                        duration_ms = report.duration_ms,
                        "Resource realized"
                    );
                    options.events.try_emit(
                        event,
                        Some(json!({
                            "stack": self.stack.to_string(),
                            "resource": declaration.id.as_str(),
                            "duration_ms": report.duration_ms,
                        })),
                    );

                    for &succ in &self.successors[index] {
                        remaining[succ] -= 1;
                        if remaining[succ] == 0 && status[succ] == ResourceStatus::Pending {
                            ready.insert(succ);
                        }
                    }
                }
                ResourceStatus::Failed => {
                    self.nodes[index].sender.take();
                    let message = report
                        .error
                        .as_ref()
                        .map_or_else(String::new, |e| e.message.clone());
                    warn!(
                        stack = %self.stack,
                        resource = %declaration.id,
                        error = %message,
                        "Resource failed"
                    );
                    options.events.try_emit(
                        "resource.failed",
                        Some(json!({
                            "stack": self.stack.to_string(),
                            "resource": declaration.id.as_str(),
                            "error": message,
                        })),
                    );
                    self.skip_successors(index, &mut status, &mut outcomes, &options);
                }
                _ => {
                    self.nodes[index].sender.take();
                    options.events.try_emit(
                        "resource.cancelled",
                        Some(json!({
                            "stack": self.stack.to_string(),
                            "resource": declaration.id.as_str(),
                            "reason": &report.reason,
                        })),
                    );
                }
            }

            outcomes[index] = Some(report.into_outcome(&declaration, self.names(&self.predecessors[index])));
        }

        let cancelled = options.cancel.is_cancelled();
        for index in 0..n {
            if status[index] != ResourceStatus::Pending {
                continue;
            }
            let declaration = Arc::clone(&self.nodes[index].declaration);
            let (final_status, reason) = if cancelled {
                (
                    ResourceStatus::Cancelled,
                    options
                        .cancel
                        .reason()
                        .unwrap_or_else(|| "apply cancelled".to_string()),
                )
            } else {
                (
                    ResourceStatus::Skipped,
                    "a predecessor was not realized".to_string(),
                )
            };
            status[index] = final_status;
            self.nodes[index].sender.take();
            options.events.try_emit(
                if cancelled { "resource.cancelled" } else { "resource.skipped" },
                Some(json!({
                    "stack": self.stack.to_string(),
                    "resource": declaration.id.as_str(),
                    "reason": &reason,
                })),
            );
            outcomes[index] = Some(NodeReport::not_attempted(final_status, reason).into_outcome(
                &declaration,
                self.names(&self.predecessors[index]),
            ));
        }

        let resources: Vec<ResourceOutcome> = outcomes.into_iter().flatten().collect();
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

        info!(
            stack = %self.stack,
            run_id = %run_id,
            applied = resources.iter().filter(|r| r.status == ResourceStatus::Applied).count(),
            unchanged = resources.iter().filter(|r| r.status == ResourceStatus::Unchanged).count(),
            failed = resources.iter().filter(|r| r.status == ResourceStatus::Failed).count(),
            skipped = resources.iter().filter(|r| r.status == ResourceStatus::Skipped).count(),
            cancelled,
            duration_ms,
            "Provisioning graph applied"
        );

        Ok(AppliedState {
            stack: self.stack.clone(),
            run_id,
            resources,
            realization_order,
            execution_order: self.execution_order.clone(),
            duration_ms,
            cancelled,
        })
    }

    fn skip_successors(
        &mut self,
        failed: usize,
        status: &mut [ResourceStatus],
        outcomes: &mut [Option<ResourceOutcome>],
        options: &ApplyOptions,
    ) {
        let failed_id = self.nodes[failed].declaration.id.clone();
        for succ in self.reachable_from(failed) {
            if status[succ] != ResourceStatus::Pending {
                continue;
            }
            let declaration = Arc::clone(&self.nodes[succ].declaration);
            let reason = format!("predecessor '{failed_id}' was not realized");
            status[succ] = ResourceStatus::Skipped;
            self.nodes[succ].sender.take();

            debug!(stack = %self.stack, resource = %declaration.id, reason = %reason, "Skipping resource");
            options.events.try_emit(
                "resource.skipped",
                Some(json!({
                    "stack": self.stack.to_string(),
                    "resource": declaration.id.as_str(),
                    "reason": &reason,
                })),
            );

            outcomes[succ] = Some(
                NodeReport::not_attempted(ResourceStatus::Skipped, reason)
                    .into_outcome(&declaration, self.names(&self.predecessors[succ])),
            );
        }
    }
}

fn spawn_node(
    index: usize,
    task: NodeTask,
) -> impl Future<Output = (usize, Result<NodeReport, JoinError>)> {
    tokio::spawn(task.realize()).map(move |joined| (index, joined))
}

struct NodeTask {
    stack: StackId,
    declaration: Arc<ResourceDeclaration>,
    properties: Result<Value, DeferredError>,
    provider: Arc<dyn ResourceProvider>,
    previous: Option<ResourceRecord>,
    refresh: bool,
    interruptible: bool,
    cancel: Arc<CancellationToken>,
}

impl NodeTask {
    async fn realize(self) -> NodeReport {
        let start = Instant::now();
        let decl = &self.declaration;
        let elapsed = || start.elapsed().as_secs_f64() * 1000.0;

        let properties = match self.properties {
            Ok(value) => value,
            Err(err) => {
                return NodeReport::failed(decl, format!("input not available: {err}"), elapsed());
            }
        };

        let hash = spec_hash(&decl.kind, &decl.id, decl.scope.as_deref(), &properties);

        if !self.refresh {
            if let Some(previous) = self.previous.as_ref().filter(|p| p.spec_hash == hash) {
                debug!(stack = %self.stack, resource = %decl.id, "Spec unchanged, skipping provider");
                return NodeReport {
                    status: ResourceStatus::Unchanged,
                    outputs: previous.outputs.clone(),
                    spec: Some(properties),
                    spec_hash: Some(hash),
                    error: None,
                    reason: None,
                    duration_ms: elapsed(),
                };
            }
        }

        let request = ApplyRequest {
            stack: self.stack.clone(),
            resource: decl.id.clone(),
            kind: decl.kind.clone(),
            scope: decl.scope.clone(),
            properties,
            previous_outputs: self.previous.as_ref().map(|p| p.outputs.clone()),
        };

        let result = if self.interruptible {
            tokio::select! {
                result = self.provider.apply(&request) => Some(result),
                () = self.cancel.cancelled() => None,
            }
        } else {
            Some(self.provider.apply(&request).await)
        };

        match result {
            Some(Ok(outputs)) => NodeReport {
                status: ResourceStatus::Applied,
                outputs,
                spec: Some(request.properties),
                spec_hash: Some(hash),
                error: None,
                reason: None,
                duration_ms: elapsed(),
            },
            Some(Err(err)) => {
                let mut report = NodeReport::failed(decl, format!("{err:#}"), elapsed());
                report.spec = Some(request.properties);
                report.spec_hash = Some(hash);
                report
            }
            None => NodeReport {
                status: ResourceStatus::Cancelled,
                outputs: OutputMap::new(),
                spec: Some(request.properties),
                spec_hash: Some(hash),
                error: None,
                reason: Some("interrupted by cancellation".to_string()),
                duration_ms: elapsed(),
            },
        }
    }
}

struct NodeReport {
    status: ResourceStatus,
    outputs: OutputMap,
    spec: Option<Value>,
    spec_hash: Option<String>,
    error: Option<ResourceApplyError>,
    reason: Option<String>,
    duration_ms: f64,
}

impl NodeReport {
    fn failed(decl: &ResourceDeclaration, message: String, duration_ms: f64) -> Self {
        Self {
            status: ResourceStatus::Failed,
            outputs: OutputMap::new(),
            spec: None,
            spec_hash: None,
            error: Some(ResourceApplyError::new(decl.id.as_str(), &decl.kind, message)),
            reason: None,
            duration_ms,
        }
    }

    fn not_attempted(status: ResourceStatus, reason: String) -> Self {
        Self {
            status,
            outputs: OutputMap::new(),
            spec: None,
            spec_hash: None,
            error: None,
            reason: Some(reason),
            duration_ms: 0.0,
        }
    }

    fn into_outcome(self, decl: &ResourceDeclaration, dependencies: BTreeSet<ResourceId>) -> ResourceOutcome {
        ResourceOutcome {
            id: decl.id.clone(),
            kind: decl.kind.clone(),
            scope: decl.scope.clone(),
            status: self.status,
            spec: self.spec,
            spec_hash: self.spec_hash,
            outputs: self.outputs,
            error: self.error,
            reason: self.reason,
            duration_ms: self.duration_ms,
            dependencies,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Deferred, Property};
    use crate::events::CollectingEventSink;
    use crate::graph::{GraphBuilder, ResourceDeclaration};
    use crate::testing::MockProvider;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn stack() -> StackId {
        "acme/api/dev".parse().unwrap()
    }

    fn decl(name: &str, preds: &[&str]) -> ResourceDeclaration {
        ResourceDeclaration::new("test:Resource", name, Property::map([("name", name)]))
            .with_predecessors(preds.iter().copied())
    }

    fn ids(items: &[ResourceId]) -> Vec<&str> {
        items.iter().map(ResourceId::as_str).collect()
    }

    #[tokio::test]
    async fn test_apply_respects_dependencies() {
        let mut b = GraphBuilder::new(stack());
        b.declare(decl("service", &["deployment"])).unwrap();
        b.declare(decl("deployment", &["namespace"])).unwrap();
        b.declare(decl("namespace", &[])).unwrap();
        let provider = Arc::new(MockProvider::new());

        let state = b
            .build()
            .unwrap()
            .apply(ApplyOptions::new(provider.clone()).with_max_parallelism(1))
            .await
            .unwrap();

        assert!(state.is_success());
        assert_eq!(ids(&state.realization_order), vec!["namespace", "deployment", "service"]);
        assert_eq!(state.realization_order, state.execution_order);
        assert_eq!(provider.applied(), vec!["namespace", "deployment", "service"]);
    }

    #[tokio::test]
    async fn test_failure_skips_transitive_successors_only() {
        let mut b = GraphBuilder::new(stack());
        b.declare(decl("namespace", &[])).unwrap();
        b.declare(decl("secret", &["namespace"])).unwrap();
        b.declare(decl("deployment", &["secret"])).unwrap();
        b.declare(decl("bucket", &[])).unwrap();
        let provider = Arc::new(MockProvider::new().failing_on("secret"));
        let events = Arc::new(CollectingEventSink::new());

        let state = b
            .build()
            .unwrap()
            .apply(ApplyOptions::new(provider.clone()).with_events(events.clone()))
            .await
            .unwrap();

        assert_eq!(state.status("namespace"), Some(ResourceStatus::Applied));
        assert_eq!(state.status("secret"), Some(ResourceStatus::Failed));
        assert_eq!(state.status("deployment"), Some(ResourceStatus::Skipped));
        assert_eq!(state.status("bucket"), Some(ResourceStatus::Applied));
        assert!(state.has_failures());
        assert_eq!(state.failures()[0].resource, "secret");
        assert!(!provider.applied().contains(&"deployment".to_string()));
        assert_eq!(events.resources_for("resource.skipped"), vec!["deployment".to_string()]);
    }

    #[tokio::test]
    async fn test_chained_value_hiding_a_cycle_fails_instead_of_waiting() {
        let mut b = GraphBuilder::new(stack());
        let y = b.declare(decl("y", &["x"])).unwrap();
        let y_id = y.output("id");
        let hidden = Deferred::ready(json!(1)).chain(move |_| y_id);
        b.declare(ResourceDeclaration::new(
            "test:Resource",
            "x",
            Property::map([("ref", hidden)]),
        ))
        .unwrap();
        let provider = Arc::new(MockProvider::new());

        let state = tokio::time::timeout(
            Duration::from_secs(5),
            b.build().unwrap().apply(ApplyOptions::new(provider.clone())),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(state.status("x"), Some(ResourceStatus::Failed));
        assert_eq!(state.status("y"), Some(ResourceStatus::Skipped));
        assert!(state.failures()[0].message.contains("not known when it was dispatched"));
        assert!(provider.applied().is_empty());
    }

    #[tokio::test]
    async fn test_chained_value_never_holds_the_only_worker() {
        let mut b = GraphBuilder::new(stack());
        let a = b.declare(decl("a", &[])).unwrap();
        let y = b.declare(decl("y", &["z"])).unwrap();
        let y_id = y.output("id");
        b.declare(ResourceDeclaration::new(
            "test:Resource",
            "x",
            Property::map([("ref", a.outputs().chain(move |_| y_id))]),
        ))
        .unwrap();
        b.declare(decl("z", &[])).unwrap();
        let provider = Arc::new(MockProvider::new());

        let state = tokio::time::timeout(
            Duration::from_secs(5),
            b.build()
                .unwrap()
                .apply(ApplyOptions::new(provider.clone()).with_max_parallelism(1)),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(state.status("x"), Some(ResourceStatus::Failed));
        assert_eq!(state.status("a"), Some(ResourceStatus::Applied));
        assert_eq!(state.status("z"), Some(ResourceStatus::Applied));
        assert_eq!(state.status("y"), Some(ResourceStatus::Applied));
        assert_eq!(provider.applied(), vec!["a", "z", "y"]);
    }

    #[tokio::test]
    async fn test_parallelism_bound_is_honored() {
        let mut b = GraphBuilder::new(stack());
        for i in 0..8 {
            b.declare(decl(&format!("r{i}"), &[])).unwrap();
        }
        let provider = Arc::new(MockProvider::new().with_delay(Duration::from_millis(20)));

        let state = b
            .build()
            .unwrap()
            .apply(ApplyOptions::new(provider.clone()).with_max_parallelism(3))
            .await
            .unwrap();

        assert!(state.is_success());
        assert!(provider.max_concurrency() <= 3);
        assert!(provider.max_concurrency() >= 2);
    }

    #[tokio::test]
    async fn test_zero_parallelism_is_rejected() {
        let graph = GraphBuilder::new(stack()).build().unwrap();
        let err = graph
            .apply(ApplyOptions::new(Arc::new(MockProvider::new())).with_max_parallelism(0))
            .await
            .unwrap_err();
        assert!(matches!(err, StackGraphError::Config(_)));
    }

    #[tokio::test]
    async fn test_unchanged_resource_skips_provider_and_feeds_outputs() {
        let mut b = GraphBuilder::new(stack());
        let ns = b.declare(decl("namespace", &[])).unwrap();
        b.declare(ResourceDeclaration::new(
            "test:Resource",
            "deployment",
            Property::map([("namespace", Property::from(ns.output("uid")))]),
        ))
        .unwrap();

        let first = b
            .build()
            .unwrap()
            .apply(ApplyOptions::new(Arc::new(MockProvider::new())))
            .await
            .unwrap();
        let ns_outcome = first.resource("namespace").unwrap();

        let previous = HashMap::from([(
            ResourceId::new("namespace"),
            ResourceRecord {
                kind: ns_outcome.kind.clone(),
                scope: None,
                spec_hash: ns_outcome.spec_hash.clone().unwrap(),
                applied_spec: ns_outcome.spec.clone().unwrap(),
                outputs: ns_outcome.outputs.clone(),
                dependencies: BTreeSet::new(),
                applied_at: chrono::Utc::now(),
            },
        )]);

        let mut b = GraphBuilder::new(stack());
        let ns = b.declare(decl("namespace", &[])).unwrap();
        b.declare(ResourceDeclaration::new(
            "test:Resource",
            "deployment",
            Property::map([("namespace", Property::from(ns.output("uid")))]),
        ))
        .unwrap();
        let provider = Arc::new(MockProvider::new());

        let second = b
            .build()
            .unwrap()
            .apply(ApplyOptions::new(provider.clone()).with_previous(previous))
            .await
            .unwrap();

        assert_eq!(second.status("namespace"), Some(ResourceStatus::Unchanged));
        assert_eq!(second.status("deployment"), Some(ResourceStatus::Applied));
        assert_eq!(provider.applied(), vec!["deployment"]);
        assert_eq!(
            second.resource("deployment").unwrap().spec,
            Some(json!({"namespace": ns_outcome.outputs["uid"].clone()}))
        );
    }

    #[tokio::test]
    async fn test_cancel_before_apply_cancels_everything() {
        let mut b = GraphBuilder::new(stack());
        b.declare(decl("a", &[])).unwrap();
        b.declare(decl("b", &["a"])).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel("operator abort");
        let provider = Arc::new(MockProvider::new());

        let state = b
            .build()
            .unwrap()
            .apply(ApplyOptions::new(provider.clone()).with_cancel(cancel))
            .await
            .unwrap();

        assert!(state.cancelled);
        assert_eq!(
            state.ids_with_status(ResourceStatus::Cancelled),
            vec![ResourceId::new("a"), ResourceId::new("b")]
        );
        assert_eq!(state.resource("a").unwrap().reason.as_deref(), Some("operator abort"));
        assert!(provider.applied().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_only_interruptible_kinds() {
        let mut b = GraphBuilder::new(stack());
        b.declare(ResourceDeclaration::new("slow:Interruptible", "bucket", Property::default()))
            .unwrap();
        b.declare(ResourceDeclaration::new("slow:Blocking", "database", Property::default()))
            .unwrap();
        b.declare(decl("after", &["bucket", "database"])).unwrap();

        let provider = Arc::new(
            MockProvider::new()
                .with_delay(Duration::from_millis(200))
                .interruptible("slow:Interruptible"),
        );
        let cancel = CancellationToken::new();
        let trigger = Arc::clone(&cancel);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel("deadline");
        });

        let state = b
            .build()
            .unwrap()
            .apply(ApplyOptions::new(provider.clone()).with_cancel(cancel))
            .await
            .unwrap();

        assert_eq!(state.status("bucket"), Some(ResourceStatus::Cancelled));
        assert_eq!(state.status("database"), Some(ResourceStatus::Applied));
        assert_eq!(state.status("after"), Some(ResourceStatus::Cancelled));
        assert!(!state.is_success());
    }

    #[test]
    fn test_transitive_successors() {
        let mut b = GraphBuilder::new(stack());
        b.declare(decl("a", &[])).unwrap();
        b.declare(decl("b", &["a"])).unwrap();
        b.declare(decl("c", &["b"])).unwrap();
        b.declare(decl("d", &[])).unwrap();
        let graph = b.build().unwrap();

        assert_eq!(
            graph.transitive_successors("a"),
            BTreeSet::from([ResourceId::new("b"), ResourceId::new("c")])
        );
        assert_eq!(graph.dependencies("c"), Some(BTreeSet::from([ResourceId::new("b")])));
        assert!(graph.declaration("d").is_some());
        assert_eq!(graph.declarations().count(), 4);
    }
}
