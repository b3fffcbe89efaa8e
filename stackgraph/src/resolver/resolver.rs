//! Cross-stack output resolution.

use super::live::LiveStacks;
use super::retry::{with_retry_if, RetryConfig, RetryExhausted};
use crate::core::Deferred;
use crate::errors::{
    BackendError, CycleDetectedError, CycleScope, DeferredError, ResolutionError, StackGraphError,
};
use crate::stack::StackId;
use crate::state::{ConsumedOutput, StackSnapshot, StateBackend};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

type ConsumedMap = Arc<Mutex<BTreeMap<(StackId, String), u64>>>;

/// The result of resolving one output reference.
#[derive(Debug, Clone)]
pub enum OutputValue {
    /// The output was read from a persisted snapshot.
    Resolved(Value),
    /// The upstream stack is being applied in this run.
    Pending(Deferred<Value>),
}

impl OutputValue {
    /// Returns the concrete value, if resolved.
    #[must_use]
    pub fn as_resolved(&self) -> Option<&Value> {
        match self {
            Self::Resolved(value) => Some(value),
            Self::Pending(_) => None,
        }
    }

    /// Returns true if the value is not known yet.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    /// Converts into a deferred value.
    #[must_use]
    pub fn into_deferred(self) -> Deferred<Value> {
        match self {
            Self::Resolved(value) => Deferred::ready(value),
            Self::Pending(deferred) => deferred,
        }
    }

    /// Waits for the value.
    ///
    /// # Errors
    ///
    /// Returns the upstream failure if a pending value never resolves.
    pub async fn resolve(self) -> Result<Value, DeferredError> {
        match self {
            Self::Resolved(value) => Ok(value),
            Self::Pending(deferred) => deferred.resolve().await,
        }
    }
}

/// Resolves `(stack, output)` references against the state backend.
///
/// Each resolver serves one run: the first lookup of a stack takes a
/// snapshot and every later lookup in the run reads the same snapshot.
pub struct OutputResolver {
    backend: Arc<dyn StateBackend>,
    retry: RetryConfig,
    snapshots: DashMap<StackId, Arc<StackSnapshot>>,
    live: Option<Arc<LiveStacks>>,
    consumed: ConsumedMap,
}

impl std::fmt::Debug for OutputResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputResolver")
            .field("retry", &self.retry)
            .field("snapshots", &self.snapshots.len())
            .field("live", &self.live.is_some())
            .finish_non_exhaustive()
    }
}

impl OutputResolver {
    /// Creates a resolver over a backend.
    #[must_use]
    pub fn new(backend: Arc<dyn StateBackend>, retry: RetryConfig) -> Self {
        Self {
            backend,
            retry,
            snapshots: DashMap::new(),
            live: None,
            consumed: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Routes lookups of live stacks to their pending outputs.
    #[must_use]
    pub fn with_live(mut self, live: Arc<LiveStacks>) -> Self {
        self.live = Some(live);
        self
    }

    /// Resolves one output of another stack.
    ///
    /// # Errors
    ///
    /// - `UnresolvedStack` if the stack was never provisioned.
    /// - `MissingOutput` if the stack never published `output`.
    /// - `TransientLookup` if the state could not be read within the retry budget.
    /// - `Backend` for permanent backend failures.
    pub async fn resolve_output(&self, stack: &StackId, output: &str) -> Result<OutputValue, StackGraphError> {
        if let Some(pending) = self.live.as_ref().and_then(|live| live.lookup(stack)) {
            debug!(stack = %stack, output, "Output pending on live stack");
            let upstream = stack.clone();
            let name = output.to_string();
            let consumed = Arc::clone(&self.consumed);
            let value = pending.try_map(move |snapshot| match snapshot.get(&name) {
                Some(published) => {
                    consumed
                        .lock()
                        .insert((upstream, name), published.revision);
                    Ok(published.value.clone())
                }
                None => Err(DeferredError::Resolution(ResolutionError::MissingOutput {
                    stack: upstream,
                    output: name,
                })),
            });
            return Ok(OutputValue::Pending(value));
        }

        let snapshot = self.snapshot(stack).await?;
        match snapshot.get(output) {
            Some(published) => {
                self.consumed
                    .lock()
                    .insert((stack.clone(), output.to_string()), published.revision);
                debug!(stack = %stack, output, revision = published.revision, "Resolved output");
                Ok(OutputValue::Resolved(published.value.clone()))
            }
            None => Err(ResolutionError::MissingOutput {
                stack: stack.clone(),
                output: output.to_string(),
            }
            .into()),
        }
    }

    /// Returns the snapshot of a stack, reading it on first use.
    ///
    /// # Errors
    ///
    /// See [`OutputResolver::resolve_output`].
    pub async fn snapshot(&self, stack: &StackId) -> Result<Arc<StackSnapshot>, StackGraphError> {
        if let Some(cached) = self.snapshots.get(stack) {
            return Ok(Arc::clone(cached.value()));
        }

        let key = stack.to_string();
        let read = with_retry_if(
            &self.retry,
            &key,
            || self.backend.read(stack),
            BackendError::is_transient,
        )
        .await;

        match read {
            Ok(Some(state)) => {
                let snapshot = Arc::new(state.snapshot());
                let entry = self
                    .snapshots
                    .entry(stack.clone())
                    .or_insert(snapshot);
                Ok(Arc::clone(entry.value()))
            }
            Ok(None) => Err(ResolutionError::UnresolvedStack {
                stack: stack.clone(),
            }
            .into()),
            Err(RetryExhausted { error, attempts }) if error.is_transient() => {
                warn!(stack = %stack, attempts, error = %error, "State lookup retries exhausted");
                Err(ResolutionError::TransientLookup {
                    stack: stack.clone(),
                    message: error.to_string(),
                    attempts,
                }
                .into())
            }
            Err(RetryExhausted { error, .. }) => Err(error.into()),
        }
    }

    /// Fails if `consumer` reading from `upstream` would close a cycle.
    ///
    /// Walks the persisted `consumed` records of `upstream` and its own
    /// upstreams. A live stack is followed through the references its
    /// program declares instead of its persisted state. Stacks without
    /// state end the walk.
    ///
    /// # Errors
    ///
    /// Returns `CyclicDependency` with the stack path, or a lookup error.
    pub async fn check_cycle(&self, consumer: &StackId, upstream: &StackId) -> Result<(), StackGraphError> {
        let mut parent: HashMap<StackId, StackId> = HashMap::new();
        let mut queue = VecDeque::from([upstream.clone()]);
        parent.insert(upstream.clone(), consumer.clone());

        while let Some(current) = queue.pop_front() {
            if &current == consumer {
                let mut path = vec![consumer.to_string()];
                let mut node = current;
                let mut back = Vec::new();
                while let Some(prev) = parent.get(&node) {
                    if prev == consumer {
                        break;
                    }
                    back.push(prev.to_string());
                    node = prev.clone();
                }
                back.reverse();
                path.extend(back);
                path.push(consumer.to_string());
                return Err(CycleDetectedError::new(CycleScope::Stacks, path).into());
            }

            let upstreams = match self.live.as_ref().and_then(|live| live.declared_upstream(&current)) {
                Some(declared) => declared,
                None => match self.snapshot(&current).await {
                    Ok(snapshot) => snapshot.upstream.clone(),
                    Err(StackGraphError::Resolution(ResolutionError::UnresolvedStack { .. })) => continue,
                    Err(err) => return Err(err),
                },
            };

            for next in &upstreams {
                if !parent.contains_key(next) {
                    parent.insert(next.clone(), current.clone());
                    queue.push_back(next.clone());
                }
            }
        }

        Ok(())
    }

    /// Every output read so far with the revision observed.
    #[must_use]
    pub fn consumed_outputs(&self) -> Vec<ConsumedOutput> {
        self.consumed
            .lock()
            .iter()
            .map(|((stack, output), revision)| ConsumedOutput {
                stack: stack.clone(),
                output: output.clone(),
                revision: *revision,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::JitterStrategy;
    use crate::state::{InMemoryStateBackend, MockStateBackend, StackState};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn stack(s: &str) -> StackId {
        s.parse().unwrap()
    }

    fn fast_retry(attempts: usize) -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(attempts)
            .with_base_delay_ms(1)
            .with_jitter(JitterStrategy::None)
    }

    fn published(id: &str, outputs: &[(&str, Value)]) -> StackState {
        let mut state = StackState::new(stack(id));
        state.revision = 1;
        for (name, value) in outputs {
            state.publish_output(name, value.clone(), 1);
        }
        state
    }

    fn consuming(id: &str, upstream: &str) -> StackState {
        let mut state = published(id, &[]);
        state.consumed.push(ConsumedOutput {
            stack: stack(upstream),
            output: "x".into(),
            revision: 1,
        });
        state
    }

    #[tokio::test]
    async fn test_resolves_published_output_and_records_revision() {
        let backend = Arc::new(InMemoryStateBackend::with_states([published(
            "mirrorboards/actaboards-api-db-postgres/dev",
            &[("ConnectionSecretName", json!("pg-app"))],
        )]));
        let resolver = OutputResolver::new(backend, fast_retry(1));
        let db = stack("mirrorboards/actaboards-api-db-postgres/dev");

        let value = resolver
            .resolve_output(&db, "ConnectionSecretName")
            .await
            .unwrap();
        assert_eq!(value.as_resolved(), Some(&json!("pg-app")));
        assert_eq!(
            resolver.consumed_outputs(),
            vec![ConsumedOutput {
                stack: db,
                output: "ConnectionSecretName".into(),
                revision: 1
            }]
        );
    }

    #[tokio::test]
    async fn test_missing_output_never_defaults() {
        let backend = Arc::new(InMemoryStateBackend::with_states([published("acme/db/dev", &[])]));
        let resolver = OutputResolver::new(backend, fast_retry(1));

        let err = resolver
            .resolve_output(&stack("acme/db/dev"), "DatabaseName")
            .await
            .unwrap_err();
        assert_eq!(
            err.as_resolution(),
            Some(&ResolutionError::MissingOutput {
                stack: stack("acme/db/dev"),
                output: "DatabaseName".into()
            })
        );
    }

    #[tokio::test]
    async fn test_unprovisioned_stack_is_unresolved() {
        let resolver = OutputResolver::new(Arc::new(InMemoryStateBackend::new()), fast_retry(3));
        let err = resolver
            .resolve_output(&stack("acme/db/dev"), "DatabaseName")
            .await
            .unwrap_err();
        assert!(matches!(
            err.as_resolution(),
            Some(ResolutionError::UnresolvedStack { .. })
        ));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let mut backend = MockStateBackend::new();
        let mut seq = mockall::Sequence::new();
        backend
            .expect_read()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Err(BackendError::Transient("connection reset".into())));
        backend
            .expect_read()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(published("acme/db/dev", &[("DatabaseName", json!("actaboards"))]))));

        let resolver = OutputResolver::new(Arc::new(backend), fast_retry(4));
        let value = resolver
            .resolve_output(&stack("acme/db/dev"), "DatabaseName")
            .await
            .unwrap();
        assert_eq!(value.as_resolved(), Some(&json!("actaboards")));
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_into_transient_lookup() {
        let mut backend = MockStateBackend::new();
        backend
            .expect_read()
            .times(3)
            .returning(|_| Err(BackendError::Transient("timeout".into())));

        let resolver = OutputResolver::new(Arc::new(backend), fast_retry(3));
        let err = resolver
            .resolve_output(&stack("acme/db/dev"), "DatabaseName")
            .await
            .unwrap_err();
        assert!(matches!(
            err.as_resolution(),
            Some(ResolutionError::TransientLookup { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let mut backend = MockStateBackend::new();
        backend
            .expect_read()
            .times(1)
            .returning(|_| Err(BackendError::Permanent("access denied".into())));

        let resolver = OutputResolver::new(Arc::new(backend), fast_retry(5));
        let err = resolver
            .snapshot(&stack("acme/db/dev"))
            .await
            .unwrap_err();
        assert!(matches!(err, StackGraphError::Backend(BackendError::Permanent(_))));
    }

    #[tokio::test]
    async fn test_snapshot_is_read_once_per_run() {
        let mut backend = MockStateBackend::new();
        backend
            .expect_read()
            .times(1)
            .returning(|_| Ok(Some(published("acme/db/dev", &[("A", json!(1)), ("B", json!(2))]))));

        let resolver = OutputResolver::new(Arc::new(backend), fast_retry(1));
        let db = stack("acme/db/dev");
        resolver.resolve_output(&db, "A").await.unwrap();
        resolver.resolve_output(&db, "B").await.unwrap();
        assert_eq!(resolver.consumed_outputs().len(), 2);
    }

    #[tokio::test]
    async fn test_live_stack_returns_pending_value() {
        let live = Arc::new(LiveStacks::new());
        let db = stack("acme/db/dev");
        live.register(&db, std::collections::BTreeSet::new());
        let resolver = OutputResolver::new(Arc::new(InMemoryStateBackend::new()), fast_retry(1))
            .with_live(Arc::clone(&live));

        let value = resolver.resolve_output(&db, "DatabaseName").await.unwrap();
        assert!(value.is_pending());

        live.publish(&db, Arc::new(published("acme/db/dev", &[("DatabaseName", json!("app"))]).snapshot()));
        assert_eq!(value.resolve().await.unwrap(), json!("app"));
        assert_eq!(resolver.consumed_outputs()[0].revision, 1);
    }

    #[tokio::test]
    async fn test_check_cycle_follows_consumed_records() {
        // db consumed from api; api now wants to read db.
        let backend = Arc::new(InMemoryStateBackend::with_states([
            consuming("acme/db/dev", "acme/api/dev"),
            published("acme/api/dev", &[]),
        ]));
        let resolver = OutputResolver::new(backend, fast_retry(1));

        let err = resolver
            .check_cycle(&stack("acme/api/dev"), &stack("acme/db/dev"))
            .await
            .unwrap_err();
        match err {
            StackGraphError::CyclicDependency(e) => {
                assert_eq!(e.scope, CycleScope::Stacks);
                assert_eq!(e.cycle_path, vec!["acme/api/dev", "acme/db/dev", "acme/api/dev"]);
            }
            other => panic!("unexpected error: {other}"),
        }

        resolver
            .check_cycle(&stack("acme/web/dev"), &stack("acme/db/dev"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_check_cycle_follows_declared_references_of_live_stacks() {
        // c persisted reading a; a is live and reads b; b wants to read c.
        let backend = Arc::new(InMemoryStateBackend::with_states([
            published("acme/a/dev", &[]),
            consuming("acme/c/dev", "acme/a/dev"),
        ]));
        let live = Arc::new(LiveStacks::new());
        live.register(&stack("acme/a/dev"), std::collections::BTreeSet::from([stack("acme/b/dev")]));
        live.register(&stack("acme/b/dev"), std::collections::BTreeSet::from([stack("acme/c/dev")]));
        let resolver = OutputResolver::new(backend, fast_retry(1)).with_live(live);

        let err = resolver
            .check_cycle(&stack("acme/b/dev"), &stack("acme/c/dev"))
            .await
            .unwrap_err();
        match err {
            StackGraphError::CyclicDependency(e) => assert_eq!(
                e.cycle_path,
                vec!["acme/b/dev", "acme/c/dev", "acme/a/dev", "acme/b/dev"]
            ),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_self_reference_is_a_cycle() {
        let resolver = OutputResolver::new(Arc::new(InMemoryStateBackend::new()), fast_retry(1));
        let api = stack("acme/api/dev");
        let err = resolver.check_cycle(&api, &api).await.unwrap_err();
        assert!(matches!(err, StackGraphError::CyclicDependency(_)));
    }
}
