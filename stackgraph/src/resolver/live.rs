//! Stacks being applied in the current workspace run.
//!
//! A consumer that references a live stack receives a pending snapshot which
//! completes when the upstream stack publishes, or fails with
//! `UpstreamFailed` when it does not.

use crate::core::Deferred;
use crate::errors::{DeferredError, ResolutionError};
use crate::stack::StackId;
use crate::state::StackSnapshot;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

type SnapshotResult = Result<Arc<StackSnapshot>, DeferredError>;

#[derive(Debug)]
struct LiveSlot {
    sender: Mutex<Option<oneshot::Sender<SnapshotResult>>>,
    snapshot: Deferred<Arc<StackSnapshot>>,
    upstream: BTreeSet<StackId>,
}

/// Registry of in-flight stacks and their eventual snapshots.
#[derive(Debug, Default)]
pub struct LiveStacks {
    stacks: DashMap<StackId, LiveSlot>,
}

impl LiveStacks {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a stack as being applied, with the stacks its program reads.
    /// Registering twice is a no-op.
    pub fn register(&self, stack: &StackId, upstream: BTreeSet<StackId>) {
        self.stacks.entry(stack.clone()).or_insert_with(|| {
            let (sender, receiver) = oneshot::channel::<SnapshotResult>();
            let pending_stack = stack.clone();
            let snapshot = Deferred::from_future(
                BTreeSet::new(),
                receiver.map(move |r| {
                    r.unwrap_or_else(|_| {
                        Err(DeferredError::Resolution(ResolutionError::UpstreamFailed {
                            stack: pending_stack,
                            reason: "stack finished without publishing".to_string(),
                        }))
                    })
                }),
            );
            LiveSlot {
                sender: Mutex::new(Some(sender)),
                snapshot,
                upstream,
            }
        });
    }

    /// Returns true if the stack is registered.
    #[must_use]
    pub fn is_live(&self, stack: &StackId) -> bool {
        self.stacks.contains_key(stack)
    }

    /// Returns the stacks a live stack's program reads from.
    #[must_use]
    pub fn declared_upstream(&self, stack: &StackId) -> Option<BTreeSet<StackId>> {
        self.stacks.get(stack).map(|slot| slot.upstream.clone())
    }

    /// Returns the pending snapshot of a live stack.
    #[must_use]
    pub fn lookup(&self, stack: &StackId) -> Option<Deferred<Arc<StackSnapshot>>> {
        self.stacks.get(stack).map(|slot| slot.snapshot.clone())
    }

    /// Completes a live stack with its published outputs.
    pub fn publish(&self, stack: &StackId, snapshot: Arc<StackSnapshot>) {
        debug!(stack = %stack, revision = snapshot.revision, "Live stack published");
        self.complete(stack, Ok(snapshot));
    }

    /// Completes a live stack with a failure.
    pub fn fail(&self, stack: &StackId, reason: impl Into<String>) {
        let reason = reason.into();
        debug!(stack = %stack, reason = %reason, "Live stack failed");
        self.complete(
            stack,
            Err(DeferredError::Resolution(ResolutionError::UpstreamFailed {
                stack: stack.clone(),
                reason,
            })),
        );
    }

    fn complete(&self, stack: &StackId, result: SnapshotResult) {
        if let Some(slot) = self.stacks.get(stack) {
            if let Some(sender) = slot.sender.lock().take() {
                let _ = sender.send(result);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn stack() -> StackId {
        "acme/db/dev".parse().unwrap()
    }

    #[tokio::test]
    async fn test_publish_completes_waiters() {
        let live = LiveStacks::new();
        live.register(&stack(), BTreeSet::new());
        let pending = live.lookup(&stack()).unwrap();
        assert!(pending.try_now().is_none());

        live.publish(
            &stack(),
            Arc::new(StackSnapshot {
                stack: stack(),
                revision: 1,
                outputs: BTreeMap::new(),
                upstream: BTreeSet::new(),
            }),
        );
        assert_eq!(pending.resolve().await.unwrap().revision, 1);
    }

    #[tokio::test]
    async fn test_fail_is_final() {
        let live = LiveStacks::new();
        let api: StackId = "acme/api/dev".parse().unwrap();
        live.register(&stack(), BTreeSet::from([api.clone()]));
        live.fail(&stack(), "resource 'cluster' failed");
        live.fail(&stack(), "second call ignored");

        let err = live.lookup(&stack()).unwrap().resolve().await.unwrap_err();
        assert_eq!(
            err,
            DeferredError::Resolution(ResolutionError::UpstreamFailed {
                stack: stack(),
                reason: "resource 'cluster' failed".to_string(),
            })
        );
        assert!(live.is_live(&stack()));
        assert_eq!(live.declared_upstream(&stack()), Some(BTreeSet::from([api])));
        assert!(live.lookup(&"acme/other/dev".parse().unwrap()).is_none());
    }
}
