//! The state backend trait and its in-memory implementation.

use super::StackState;
use crate::errors::BackendError;
use crate::stack::StackId;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Storage for per-stack state records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Reads the state of a stack. `None` means it was never provisioned.
    async fn read(&self, stack: &StackId) -> Result<Option<StackState>, BackendError>;

    /// Writes the state of a stack, replacing any previous record.
    async fn write(&self, state: &StackState) -> Result<(), BackendError>;

    /// Deletes the state of a stack. Returns whether a record existed.
    async fn delete(&self, stack: &StackId) -> Result<bool, BackendError>;

    /// Lists every stack with a state record.
    async fn list(&self) -> Result<Vec<StackId>, BackendError>;
}

/// A process-local backend for tests and embedding.
#[derive(Debug, Default)]
pub struct InMemoryStateBackend {
    states: RwLock<HashMap<StackId, StackState>>,
}

impl InMemoryStateBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend seeded with the given records.
    #[must_use]
    pub fn with_states(states: impl IntoIterator<Item = StackState>) -> Self {
        let backend = Self::new();
        {
            let mut map = backend.states.write();
            for state in states {
                map.insert(state.stack.clone(), state);
            }
        }
        backend
    }

    /// Returns the number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }

    /// Returns a copy of a stored record without going through the trait.
    #[must_use]
    pub fn get(&self, stack: &StackId) -> Option<StackState> {
        self.states.read().get(stack).cloned()
    }
}

#[async_trait]
impl StateBackend for InMemoryStateBackend {
    async fn read(&self, stack: &StackId) -> Result<Option<StackState>, BackendError> {
        Ok(self.states.read().get(stack).cloned())
    }

    async fn write(&self, state: &StackState) -> Result<(), BackendError> {
        self.states
            .write()
            .insert(state.stack.clone(), state.clone());
        Ok(())
    }

    async fn delete(&self, stack: &StackId) -> Result<bool, BackendError> {
        Ok(self.states.write().remove(stack).is_some())
    }

    async fn list(&self) -> Result<Vec<StackId>, BackendError> {
        let mut stacks: Vec<StackId> = self.states.read().keys().cloned().collect();
        stacks.sort();
        Ok(stacks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn stack(s: &str) -> StackId {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_in_memory_round_trip() {
        let backend = InMemoryStateBackend::new();
        let id = stack("acme/db/dev");
        assert_eq!(backend.read(&id).await.unwrap(), None);

        let mut state = StackState::new(id.clone());
        state.revision = 1;
        backend.write(&state).await.unwrap();

        assert_eq!(backend.read(&id).await.unwrap(), Some(state));
        assert_eq!(backend.list().await.unwrap(), vec![id.clone()]);
        assert!(backend.delete(&id).await.unwrap());
        assert!(!backend.delete(&id).await.unwrap());
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_list_is_sorted() {
        let backend = InMemoryStateBackend::with_states([
            StackState::new(stack("acme/web/dev")),
            StackState::new(stack("acme/api/dev")),
        ]);
        assert_eq!(
            backend.list().await.unwrap(),
            vec![stack("acme/api/dev"), stack("acme/web/dev")]
        );
        assert_eq!(backend.len(), 2);
    }
}
