//! Persisted stack state and the backends that store it.

mod backend;
mod file;
mod model;

pub use backend::{InMemoryStateBackend, StateBackend};
#[cfg(test)]
pub use backend::MockStateBackend;
pub use file::FileStateBackend;
pub use model::{
    ConsumedOutput, PublishEffect, PublishedOutput, ResourceRecord, StackSnapshot, StackState,
};
