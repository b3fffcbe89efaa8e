//! Stacks: identifiers, the declaration context and naming helpers.

mod context;
mod id;
mod naming;

pub use context::{StackContext, StackProgram};
pub(crate) use context::{OutputReference, StackDefinition};
pub use id::StackId;
pub use naming::ResourceNamer;
