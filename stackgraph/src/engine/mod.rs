//! Stack runs and workspace runs.
//!
//! [`Engine`] applies one stack program: it resolves the program's output
//! references, realizes its resources, then persists outputs and resource
//! records. [`Workspace`] applies several programs at once, ordering them by
//! the outputs they read from each other.

mod config;
#[allow(clippy::module_inception)]
mod engine;
mod workspace;


pub use config::{EngineConfig, ENV_PARALLELISM, ENV_REFRESH, ENV_STATE_DIR};
pub use engine::{DestroyReport, Engine, PlannedResource, StackPreview, StackReport, StaleReference};
pub use workspace::{Workspace, WorkspaceReport};
