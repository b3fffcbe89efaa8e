//! # Stackgraph
//!
//! Cross-stack output resolution and dependency-ordered provisioning.
//!
//! A stack program declares resources, reads outputs published by other
//! stacks and publishes outputs of its own. The engine:
//!
//! - **Resolves references**: every cross-stack output a program reads is
//!   looked up before any resource is touched; missing stacks or outputs
//!   abort the run
//! - **Orders resources**: explicit predecessors and deferred outputs used
//!   inside property bags become graph edges, applied in topological order
//!   with bounded parallelism
//! - **Propagates failures**: a failed resource skips everything that
//!   depends on it while independent resources still complete
//! - **Persists state**: outputs, resource records and consumed upstream
//!   revisions are written through a pluggable state backend
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stackgraph::prelude::*;
//!
//! let engine = Engine::new(Arc::new(InMemoryStateBackend::new()), Arc::new(EchoProvider));
//! let db: StackId = "acme/db/dev".parse()?;
//!
//! let report = engine
//!     .apply_stack(&db, &|ctx: &mut StackContext| {
//!         let secret = ctx.declare_resource("kubernetes:core/v1:Secret", "secret", Property::map([("name", "db-app")]), &[])?;
//!         ctx.publish_output("ConnectionSecretName", secret.output("name"));
//!         Ok(())
//!     })
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod core;
pub mod engine;
pub mod errors;
pub mod events;
pub mod graph;
pub mod observability;
pub mod provider;
pub mod resolver;
pub mod stack;
pub mod state;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::core::{Deferred, OutputMap, PlannedChange, Property, ResourceId, ResourceStatus};
    pub use crate::engine::{
        DestroyReport, Engine, EngineConfig, StackPreview, StackReport, StaleReference, Workspace,
        WorkspaceReport,
    };
    pub use crate::errors::{
        BackendError, CycleDetectedError, DeferredError, GraphValidationError, ResolutionError,
        ResourceApplyError, StackGraphError,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::graph::{AppliedState, ResourceDeclaration, ResourceHandle};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::provider::{ApplyRequest, DeleteRequest, EchoProvider, ResourceProvider};
    pub use crate::resolver::{OutputResolver, OutputValue, RetryConfig};
    pub use crate::stack::{ResourceNamer, StackContext, StackId, StackProgram};
    pub use crate::state::{FileStateBackend, InMemoryStateBackend, StackState, StateBackend};
}
