//! The per-stack provisioning graph.
//!
//! Declarations are collected by a [`GraphBuilder`], frozen into a
//! [`ProvisioningGraph`] once every edge is known, and realized with
//! [`ProvisioningGraph::apply`].

mod builder;
mod dag;
mod hash;
mod resource;
mod topology;

pub use builder::GraphBuilder;
pub use dag::{AppliedState, ApplyOptions, ProvisioningGraph, ResourceOutcome};
pub use hash::spec_hash;
pub use resource::{ResourceDeclaration, ResourceHandle};
pub(crate) use topology::topological_order;
