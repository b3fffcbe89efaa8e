//! Core value types shared by the graph, the resolver and the engine.
//!
//! This module contains:
//! - Resource status and planned-change enums
//! - Resource identifiers
//! - `Deferred<T>` values and `Property` bags

mod deferred;
mod id;
mod property;
mod status;

pub use deferred::Deferred;
pub use id::ResourceId;
pub use property::Property;
pub use status::{PlannedChange, ResourceStatus};

/// Output properties reported by a provider for one resource.
pub type OutputMap = std::collections::BTreeMap<String, serde_json::Value>;
