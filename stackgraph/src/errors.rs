//! Error types for stack graph resolution and provisioning.
//!
//! The taxonomy separates failures that abort a stack before any resource is
//! touched (resolution, cycles, validation) from failures that happen while
//! realizing resources (`ResourceApplyError`), which are recorded per resource
//! and propagate to successors as skips.

use crate::stack::StackId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// The main error type for stackgraph operations.
#[derive(Debug, Error)]
pub enum StackGraphError {
    /// A cross-stack output reference could not be resolved.
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// The resource or stack graph contains a cycle.
    #[error("{0}")]
    CyclicDependency(#[from] CycleDetectedError),

    /// A provider failed to realize a resource.
    #[error("{0}")]
    ResourceApply(#[from] ResourceApplyError),

    /// A declaration was rejected while building the graph.
    #[error("{0}")]
    Validation(#[from] GraphValidationError),

    /// A stack identifier could not be parsed.
    #[error("Invalid stack id '{input}': {reason}")]
    InvalidStackId {
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A deferred value could not be resolved.
    #[error("{0}")]
    Deferred(#[from] DeferredError),

    /// The state backend failed.
    #[error("{0}")]
    Backend(#[from] BackendError),

    /// A stack run was cancelled before every resource was realized.
    #[error("Apply cancelled: {0}")]
    Cancelled(String),

    /// The engine configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StackGraphError {
    /// Creates an invalid stack id error.
    #[must_use]
    pub fn invalid_stack_id(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidStackId {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Returns the resolution error if this error came from an output lookup.
    #[must_use]
    pub fn as_resolution(&self) -> Option<&ResolutionError> {
        match self {
            Self::Resolution(err) => Some(err),
            Self::Deferred(DeferredError::Resolution(err)) => Some(err),
            _ => None,
        }
    }
}

/// Failures of `resolve_output` and of output references.
///
/// Cloneable so the same failure can be observed by every consumer of a
/// shared deferred value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    /// The target stack has never been provisioned.
    #[error("Stack '{stack}' has never been provisioned")]
    UnresolvedStack {
        /// The stack that was looked up.
        stack: StackId,
    },

    /// The stack exists but never published the output.
    #[error("Stack '{stack}' does not publish output '{output}'")]
    MissingOutput {
        /// The stack that was looked up.
        stack: StackId,
        /// The missing output name.
        output: String,
    },

    /// The stack state could not be read, and retries were exhausted.
    #[error("Transient failure reading stack '{stack}' after {attempts} attempt(s): {message}")]
    TransientLookup {
        /// The stack that was looked up.
        stack: StackId,
        /// The last backend message.
        message: String,
        /// How many lookups were attempted.
        attempts: usize,
    },

    /// An upstream stack applied in the same run failed before publishing.
    #[error("Upstream stack '{stack}' failed: {reason}")]
    UpstreamFailed {
        /// The upstream stack.
        stack: StackId,
        /// Why it failed.
        reason: String,
    },
}

impl ResolutionError {
    /// Returns the stack the failed lookup targeted.
    #[must_use]
    pub fn stack(&self) -> &StackId {
        match self {
            Self::UnresolvedStack { stack }
            | Self::MissingOutput { stack, .. }
            | Self::TransientLookup { stack, .. }
            | Self::UpstreamFailed { stack, .. } => stack,
        }
    }
}

/// Failures surfaced when awaiting a deferred value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeferredError {
    /// The producing resource failed, was skipped or was cancelled.
    #[error("Resource '{resource}' was not realized")]
    SourceUnavailable {
        /// The producing resource.
        resource: String,
    },

    /// The producing resource did not report the requested property.
    #[error("Resource '{resource}' has no output property '{property}'")]
    MissingProperty {
        /// The producing resource.
        resource: String,
        /// The requested property.
        property: String,
    },

    /// The value came from another stack and its lookup failed.
    #[error(transparent)]
    Resolution(ResolutionError),

    /// A value had an unexpected shape.
    #[error("Value conversion failed: {0}")]
    Conversion(String),

    /// A property waited on a value that no declared edge produces, such as
    /// the inner value of `Deferred::chain`.
    #[error("Resource '{resource}' reads a value that was not known when it was dispatched; declare its producer as a predecessor")]
    UndeclaredDependency {
        /// The resource whose properties were incomplete.
        resource: String,
    },
}

impl DeferredError {
    /// Converts into the top-level error, unwrapping resolution failures.
    #[must_use]
    pub fn into_stack_error(self) -> StackGraphError {
        match self {
            Self::Resolution(err) => StackGraphError::Resolution(err),
            other => StackGraphError::Deferred(other),
        }
    }
}

/// Errors reported by a state backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The state could not be read right now; retrying may succeed.
    #[error("State backend temporarily unavailable: {0}")]
    Transient(String),

    /// The backend failed permanently.
    #[error("State backend error: {0}")]
    Permanent(String),

    /// A stored state record could not be decoded.
    #[error("Corrupt state for stack '{stack}': {message}")]
    Corrupt {
        /// The stack whose record is corrupt.
        stack: StackId,
        /// Decoder message.
        message: String,
    },
}

impl BackendError {
    /// Returns true if the operation may succeed when retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Diagnostic metadata attached to graph errors.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ErrorInfo {
    /// Error code (e.g., "GRAPH-001-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when a declaration is rejected.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct GraphValidationError {
    /// The error message.
    pub message: String,
    /// The resources involved in the error.
    pub resources: Vec<String>,
    /// Optional diagnostic info.
    pub error_info: Option<ErrorInfo>,
}

impl GraphValidationError {
    /// Creates a new validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            resources: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the resources involved.
    #[must_use]
    pub fn with_resources(mut self, resources: Vec<String>) -> Self {
        self.resources = resources;
        self
    }

    /// Sets the diagnostic info.
    #[must_use]
    pub fn with_error_info(mut self, info: ErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Returns the error code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|info| info.code.as_str())
    }
}

/// Which graph a cycle was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleScope {
    /// Resources inside one stack.
    Resources,
    /// Stacks linked by output references.
    Stacks,
}

impl std::fmt::Display for CycleScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resources => write!(f, "resources"),
            Self::Stacks => write!(f, "stacks"),
        }
    }
}

/// Error raised when the dependency relation is not acyclic.
#[derive(Debug, Clone, Error)]
#[error("Cyclic dependency between {scope}: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// Which graph the cycle belongs to.
    pub scope: CycleScope,
    /// The path forming the cycle, first node repeated at the end.
    pub cycle_path: Vec<String>,
    /// Diagnostic info.
    pub error_info: ErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle error.
    #[must_use]
    pub fn new(scope: CycleScope, cycle_path: Vec<String>) -> Self {
        let info = ErrorInfo::new(
            "GRAPH-001-CYCLE",
            format!("Dependency cycle between {scope}: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("Remove one of the dependencies or output references in the cycle.");

        Self {
            scope,
            cycle_path,
            error_info: info,
        }
    }
}

/// A provider failure while realizing a resource.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("Failed to apply {kind} '{resource}': {message}")]
pub struct ResourceApplyError {
    /// The logical resource name.
    pub resource: String,
    /// The resource kind.
    pub kind: String,
    /// The provider message, including its cause chain.
    pub message: String,
}

impl ResourceApplyError {
    /// Creates a new apply error.
    #[must_use]
    pub fn new(
        resource: impl Into<String>,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            resource: resource.into(),
            kind: kind.into(),
            message: message.into(),
        }
    }
}
