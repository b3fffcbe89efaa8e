//! Tracing setup and per-run spans.
//!
//! Every scheduling decision is logged through `tracing` with structured
//! fields. Binaries embedding the engine call [`init_tracing`] once; the
//! filter honours `RUST_LOG` and defaults to `info`.

use crate::errors::StackGraphError;
use crate::stack::StackId;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// One JSON object per event, fields flattened.
    Json,
    /// Multi-line human readable output.
    Pretty,
    /// Single-line human readable output.
    #[default]
    Compact,
}

impl FromStr for LogFormat {
    type Err = StackGraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            other => Err(StackGraphError::Config(format!("unknown log format '{other}'"))),
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Returns `Config` if a global subscriber is already installed.
pub fn try_init_tracing(format: LogFormat) -> Result<(), StackGraphError> {
    let registry = tracing_subscriber::registry().with(env_filter());
    let result = match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().flatten_event(true).with_target(true))
            .try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
        LogFormat::Compact => registry.with(fmt::layer().compact()).try_init(),
    };
    result.map_err(|e| StackGraphError::Config(format!("failed to initialize tracing: {e}")))
}

/// Installs the global subscriber, ignoring a subscriber that is already set.
pub fn init_tracing(format: LogFormat) {
    if let Err(err) = try_init_tracing(format) {
        tracing::debug!(error = %err, "Tracing already initialized");
    }
}

/// The span every log line of one stack run is recorded in.
#[must_use]
pub fn stack_span(stack: &StackId) -> Span {
    tracing::info_span!(
        "stack_apply",
        stack = %stack,
        organization = stack.organization(),
        project = stack.project(),
        environment = stack.environment(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert!(matches!("xml".parse::<LogFormat>(), Err(StackGraphError::Config(_))));
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_tracing(LogFormat::Compact);
        init_tracing(LogFormat::Json);
        assert!(try_init_tracing(LogFormat::Pretty).is_err());
    }
}
