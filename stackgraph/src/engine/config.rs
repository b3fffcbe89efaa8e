//! Engine configuration.

use crate::errors::StackGraphError;
use crate::resolver::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Overrides `max_parallelism`.
pub const ENV_PARALLELISM: &str = "STACKGRAPH_PARALLELISM";
/// Overrides `state_dir`.
pub const ENV_STATE_DIR: &str = "STACKGRAPH_STATE_DIR";
/// Overrides `refresh`.
pub const ENV_REFRESH: &str = "STACKGRAPH_REFRESH";

/// Configuration for provisioning runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum provider calls in flight per stack.
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,
    /// Retry policy for state lookups.
    #[serde(default)]
    pub lookup_retry: RetryConfig,
    /// Re-apply resources whose spec did not change.
    #[serde(default)]
    pub refresh: bool,
    /// Delete recorded resources that are no longer declared.
    #[serde(default = "default_prune")]
    pub prune: bool,
    /// Root directory of the file state backend.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_max_parallelism() -> usize {
    16
}

fn default_prune() -> bool {
    true
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".stackgraph/state")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallelism: default_max_parallelism(),
            lookup_retry: RetryConfig::default(),
            refresh: false,
            prune: default_prune(),
            state_dir: default_state_dir(),
        }
    }
}

impl EngineConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a configuration from a JSON file and validates it.
    ///
    /// # Errors
    ///
    /// Returns `Io`, `Serialization` or `Config` errors.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, StackGraphError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `Config` if a variable is set but malformed.
    pub fn from_env(self) -> Result<Self, StackGraphError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from a variable lookup.
    ///
    /// # Errors
    ///
    /// Returns `Config` if a variable is set but malformed.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, StackGraphError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_PARALLELISM) {
            self.max_parallelism = raw.trim().parse().map_err(|_| {
                StackGraphError::Config(format!("{ENV_PARALLELISM} must be a positive integer, got '{raw}'"))
            })?;
        }
        if let Some(raw) = lookup(ENV_STATE_DIR) {
            self.state_dir = PathBuf::from(raw);
        }
        if let Some(raw) = lookup(ENV_REFRESH) {
            self.refresh = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" | "" => false,
                _ => {
                    return Err(StackGraphError::Config(format!(
                        "{ENV_REFRESH} must be a boolean, got '{raw}'"
                    )))
                }
            };
        }
        self.validate()?;
        Ok(self)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns `Config` for a zero parallelism or zero lookup attempts.
    pub fn validate(&self) -> Result<(), StackGraphError> {
        if self.max_parallelism == 0 {
            return Err(StackGraphError::Config(
                "max_parallelism must be at least 1".to_string(),
            ));
        }
        if self.lookup_retry.max_attempts == 0 {
            return Err(StackGraphError::Config(
                "lookup_retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Sets the parallelism bound.
    #[must_use]
    pub fn with_max_parallelism(mut self, max_parallelism: usize) -> Self {
        self.max_parallelism = max_parallelism;
        self
    }

    /// Sets the lookup retry policy.
    #[must_use]
    pub fn with_lookup_retry(mut self, retry: RetryConfig) -> Self {
        self.lookup_retry = retry;
        self
    }

    /// Sets refresh mode.
    #[must_use]
    pub fn with_refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    /// Enables or disables pruning.
    #[must_use]
    pub fn with_prune(mut self, prune: bool) -> Self {
        self.prune = prune;
        self
    }

    /// Sets the state directory.
    #[must_use]
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_parallelism, 16);
        assert_eq!(config.lookup_retry.max_attempts, 4);
        assert!(!config.refresh);
        assert!(config.prune);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_parallelism": 4, "lookup_retry": {{"max_attempts": 2}}}}"#).unwrap();

        let config = EngineConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.max_parallelism, 4);
        assert_eq!(config.lookup_retry.max_attempts, 2);
        assert_eq!(config.lookup_retry.base_delay_ms, 200);
        assert!(config.prune);
    }

    #[test]
    fn test_from_json_file_rejects_zero_parallelism() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_parallelism": 0}}"#).unwrap();
        assert!(matches!(
            EngineConfig::from_json_file(file.path()),
            Err(StackGraphError::Config(_))
        ));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (ENV_PARALLELISM, "2"),
            (ENV_STATE_DIR, "/var/lib/stackgraph"),
            (ENV_REFRESH, "true"),
        ]);
        let config = EngineConfig::default()
            .with_overrides(|k| vars.get(k).map(|v| (*v).to_string()))
            .unwrap();

        assert_eq!(config.max_parallelism, 2);
        assert_eq!(config.state_dir, PathBuf::from("/var/lib/stackgraph"));
        assert!(config.refresh);
    }

    #[test]
    fn test_malformed_override_is_rejected() {
        let result = EngineConfig::default().with_overrides(|k| {
            (k == ENV_REFRESH).then(|| "sometimes".to_string())
        });
        assert!(matches!(result, Err(StackGraphError::Config(_))));

        let result = EngineConfig::default().with_overrides(|k| {
            (k == ENV_PARALLELISM).then(|| "0".to_string())
        });
        assert!(matches!(result, Err(StackGraphError::Config(_))));
    }
}
