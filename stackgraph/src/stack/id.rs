//! Typed stack identifiers.

use crate::errors::StackGraphError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

#[allow(clippy::expect_used)]
fn segment_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,99}$").expect("static pattern compiles")
    })
}

/// Identifies a stack as an `organization/project/environment` tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StackId {
    organization: String,
    project: String,
    environment: String,
}

impl StackId {
    /// Creates a stack id from its three segments.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStackId` if any segment is empty or contains characters
    /// other than ASCII alphanumerics, `.`, `_` and `-`.
    pub fn new(
        organization: impl Into<String>,
        project: impl Into<String>,
        environment: impl Into<String>,
    ) -> Result<Self, StackGraphError> {
        let id = Self {
            organization: organization.into(),
            project: project.into(),
            environment: environment.into(),
        };

        for (label, segment) in [
            ("organization", &id.organization),
            ("project", &id.project),
            ("environment", &id.environment),
        ] {
            if !segment_pattern().is_match(segment) {
                return Err(StackGraphError::invalid_stack_id(
                    id.to_string(),
                    format!("{label} segment '{segment}' is not a valid name"),
                ));
            }
        }

        Ok(id)
    }

    /// Returns the organization segment.
    #[must_use]
    pub fn organization(&self) -> &str {
        &self.organization
    }

    /// Returns the project segment.
    #[must_use]
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Returns the environment segment.
    #[must_use]
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Returns a sibling stack in the same organization and environment.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStackId` if `project` is not a valid segment.
    pub fn sibling(&self, project: impl Into<String>) -> Result<Self, StackGraphError> {
        Self::new(self.organization.clone(), project, self.environment.clone())
    }
}

impl fmt::Display for StackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.organization, self.project, self.environment)
    }
}

impl FromStr for StackId {
    type Err = StackGraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [organization, project, environment] => {
                Self::new(*organization, *project, *environment).map_err(|_| {
                    StackGraphError::invalid_stack_id(s, "segments must match [A-Za-z0-9][A-Za-z0-9._-]*")
                })
            }
            _ => Err(StackGraphError::invalid_stack_id(
                s,
                format!("expected organization/project/environment, got {} segment(s)", parts.len()),
            )),
        }
    }
}

impl TryFrom<String> for StackId {
    type Error = StackGraphError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StackId> for String {
    fn from(id: StackId) -> Self {
        id.to_string()
    }
}
