//! Kebab-case logical names built from a fixed prefix.

use std::fmt;

/// Builds resource names such as `actaboards-api-postgres`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNamer {
    prefix: Vec<String>,
}

impl ResourceNamer {
    /// Creates a namer from prefix segments. Empty segments are dropped.
    #[must_use]
    pub fn new<I, S>(prefix: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefix: prefix
                .into_iter()
                .map(Into::into)
                .filter(|s: &String| !s.is_empty())
                .collect(),
        }
    }

    /// Joins the prefix with `parts`.
    #[must_use]
    pub fn name(&self, parts: &[&str]) -> String {
        self.prefix
            .iter()
            .map(String::as_str)
            .chain(parts.iter().copied().filter(|p| !p.is_empty()))
            .collect::<Vec<_>>()
            .join("-")
    }

    /// Returns a namer with one more prefix segment.
    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut prefix = self.prefix.clone();
        let segment = segment.into();
        if !segment.is_empty() {
            prefix.push(segment);
        }
        Self { prefix }
    }
}

impl fmt::Display for ResourceNamer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.prefix.join("-"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_join_with_dashes() {
        let ns = ResourceNamer::new(["actaboards", "api"]);
        assert_eq!(ns.name(&["postgres"]), "actaboards-api-postgres");
        assert_eq!(
            ns.name(&["s3", "public-access-block"]),
            "actaboards-api-s3-public-access-block"
        );
        assert_eq!(ns.name(&[]), "actaboards-api");
        assert_eq!(ns.to_string(), "actaboards-api");
    }

    #[test]
    fn test_empty_segments_are_dropped() {
        let ns = ResourceNamer::new(["core-system", ""]);
        assert_eq!(ns.name(&["", "namespace"]), "core-system-namespace");
        assert_eq!(ns.child("db").name(&["secret"]), "core-system-db-secret");
    }
}
