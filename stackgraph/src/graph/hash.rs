//! Spec hashing for unchanged detection.

use crate::core::ResourceId;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// Hashes the resolved specification of a resource.
///
/// Covers kind, name, scope and properties. `serde_json` objects keep their
/// keys sorted, so equal specs always serialize identically.
#[must_use]
pub fn spec_hash(kind: &str, id: &ResourceId, scope: Option<&str>, properties: &Value) -> String {
    let canonical = json!({
        "kind": kind,
        "name": id.as_str(),
        "scope": scope,
        "properties": properties,
    });

    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable_across_key_order() {
        let id = ResourceId::new("deployment");
        let a: Value = serde_json::from_str(r#"{"replicas":1,"image":"nginx"}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"image":"nginx","replicas":1}"#).unwrap();
        assert_eq!(
            spec_hash("Deployment", &id, Some("api"), &a),
            spec_hash("Deployment", &id, Some("api"), &b)
        );
        assert_eq!(spec_hash("Deployment", &id, None, &a).len(), 64);
    }

    #[test]
    fn test_hash_changes_with_scope_and_properties() {
        let id = ResourceId::new("deployment");
        let props = json!({"replicas": 1});
        let base = spec_hash("Deployment", &id, Some("api"), &props);
        assert_ne!(base, spec_hash("Deployment", &id, Some("web"), &props));
        assert_ne!(base, spec_hash("Deployment", &id, Some("api"), &json!({"replicas": 2})));
    }
}
