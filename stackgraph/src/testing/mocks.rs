//! Mock providers for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::core::OutputMap;
use crate::provider::{ApplyRequest, DeleteRequest, ResourceProvider};

/// A provider that records every call and can be told to fail or stall.
///
/// Successful applies echo the top-level properties and add `id`
/// (the resource name) and `uid` (`<stack>:<resource>`).
#[derive(Debug, Default)]
pub struct MockProvider {
    failing: HashSet<String>,
    failing_deletes: HashSet<String>,
    interruptible: HashSet<String>,
    delay: Option<Duration>,
    delays: HashMap<String, Duration>,
    extra_outputs: HashMap<String, OutputMap>,
    requests: Mutex<Vec<ApplyRequest>>,
    applied: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
    current: AtomicUsize,
    max_seen: AtomicUsize,
}

struct InFlight<'a> {
    current: &'a AtomicUsize,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockProvider {
    /// Creates a provider that succeeds immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails applies of the named resource.
    #[must_use]
    pub fn failing_on(mut self, resource: impl Into<String>) -> Self {
        self.failing.insert(resource.into());
        self
    }

    /// Fails deletes of the named resource.
    #[must_use]
    pub fn failing_delete_on(mut self, resource: impl Into<String>) -> Self {
        self.failing_deletes.insert(resource.into());
        self
    }

    /// Delays every apply.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Delays applies of one resource.
    #[must_use]
    pub fn with_resource_delay(mut self, resource: impl Into<String>, delay: Duration) -> Self {
        self.delays.insert(resource.into(), delay);
        self
    }

    /// Marks a kind as interruptible on cancellation.
    #[must_use]
    pub fn interruptible(mut self, kind: impl Into<String>) -> Self {
        self.interruptible.insert(kind.into());
        self
    }

    /// Adds an output reported for one resource.
    #[must_use]
    pub fn with_output(
        mut self,
        resource: impl Into<String>,
        name: impl Into<String>,
        value: Value,
    ) -> Self {
        self.extra_outputs
            .entry(resource.into())
            .or_default()
            .insert(name.into(), value);
        self
    }

    /// Names of successfully applied resources, in completion order.
    #[must_use]
    pub fn applied(&self) -> Vec<String> {
        self.applied.lock().clone()
    }

    /// Names of deleted resources, in call order.
    #[must_use]
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }

    /// Every apply request received, including failed ones.
    #[must_use]
    pub fn requests(&self) -> Vec<ApplyRequest> {
        self.requests.lock().clone()
    }

    /// The last request received for a resource.
    #[must_use]
    pub fn request_for(&self, resource: &str) -> Option<ApplyRequest> {
        self.requests
            .lock()
            .iter()
            .rev()
            .find(|r| r.resource.as_str() == resource)
            .cloned()
    }

    /// The highest number of concurrent applies observed.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.max_seen.load(Ordering::SeqCst)
    }

    /// Clears recorded calls.
    pub fn reset(&self) {
        self.requests.lock().clear();
        self.applied.lock().clear();
        self.deleted.lock().clear();
        self.max_seen.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl ResourceProvider for MockProvider {
    async fn apply(&self, request: &ApplyRequest) -> anyhow::Result<OutputMap> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight {
            current: &self.current,
        };
        self.requests.lock().push(request.clone());

        let name = request.resource.as_str();
        if let Some(delay) = self.delays.get(name).copied().or(self.delay) {
            tokio::time::sleep(delay).await;
        }

        if self.failing.contains(name) {
            anyhow::bail!("simulated failure applying {name}");
        }

        let mut outputs = OutputMap::new();
        if let Value::Object(map) = &request.properties {
            outputs.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        outputs.insert("id".to_string(), Value::String(name.to_string()));
        outputs.insert(
            "uid".to_string(),
            Value::String(format!("{}:{name}", request.stack)),
        );
        if let Some(extra) = self.extra_outputs.get(name) {
            outputs.extend(extra.clone());
        }

        self.applied.lock().push(name.to_string());
        Ok(outputs)
    }

    async fn delete(&self, request: &DeleteRequest) -> anyhow::Result<()> {
        let name = request.resource.as_str();
        if self.failing_deletes.contains(name) {
            anyhow::bail!("simulated failure deleting {name}");
        }
        self.deleted.lock().push(name.to_string());
        Ok(())
    }

    fn supports_interruption(&self, kind: &str) -> bool {
        self.interruptible.contains(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ResourceId;
    use serde_json::json;

    fn request(name: &str) -> ApplyRequest {
        ApplyRequest {
            stack: "acme/api/dev".parse().unwrap(),
            resource: ResourceId::new(name),
            kind: "test:Resource".into(),
            scope: None,
            properties: json!({"replicas": 2}),
            previous_outputs: None,
        }
    }

    #[tokio::test]
    async fn test_mock_provider_echoes_and_records() {
        let provider = MockProvider::new().with_output("db", "host", json!("pg.local"));
        let outputs = provider.apply(&request("db")).await.unwrap();

        assert_eq!(outputs["replicas"], json!(2));
        assert_eq!(outputs["uid"], json!("acme/api/dev:db"));
        assert_eq!(outputs["host"], json!("pg.local"));
        assert_eq!(provider.applied(), vec!["db".to_string()]);
        assert_eq!(provider.max_concurrency(), 1);
        assert!(provider.request_for("db").is_some());
    }

    #[tokio::test]
    async fn test_mock_provider_failures() {
        let provider = MockProvider::new()
            .failing_on("db")
            .failing_delete_on("db");
        assert!(provider.apply(&request("db")).await.is_err());
        assert!(provider.applied().is_empty());
        assert_eq!(provider.requests().len(), 1);

        let delete = DeleteRequest {
            stack: "acme/api/dev".parse().unwrap(),
            resource: ResourceId::new("db"),
            kind: "test:Resource".into(),
            scope: None,
            outputs: OutputMap::new(),
        };
        assert!(provider.delete(&delete).await.is_err());
        provider.reset();
        assert!(provider.requests().is_empty());
    }
}
