//! Deferred values: outputs that become known once their producer completes.
//!
//! A `Deferred<T>` wraps a shared future together with the set of resources
//! it waits on. The source set lets the graph builder turn every deferred
//! reference inside a property bag into an ordering edge; the shared future
//! lets any number of consumers await the same value without blocking a
//! worker thread.

use super::ResourceId;
use crate::errors::DeferredError;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;

/// A value that may not be known yet.
pub struct Deferred<T> {
    sources: BTreeSet<ResourceId>,
    inner: Shared<BoxFuture<'static, Result<T, DeferredError>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            sources: self.sources.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("sources", &self.sources)
            .finish_non_exhaustive()
    }
}

impl<T> Deferred<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates an already-known value.
    #[must_use]
    pub fn ready(value: T) -> Self {
        Self::from_future(BTreeSet::new(), future::ready(Ok(value)))
    }

    /// Creates a value that will never become known.
    #[must_use]
    pub fn failed(error: DeferredError) -> Self {
        Self::from_future(BTreeSet::new(), future::ready(Err(error)))
    }

    pub(crate) fn from_future<F>(sources: BTreeSet<ResourceId>, fut: F) -> Self
    where
        F: Future<Output = Result<T, DeferredError>> + Send + 'static,
    {
        Self {
            sources,
            inner: fut.boxed().shared(),
        }
    }

    /// Returns the resources this value waits on.
    #[must_use]
    pub fn sources(&self) -> &BTreeSet<ResourceId> {
        &self.sources
    }

    /// Waits for the value.
    pub async fn resolve(&self) -> Result<T, DeferredError> {
        self.inner.clone().await
    }

    /// Returns the value if it is already known, without waiting.
    #[must_use]
    pub fn try_now(&self) -> Option<Result<T, DeferredError>> {
        self.inner.clone().now_or_never()
    }

    /// Transforms the value once it is known.
    #[must_use]
    pub fn map<U, F>(self, f: F) -> Deferred<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        Deferred::from_future(self.sources, self.inner.map(move |r| r.map(f)))
    }

    /// Transforms the value with a fallible function.
    #[must_use]
    pub fn try_map<U, F>(self, f: F) -> Deferred<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Result<U, DeferredError> + Send + 'static,
    {
        Deferred::from_future(self.sources, self.inner.map(move |r| r.and_then(f)))
    }

    /// Continues with another deferred value computed from this one.
    ///
    /// Only this value's sources are known up front. Sources of the value
    /// returned by `f` do not become graph edges, so a resource whose
    /// properties chain onto an undeclared producer fails at dispatch.
    #[must_use]
    pub fn chain<U, F>(self, f: F) -> Deferred<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Deferred<U> + Send + 'static,
    {
        let Self { sources, inner } = self;
        Deferred::from_future(sources, async move {
            let value = inner.await?;
            f(value).inner.await
        })
    }

    /// Combines two values; the result waits on the sources of both.
    #[must_use]
    pub fn zip<U>(self, other: Deferred<U>) -> Deferred<(T, U)>
    where
        U: Clone + Send + Sync + 'static,
    {
        let mut sources = self.sources;
        sources.extend(other.sources);
        Deferred::from_future(sources, future::try_join(self.inner, other.inner))
    }

    /// Combines many values in order.
    #[must_use]
    pub fn all(items: impl IntoIterator<Item = Self>) -> Deferred<Vec<T>> {
        let mut sources = BTreeSet::new();
        let mut futures = Vec::new();
        for item in items {
            sources.extend(item.sources);
            futures.push(item.inner);
        }
        Deferred::from_future(sources, future::try_join_all(futures))
    }
}

impl Deferred<Value> {
    /// Narrows a JSON value to a string.
    #[must_use]
    pub fn into_string(self) -> Deferred<String> {
        self.try_map(|value| match value {
            Value::String(s) => Ok(s),
            other => Err(DeferredError::Conversion(format!(
                "expected a string, got {other}"
            ))),
        })
    }
}

impl Deferred<String> {
    /// Widens a string to a JSON value.
    #[must_use]
    pub fn into_value(self) -> Deferred<Value> {
        self.map(Value::String)
    }
}

impl<T> From<T> for Deferred<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn from(value: T) -> Self {
        Self::ready(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::sync::oneshot;

    fn pending(source: &str) -> (oneshot::Sender<String>, Deferred<String>) {
        let (tx, rx) = oneshot::channel::<String>();
        let resource = source.to_string();
        let deferred = Deferred::from_future(
            BTreeSet::from([ResourceId::new(source)]),
            rx.map(move |r| r.map_err(|_| DeferredError::SourceUnavailable { resource })),
        );
        (tx, deferred)
    }

    #[tokio::test]
    async fn test_ready_resolves_immediately() {
        let value = Deferred::ready(7_u32);
        assert_eq!(value.try_now(), Some(Ok(7)));
        assert_eq!(value.resolve().await, Ok(7));
        assert!(value.sources().is_empty());
    }

    #[tokio::test]
    async fn test_map_and_chain_keep_sources() {
        let (tx, name) = pending("namespace");
        let host = name
            .clone()
            .map(|ns| format!("dragonfly.{ns}.svc.cluster.local"));
        let chained = name.chain(|ns| Deferred::ready(ns.len()));

        assert_eq!(host.try_now(), None);
        assert!(host.sources().contains(&ResourceId::new("namespace")));

        tx.send("cache".to_string()).unwrap();
        assert_eq!(host.resolve().await.unwrap(), "dragonfly.cache.svc.cluster.local");
        assert_eq!(chained.resolve().await, Ok(5));
    }

    #[tokio::test]
    async fn test_zip_and_all_union_sources() {
        let (tx_a, a) = pending("a");
        let (tx_b, b) = pending("b");
        let both = a.clone().zip(b.clone());
        let listed = Deferred::all(vec![a, b]);

        let expected: BTreeSet<ResourceId> = ["a", "b"].into_iter().map(ResourceId::new).collect();
        assert_eq!(both.sources(), &expected);
        assert_eq!(listed.sources(), &expected);

        tx_a.send("ns".into()).unwrap();
        tx_b.send("secret".into()).unwrap();
        assert_eq!(both.resolve().await.unwrap(), ("ns".to_string(), "secret".to_string()));
        assert_eq!(listed.resolve().await.unwrap(), vec!["ns".to_string(), "secret".to_string()]);
    }

    #[tokio::test]
    async fn test_dropped_producer_fails_every_consumer() {
        let (tx, value) = pending("bucket");
        let first = value.clone();
        let second = value.map(|v| v.to_uppercase());
        drop(tx);

        let expected = DeferredError::SourceUnavailable {
            resource: "bucket".to_string(),
        };
        assert_eq!(first.resolve().await, Err(expected.clone()));
        assert_eq!(second.resolve().await, Err(expected));
    }

    #[tokio::test]
    async fn test_into_string_rejects_non_strings() {
        let ok = Deferred::ready(Value::String("db-app".into())).into_string();
        assert_eq!(ok.resolve().await.unwrap(), "db-app");

        let bad = Deferred::ready(serde_json::json!(3)).into_string();
        assert!(matches!(bad.resolve().await, Err(DeferredError::Conversion(_))));
    }
}
