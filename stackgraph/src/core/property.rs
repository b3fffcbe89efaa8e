//! Property bags: opaque resource payloads that may embed deferred values.

use super::{Deferred, ResourceId};
use crate::errors::DeferredError;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// A property value in a resource specification.
#[derive(Debug, Clone)]
pub enum Property {
    /// A known JSON value.
    Value(Value),
    /// A value produced by another resource or stack.
    Deferred(Deferred<Value>),
    /// A nested object.
    Map(BTreeMap<String, Property>),
    /// A nested array.
    List(Vec<Property>),
}

impl Default for Property {
    fn default() -> Self {
        Self::Map(BTreeMap::new())
    }
}

impl Property {
    /// Builds a nested object from key-value pairs.
    pub fn map<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Property>,
    {
        Self::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Builds a nested array.
    pub fn list<I, V>(items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Property>,
    {
        Self::List(items.into_iter().map(Into::into).collect())
    }

    /// Returns every resource this property waits on.
    #[must_use]
    pub fn sources(&self) -> BTreeSet<ResourceId> {
        let mut sources = BTreeSet::new();
        self.collect_sources(&mut sources);
        sources
    }

    fn collect_sources(&self, into: &mut BTreeSet<ResourceId>) {
        match self {
            Self::Value(_) => {}
            Self::Deferred(deferred) => into.extend(deferred.sources().iter().cloned()),
            Self::Map(entries) => entries.values().for_each(|p| p.collect_sources(into)),
            Self::List(items) => items.iter().for_each(|p| p.collect_sources(into)),
        }
    }

    /// Waits for every deferred value and returns the concrete JSON payload.
    pub fn resolve(&self) -> BoxFuture<'_, Result<Value, DeferredError>> {
        async move {
            match self {
                Self::Value(value) => Ok(value.clone()),
                Self::Deferred(deferred) => deferred.resolve().await,
                Self::Map(entries) => {
                    let mut object = Map::new();
                    for (key, property) in entries {
                        object.insert(key.clone(), property.resolve().await?);
                    }
                    Ok(Value::Object(object))
                }
                Self::List(items) => {
                    let mut values = Vec::with_capacity(items.len());
                    for property in items {
                        values.push(property.resolve().await?);
                    }
                    Ok(Value::Array(values))
                }
            }
        }
        .boxed()
    }

    /// Returns the concrete payload if every part is already known.
    ///
    /// `None` means at least one deferred value is still pending.
    #[must_use]
    pub fn try_now(&self) -> Option<Result<Value, DeferredError>> {
        match self {
            Self::Value(value) => Some(Ok(value.clone())),
            Self::Deferred(deferred) => deferred.try_now(),
            Self::Map(entries) => {
                let mut object = Map::new();
                for (key, property) in entries {
                    match property.try_now()? {
                        Ok(value) => {
                            object.insert(key.clone(), value);
                        }
                        Err(err) => return Some(Err(err)),
                    }
                }
                Some(Ok(Value::Object(object)))
            }
            Self::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for property in items {
                    match property.try_now()? {
                        Ok(value) => values.push(value),
                        Err(err) => return Some(Err(err)),
                    }
                }
                Some(Ok(Value::Array(values)))
            }
        }
    }
}

impl From<Value> for Property {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<&str> for Property {
    fn from(value: &str) -> Self {
        Self::Value(Value::String(value.to_string()))
    }
}

impl From<String> for Property {
    fn from(value: String) -> Self {
        Self::Value(Value::String(value))
    }
}

impl From<bool> for Property {
    fn from(value: bool) -> Self {
        Self::Value(Value::Bool(value))
    }
}

impl From<i64> for Property {
    fn from(value: i64) -> Self {
        Self::Value(Value::from(value))
    }
}

impl From<i32> for Property {
    fn from(value: i32) -> Self {
        Self::Value(Value::from(value))
    }
}

impl From<u32> for Property {
    fn from(value: u32) -> Self {
        Self::Value(Value::from(value))
    }
}

impl From<Deferred<Value>> for Property {
    fn from(value: Deferred<Value>) -> Self {
        Self::Deferred(value)
    }
}

impl From<Deferred<String>> for Property {
    fn from(value: Deferred<String>) -> Self {
        Self::Deferred(value.into_value())
    }
}

impl From<Vec<Property>> for Property {
    fn from(items: Vec<Property>) -> Self {
        Self::List(items)
    }
}

impl From<BTreeMap<String, Property>> for Property {
    fn from(entries: BTreeMap<String, Property>) -> Self {
        Self::Map(entries)
    }
}
