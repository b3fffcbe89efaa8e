//! Sample stacks and engine harnesses for tests.

use std::sync::Arc;

use serde_json::json;

use super::mocks::MockProvider;
use crate::core::Property;
use crate::engine::{Engine, EngineConfig};
use crate::errors::StackGraphError;
use crate::events::CollectingEventSink;
use crate::resolver::RetryConfig;
use crate::stack::{StackContext, StackId};
use crate::state::InMemoryStateBackend;

/// Parses a stack id, panicking on malformed input.
///
/// # Panics
///
/// Panics if `id` is not `organization/project/environment`.
#[must_use]
pub fn stack_id(id: &str) -> StackId {
    id.parse()
        .unwrap_or_else(|e| panic!("invalid test stack id '{id}': {e}"))
}

/// The database stack used across tests.
#[must_use]
pub fn db_stack() -> StackId {
    stack_id("acme/db/dev")
}

/// The API stack that consumes the database stack's outputs.
#[must_use]
pub fn api_stack() -> StackId {
    stack_id("acme/api/dev")
}

/// Declares a namespace, a database cluster and its connection secret,
/// and publishes `ConnectionSecretName`.
///
/// # Errors
///
/// Propagates declaration errors.
pub fn db_program(ctx: &mut StackContext) -> Result<(), StackGraphError> {
    let namespace = ctx.declare_resource(
        "kubernetes:core/v1:Namespace",
        "namespace",
        Property::map([("name", "database")]),
        &[],
    )?;
    let cluster = ctx.declare_resource(
        "postgresql.cnpg.io/v1:Cluster",
        "cluster",
        Property::map([
            ("name", Property::from("db")),
            ("namespace", Property::from(namespace.output("name"))),
            ("instances", Property::from(1)),
        ]),
        &[],
    )?;
    let secret = ctx.declare_resource(
        "kubernetes:core/v1:Secret",
        "connection-secret",
        Property::map([
            ("name", Property::from("db-app")),
            ("namespace", Property::from(namespace.output("name"))),
        ]),
        &[&cluster],
    )?;

    ctx.publish_output("ConnectionSecretName", secret.output("name"));
    ctx.publish_output("Namespace", namespace.output("name"));
    Ok(())
}

/// Declares a deployment whose environment reads the database stack's
/// `ConnectionSecretName`.
///
/// # Errors
///
/// Propagates declaration errors.
pub fn api_program(ctx: &mut StackContext) -> Result<(), StackGraphError> {
    let secret_name = ctx.require_output(&db_stack(), "ConnectionSecretName");
    let deployment = ctx.declare_resource(
        "kubernetes:apps/v1:Deployment",
        "deployment",
        Property::map([
            ("image", Property::from("ghcr.io/acme/api:1.4.2")),
            ("replicas", Property::from(2)),
            (
                "env",
                Property::map([("DB_SECRET", Property::from(secret_name))]),
            ),
        ]),
        &[],
    )?;
    ctx.publish_output("Endpoint", deployment.output("uid"));
    Ok(())
}

/// An engine wired to an in-memory backend, a mock provider and a
/// collecting event sink, with fast lookup retries.
#[derive(Debug)]
pub struct TestEngine {
    /// The engine under test.
    pub engine: Arc<Engine>,
    /// Its state backend.
    pub backend: Arc<InMemoryStateBackend>,
    /// Its provider.
    pub provider: Arc<MockProvider>,
    /// Every emitted event.
    pub events: Arc<CollectingEventSink>,
}

impl TestEngine {
    /// Creates a harness around `provider`.
    #[must_use]
    pub fn new(provider: MockProvider) -> Self {
        Self::with_config(provider, Self::default_config())
    }

    /// Creates a harness with an explicit configuration.
    #[must_use]
    pub fn with_config(provider: MockProvider, config: EngineConfig) -> Self {
        let backend = Arc::new(InMemoryStateBackend::new());
        let provider = Arc::new(provider);
        let events = Arc::new(CollectingEventSink::new());
        let engine = Engine::new(backend.clone(), provider.clone())
            .with_config(config)
            .with_events(events.clone());
        Self {
            engine: Arc::new(engine),
            backend,
            provider,
            events,
        }
    }

    /// The default test configuration: 5 ms retry base delay, no jitter.
    #[must_use]
    pub fn default_config() -> EngineConfig {
        EngineConfig::default().with_lookup_retry(
            RetryConfig::default()
                .with_base_delay_ms(5)
                .with_max_delay_ms(20)
                .with_jitter(crate::resolver::JitterStrategy::None),
        )
    }

    /// A JSON copy of the stored outputs of a stack, or `null`.
    #[must_use]
    pub fn stored_outputs(&self, stack: &StackId) -> serde_json::Value {
        self.backend
            .get(stack)
            .map_or(serde_json::Value::Null, |state| {
                json!(state
                    .outputs
                    .iter()
                    .map(|(k, v)| (k.clone(), v.value.clone()))
                    .collect::<serde_json::Map<_, _>>())
            })
    }
}
