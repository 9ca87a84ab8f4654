//! Typed events: schema registry, envelope protocol, publish/subscribe.
//!
//! Events are registered per namespace as a tree whose leaves are payload
//! schemas and whose interior nodes are groups; path segments join with `:`.
//! On the wire every message is an [`EventEnvelope`]; legacy payloads that
//! arrive unwrapped are wrapped on receipt with the subscribed event name as
//! their `type`.

use crate::driver::{DriverRef, StoreDriver};
use crate::keys::{KeyBuilder, ScopeEntry};
use crate::pubsub::{ChannelHandler, PubSubMultiplexer, SubscriptionId};
use crate::serializer::SerializerRef;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use igniter_core::{IgniterError, IgniterResult, SchemaRef};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Namespaces that can never be registered.
const RESERVED_NAMESPACES: &[&str] = &["igniter", "ign", "__internal"];

/// Envelope carried on every pub/sub channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Full event path, e.g. `user:created`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// User payload.
    pub data: Value,
    /// Publish time, ISO-8601 UTC.
    pub timestamp: DateTime<Utc>,
    /// Innermost scope of the publisher, when scoped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<ScopeEntry>,
}

impl EventEnvelope {
    /// Builds a fresh envelope for a publish.
    #[must_use]
    pub fn new(event_type: impl Into<String>, data: Value, scope: Option<ScopeEntry>) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            timestamp: Utc::now(),
            scope,
        }
    }

    /// Wraps a legacy unenveloped payload received on `channel`.
    #[must_use]
    pub fn wrap_legacy(subscribed: &str, raw: Value) -> Self {
        Self::new(subscribed, raw, None)
    }
}

/// Validation switches for one registered namespace.
#[derive(Debug, Clone, Copy)]
pub struct ValidationOptions {
    /// Validate payloads on publish.
    pub validate_publish: bool,
    /// Validate envelopes on receipt.
    pub validate_subscribe: bool,
    /// Raise on publish validation failure instead of logging.
    pub throw_on_validation_error: bool,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            validate_publish: true,
            validate_subscribe: false,
            throw_on_validation_error: true,
        }
    }
}

/// One node of an event tree.
pub enum EventNode {
    /// Leaf: a schema validator.
    Event(SchemaRef),
    /// Interior: a named group of further nodes.
    Group(Vec<(String, EventNode)>),
}

/// Declarative description of one namespace's events.
///
/// ```rust,ignore
/// let events = EventsDescriptor::new("user")
///     .event("created", schema::typed::<UserCreated>())
///     .group("profile", |g| g.event("updated", schema::any()));
/// store.add_events(events, None)?;
/// ```
pub struct EventsDescriptor {
    namespace: String,
    events: Vec<(String, EventNode)>,
}

impl EventsDescriptor {
    /// Starts a descriptor for a namespace.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            events: Vec::new(),
        }
    }

    /// Adds an event leaf.
    #[must_use]
    pub fn event(mut self, name: impl Into<String>, schema: SchemaRef) -> Self {
        self.events.push((name.into(), EventNode::Event(schema)));
        self
    }

    /// Adds a nested group.
    #[must_use]
    pub fn group(mut self, name: impl Into<String>, build: impl FnOnce(EventGroup) -> EventGroup) -> Self {
        let group = build(EventGroup { events: Vec::new() });
        self.events.push((name.into(), EventNode::Group(group.events)));
        self
    }
}

/// Builder for a nested event group.
pub struct EventGroup {
    events: Vec<(String, EventNode)>,
}

impl EventGroup {
    /// Adds an event leaf.
    #[must_use]
    pub fn event(mut self, name: impl Into<String>, schema: SchemaRef) -> Self {
        self.events.push((name.into(), EventNode::Event(schema)));
        self
    }

    /// Adds a nested group.
    #[must_use]
    pub fn group(mut self, name: impl Into<String>, build: impl FnOnce(EventGroup) -> EventGroup) -> Self {
        let group = build(EventGroup { events: Vec::new() });
        self.events.push((name.into(), EventNode::Group(group.events)));
        self
    }
}

enum ResolvedNode {
    Event(SchemaRef),
    Group(HashMap<String, ResolvedNode>),
}

struct RegisteredNamespace {
    events: HashMap<String, ResolvedNode>,
    options: ValidationOptions,
}

/// Directory of registered namespaces and their schemas.
#[derive(Default)]
pub struct EventRegistry {
    namespaces: RwLock<HashMap<String, RegisteredNamespace>>,
}

impl EventRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a namespace descriptor.
    pub fn add_events(
        &self,
        descriptor: EventsDescriptor,
        options: Option<ValidationOptions>,
    ) -> IgniterResult<()> {
        let namespace = descriptor.namespace;
        validate_namespace(&namespace)?;

        let mut namespaces = self.namespaces.write();
        if namespaces.contains_key(&namespace) {
            return Err(IgniterError::DuplicateNamespace { namespace });
        }

        let events = build_tree(&namespace, descriptor.events)?;
        namespaces.insert(
            namespace,
            RegisteredNamespace {
                events,
                options: options.unwrap_or_default(),
            },
        );
        Ok(())
    }

    /// Resolves a full event path to its schema and namespace options.
    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<(SchemaRef, ValidationOptions)> {
        let namespaces = self.namespaces.read();
        let mut segments = path.split(':');
        let namespace = segments.next()?;
        let registered = namespaces.get(namespace)?;

        let mut current = &registered.events;
        let mut segments = segments.peekable();
        loop {
            let segment = segments.next()?;
            match current.get(segment)? {
                ResolvedNode::Event(schema) => {
                    return segments
                        .peek()
                        .is_none()
                        .then(|| (schema.clone(), registered.options));
                }
                ResolvedNode::Group(children) => {
                    segments.peek()?;
                    current = children;
                }
            }
        }
    }

    /// Returns the registered namespace names.
    #[must_use]
    pub fn namespaces(&self) -> Vec<String> {
        self.namespaces.read().keys().cloned().collect()
    }

    /// True when the namespace is registered.
    #[must_use]
    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.namespaces.read().contains_key(namespace)
    }
}

fn validate_namespace(namespace: &str) -> IgniterResult<()> {
    if namespace.is_empty() || namespace.contains('.') || namespace.contains(':') {
        return Err(IgniterError::InvalidNamespace {
            namespace: namespace.to_string(),
        });
    }
    if RESERVED_NAMESPACES.contains(&namespace) || namespace.starts_with("__") {
        return Err(IgniterError::ReservedNamespace {
            namespace: namespace.to_string(),
        });
    }
    Ok(())
}

fn validate_event_name(name: &str) -> IgniterResult<()> {
    if name.is_empty() || name.contains('.') || name.contains(':') {
        return Err(IgniterError::InvalidEventName {
            name: name.to_string(),
        });
    }
    Ok(())
}

fn build_tree(
    prefix: &str,
    nodes: Vec<(String, EventNode)>,
) -> IgniterResult<HashMap<String, ResolvedNode>> {
    let mut tree = HashMap::new();
    for (name, node) in nodes {
        validate_event_name(&name)?;
        let path = format!("{prefix}:{name}");
        if tree.contains_key(&name) {
            return Err(IgniterError::DuplicateEvent { path });
        }
        let node = match node {
            EventNode::Event(schema) => ResolvedNode::Event(schema),
            EventNode::Group(children) => ResolvedNode::Group(build_tree(&path, children)?),
        };
        tree.insert(name, node);
    }
    Ok(tree)
}

/// Handle for one live event subscription.
#[derive(Debug, Clone)]
pub struct EventSubscription {
    /// The event path that was subscribed.
    pub event: String,
    pub(crate) channel: String,
    pub(crate) id: SubscriptionId,
}

/// Handler invoked for each received envelope.
pub type EnvelopeHandler =
    Arc<dyn Fn(EventEnvelope) -> BoxFuture<'static, IgniterResult<()>> + Send + Sync>;

/// The events surface of a store.
#[derive(Clone)]
pub struct Events {
    pub(crate) keys: KeyBuilder,
    pub(crate) driver: DriverRef,
    pub(crate) serializer: SerializerRef,
    pub(crate) mux: Arc<PubSubMultiplexer>,
    pub(crate) registry: Arc<EventRegistry>,
}

impl Events {
    /// Publishes an event, wrapping `data` into an envelope.
    pub async fn publish(&self, event: &str, data: Value) -> IgniterResult<()> {
        if let Some((schema, options)) = self.registry.resolve(event) {
            if options.validate_publish {
                if let Err(issues) = schema.validate(&data) {
                    if options.throw_on_validation_error {
                        return Err(IgniterError::SchemaValidationFailed {
                            path: event.to_string(),
                            issues,
                        });
                    }
                    warn!(event = %event, issues = issues.len(), "Publishing payload that failed validation");
                }
            }
        }

        let envelope = EventEnvelope::new(
            event,
            data,
            self.keys.innermost_scope().cloned(),
        );
        let payload = self.serializer.encode(&serde_json::to_value(&envelope)?)?;
        self.driver.publish(&self.keys.channel(event), &payload).await
    }

    /// Subscribes a handler to an event path. `*` segments follow the
    /// wildcard contract: `ns:*` receives every event under `ns:`.
    pub async fn subscribe(
        &self,
        event: &str,
        handler: EnvelopeHandler,
    ) -> IgniterResult<EventSubscription> {
        let channel = self.keys.channel(event);
        let subscribed = event.to_string();
        let registry = self.registry.clone();

        let channel_handler: ChannelHandler = Arc::new(move |message| {
            let envelope = match serde_json::from_value::<EventEnvelope>(message.payload.clone()) {
                Ok(envelope) => envelope,
                Err(_) => EventEnvelope::wrap_legacy(&subscribed, message.payload),
            };

            if let Some((schema, options)) = registry.resolve(&envelope.event_type) {
                if options.validate_subscribe {
                    if let Err(issues) = schema.validate(&envelope.data) {
                        let path = envelope.event_type.clone();
                        return Box::pin(async move {
                            Err(IgniterError::SchemaValidationFailed { path, issues })
                        });
                    }
                }
            }

            handler(envelope)
        });

        let id = self.mux.subscribe(&channel, channel_handler).await?;
        Ok(EventSubscription {
            event: event.to_string(),
            channel,
            id,
        })
    }

    /// Removes one subscription.
    pub async fn unsubscribe(&self, subscription: &EventSubscription) -> IgniterResult<()> {
        self.mux
            .unsubscribe(&subscription.channel, Some(subscription.id))
            .await
    }

    /// Removes every handler on an event path.
    pub async fn unsubscribe_all(&self, event: &str) -> IgniterResult<()> {
        self.mux.unsubscribe(&self.keys.channel(event), None).await
    }

    /// Registry-resolved accessor: `events.of("user").event("created")`.
    ///
    /// Unknown paths are rejected at access time, which is what the
    /// registry-driven tree buys over the plain string API.
    pub fn of(&self, namespace: &str) -> EventNamespaceRef {
        EventNamespaceRef {
            events: self.clone(),
            prefix: namespace.to_string(),
        }
    }
}

/// Accessor for one registered namespace.
#[derive(Clone)]
pub struct EventNamespaceRef {
    events: Events,
    prefix: String,
}

impl EventNamespaceRef {
    /// Descends into a nested group.
    #[must_use]
    pub fn group(&self, name: &str) -> EventNamespaceRef {
        EventNamespaceRef {
            events: self.events.clone(),
            prefix: format!("{}:{}", self.prefix, name),
        }
    }

    /// Resolves an event leaf; errors when the path is not registered.
    pub fn event(&self, name: &str) -> IgniterResult<EventRef> {
        let path = format!("{}:{}", self.prefix, name);
        if self.events.registry.resolve(&path).is_none() {
            return Err(IgniterError::InvalidEventName { name: path });
        }
        Ok(EventRef {
            events: self.events.clone(),
            path,
        })
    }
}

/// A resolved event endpoint with publish/subscribe.
#[derive(Clone)]
pub struct EventRef {
    events: Events,
    path: String,
}

impl std::fmt::Debug for EventRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRef")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl EventRef {
    /// The full event path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Publishes to this event.
    pub async fn publish(&self, data: Value) -> IgniterResult<()> {
        self.events.publish(&self.path, data).await
    }

    /// Subscribes to this event.
    pub async fn subscribe(&self, handler: EnvelopeHandler) -> IgniterResult<EventSubscription> {
        self.events.subscribe(&self.path, handler).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_driver::MemoryDriver;
    use crate::serializer::default_serializer;
    use igniter_core::schema;
    use serde_json::json;
    use std::time::Duration;

    fn registry_with_user_events() -> EventRegistry {
        let registry = EventRegistry::new();
        registry
            .add_events(
                EventsDescriptor::new("user")
                    .event("created", schema::any())
                    .group("profile", |g| g.event("updated", schema::any())),
                None,
            )
            .unwrap();
        registry
    }

    fn test_events(service: &str, registry: Arc<EventRegistry>) -> (DriverRef, Events) {
        let driver: DriverRef = Arc::new(MemoryDriver::new());
        let serializer = default_serializer();
        let mux = PubSubMultiplexer::new(driver.clone(), serializer.clone());
        let events = Events {
            keys: KeyBuilder::new(service),
            driver: driver.clone(),
            serializer,
            mux,
            registry,
        };
        (driver, events)
    }

    #[test]
    fn test_namespace_rules() {
        let registry = EventRegistry::new();

        let err = registry
            .add_events(EventsDescriptor::new("bad.ns"), None)
            .unwrap_err();
        assert!(err.is("STORE_INVALID_NAMESPACE"));

        let err = registry
            .add_events(EventsDescriptor::new("igniter"), None)
            .unwrap_err();
        assert!(err.is("STORE_RESERVED_NAMESPACE"));

        let err = registry
            .add_events(EventsDescriptor::new("__private"), None)
            .unwrap_err();
        assert!(err.is("STORE_RESERVED_NAMESPACE"));
    }

    #[test]
    fn test_duplicate_namespace() {
        let registry = registry_with_user_events();
        let err = registry
            .add_events(EventsDescriptor::new("user"), None)
            .unwrap_err();
        assert!(err.is("STORE_DUPLICATE_NAMESPACE"));
    }

    #[test]
    fn test_duplicate_event() {
        let registry = EventRegistry::new();
        let err = registry
            .add_events(
                EventsDescriptor::new("orders")
                    .event("placed", schema::any())
                    .event("placed", schema::any()),
                None,
            )
            .unwrap_err();
        assert!(err.is("STORE_DUPLICATE_EVENT"));
    }

    #[test]
    fn test_resolve_nested_path() {
        let registry = registry_with_user_events();
        assert!(registry.resolve("user:created").is_some());
        assert!(registry.resolve("user:profile:updated").is_some());
        assert!(registry.resolve("user:missing").is_none());
        assert!(registry.resolve("user:profile").is_none());
        assert!(registry.resolve("other:created").is_none());
    }

    #[tokio::test]
    async fn test_envelope_round_trip() {
        let (_driver, events) = test_events("test-api", Arc::new(registry_with_user_events()));

        let seen: Arc<parking_lot::Mutex<Option<EventEnvelope>>> =
            Arc::new(parking_lot::Mutex::new(None));
        let seen2 = seen.clone();
        let handler: EnvelopeHandler = Arc::new(move |envelope| {
            let seen = seen2.clone();
            Box::pin(async move {
                *seen.lock() = Some(envelope);
                Ok(())
            })
        });
        events.subscribe("user:created", handler).await.unwrap();

        events
            .publish("user:created", json!({"userId": "456"}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let envelope = seen.lock().clone().unwrap();
        assert_eq!(envelope.event_type, "user:created");
        assert_eq!(envelope.data, json!({"userId": "456"}));
        assert!(envelope.scope.is_none());
    }

    #[tokio::test]
    async fn test_scoped_publish_carries_innermost_scope() {
        let registry = Arc::new(registry_with_user_events());
        let driver: DriverRef = Arc::new(MemoryDriver::new());
        let serializer = default_serializer();
        let mux = PubSubMultiplexer::new(driver.clone(), serializer.clone());
        let events = Events {
            keys: KeyBuilder::new("test-api").with_scope("organization", "org-123"),
            driver: driver.clone(),
            serializer,
            mux,
            registry,
        };

        let mut raw = driver.messages();
        driver
            .subscribe("igniter:store:test-api:organization:org-123:events:user:created")
            .await
            .unwrap();

        events.publish("user:created", json!({"userId": "456"})).await.unwrap();

        let msg = raw.recv().await.unwrap();
        assert_eq!(
            msg.channel,
            "igniter:store:test-api:organization:org-123:events:user:created"
        );
        let envelope: EventEnvelope = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(envelope.scope, Some(ScopeEntry::new("organization", "org-123")));
    }

    #[tokio::test]
    async fn test_publish_validation_failure() {
        let registry = EventRegistry::new();
        #[derive(serde::Deserialize)]
        struct Created {
            #[allow(dead_code)]
            user_id: String,
        }
        registry
            .add_events(
                EventsDescriptor::new("user").event("created", schema::typed::<Created>()),
                None,
            )
            .unwrap();

        let (_driver, events) = test_events("svc", Arc::new(registry));
        let err = events
            .publish("user:created", json!({"wrong": true}))
            .await
            .unwrap_err();
        assert!(err.is("STORE_SCHEMA_VALIDATION_FAILED"));
        assert!(err.details().is_some());
    }

    #[tokio::test]
    async fn test_legacy_payload_wrapped_on_receipt() {
        let (driver, events) = test_events("svc", Arc::new(registry_with_user_events()));

        let seen: Arc<parking_lot::Mutex<Option<EventEnvelope>>> =
            Arc::new(parking_lot::Mutex::new(None));
        let seen2 = seen.clone();
        let handler: EnvelopeHandler = Arc::new(move |envelope| {
            let seen = seen2.clone();
            Box::pin(async move {
                *seen.lock() = Some(envelope);
                Ok(())
            })
        });
        events.subscribe("user:created", handler).await.unwrap();

        // Raw publish bypassing the envelope.
        driver
            .publish("igniter:store:svc:events:user:created", "{\"id\":7}")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let envelope = seen.lock().clone().unwrap();
        assert_eq!(envelope.event_type, "user:created");
        assert_eq!(envelope.data, json!({"id": 7}));
    }

    #[tokio::test]
    async fn test_wildcard_subscription() {
        let (_driver, events) = test_events("svc", Arc::new(registry_with_user_events()));

        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count2 = count.clone();
        let handler: EnvelopeHandler = Arc::new(move |_| {
            let count = count2.clone();
            Box::pin(async move {
                count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
        });
        events.subscribe("user:*", handler).await.unwrap();

        events.publish("user:created", json!({})).await.unwrap();
        events.publish("user:profile:updated", json!({})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_typed_accessor_rejects_unknown() {
        let registry = Arc::new(registry_with_user_events());
        let (_driver, events) = test_events("svc", registry);

        assert!(events.of("user").event("created").is_ok());
        assert!(events.of("user").group("profile").event("updated").is_ok());
        let err = events.of("user").event("ghost").unwrap_err();
        assert!(err.is("STORE_INVALID_EVENT_NAME"));
    }
}
