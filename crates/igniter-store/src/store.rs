//! Store manager: the public façade over driver, serializer, registry, and
//! multiplexer.
//!
//! A [`Store`] is cheap to clone; [`Store::scope`] returns a new value with
//! the scope chain extended while sharing every underlying resource, so a
//! scoped store is an immutable view rather than a copy.

use crate::driver::{AppendOptions, DriverRef, MsetEntry, ScanPage, StoreDriver, StreamReadOptions};
use crate::events::{EventRegistry, Events, EventsDescriptor, ValidationOptions};
use crate::keys::{KeyBuilder, Namespace, ScopeEntry};
use crate::pubsub::PubSubMultiplexer;
use crate::serializer::{default_serializer, SerializerRef};
use igniter_core::{IgniterError, IgniterResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

struct StoreInner {
    service: String,
    driver: DriverRef,
    serializer: SerializerRef,
    registry: Arc<EventRegistry>,
    mux: Arc<PubSubMultiplexer>,
    allowed_scope_keys: Option<HashSet<String>>,
}

/// Multi-tenant typed façade over a Redis-compatible server.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
    keys: KeyBuilder,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("service", &self.inner.service)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Starts building a store.
    #[must_use]
    pub fn builder() -> StoreBuilder {
        StoreBuilder::default()
    }

    /// The service identifier baked into every key.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.inner.service
    }

    /// The current scope chain, outermost first.
    #[must_use]
    pub fn scopes(&self) -> &[ScopeEntry] {
        self.keys.scopes()
    }

    /// Returns the key builder for this store's `(service, scopes)`.
    #[must_use]
    pub fn keys(&self) -> &KeyBuilder {
        &self.keys
    }

    /// Registers a namespace of events on the shared registry.
    pub fn add_events(
        &self,
        descriptor: EventsDescriptor,
        options: Option<ValidationOptions>,
    ) -> IgniterResult<()> {
        self.inner.registry.add_events(descriptor, options)
    }

    /// Returns a store scoped one level deeper.
    ///
    /// The child shares the driver, serializer, registry, and multiplexer;
    /// only the key prefix changes.
    pub fn scope(&self, key: &str, id: impl ToString) -> IgniterResult<Store> {
        let id = id.to_string();
        if key.is_empty() {
            return Err(IgniterError::ScopeKeyRequired);
        }
        if id.is_empty() {
            return Err(IgniterError::ScopeIdentifierRequired);
        }
        // No escaping happens in the key builder; reject separators here so
        // two different chains can never collide.
        if key.contains(':') || id.contains(':') {
            return Err(IgniterError::InvalidScopeKey { key: key.to_string() });
        }
        if let Some(allowed) = &self.inner.allowed_scope_keys {
            if !allowed.contains(key) {
                return Err(IgniterError::InvalidScopeKey { key: key.to_string() });
            }
        }
        if self.keys.scopes().iter().any(|s| s.key == key) {
            return Err(IgniterError::DuplicateScope { key: key.to_string() });
        }

        Ok(Store {
            inner: self.inner.clone(),
            keys: self.keys.with_scope(key, id),
        })
    }

    /// Key/value surface.
    #[must_use]
    pub fn kv(&self) -> Kv {
        Kv { store: self.clone() }
    }

    /// Atomic counter surface.
    #[must_use]
    pub fn counter(&self) -> Counter {
        Counter { store: self.clone() }
    }

    /// Single-shot claim surface.
    #[must_use]
    pub fn claim(&self) -> Claim {
        Claim { store: self.clone() }
    }

    /// Batched read/write surface.
    #[must_use]
    pub fn batch(&self) -> Batch {
        Batch { store: self.clone() }
    }

    /// Typed pub/sub surface.
    #[must_use]
    pub fn events(&self) -> Events {
        Events {
            keys: self.keys.clone(),
            driver: self.inner.driver.clone(),
            serializer: self.inner.serializer.clone(),
            mux: self.inner.mux.clone(),
            registry: self.inner.registry.clone(),
        }
    }

    /// Development helpers.
    #[must_use]
    pub fn dev(&self) -> Dev {
        Dev { store: self.clone() }
    }

    /// Append-only stream surface.
    #[must_use]
    pub fn streams(&self) -> Streams {
        Streams { store: self.clone() }
    }

    fn encode<T: Serialize>(&self, value: &T) -> IgniterResult<String> {
        self.inner.serializer.encode(&serde_json::to_value(value)?)
    }

    fn decode<T: DeserializeOwned>(&self, raw: &str) -> IgniterResult<T> {
        let value = self.inner.serializer.decode(raw)?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Builder for [`Store`].
#[derive(Default)]
pub struct StoreBuilder {
    driver: Option<DriverRef>,
    service: Option<String>,
    serializer: Option<SerializerRef>,
    allowed_scope_keys: Option<HashSet<String>>,
}

impl StoreBuilder {
    /// Sets the driver (required).
    #[must_use]
    pub fn driver(mut self, driver: DriverRef) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Sets the service name (required).
    #[must_use]
    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Overrides the serializer.
    #[must_use]
    pub fn serializer(mut self, serializer: SerializerRef) -> Self {
        self.serializer = Some(serializer);
        self
    }

    /// Restricts `scope()` to a finite set of scope keys.
    #[must_use]
    pub fn allowed_scope_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_scope_keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    /// Builds the store.
    pub fn build(self) -> IgniterResult<Store> {
        let driver = self.driver.ok_or(IgniterError::AdapterRequired)?;
        let service = match self.service {
            Some(service) if !service.is_empty() => service,
            _ => return Err(IgniterError::ServiceRequired),
        };
        let serializer = self.serializer.unwrap_or_else(default_serializer);
        let mux = PubSubMultiplexer::new(driver.clone(), serializer.clone());

        debug!(service = %service, "Store created");

        Ok(Store {
            keys: KeyBuilder::new(service.as_str()),
            inner: Arc::new(StoreInner {
                service,
                driver,
                serializer,
                registry: Arc::new(EventRegistry::new()),
                mux,
                allowed_scope_keys: self.allowed_scope_keys,
            }),
        })
    }
}

/// Key/value operations.
#[derive(Clone)]
pub struct Kv {
    store: Store,
}

impl Kv {
    /// Reads and decodes a value.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> IgniterResult<Option<T>> {
        let full = self.store.keys.build(Namespace::Kv, key);
        match self.store.inner.driver.get(&full).await? {
            Some(raw) => Ok(Some(self.store.decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Encodes and writes a value, with an optional TTL in seconds.
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<u64>,
    ) -> IgniterResult<()> {
        let full = self.store.keys.build(Namespace::Kv, key);
        let encoded = self.store.encode(value)?;
        self.store.inner.driver.set(&full, &encoded, ttl).await
    }

    /// Deletes a key; true when it existed.
    pub async fn remove(&self, key: &str) -> IgniterResult<bool> {
        let full = self.store.keys.build(Namespace::Kv, key);
        self.store.inner.driver.delete(&full).await
    }

    /// True when the key exists.
    pub async fn exists(&self, key: &str) -> IgniterResult<bool> {
        let full = self.store.keys.build(Namespace::Kv, key);
        self.store.inner.driver.has(&full).await
    }

    /// Re-arms the TTL on an existing key.
    pub async fn expire(&self, key: &str, ttl: u64) -> IgniterResult<bool> {
        let full = self.store.keys.build(Namespace::Kv, key);
        self.store.inner.driver.expire(&full, ttl).await
    }

    /// Alias for [`Kv::expire`].
    pub async fn touch(&self, key: &str, ttl: u64) -> IgniterResult<bool> {
        self.expire(key, ttl).await
    }
}

/// Atomic counter operations.
#[derive(Clone)]
pub struct Counter {
    store: Store,
}

impl Counter {
    /// Increments by one; a missing counter starts at zero.
    pub async fn increment(&self, key: &str) -> IgniterResult<i64> {
        self.increment_by(key, 1).await
    }

    /// Increments by an arbitrary delta.
    pub async fn increment_by(&self, key: &str, delta: i64) -> IgniterResult<i64> {
        let full = self.store.keys.build(Namespace::Counter, key);
        self.store.inner.driver.increment(&full, delta).await
    }

    /// Decrements by one.
    pub async fn decrement(&self, key: &str) -> IgniterResult<i64> {
        self.increment_by(key, -1).await
    }

    /// Re-arms the TTL on a counter.
    pub async fn expire(&self, key: &str, ttl: u64) -> IgniterResult<bool> {
        let full = self.store.keys.build(Namespace::Counter, key);
        self.store.inner.driver.expire(&full, ttl).await
    }
}

/// Single-shot claim (distributed lock) operations.
#[derive(Clone)]
pub struct Claim {
    store: Store,
}

impl Claim {
    /// Attempts an atomic single-shot acquisition.
    ///
    /// Exactly one of any number of concurrent calls on a fresh key
    /// returns true.
    pub async fn once<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<u64>,
    ) -> IgniterResult<bool> {
        let full = self.store.keys.build(Namespace::Claim, key);
        let encoded = self.store.encode(value)?;
        self.store.inner.driver.set_nx(&full, &encoded, ttl).await
    }
}

/// One entry of a batched write.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    /// User key (namespaced under `kv`).
    pub key: String,
    /// Value to store.
    pub value: Value,
    /// Optional TTL in seconds.
    pub ttl: Option<u64>,
}

impl BatchEntry {
    /// Creates an entry without TTL.
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
            ttl: None,
        }
    }

    /// Sets the TTL.
    #[must_use]
    pub fn ttl(mut self, ttl: u64) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Batched read/write operations over the `kv` namespace.
#[derive(Clone)]
pub struct Batch {
    store: Store,
}

impl Batch {
    /// Reads many keys at once; empty input is a no-op.
    pub async fn get<T: DeserializeOwned>(&self, keys: &[&str]) -> IgniterResult<Vec<Option<T>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let full: Vec<String> = keys
            .iter()
            .map(|k| self.store.keys.build(Namespace::Kv, k))
            .collect();
        let raw = self.store.inner.driver.mget(&full).await?;
        raw.into_iter()
            .map(|entry| entry.map(|raw| self.store.decode(&raw)).transpose())
            .collect()
    }

    /// Writes many entries at once; empty input is a no-op.
    pub async fn set(&self, entries: Vec<BatchEntry>) -> IgniterResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut mset = Vec::with_capacity(entries.len());
        for entry in entries {
            mset.push(MsetEntry {
                key: self.store.keys.build(Namespace::Kv, &entry.key),
                value: self.store.encode(&entry.value)?,
                ttl: entry.ttl,
            });
        }
        self.store.inner.driver.mset(&mset).await
    }
}

/// Development helpers.
#[derive(Clone)]
pub struct Dev {
    store: Store,
}

impl Dev {
    /// Scans keys in the `kv` namespace. The pattern is always prefixed
    /// with the scoped key prefix, so a scan can never leave the service's
    /// key space.
    pub async fn scan(
        &self,
        pattern: &str,
        cursor: u64,
        count: Option<usize>,
    ) -> IgniterResult<ScanPage> {
        let full = self.store.keys.pattern(Namespace::Kv, pattern);
        self.store.inner.driver.scan(&full, cursor, count).await
    }
}

/// One decoded stream entry.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    /// Server-assigned id, `<ms>-<seq>`.
    pub id: String,
    /// Decoded payload.
    pub data: Value,
}

/// Append-only stream operations.
#[derive(Clone)]
pub struct Streams {
    store: Store,
}

impl Streams {
    /// Appends a message; returns the server-assigned id.
    pub async fn append<T: Serialize>(
        &self,
        stream: &str,
        message: &T,
        opts: Option<AppendOptions>,
    ) -> IgniterResult<String> {
        let full = self.store.keys.build(Namespace::Streams, stream);
        let payload = self.store.encode(message)?;
        self.store
            .inner
            .driver
            .xadd(&full, &payload, &opts.unwrap_or_default())
            .await
    }

    /// Binds a `(group, consumer)` pair for consumer-group reads.
    #[must_use]
    pub fn group(&self, group: impl Into<String>, consumer: impl Into<String>) -> StreamGroup {
        StreamGroup {
            store: self.store.clone(),
            group: group.into(),
            consumer: consumer.into(),
        }
    }
}

/// A consumer-group view on the stream surface.
#[derive(Clone)]
pub struct StreamGroup {
    store: Store,
    group: String,
    consumer: String,
}

impl StreamGroup {
    /// Creates the group if it does not exist (idempotent, `MKSTREAM`).
    pub async fn ensure(&self, stream: &str, start_id: Option<&str>) -> IgniterResult<()> {
        let full = self.store.keys.build(Namespace::Streams, stream);
        self.store
            .inner
            .driver
            .xgroup_create(&full, &self.group, start_id.unwrap_or("0"))
            .await
    }

    /// Reads unconsumed entries for this consumer.
    pub async fn read(
        &self,
        stream: &str,
        opts: StreamReadOptions,
    ) -> IgniterResult<Vec<StreamEntry>> {
        let full = self.store.keys.build(Namespace::Streams, stream);
        let messages = self
            .store
            .inner
            .driver
            .xreadgroup(&full, &self.group, &self.consumer, &opts)
            .await?;

        messages
            .into_iter()
            .map(|m| {
                Ok(StreamEntry {
                    data: self.store.inner.serializer.decode(&m.data)?,
                    id: m.id,
                })
            })
            .collect()
    }

    /// Acknowledges processed entries; returns how many were pending.
    pub async fn ack(&self, stream: &str, ids: &[String]) -> IgniterResult<u64> {
        let full = self.store.keys.build(Namespace::Streams, stream);
        self.store.inner.driver.xack(&full, &self.group, ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_driver::MemoryDriver;
    use serde_json::json;

    fn test_store() -> (Arc<MemoryDriver>, Store) {
        let driver = Arc::new(MemoryDriver::new());
        let store = Store::builder()
            .driver(driver.clone())
            .service("test-api")
            .build()
            .unwrap();
        (driver, store)
    }

    #[tokio::test]
    async fn test_builder_requires_adapter_and_service() {
        let err = Store::builder().service("svc").build().unwrap_err();
        assert!(err.is("STORE_ADAPTER_REQUIRED"));

        let err = Store::builder()
            .driver(Arc::new(MemoryDriver::new()))
            .build()
            .unwrap_err();
        assert!(err.is("STORE_SERVICE_REQUIRED"));
    }

    #[tokio::test]
    async fn test_kv_round_trip_with_ttl() {
        let (driver, store) = test_store();
        store
            .kv()
            .set("user:1", &json!({"name": "Alice"}), Some(3600))
            .await
            .unwrap();

        // The full key lands under the service's kv namespace.
        let raw = driver
            .get("igniter:store:test-api:kv:user:1")
            .await
            .unwrap();
        assert!(raw.is_some());

        let value: Option<Value> = store.kv().get("user:1").await.unwrap();
        assert_eq!(value, Some(json!({"name": "Alice"})));

        assert!(store.kv().exists("user:1").await.unwrap());
        assert!(store.kv().touch("user:1", 60).await.unwrap());
        assert!(store.kv().remove("user:1").await.unwrap());
        assert_eq!(store.kv().get::<Value>("user:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_counter_monotonicity() {
        let (_driver, store) = test_store();
        let counter = store.counter();

        assert_eq!(counter.increment("hits").await.unwrap(), 1);
        assert_eq!(counter.increment_by("hits", 4).await.unwrap(), 5);
        assert_eq!(counter.decrement("hits").await.unwrap(), 4);

        // increment then decrement restores the original value
        let before = counter.increment("fresh").await.unwrap() - 1;
        counter.decrement("fresh").await.unwrap();
        let now = counter.increment("fresh").await.unwrap() - 1;
        assert_eq!(before, now);
    }

    #[tokio::test]
    async fn test_claim_exclusivity_under_contention() {
        let (_driver, store) = test_store();

        let mut handles = Vec::new();
        for i in 0..8 {
            let claim = store.claim();
            handles.push(tokio::spawn(async move {
                claim.once("lock:p", &json!(format!("w{i}")), Some(60)).await.unwrap()
            }));
        }

        let mut acquired = 0;
        for handle in handles {
            if handle.await.unwrap() {
                acquired += 1;
            }
        }
        assert_eq!(acquired, 1);
    }

    #[tokio::test]
    async fn test_batch_empty_is_noop() {
        let (_driver, store) = test_store();
        let got: Vec<Option<Value>> = store.batch().get(&[]).await.unwrap();
        assert!(got.is_empty());
        store.batch().set(Vec::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_round_trip() {
        let (_driver, store) = test_store();
        store
            .batch()
            .set(vec![
                BatchEntry::new("a", json!(1)),
                BatchEntry::new("b", json!({"x": true})).ttl(60),
            ])
            .await
            .unwrap();

        let got: Vec<Option<Value>> = store.batch().get(&["a", "b", "missing"]).await.unwrap();
        assert_eq!(got, vec![Some(json!(1)), Some(json!({"x": true})), None]);
    }

    #[tokio::test]
    async fn test_scope_validation() {
        let (_driver, store) = test_store();

        assert!(store.scope("", "1").unwrap_err().is("STORE_SCOPE_KEY_REQUIRED"));
        assert!(store.scope("org", "").unwrap_err().is("STORE_SCOPE_IDENTIFIER_REQUIRED"));
        assert!(store.scope("or:g", "1").unwrap_err().is("STORE_INVALID_SCOPE_KEY"));
        assert!(store.scope("org", "a:b").unwrap_err().is("STORE_INVALID_SCOPE_KEY"));

        let scoped = store.scope("org", 42).unwrap();
        assert_eq!(scoped.scopes(), &[ScopeEntry::new("org", "42")]);
        assert!(scoped.scope("org", "43").unwrap_err().is("STORE_DUPLICATE_SCOPE"));
    }

    #[tokio::test]
    async fn test_scope_allow_list() {
        let driver = Arc::new(MemoryDriver::new());
        let store = Store::builder()
            .driver(driver)
            .service("svc")
            .allowed_scope_keys(["organization", "workspace"])
            .build()
            .unwrap();

        assert!(store.scope("organization", "1").is_ok());
        assert!(store.scope("tenant", "1").unwrap_err().is("STORE_INVALID_SCOPE_KEY"));
    }

    #[tokio::test]
    async fn test_scoped_keys_are_isolated() {
        let (_driver, store) = test_store();
        let a = store.scope("org", "a").unwrap();
        let b = store.scope("org", "b").unwrap();

        a.kv().set("k", &json!("from-a"), None).await.unwrap();
        b.kv().set("k", &json!("from-b"), None).await.unwrap();

        assert_eq!(a.kv().get::<Value>("k").await.unwrap(), Some(json!("from-a")));
        assert_eq!(b.kv().get::<Value>("k").await.unwrap(), Some(json!("from-b")));
        assert_eq!(store.kv().get::<Value>("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dev_scan_restricted_to_kv() {
        let (_driver, store) = test_store();
        store.kv().set("user:1", &json!(1), None).await.unwrap();
        store.kv().set("user:2", &json!(2), None).await.unwrap();
        store.counter().increment("user:1").await.unwrap();

        let page = store.dev().scan("user:*", 0, None).await.unwrap();
        let mut keys = page.keys;
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "igniter:store:test-api:kv:user:1".to_string(),
                "igniter:store:test-api:kv:user:2".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_surface_lifecycle() {
        let (_driver, store) = test_store();
        let streams = store.streams();

        let id = streams
            .append("events", &json!({"type": "click"}), None)
            .await
            .unwrap();
        assert!(id.split('-').count() == 2);

        let group = streams.group("g", "c");
        group.ensure("events", None).await.unwrap();

        let read = group
            .read("events", StreamReadOptions { count: Some(10), block_ms: None })
            .await
            .unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].id, id);
        assert_eq!(read[0].data, json!({"type": "click"}));

        let acked = group.ack("events", &[id]).await.unwrap();
        assert_eq!(acked, 1);
    }

    #[tokio::test]
    async fn test_key_determinism_across_instances() {
        let driver = Arc::new(MemoryDriver::new());
        let build = || {
            Store::builder()
                .driver(driver.clone())
                .service("svc")
                .build()
                .unwrap()
                .scope("org", "1")
                .unwrap()
        };
        let a = build();
        let b = build();
        assert_eq!(
            a.keys().build(Namespace::Kv, "k"),
            b.keys().build(Namespace::Kv, "k")
        );
    }
}
