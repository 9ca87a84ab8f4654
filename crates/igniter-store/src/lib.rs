//! Igniter Store - multi-tenant typed façade over Redis
//!
//! A scoped key/value, counter, claim, pub/sub, and stream surface on top of
//! a Redis-compatible server:
//!
//! - Deterministic key layout `igniter:store:<service>{:<scope>:<id>}*:<ns>:<key>`
//! - Typed publish/subscribe with envelope metadata and schema validation
//! - A pub/sub multiplexer sharing one dedicated subscription connection
//! - Append-only streams with consumer groups
//! - Scope chaining for tenant isolation
//!
//! # Example
//!
//! ```rust,ignore
//! use igniter_store::{Store, RedisDriver};
//! use serde_json::json;
//!
//! let driver = RedisDriver::connect("redis://localhost:6379").await?;
//! let store = Store::builder()
//!     .driver(std::sync::Arc::new(driver))
//!     .service("my-api")
//!     .build()?;
//!
//! store.kv().set("user:1", &json!({"name": "Alice"}), Some(3600)).await?;
//!
//! let org = store.scope("organization", "org-123")?;
//! org.events().publish("user:created", json!({"userId": "456"})).await?;
//! ```

pub mod driver;
pub mod events;
pub mod keys;
pub mod memory_driver;
pub mod pubsub;
pub mod redis_driver;
pub mod serializer;
pub mod store;

pub use driver::{
    AppendOptions, DriverRef, MsetEntry, RawMessage, ScanPage, StoreDriver, StreamMessage,
    StreamReadOptions,
};
pub use events::{
    EnvelopeHandler, EventEnvelope, EventRegistry, EventSubscription, Events, EventsDescriptor,
    ValidationOptions,
};
pub use keys::{KeyBuilder, Namespace, ScopeEntry};
pub use memory_driver::MemoryDriver;
pub use pubsub::{ChannelHandler, ChannelMessage, PubSubMultiplexer, SubscriptionId};
pub use redis_driver::RedisDriver;
pub use serializer::{default_serializer, JsonSerializer, Serializer, SerializerRef};
pub use store::{Batch, BatchEntry, Claim, Counter, Dev, Kv, Store, StoreBuilder, StreamEntry, Streams};
