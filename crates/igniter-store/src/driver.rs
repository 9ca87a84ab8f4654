//! Driver abstraction over the Redis command surface the store uses.
//!
//! The trait is deliberately thin: each method maps to one Redis command (or
//! one pipeline), and semantics are fixed here so every driver behaves the
//! same. Subscription traffic is delivered out-of-band through the driver's
//! raw message channel; a dedicated subscription connection backs it in the
//! Redis driver.

use async_trait::async_trait;
use igniter_core::IgniterResult;
use std::sync::Arc;
use tokio::sync::broadcast;

/// One raw pub/sub delivery.
///
/// `pattern` is set when the message arrived through a pattern subscription;
/// dispatch routes on `pattern` when present, else on `channel`.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Concrete channel the message was published to.
    pub channel: String,
    /// Matching subscription pattern, for wildcard subscriptions.
    pub pattern: Option<String>,
    /// Serialized payload.
    pub payload: String,
}

impl RawMessage {
    /// Returns the subscription key this message should be routed by.
    #[must_use]
    pub fn routing_key(&self) -> &str {
        self.pattern.as_deref().unwrap_or(&self.channel)
    }
}

/// One page of a `SCAN` iteration.
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    /// Cursor to pass to the next call; 0 means the iteration finished.
    pub cursor: u64,
    /// Keys matched on this page.
    pub keys: Vec<String>,
}

/// One entry read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    /// Server-assigned id, `<ms>-<seq>`.
    pub id: String,
    /// Serialized payload stored under the `data` field.
    pub data: String,
}

/// Options for `XADD`.
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// Trim the stream to roughly this many entries.
    pub max_len: Option<u64>,
    /// Use approximate (`~`) trimming.
    pub approximate: bool,
}

/// Options for `XREADGROUP`.
#[derive(Debug, Clone, Default)]
pub struct StreamReadOptions {
    /// Maximum entries to return.
    pub count: Option<usize>,
    /// Block up to this many milliseconds waiting for entries.
    pub block_ms: Option<u64>,
}

/// One entry of a batched write.
#[derive(Debug, Clone)]
pub struct MsetEntry {
    /// Full key.
    pub key: String,
    /// Encoded value.
    pub value: String,
    /// Optional TTL in seconds.
    pub ttl: Option<u64>,
}

/// The Redis-shaped command surface the store is built on.
#[async_trait]
pub trait StoreDriver: Send + Sync {
    /// `GET` — returns the stored string, or `None` when absent.
    async fn get(&self, key: &str) -> IgniterResult<Option<String>>;

    /// `SET k v [EX ttl]`.
    async fn set(&self, key: &str, value: &str, ttl: Option<u64>) -> IgniterResult<()>;

    /// `DEL` — returns true when the key existed.
    async fn delete(&self, key: &str) -> IgniterResult<bool>;

    /// `EXISTS`.
    async fn has(&self, key: &str) -> IgniterResult<bool>;

    /// `EXPIRE` — returns true when the key existed.
    async fn expire(&self, key: &str, ttl: u64) -> IgniterResult<bool>;

    /// `INCR` / `INCRBY` — a missing key initializes to 0 first.
    async fn increment(&self, key: &str, delta: i64) -> IgniterResult<i64>;

    /// `SET k v NX [EX ttl]` when a TTL is given, `SETNX` otherwise.
    ///
    /// Returns true when this call acquired the key.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<u64>) -> IgniterResult<bool>;

    /// `MGET`.
    async fn mget(&self, keys: &[String]) -> IgniterResult<Vec<Option<String>>>;

    /// Batched write: TTL entries through pipelined `SET EX`, the rest
    /// through a single `MSET`.
    async fn mset(&self, entries: &[MsetEntry]) -> IgniterResult<()>;

    /// `PUBLISH`.
    async fn publish(&self, channel: &str, payload: &str) -> IgniterResult<()>;

    /// `SUBSCRIBE` (or `PSUBSCRIBE` when the channel contains `*`) on the
    /// dedicated subscription connection.
    async fn subscribe(&self, channel: &str) -> IgniterResult<()>;

    /// `UNSUBSCRIBE` / `PUNSUBSCRIBE`.
    async fn unsubscribe(&self, channel: &str) -> IgniterResult<()>;

    /// Raw delivery channel for subscribed messages.
    fn messages(&self) -> broadcast::Receiver<RawMessage>;

    /// `SCAN cursor MATCH pattern [COUNT n]`.
    async fn scan(&self, pattern: &str, cursor: u64, count: Option<usize>)
        -> IgniterResult<ScanPage>;

    /// `XADD stream [MAXLEN [~] n] * data <payload>` — returns the new id.
    async fn xadd(&self, stream: &str, payload: &str, opts: &AppendOptions)
        -> IgniterResult<String>;

    /// `XGROUP CREATE stream group id MKSTREAM`; an already-existing group
    /// is not an error.
    async fn xgroup_create(&self, stream: &str, group: &str, start_id: &str) -> IgniterResult<()>;

    /// `XREADGROUP GROUP g c [COUNT n] [BLOCK ms] STREAMS s >`.
    async fn xreadgroup(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        opts: &StreamReadOptions,
    ) -> IgniterResult<Vec<StreamMessage>>;

    /// `XACK` — returns the number of entries acknowledged.
    async fn xack(&self, stream: &str, group: &str, ids: &[String]) -> IgniterResult<u64>;
}

/// Shared driver handle.
pub type DriverRef = Arc<dyn StoreDriver>;
