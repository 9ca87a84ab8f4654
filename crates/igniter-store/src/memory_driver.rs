//! In-memory driver.
//!
//! Implements the full [`StoreDriver`] contract against process-local state:
//! useful for tests and local development without a Redis instance. TTLs are
//! honored lazily on read, `SETNX` is atomic under a single lock, and stream
//! ids follow the `<ms>-<seq>` shape.

use crate::driver::{
    AppendOptions, MsetEntry, RawMessage, ScanPage, StoreDriver, StreamMessage, StreamReadOptions,
};
use async_trait::async_trait;
use chrono::Utc;
use igniter_core::IgniterResult;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Capacity of the raw message fan-out channel.
const MESSAGE_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map(|at| at > Instant::now()).unwrap_or(true)
    }
}

#[derive(Debug, Default)]
struct GroupState {
    cursor: usize,
    pending: HashSet<String>,
}

#[derive(Debug, Default)]
struct StreamState {
    last_ms: i64,
    last_seq: u64,
    entries: Vec<StreamMessage>,
    groups: HashMap<String, GroupState>,
}

/// Process-local [`StoreDriver`].
pub struct MemoryDriver {
    entries: Mutex<HashMap<String, Entry>>,
    streams: Mutex<HashMap<String, StreamState>>,
    subscriptions: Mutex<HashSet<String>>,
    messages_tx: broadcast::Sender<RawMessage>,
}

impl MemoryDriver {
    /// Creates an empty in-memory driver.
    #[must_use]
    pub fn new() -> Self {
        let (messages_tx, _) = broadcast::channel(MESSAGE_BUFFER);
        Self {
            entries: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashSet::new()),
            messages_tx,
        }
    }

    fn read_live(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.live() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreDriver for MemoryDriver {
    async fn get(&self, key: &str) -> IgniterResult<Option<String>> {
        Ok(self.read_live(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<u64>) -> IgniterResult<()> {
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|s| Instant::now() + Duration::from_secs(s)),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> IgniterResult<bool> {
        let existed = self.read_live(key).is_some();
        self.entries.lock().remove(key);
        Ok(existed)
    }

    async fn has(&self, key: &str) -> IgniterResult<bool> {
        Ok(self.read_live(key).is_some())
    }

    async fn expire(&self, key: &str, ttl: u64) -> IgniterResult<bool> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.live() => {
                entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment(&self, key: &str, delta: i64) -> IgniterResult<i64> {
        let mut entries = self.entries.lock();
        let current = entries
            .get(key)
            .filter(|e| e.live())
            .and_then(|e| e.value.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + delta;
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at: None,
            },
        );
        Ok(next)
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<u64>) -> IgniterResult<bool> {
        let mut entries = self.entries.lock();
        if entries.get(key).map(Entry::live).unwrap_or(false) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|s| Instant::now() + Duration::from_secs(s)),
            },
        );
        Ok(true)
    }

    async fn mget(&self, keys: &[String]) -> IgniterResult<Vec<Option<String>>> {
        Ok(keys.iter().map(|k| self.read_live(k)).collect())
    }

    async fn mset(&self, entries: &[MsetEntry]) -> IgniterResult<()> {
        let mut map = self.entries.lock();
        for entry in entries {
            map.insert(
                entry.key.clone(),
                Entry {
                    value: entry.value.clone(),
                    expires_at: entry.ttl.map(|s| Instant::now() + Duration::from_secs(s)),
                },
            );
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> IgniterResult<()> {
        let subscriptions = self.subscriptions.lock().clone();
        for target in subscriptions {
            let matched = if target.contains('*') {
                glob_match(&target, channel)
            } else {
                target == channel
            };
            if matched {
                let pattern = target.contains('*').then(|| target.clone());
                let _ = self.messages_tx.send(RawMessage {
                    channel: channel.to_string(),
                    pattern,
                    payload: payload.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> IgniterResult<()> {
        self.subscriptions.lock().insert(channel.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> IgniterResult<()> {
        self.subscriptions.lock().remove(channel);
        Ok(())
    }

    fn messages(&self) -> broadcast::Receiver<RawMessage> {
        self.messages_tx.subscribe()
    }

    async fn scan(
        &self,
        pattern: &str,
        _cursor: u64,
        _count: Option<usize>,
    ) -> IgniterResult<ScanPage> {
        let entries = self.entries.lock();
        let keys = entries
            .iter()
            .filter(|(_, e)| e.live())
            .filter(|(k, _)| glob_match(pattern, k))
            .map(|(k, _)| k.clone())
            .collect();
        Ok(ScanPage { cursor: 0, keys })
    }

    async fn xadd(
        &self,
        stream: &str,
        payload: &str,
        opts: &AppendOptions,
    ) -> IgniterResult<String> {
        let mut streams = self.streams.lock();
        let state = streams.entry(stream.to_string()).or_default();

        let now_ms = Utc::now().timestamp_millis();
        if now_ms == state.last_ms {
            state.last_seq += 1;
        } else {
            state.last_ms = now_ms;
            state.last_seq = 0;
        }
        let id = format!("{}-{}", state.last_ms, state.last_seq);

        state.entries.push(StreamMessage {
            id: id.clone(),
            data: payload.to_string(),
        });

        if let Some(max_len) = opts.max_len {
            let excess = state.entries.len().saturating_sub(max_len as usize);
            if excess > 0 {
                state.entries.drain(..excess);
                for group in state.groups.values_mut() {
                    group.cursor = group.cursor.saturating_sub(excess);
                }
            }
        }

        Ok(id)
    }

    async fn xgroup_create(&self, stream: &str, group: &str, start_id: &str) -> IgniterResult<()> {
        let mut streams = self.streams.lock();
        let state = streams.entry(stream.to_string()).or_default();
        if !state.groups.contains_key(group) {
            let cursor = if start_id == "$" { state.entries.len() } else { 0 };
            state.groups.insert(
                group.to_string(),
                GroupState {
                    cursor,
                    pending: HashSet::new(),
                },
            );
        }
        Ok(())
    }

    async fn xreadgroup(
        &self,
        stream: &str,
        group: &str,
        _consumer: &str,
        opts: &StreamReadOptions,
    ) -> IgniterResult<Vec<StreamMessage>> {
        let mut streams = self.streams.lock();
        let Some(state) = streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let total = state.entries.len();
        let Some(group_state) = state.groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let available = total.saturating_sub(group_state.cursor);
        let take = opts.count.unwrap_or(available).min(available);
        let messages: Vec<StreamMessage> = state.entries
            [group_state.cursor..group_state.cursor + take]
            .to_vec();

        group_state.cursor += take;
        for message in &messages {
            group_state.pending.insert(message.id.clone());
        }

        Ok(messages)
    }

    async fn xack(&self, stream: &str, group: &str, ids: &[String]) -> IgniterResult<u64> {
        let mut streams = self.streams.lock();
        let Some(state) = streams.get_mut(stream) else {
            return Ok(0);
        };
        let Some(group_state) = state.groups.get_mut(group) else {
            return Ok(0);
        };
        let mut acked = 0;
        for id in ids {
            if group_state.pending.remove(id) {
                acked += 1;
            }
        }
        Ok(acked)
    }
}

/// Minimal glob matcher supporting `*`, the only metacharacter the store's
/// patterns use.
fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }

    let mut rest = text;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }

    // Pattern ends with '*': any remainder matches.
    parts.last().map(|p| p.is_empty()).unwrap_or(false) || rest.is_empty()
}
