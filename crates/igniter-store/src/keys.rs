//! Key composition for the store's Redis layout.
//!
//! Every key is `igniter:store:<service>{:<scopeKey>:<scopeId>}*:<ns>:<key>`.
//! Construction is deterministic: equal inputs always produce byte-identical
//! keys, and distinct scope chains can never collide because identifiers with
//! `:` are rejected before they reach the builder.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix shared by every store key.
const KEY_PREFIX: &str = "igniter:store";

/// Key namespaces of the store surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Plain key/value entries.
    Kv,
    /// Atomic counters.
    Counter,
    /// Single-shot claims (distributed locks).
    Claim,
    /// Pub/sub channels.
    Events,
    /// Append-only streams.
    Streams,
}

impl Namespace {
    /// Returns the key segment for this namespace.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Namespace::Kv => "kv",
            Namespace::Counter => "counter",
            Namespace::Claim => "claim",
            Namespace::Events => "events",
            Namespace::Streams => "streams",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `(key, identifier)` pair in a scope chain.
///
/// Also travels on event envelopes as the publisher's innermost scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeEntry {
    /// Domain label, e.g. `organization`.
    pub key: String,
    /// Tenant identifier rendered to a string.
    pub identifier: String,
}

impl ScopeEntry {
    /// Creates a new scope entry.
    pub fn new(key: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            identifier: identifier.into(),
        }
    }
}

/// Deterministic key builder for one `(service, scope chain)` pair.
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    service: String,
    scopes: Vec<ScopeEntry>,
}

impl KeyBuilder {
    /// Creates a builder for an unscoped service.
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            scopes: Vec::new(),
        }
    }

    /// Returns the scope chain, outermost first.
    #[must_use]
    pub fn scopes(&self) -> &[ScopeEntry] {
        &self.scopes
    }

    /// Returns the innermost scope entry, if any.
    #[must_use]
    pub fn innermost_scope(&self) -> Option<&ScopeEntry> {
        self.scopes.last()
    }

    /// Returns a child builder with `(key, id)` appended to the chain.
    #[must_use]
    pub fn with_scope(&self, key: impl Into<String>, id: impl Into<String>) -> Self {
        let mut scopes = self.scopes.clone();
        scopes.push(ScopeEntry::new(key, id));
        Self {
            service: self.service.clone(),
            scopes,
        }
    }

    fn prefix(&self) -> String {
        let mut prefix = format!("{}:{}", KEY_PREFIX, self.service);
        for scope in &self.scopes {
            prefix.push(':');
            prefix.push_str(&scope.key);
            prefix.push(':');
            prefix.push_str(&scope.identifier);
        }
        prefix
    }

    /// Builds the full key for a namespace and user key.
    #[must_use]
    pub fn build(&self, namespace: Namespace, key: &str) -> String {
        format!("{}:{}:{}", self.prefix(), namespace.as_str(), key)
    }

    /// Builds a glob pattern under a namespace, e.g. for `SCAN`.
    #[must_use]
    pub fn pattern(&self, namespace: Namespace, suffix: &str) -> String {
        format!("{}:{}:{}", self.prefix(), namespace.as_str(), suffix)
    }

    /// Builds the pub/sub channel name for an event path.
    #[must_use]
    pub fn channel(&self, event: &str) -> String {
        self.build(Namespace::Events, event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unscoped_key() {
        let keys = KeyBuilder::new("test-api");
        assert_eq!(
            keys.build(Namespace::Kv, "user:1"),
            "igniter:store:test-api:kv:user:1"
        );
    }

    #[test]
    fn test_scoped_key() {
        let keys = KeyBuilder::new("test-api").with_scope("organization", "org-123");
        assert_eq!(
            keys.channel("user:created"),
            "igniter:store:test-api:organization:org-123:events:user:created"
        );
    }

    #[test]
    fn test_key_determinism() {
        let a = KeyBuilder::new("svc").with_scope("org", "1").with_scope("team", "2");
        let b = KeyBuilder::new("svc").with_scope("org", "1").with_scope("team", "2");
        assert_eq!(a.build(Namespace::Counter, "hits"), b.build(Namespace::Counter, "hits"));
    }

    #[test]
    fn test_scope_monotonicity() {
        let parent = KeyBuilder::new("svc");
        let child = parent.with_scope("org", "1");

        let parent_key = parent.build(Namespace::Kv, "k");
        let child_key = child.build(Namespace::Kv, "k");

        assert_ne!(parent_key, child_key);
        assert!(child_key.contains(":org:1:kv:"));
        assert!(child_key.ends_with(":kv:k"));
        assert!(parent_key.ends_with(":kv:k"));
    }

    #[test]
    fn test_pattern() {
        let keys = KeyBuilder::new("svc");
        assert_eq!(keys.pattern(Namespace::Kv, "user:*"), "igniter:store:svc:kv:user:*");
    }

    #[test]
    fn test_innermost_scope() {
        let keys = KeyBuilder::new("svc").with_scope("org", "1").with_scope("team", "9");
        let innermost = keys.innermost_scope().unwrap();
        assert_eq!(innermost.key, "team");
        assert_eq!(innermost.identifier, "9");
    }
}
