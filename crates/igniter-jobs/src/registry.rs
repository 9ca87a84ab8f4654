//! Job definition registry.
//!
//! Holds the flattened `namespace.jobId -> definition` mapping produced by
//! router merges. Reads vastly outnumber writes: the map lives behind a
//! `parking_lot::RwLock` and lookups clone the `Arc`'d definition.

use crate::definition::JobDefinition;
use igniter_core::{IgniterError, IgniterResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Name → definition directory.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, Arc<JobDefinition>>>,
}

impl JobRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one definition under its (namespaced) name.
    pub fn register(&self, name: impl Into<String>, definition: JobDefinition) {
        let name = name.into();
        debug!(job = %name, "Registered job definition");
        self.jobs.write().insert(name, Arc::new(definition));
    }

    /// Looks up a definition.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<JobDefinition>> {
        self.jobs.read().get(name).cloned()
    }

    /// Looks up a definition, raising `JOB_NOT_REGISTERED` when absent.
    pub fn require(&self, name: &str) -> IgniterResult<Arc<JobDefinition>> {
        self.get(name).ok_or_else(|| IgniterError::JobNotRegistered {
            name: name.to_string(),
        })
    }

    /// True when the name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.jobs.read().contains_key(name)
    }

    /// All registered names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.jobs.read().keys().cloned().collect()
    }

    /// All registered definitions.
    #[must_use]
    pub fn definitions(&self) -> Vec<Arc<JobDefinition>> {
        self.jobs.read().values().cloned().collect()
    }

    /// Number of registered definitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    /// True when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }

    /// Drops every definition; used by shutdown.
    pub fn clear(&self) {
        self.jobs.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop_definition(id: &str) -> JobDefinition {
        JobDefinition::builder(id)
            .handler(|_ctx| async { Ok(json!(null)) })
            .build()
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = JobRegistry::new();
        registry.register("emails.send", noop_definition("send"));

        assert!(registry.contains("emails.send"));
        assert_eq!(registry.get("emails.send").unwrap().id, "send");
        assert!(registry.get("emails.other").is_none());

        let err = registry.require("emails.other").unwrap_err();
        assert!(err.is("JOB_NOT_REGISTERED"));
    }

    #[test]
    fn test_clear() {
        let registry = JobRegistry::new();
        registry.register("a", noop_definition("a"));
        registry.register("b", noop_definition("b"));
        assert_eq!(registry.len(), 2);

        registry.clear();
        assert!(registry.is_empty());
    }
}
