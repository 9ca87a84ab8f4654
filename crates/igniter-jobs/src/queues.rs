//! Queue management: listing, counts, pause/resume, drain, clean,
//! obliterate.

use crate::broker::{BrokerRef, CleanOptions, JobBroker, JobFilter};
use crate::config::QueueConfig;
use crate::record::{JobCounts, JobRecord};
use igniter_core::IgniterResult;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Insertion-ordered directory of known base queue names and their wire
/// names. Cross-queue operations scan in this order.
pub struct QueueDirectory {
    config: QueueConfig,
    queues: RwLock<Vec<String>>,
}

impl QueueDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            queues: RwLock::new(Vec::new()),
        }
    }

    /// Registers a base name, keeping first-seen order.
    pub fn ensure(&self, base: &str) {
        let mut queues = self.queues.write();
        if !queues.iter().any(|q| q == base) {
            queues.push(base.to_string());
        }
    }

    /// Removes a base name.
    pub fn forget(&self, base: &str) {
        self.queues.write().retain(|q| q != base);
    }

    /// Base names in insertion order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.queues.read().clone()
    }

    /// True when the base name is known.
    #[must_use]
    pub fn contains(&self, base: &str) -> bool {
        self.queues.read().iter().any(|q| q == base)
    }

    /// Wire-level name for a base name.
    #[must_use]
    pub fn full_name(&self, base: &str) -> String {
        self.config.full_name(base)
    }
}

/// One queue's listing entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueInfo {
    /// Base queue name.
    pub name: String,
    /// Dispatch currently paused.
    pub is_paused: bool,
    /// Per-state counts.
    pub job_counts: JobCounts,
}

/// Per-queue lifecycle and introspection operations.
#[derive(Clone)]
pub struct QueueManager {
    broker: BrokerRef,
    directory: Arc<QueueDirectory>,
}

impl QueueManager {
    /// Creates the manager.
    #[must_use]
    pub fn new(broker: BrokerRef, directory: Arc<QueueDirectory>) -> Self {
        Self { broker, directory }
    }

    /// Lists every known queue with its counts.
    pub async fn list(&self) -> IgniterResult<Vec<QueueInfo>> {
        let mut infos = Vec::new();
        for name in self.directory.names() {
            if let Some(info) = self.get(&name).await? {
                infos.push(info);
            }
        }
        Ok(infos)
    }

    /// One queue's listing entry, `None` for unknown names.
    pub async fn get(&self, name: &str) -> IgniterResult<Option<QueueInfo>> {
        if !self.directory.contains(name) {
            return Ok(None);
        }
        let full = self.directory.full_name(name);
        Ok(Some(QueueInfo {
            name: name.to_string(),
            is_paused: self.broker.is_paused(&full).await?,
            job_counts: self.broker.counts(&full).await?,
        }))
    }

    /// Per-state counts.
    pub async fn get_job_counts(&self, name: &str) -> IgniterResult<JobCounts> {
        self.broker.counts(&self.directory.full_name(name)).await
    }

    /// Lists jobs in a queue matching the filter.
    pub async fn get_jobs(&self, name: &str, filter: JobFilter) -> IgniterResult<Vec<JobRecord>> {
        self.broker
            .jobs_by_filter(&self.directory.full_name(name), &filter)
            .await
    }

    /// Pauses dispatch.
    pub async fn pause(&self, name: &str) -> IgniterResult<()> {
        self.broker.pause(&self.directory.full_name(name)).await
    }

    /// Resumes dispatch.
    pub async fn resume(&self, name: &str) -> IgniterResult<()> {
        self.broker.resume(&self.directory.full_name(name)).await
    }

    /// True while paused.
    pub async fn is_paused(&self, name: &str) -> IgniterResult<bool> {
        self.broker.is_paused(&self.directory.full_name(name)).await
    }

    /// Removes all waiting jobs; returns how many were waiting beforehand.
    pub async fn drain(&self, name: &str) -> IgniterResult<u64> {
        self.broker.drain(&self.directory.full_name(name)).await
    }

    /// Removes finished or old records.
    pub async fn clean(&self, name: &str, options: CleanOptions) -> IgniterResult<u64> {
        self.broker
            .clean(&self.directory.full_name(name), &options)
            .await
    }

    /// Destroys the queue entirely; terminal.
    pub async fn obliterate(&self, name: &str, force: bool) -> IgniterResult<()> {
        self.broker
            .obliterate(&self.directory.full_name(name), force)
            .await?;
        self.directory.forget(name);
        Ok(())
    }
}
