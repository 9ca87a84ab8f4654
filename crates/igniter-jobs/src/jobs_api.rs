//! Cross-queue job introspection and mutation.
//!
//! Every operation takes `(job_id, queue?)`. Without a queue name, all
//! known queues are scanned in insertion order and the first one owning the
//! id wins; an id no queue owns raises `JOB_NOT_FOUND`.

use crate::broker::{BrokerRef, JobBroker};
use crate::queues::QueueDirectory;
use crate::record::{JobRecord, JobState};
use futures::future::try_join_all;
use igniter_core::{IgniterError, IgniterResult};
use serde_json::Value;
use std::sync::Arc;

/// Single-job operations across all known queues.
#[derive(Clone)]
pub struct JobManager {
    broker: BrokerRef,
    directory: Arc<QueueDirectory>,
}

impl JobManager {
    /// Creates the manager.
    #[must_use]
    pub fn new(broker: BrokerRef, directory: Arc<QueueDirectory>) -> Self {
        Self { broker, directory }
    }

    /// Resolves the wire queue name owning `job_id`.
    async fn owner(&self, job_id: &str, queue: Option<&str>) -> IgniterResult<String> {
        match queue {
            Some(base) => {
                let full = self.directory.full_name(base);
                if self.broker.get_job(&full, job_id).await?.is_some() {
                    Ok(full)
                } else {
                    Err(IgniterError::JobNotFound {
                        job_id: job_id.to_string(),
                    })
                }
            }
            None => {
                for base in self.directory.names() {
                    let full = self.directory.full_name(&base);
                    if self.broker.get_job(&full, job_id).await?.is_some() {
                        return Ok(full);
                    }
                }
                Err(IgniterError::JobNotFound {
                    job_id: job_id.to_string(),
                })
            }
        }
    }

    /// Loads the job record.
    pub async fn get(&self, job_id: &str, queue: Option<&str>) -> IgniterResult<JobRecord> {
        let full = self.owner(job_id, queue).await?;
        self.broker
            .get_job(&full, job_id)
            .await?
            .ok_or_else(|| IgniterError::JobNotFound {
                job_id: job_id.to_string(),
            })
    }

    /// Resolves the job's effective state.
    pub async fn get_state(&self, job_id: &str, queue: Option<&str>) -> IgniterResult<JobState> {
        let full = self.owner(job_id, queue).await?;
        self.broker
            .get_state(&full, job_id)
            .await?
            .ok_or_else(|| IgniterError::JobNotFound {
                job_id: job_id.to_string(),
            })
    }

    /// Reads the job's log lines.
    pub async fn get_logs(&self, job_id: &str, queue: Option<&str>) -> IgniterResult<Vec<String>> {
        let full = self.owner(job_id, queue).await?;
        self.broker.get_logs(&full, job_id).await
    }

    /// Reads the job's progress value.
    pub async fn get_progress(
        &self,
        job_id: &str,
        queue: Option<&str>,
    ) -> IgniterResult<Option<Value>> {
        let full = self.owner(job_id, queue).await?;
        self.broker.get_progress(&full, job_id).await
    }

    /// Moves a failed job back to waiting.
    pub async fn retry(&self, job_id: &str, queue: Option<&str>) -> IgniterResult<()> {
        let full = self.owner(job_id, queue).await?;
        self.broker.retry_job(&full, job_id).await
    }

    /// Removes the job everywhere.
    pub async fn remove(&self, job_id: &str, queue: Option<&str>) -> IgniterResult<()> {
        let full = self.owner(job_id, queue).await?;
        self.broker.remove(&full, job_id).await
    }

    /// Promotes a delayed job to waiting now.
    pub async fn promote(&self, job_id: &str, queue: Option<&str>) -> IgniterResult<()> {
        let full = self.owner(job_id, queue).await?;
        self.broker.promote(&full, job_id).await
    }

    /// Force-fails the job with a reason.
    pub async fn move_to_failed(
        &self,
        job_id: &str,
        reason: &str,
        queue: Option<&str>,
    ) -> IgniterResult<()> {
        let full = self.owner(job_id, queue).await?;
        self.broker.move_to_failed(&full, job_id, reason).await
    }

    /// Retries many jobs concurrently; the first failure aborts the batch.
    pub async fn retry_many(&self, job_ids: &[String]) -> IgniterResult<()> {
        try_join_all(job_ids.iter().map(|id| self.retry(id, None))).await?;
        Ok(())
    }

    /// Removes many jobs concurrently; the first failure aborts the batch.
    pub async fn remove_many(&self, job_ids: &[String]) -> IgniterResult<()> {
        try_join_all(job_ids.iter().map(|id| self.remove(id, None))).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::memory_broker::MemoryBroker;
    use crate::record::JobOptions;
    use serde_json::json;

    fn setup() -> (BrokerRef, Arc<QueueDirectory>, JobManager) {
        let broker: BrokerRef = Arc::new(MemoryBroker::new());
        let directory = Arc::new(QueueDirectory::new(QueueConfig::default()));
        let manager = JobManager::new(broker.clone(), directory.clone());
        (broker, directory, manager)
    }

    async fn seed(broker: &BrokerRef, directory: &QueueDirectory, queue: &str, name: &str) -> String {
        directory.ensure(queue);
        broker
            .enqueue(JobRecord::new(
                name,
                directory.full_name(queue),
                json!({}),
                JobOptions::default(),
            ))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_scan_finds_owner_across_queues() {
        let (broker, directory, manager) = setup();
        seed(&broker, &directory, "first", "a").await;
        let id = seed(&broker, &directory, "second", "b").await;

        let record = manager.get(&id, None).await.unwrap();
        assert_eq!(record.name, "b");

        let state = manager.get_state(&id, None).await.unwrap();
        assert_eq!(state, JobState::Waiting);
    }

    #[tokio::test]
    async fn test_unknown_id_raises_job_not_found() {
        let (broker, directory, manager) = setup();
        seed(&broker, &directory, "q", "a").await;

        let err = manager.get("no-such-id", None).await.unwrap_err();
        assert!(err.is("JOB_NOT_FOUND"));

        let err = manager.get("no-such-id", Some("q")).await.unwrap_err();
        assert!(err.is("JOB_NOT_FOUND"));
    }

    #[tokio::test]
    async fn test_retry_after_forced_failure() {
        let (broker, directory, manager) = setup();
        let id = seed(&broker, &directory, "q", "a").await;

        manager.move_to_failed(&id, "operator", None).await.unwrap();
        assert_eq!(manager.get_state(&id, None).await.unwrap(), JobState::Failed);

        manager.retry(&id, None).await.unwrap();
        assert_eq!(manager.get_state(&id, None).await.unwrap(), JobState::Waiting);
    }

    #[tokio::test]
    async fn test_promote_delayed() {
        let (broker, directory, manager) = setup();
        directory.ensure("q");
        let opts = JobOptions {
            delay: Some(60_000),
            ..JobOptions::default()
        };
        let id = broker
            .enqueue(JobRecord::new("slow", directory.full_name("q"), json!({}), opts))
            .await
            .unwrap();

        assert_eq!(manager.get_state(&id, None).await.unwrap(), JobState::Delayed);
        manager.promote(&id, None).await.unwrap();
        assert_eq!(manager.get_state(&id, None).await.unwrap(), JobState::Waiting);
    }

    #[tokio::test]
    async fn test_bulk_operations_fail_fast() {
        let (broker, directory, manager) = setup();
        let id = seed(&broker, &directory, "q", "a").await;

        let err = manager
            .remove_many(&[id.clone(), "missing".to_string()])
            .await
            .unwrap_err();
        assert!(err.is("JOB_NOT_FOUND"));

        // The existing one may or may not have been removed before the
        // failure; the batch contract is only fail-fast, not atomicity.
        let _ = manager.get(&id, None).await;
    }

    #[tokio::test]
    async fn test_remove_many() {
        let (broker, directory, manager) = setup();
        let a = seed(&broker, &directory, "q", "a").await;
        let b = seed(&broker, &directory, "q", "b").await;

        manager.remove_many(&[a.clone(), b.clone()]).await.unwrap();
        assert!(manager.get(&a, None).await.is_err());
        assert!(manager.get(&b, None).await.is_err());
    }
}
