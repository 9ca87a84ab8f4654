//! In-memory broker.
//!
//! Implements the full [`JobBroker`] contract on process-local structures,
//! with the same ordering and state semantics as the Redis broker. Used by
//! tests and local development.

use crate::broker::{priority_score, CleanOptions, JobBroker, JobFilter};
use crate::record::{JobCounts, JobRecord, JobState};
use async_trait::async_trait;
use chrono::Utc;
use igniter_core::{IgniterError, IgniterResult};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Default)]
struct QueueState {
    /// `(score, seq, id)`, kept sorted ascending.
    waiting: Vec<(f64, u64, String)>,
    /// `(ready_ms, id)`.
    delayed: Vec<(i64, String)>,
    /// `id -> worker_id`.
    active: HashMap<String, String>,
    /// `(finished_ms, id)`, most recent last.
    completed: Vec<(i64, String)>,
    failed: Vec<(i64, String)>,
    paused: bool,
    jobs: HashMap<String, JobRecord>,
    logs: HashMap<String, Vec<String>>,
}

impl QueueState {
    fn push_waiting(&mut self, score: f64, seq: u64, id: String) {
        self.waiting.push((score, seq, id));
        self.waiting
            .sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    }

    fn remove_everywhere(&mut self, id: &str) {
        self.waiting.retain(|(_, _, entry)| entry != id);
        self.delayed.retain(|(_, entry)| entry != id);
        self.active.remove(id);
        self.completed.retain(|(_, entry)| entry != id);
        self.failed.retain(|(_, entry)| entry != id);
    }

    fn promote_due(&mut self, now_ms: i64, seq: &mut u64) {
        let due: Vec<String> = self
            .delayed
            .iter()
            .filter(|(ready, _)| *ready <= now_ms)
            .map(|(_, id)| id.clone())
            .collect();
        self.delayed.retain(|(ready, _)| *ready > now_ms);

        for id in due {
            let priority = self.jobs.get(&id).map(|j| j.priority).unwrap_or(0);
            if let Some(job) = self.jobs.get_mut(&id) {
                job.status = JobState::Waiting;
            }
            *seq += 1;
            self.push_waiting(priority_score(priority, now_ms), *seq, id);
        }
    }

    /// Ids in one effective state. The subsets are mutually exclusive and
    /// agree with `get_state`: waiting jobs in a paused queue are `Paused`
    /// (never `Waiting`), and an active-status record without a live hold
    /// is `Stalled` (never `Active`).
    fn ids_for_status(&self, status: JobState) -> Vec<String> {
        match status {
            JobState::Waiting if self.paused => Vec::new(),
            JobState::Waiting => self.waiting.iter().map(|(_, _, id)| id.clone()).collect(),
            JobState::Paused if self.paused => {
                self.waiting.iter().map(|(_, _, id)| id.clone()).collect()
            }
            JobState::Paused => Vec::new(),
            JobState::Active => self.active.keys().cloned().collect(),
            JobState::Stalled => self
                .jobs
                .iter()
                .filter(|(id, record)| {
                    record.status == JobState::Active && !self.active.contains_key(id.as_str())
                })
                .map(|(id, _)| id.clone())
                .collect(),
            JobState::Delayed => self.delayed.iter().map(|(_, id)| id.clone()).collect(),
            JobState::Completed => self.completed.iter().rev().map(|(_, id)| id.clone()).collect(),
            JobState::Failed => self.failed.iter().rev().map(|(_, id)| id.clone()).collect(),
        }
    }
}

/// Process-local [`JobBroker`].
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, QueueState>>,
    seq: Mutex<u64>,
}

impl MemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            seq: Mutex::new(0),
        }
    }

    fn with_queue<R>(&self, queue: &str, f: impl FnOnce(&mut QueueState, &mut u64) -> R) -> R {
        let mut queues = self.queues.lock();
        let state = queues.entry(queue.to_string()).or_default();
        let mut seq = self.seq.lock();
        f(state, &mut seq)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobBroker for MemoryBroker {
    async fn enqueue(&self, mut record: JobRecord) -> IgniterResult<String> {
        let now_ms = Utc::now().timestamp_millis();
        self.with_queue(&record.queue.clone(), |state, seq| {
            if record.opts.job_id.is_some() && state.jobs.contains_key(&record.id) {
                return Ok(record.id);
            }

            let id = record.id.clone();
            match record.opts.delay {
                Some(delay) if delay > 0 => {
                    record.status = JobState::Delayed;
                    state.delayed.push((now_ms + delay as i64, id.clone()));
                }
                _ => {
                    record.status = JobState::Waiting;
                    *seq += 1;
                    state.push_waiting(priority_score(record.priority, now_ms), *seq, id.clone());
                }
            }
            state.jobs.insert(id.clone(), record);
            Ok(id)
        })
    }

    async fn dequeue(&self, queue: &str, worker_id: &str) -> IgniterResult<Option<JobRecord>> {
        let now_ms = Utc::now().timestamp_millis();
        self.with_queue(queue, |state, seq| {
            if state.paused {
                return Ok(None);
            }
            state.promote_due(now_ms, seq);

            if state.waiting.is_empty() {
                return Ok(None);
            }
            let (_, _, id) = state.waiting.remove(0);

            let Some(record) = state.jobs.get_mut(&id) else {
                return Ok(None);
            };
            record.status = JobState::Active;
            record.attempts_made += 1;
            record.processed_at = Some(Utc::now());
            state.active.insert(id, worker_id.to_string());
            Ok(Some(record.clone()))
        })
    }

    async fn complete(&self, record: &JobRecord, result: Value) -> IgniterResult<()> {
        let now_ms = Utc::now().timestamp_millis();
        self.with_queue(&record.queue, |state, _seq| {
            state.active.remove(&record.id);

            let drop_record =
                record.opts.repeat.is_some() || record.opts.remove_on_complete.unwrap_or(false);
            if drop_record {
                state.jobs.remove(&record.id);
                state.logs.remove(&record.id);
                return Ok(());
            }

            if let Some(stored) = state.jobs.get_mut(&record.id) {
                stored.status = JobState::Completed;
                stored.result = Some(result);
                stored.completed_at = Some(Utc::now());
                stored.attempts_made = record.attempts_made;
                stored.error = None;
            }
            state.completed.push((now_ms, record.id.clone()));
            Ok(())
        })
    }

    async fn retry_later(
        &self,
        record: &JobRecord,
        error: &str,
        delay: Duration,
    ) -> IgniterResult<()> {
        let ready = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        self.with_queue(&record.queue, |state, _seq| {
            state.active.remove(&record.id);
            if let Some(stored) = state.jobs.get_mut(&record.id) {
                stored.status = JobState::Delayed;
                stored.error = Some(error.to_string());
                stored.attempts_made = record.attempts_made;
            }
            state.delayed.push((ready, record.id.clone()));
            Ok(())
        })
    }

    async fn fail_terminal(&self, record: &JobRecord, error: &str) -> IgniterResult<()> {
        let now_ms = Utc::now().timestamp_millis();
        self.with_queue(&record.queue, |state, _seq| {
            state.active.remove(&record.id);

            if record.opts.remove_on_fail.unwrap_or(false) {
                state.jobs.remove(&record.id);
                state.logs.remove(&record.id);
                return Ok(());
            }

            if let Some(stored) = state.jobs.get_mut(&record.id) {
                stored.status = JobState::Failed;
                stored.error = Some(error.to_string());
                stored.attempts_made = record.attempts_made;
            }
            state.failed.push((now_ms, record.id.clone()));
            Ok(())
        })
    }

    async fn requeue(&self, record: &JobRecord) -> IgniterResult<()> {
        self.with_queue(&record.queue, |state, seq| {
            state.active.remove(&record.id);
            if let Some(stored) = state.jobs.get_mut(&record.id) {
                stored.status = JobState::Waiting;
                stored.attempts_made = stored.attempts_made.saturating_sub(1);
            }
            let score = priority_score(record.priority, record.created_at.timestamp_millis());
            *seq += 1;
            state.push_waiting(score, *seq, record.id.clone());
            Ok(())
        })
    }

    async fn get_job(&self, queue: &str, id: &str) -> IgniterResult<Option<JobRecord>> {
        self.with_queue(queue, |state, _| Ok(state.jobs.get(id).cloned()))
    }

    async fn get_state(&self, queue: &str, id: &str) -> IgniterResult<Option<JobState>> {
        self.with_queue(queue, |state, _| {
            let Some(record) = state.jobs.get(id) else {
                return Ok(None);
            };
            let effective = match record.status {
                JobState::Active if !state.active.contains_key(id) => JobState::Stalled,
                JobState::Waiting if state.paused => JobState::Paused,
                status => status,
            };
            Ok(Some(effective))
        })
    }

    async fn get_logs(&self, queue: &str, id: &str) -> IgniterResult<Vec<String>> {
        self.with_queue(queue, |state, _| {
            Ok(state.logs.get(id).cloned().unwrap_or_default())
        })
    }

    async fn append_log(&self, queue: &str, id: &str, line: &str) -> IgniterResult<()> {
        self.with_queue(queue, |state, _| {
            state.logs.entry(id.to_string()).or_default().push(line.to_string());
            Ok(())
        })
    }

    async fn set_progress(&self, queue: &str, id: &str, progress: Value) -> IgniterResult<()> {
        self.with_queue(queue, |state, _| {
            if let Some(record) = state.jobs.get_mut(id) {
                record.progress = Some(progress);
            }
            Ok(())
        })
    }

    async fn get_progress(&self, queue: &str, id: &str) -> IgniterResult<Option<Value>> {
        self.with_queue(queue, |state, _| {
            Ok(state.jobs.get(id).and_then(|r| r.progress.clone()))
        })
    }

    async fn counts(&self, queue: &str) -> IgniterResult<JobCounts> {
        self.with_queue(queue, |state, _| {
            // Waiting and paused are exclusive, matching get_state: a paused
            // queue reports its backlog under paused only.
            let waiting = state.waiting.len() as u64;
            Ok(JobCounts {
                waiting: if state.paused { 0 } else { waiting },
                active: state.active.len() as u64,
                completed: state.completed.len() as u64,
                failed: state.failed.len() as u64,
                delayed: state.delayed.len() as u64,
                paused: if state.paused { waiting } else { 0 },
            })
        })
    }

    async fn jobs_by_filter(
        &self,
        queue: &str,
        filter: &JobFilter,
    ) -> IgniterResult<Vec<JobRecord>> {
        self.with_queue(queue, |state, _| {
            let statuses: Vec<JobState> = if filter.statuses.is_empty() {
                vec![
                    JobState::Waiting,
                    JobState::Paused,
                    JobState::Active,
                    JobState::Stalled,
                    JobState::Delayed,
                    JobState::Completed,
                    JobState::Failed,
                ]
            } else {
                filter.statuses.clone()
            };

            let mut ids: Vec<String> = Vec::new();
            for status in statuses {
                ids.extend(state.ids_for_status(status));
            }

            let records = ids
                .into_iter()
                .skip(filter.offset)
                .take(filter.limit.unwrap_or(usize::MAX))
                .filter_map(|id| state.jobs.get(&id).cloned())
                .collect();
            Ok(records)
        })
    }

    async fn pause(&self, queue: &str) -> IgniterResult<()> {
        self.with_queue(queue, |state, _| {
            state.paused = true;
            Ok(())
        })
    }

    async fn resume(&self, queue: &str) -> IgniterResult<()> {
        self.with_queue(queue, |state, _| {
            state.paused = false;
            Ok(())
        })
    }

    async fn is_paused(&self, queue: &str) -> IgniterResult<bool> {
        self.with_queue(queue, |state, _| Ok(state.paused))
    }

    async fn drain(&self, queue: &str) -> IgniterResult<u64> {
        self.with_queue(queue, |state, _| {
            let count = state.waiting.len() as u64;
            let ids: Vec<String> = state.waiting.iter().map(|(_, _, id)| id.clone()).collect();
            state.waiting.clear();
            for id in ids {
                state.jobs.remove(&id);
                state.logs.remove(&id);
            }
            Ok(count)
        })
    }

    async fn clean(&self, queue: &str, options: &CleanOptions) -> IgniterResult<u64> {
        let now = Utc::now();
        self.with_queue(queue, |state, _| {
            let statuses = if options.statuses.is_empty() {
                vec![JobState::Completed, JobState::Failed]
            } else {
                options.statuses.clone()
            };

            let limit = options.limit.unwrap_or(usize::MAX);
            let mut removed = 0u64;

            let old_enough = |record: &JobRecord| match options.older_than {
                None => true,
                Some(age) => {
                    let reference = record.completed_at.unwrap_or(record.created_at);
                    now.signed_duration_since(reference).to_std().map(|d| d >= age).unwrap_or(false)
                }
            };

            for status in statuses {
                // In-flight jobs are never cleaned.
                let candidates: Vec<String> = match status {
                    JobState::Active | JobState::Stalled => Vec::new(),
                    status => state.ids_for_status(status),
                };

                for id in candidates {
                    if removed as usize >= limit {
                        break;
                    }
                    let eligible = state.jobs.get(&id).map(&old_enough).unwrap_or(true);
                    if eligible {
                        state.remove_everywhere(&id);
                        state.jobs.remove(&id);
                        state.logs.remove(&id);
                        removed += 1;
                    }
                }
            }
            Ok(removed)
        })
    }

    async fn obliterate(&self, queue: &str, force: bool) -> IgniterResult<()> {
        let mut queues = self.queues.lock();
        if let Some(state) = queues.get(queue) {
            if !force && !state.active.is_empty() {
                return Err(IgniterError::internal(format!(
                    "Cannot obliterate queue '{queue}' with {} active jobs",
                    state.active.len()
                )));
            }
        }
        queues.remove(queue);
        Ok(())
    }

    async fn remove(&self, queue: &str, id: &str) -> IgniterResult<()> {
        self.with_queue(queue, |state, _| {
            state.remove_everywhere(id);
            state.jobs.remove(id);
            state.logs.remove(id);
            Ok(())
        })
    }

    async fn promote(&self, queue: &str, id: &str) -> IgniterResult<()> {
        let now_ms = Utc::now().timestamp_millis();
        self.with_queue(queue, |state, seq| {
            let before = state.delayed.len();
            state.delayed.retain(|(_, entry)| entry != id);
            if state.delayed.len() == before {
                return Ok(());
            }
            let priority = state.jobs.get(id).map(|j| j.priority).unwrap_or(0);
            if let Some(record) = state.jobs.get_mut(id) {
                record.status = JobState::Waiting;
            }
            *seq += 1;
            state.push_waiting(priority_score(priority, now_ms), *seq, id.to_string());
            Ok(())
        })
    }

    async fn retry_job(&self, queue: &str, id: &str) -> IgniterResult<()> {
        let now_ms = Utc::now().timestamp_millis();
        self.with_queue(queue, |state, seq| {
            state.failed.retain(|(_, entry)| entry != id);
            let priority = state.jobs.get(id).map(|j| j.priority).unwrap_or(0);
            if let Some(record) = state.jobs.get_mut(id) {
                record.status = JobState::Waiting;
                record.error = None;
                record.attempts_made = 0;
            }
            *seq += 1;
            state.push_waiting(priority_score(priority, now_ms), *seq, id.to_string());
            Ok(())
        })
    }

    async fn move_to_failed(&self, queue: &str, id: &str, reason: &str) -> IgniterResult<()> {
        let now_ms = Utc::now().timestamp_millis();
        self.with_queue(queue, |state, _| {
            state.waiting.retain(|(_, _, entry)| entry != id);
            state.delayed.retain(|(_, entry)| entry != id);
            state.active.remove(id);
            if let Some(record) = state.jobs.get_mut(id) {
                record.status = JobState::Failed;
                record.error = Some(reason.to_string());
            }
            state.failed.push((now_ms, id.to_string()));
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::JobOptions;
    use serde_json::json;

    fn record(queue: &str, name: &str, opts: JobOptions) -> JobRecord {
        JobRecord::new(name, queue, json!({}), opts)
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let broker = MemoryBroker::new();

        let mut low = record("q", "low", JobOptions::default());
        low.priority = 0;
        let mut high = record("q", "high", JobOptions::default());
        high.priority = 10;
        let mut second_low = record("q", "low2", JobOptions::default());
        second_low.priority = 0;

        broker.enqueue(low).await.unwrap();
        broker.enqueue(high).await.unwrap();
        broker.enqueue(second_low).await.unwrap();

        let first = broker.dequeue("q", "w").await.unwrap().unwrap();
        assert_eq!(first.name, "high");
        let second = broker.dequeue("q", "w").await.unwrap().unwrap();
        assert_eq!(second.name, "low");
        let third = broker.dequeue("q", "w").await.unwrap().unwrap();
        assert_eq!(third.name, "low2");
    }

    #[tokio::test]
    async fn test_dequeue_consumes_attempt_and_marks_active() {
        let broker = MemoryBroker::new();
        let id = broker.enqueue(record("q", "j", JobOptions::default())).await.unwrap();

        let job = broker.dequeue("q", "worker-1").await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 1);
        assert_eq!(job.status, JobState::Active);
        assert_eq!(broker.get_state("q", &id).await.unwrap(), Some(JobState::Active));
    }

    #[tokio::test]
    async fn test_delayed_promotion() {
        let broker = MemoryBroker::new();
        let opts = JobOptions {
            delay: Some(50),
            ..JobOptions::default()
        };
        let id = broker.enqueue(record("q", "later", opts)).await.unwrap();

        assert_eq!(broker.get_state("q", &id).await.unwrap(), Some(JobState::Delayed));
        assert!(broker.dequeue("q", "w").await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let job = broker.dequeue("q", "w").await.unwrap().unwrap();
        assert_eq!(job.id, id);
    }

    #[tokio::test]
    async fn test_explicit_job_id_dedup() {
        let broker = MemoryBroker::new();
        let opts = JobOptions {
            job_id: Some("report__cron".into()),
            ..JobOptions::default()
        };
        let first = broker.enqueue(record("q", "report", opts.clone())).await.unwrap();
        let second = broker.enqueue(record("q", "report", opts)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(broker.counts("q").await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_complete_and_result() {
        let broker = MemoryBroker::new();
        let id = broker.enqueue(record("q", "j", JobOptions::default())).await.unwrap();
        let job = broker.dequeue("q", "w").await.unwrap().unwrap();

        broker.complete(&job, json!({"ok": true})).await.unwrap();

        let stored = broker.get_job("q", &id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobState::Completed);
        assert_eq!(stored.result, Some(json!({"ok": true})));
        assert!(stored.completed_at.is_some());
        assert_eq!(broker.counts("q").await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn test_repeat_record_dropped_on_complete() {
        let broker = MemoryBroker::new();
        let opts = JobOptions {
            job_id: Some("cron-job__cron".into()),
            repeat: Some(crate::record::RepeatSpec {
                every: Some(60_000),
                ..crate::record::RepeatSpec::default()
            }),
            ..JobOptions::default()
        };
        let id = broker.enqueue(record("q", "cron-job", opts.clone())).await.unwrap();
        let job = broker.dequeue("q", "w").await.unwrap().unwrap();
        broker.complete(&job, json!(null)).await.unwrap();

        // The id is free again for the next iteration.
        assert!(broker.get_job("q", &id).await.unwrap().is_none());
        let again = broker.enqueue(record("q", "cron-job", opts)).await.unwrap();
        assert_eq!(again, id);
    }

    #[tokio::test]
    async fn test_retry_later_delays_job() {
        let broker = MemoryBroker::new();
        let id = broker.enqueue(record("q", "flaky", JobOptions::default())).await.unwrap();
        let job = broker.dequeue("q", "w").await.unwrap().unwrap();

        broker.retry_later(&job, "boom", Duration::from_millis(10)).await.unwrap();
        assert_eq!(broker.get_state("q", &id).await.unwrap(), Some(JobState::Delayed));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let retried = broker.dequeue("q", "w").await.unwrap().unwrap();
        assert_eq!(retried.attempts_made, 2);
        assert_eq!(retried.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_fail_terminal() {
        let broker = MemoryBroker::new();
        let id = broker.enqueue(record("q", "j", JobOptions::default())).await.unwrap();
        let job = broker.dequeue("q", "w").await.unwrap().unwrap();

        broker.fail_terminal(&job, "gave up").await.unwrap();
        let stored = broker.get_job("q", &id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobState::Failed);
        assert_eq!(stored.error.as_deref(), Some("gave up"));
        assert_eq!(broker.counts("q").await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_requeue_refunds_attempt() {
        let broker = MemoryBroker::new();
        let id = broker.enqueue(record("q", "filtered", JobOptions::default())).await.unwrap();
        let job = broker.dequeue("q", "w").await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 1);

        broker.requeue(&job).await.unwrap();
        assert_eq!(broker.get_state("q", &id).await.unwrap(), Some(JobState::Waiting));

        let again = broker.dequeue("q", "w").await.unwrap().unwrap();
        assert_eq!(again.attempts_made, 1);
    }

    #[tokio::test]
    async fn test_pause_blocks_dispatch() {
        let broker = MemoryBroker::new();
        let id = broker.enqueue(record("q", "j", JobOptions::default())).await.unwrap();

        broker.pause("q").await.unwrap();
        assert!(broker.is_paused("q").await.unwrap());
        assert!(broker.dequeue("q", "w").await.unwrap().is_none());
        assert_eq!(broker.get_state("q", &id).await.unwrap(), Some(JobState::Paused));

        // The backlog is reported once: under paused, not waiting as well.
        let counts = broker.counts("q").await.unwrap();
        assert_eq!(counts.paused, 1);
        assert_eq!(counts.waiting, 0);

        broker.resume("q").await.unwrap();
        let counts = broker.counts("q").await.unwrap();
        assert_eq!(counts.waiting, 1);
        assert_eq!(counts.paused, 0);
        assert!(broker.dequeue("q", "w").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_filter_states_are_exclusive() {
        let broker = MemoryBroker::new();
        let id = broker.enqueue(record("q", "j", JobOptions::default())).await.unwrap();

        broker.pause("q").await.unwrap();
        let by_status = |statuses: Vec<JobState>| JobFilter {
            statuses,
            ..JobFilter::default()
        };

        let waiting = broker
            .jobs_by_filter("q", &by_status(vec![JobState::Waiting]))
            .await
            .unwrap();
        assert!(waiting.is_empty());
        let paused = broker
            .jobs_by_filter("q", &by_status(vec![JobState::Paused]))
            .await
            .unwrap();
        assert_eq!(paused.len(), 1);

        // Asking for both never duplicates the backlog.
        let both = broker
            .jobs_by_filter("q", &by_status(vec![JobState::Waiting, JobState::Paused]))
            .await
            .unwrap();
        assert_eq!(both.len(), 1);

        broker.resume("q").await.unwrap();
        broker.dequeue("q", "w").await.unwrap().unwrap();

        let active = broker
            .jobs_by_filter("q", &by_status(vec![JobState::Active]))
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        let stalled = broker
            .jobs_by_filter("q", &by_status(vec![JobState::Stalled]))
            .await
            .unwrap();
        assert!(stalled.is_empty());

        // Lose the worker's hold: the same job is now stalled, not active.
        broker.with_queue("q", |state, _| state.active.remove(&id));
        let stalled = broker
            .jobs_by_filter("q", &by_status(vec![JobState::Stalled]))
            .await
            .unwrap();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].id, id);
        let active = broker
            .jobs_by_filter("q", &by_status(vec![JobState::Active]))
            .await
            .unwrap();
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn test_drain_counts_waiting_before() {
        let broker = MemoryBroker::new();
        broker.enqueue(record("q", "a", JobOptions::default())).await.unwrap();
        broker.enqueue(record("q", "b", JobOptions::default())).await.unwrap();
        let opts = JobOptions { delay: Some(60_000), ..JobOptions::default() };
        broker.enqueue(record("q", "later", opts)).await.unwrap();

        assert_eq!(broker.drain("q").await.unwrap(), 2);
        let counts = broker.counts("q").await.unwrap();
        assert_eq!(counts.waiting, 0);
        assert_eq!(counts.delayed, 1);
    }

    #[tokio::test]
    async fn test_obliterate_refuses_active_without_force() {
        let broker = MemoryBroker::new();
        broker.enqueue(record("q", "j", JobOptions::default())).await.unwrap();
        broker.dequeue("q", "w").await.unwrap().unwrap();

        assert!(broker.obliterate("q", false).await.is_err());
        broker.obliterate("q", true).await.unwrap();
        assert_eq!(broker.counts("q").await.unwrap(), JobCounts::default());
    }

    #[tokio::test]
    async fn test_logs_and_progress() {
        let broker = MemoryBroker::new();
        let id = broker.enqueue(record("q", "j", JobOptions::default())).await.unwrap();

        broker.append_log("q", &id, "step 1").await.unwrap();
        broker.append_log("q", &id, "step 2").await.unwrap();
        assert_eq!(broker.get_logs("q", &id).await.unwrap(), vec!["step 1", "step 2"]);

        broker.set_progress("q", &id, json!(75)).await.unwrap();
        assert_eq!(broker.get_progress("q", &id).await.unwrap(), Some(json!(75)));
    }

    #[tokio::test]
    async fn test_stalled_detection() {
        let broker = MemoryBroker::new();
        let id = broker.enqueue(record("q", "j", JobOptions::default())).await.unwrap();
        let job = broker.dequeue("q", "w").await.unwrap().unwrap();

        // Simulate a vanished worker by requeueing through move_to_failed's
        // inverse: drop the active entry directly via obliterate-free path.
        broker.with_queue("q", |state, _| state.active.remove(&job.id));
        assert_eq!(broker.get_state("q", &id).await.unwrap(), Some(JobState::Stalled));
    }

    #[tokio::test]
    async fn test_promote_and_retry_and_move_to_failed() {
        let broker = MemoryBroker::new();
        let opts = JobOptions { delay: Some(60_000), ..JobOptions::default() };
        let id = broker.enqueue(record("q", "j", opts)).await.unwrap();

        broker.promote("q", &id).await.unwrap();
        assert_eq!(broker.get_state("q", &id).await.unwrap(), Some(JobState::Waiting));

        broker.move_to_failed("q", &id, "operator said so").await.unwrap();
        assert_eq!(broker.get_state("q", &id).await.unwrap(), Some(JobState::Failed));

        broker.retry_job("q", &id).await.unwrap();
        let record = broker.get_job("q", &id).await.unwrap().unwrap();
        assert_eq!(record.status, JobState::Waiting);
        assert_eq!(record.attempts_made, 0);
        assert!(record.error.is_none());
    }

    #[tokio::test]
    async fn test_jobs_by_filter() {
        let broker = MemoryBroker::new();
        broker.enqueue(record("q", "a", JobOptions::default())).await.unwrap();
        broker.enqueue(record("q", "b", JobOptions::default())).await.unwrap();
        let job = broker.dequeue("q", "w").await.unwrap().unwrap();
        broker.complete(&job, json!(null)).await.unwrap();

        let waiting = broker
            .jobs_by_filter("q", &JobFilter { statuses: vec![JobState::Waiting], ..JobFilter::default() })
            .await
            .unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].name, "b");

        let completed = broker
            .jobs_by_filter("q", &JobFilter { statuses: vec![JobState::Completed], ..JobFilter::default() })
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].name, "a");

        let limited = broker
            .jobs_by_filter("q", &JobFilter { statuses: vec![], limit: Some(1), offset: 0 })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }
}
