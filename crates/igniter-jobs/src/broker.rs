//! Broker abstraction: BullMQ-style queue semantics over a backend.
//!
//! A queue is a waiting set ordered by priority-then-FIFO, a delayed set
//! ordered by ready time, an active map, completed/failed history sets, and
//! a pause flag; each job instance has a state record, a log list, and a
//! progress value. The Redis implementation lays this out on sorted sets and
//! hashes; the in-memory implementation mirrors the exact semantics for
//! tests and local development.

use crate::record::{JobCounts, JobRecord, JobState};
use async_trait::async_trait;
use igniter_core::IgniterResult;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Priority-then-FIFO score: higher priority sorts first, ties break on
/// enqueue time. Same shape the waiting sorted set uses in Redis.
#[must_use]
pub fn priority_score(priority: i32, at_ms: i64) -> f64 {
    -(priority as f64) * 1e12 + at_ms as f64
}

/// Filter for job listings.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Restrict to these states; empty means all.
    pub statuses: Vec<JobState>,
    /// Maximum records returned.
    pub limit: Option<usize>,
    /// Records skipped from the front.
    pub offset: usize,
}

/// Options for [`JobBroker::clean`].
#[derive(Debug, Clone, Default)]
pub struct CleanOptions {
    /// States to clean; empty cleans completed and failed.
    pub statuses: Vec<JobState>,
    /// Only records finished/created at least this long ago.
    pub older_than: Option<Duration>,
    /// Upper bound on removals.
    pub limit: Option<usize>,
}

/// Queue backend contract.
#[async_trait]
pub trait JobBroker: Send + Sync {
    /// Adds a job instance. With an explicit `opts.job_id` that already has
    /// a record, nothing is added and the existing id is returned — the
    /// dedup contract `skip_if_running` and repeating jobs rely on.
    async fn enqueue(&self, record: JobRecord) -> IgniterResult<String>;

    /// Pops the next due job for a queue: promotes due delayed jobs, then
    /// takes the best waiting one, marking it active for `worker_id` and
    /// consuming one attempt. Returns `None` when paused or empty.
    async fn dequeue(&self, queue: &str, worker_id: &str) -> IgniterResult<Option<JobRecord>>;

    /// Marks a job completed with its result. Repeating jobs and jobs with
    /// `remove_on_complete` drop their record so the id can be reused.
    async fn complete(&self, record: &JobRecord, result: Value) -> IgniterResult<()>;

    /// Schedules a retry after `delay`, recording the error.
    async fn retry_later(&self, record: &JobRecord, error: &str, delay: Duration)
        -> IgniterResult<()>;

    /// Moves a job to its terminal failed state.
    async fn fail_terminal(&self, record: &JobRecord, error: &str) -> IgniterResult<()>;

    /// Puts a dequeued job back at its queue position untouched, refunding
    /// the consumed attempt (job-filter skips).
    async fn requeue(&self, record: &JobRecord) -> IgniterResult<()>;

    /// Loads a job record.
    async fn get_job(&self, queue: &str, id: &str) -> IgniterResult<Option<JobRecord>>;

    /// Resolves the effective state: `stalled` for active jobs whose worker
    /// entry is gone, `paused` for waiting jobs in a paused queue.
    async fn get_state(&self, queue: &str, id: &str) -> IgniterResult<Option<JobState>>;

    /// Reads the job's log lines.
    async fn get_logs(&self, queue: &str, id: &str) -> IgniterResult<Vec<String>>;

    /// Appends one log line.
    async fn append_log(&self, queue: &str, id: &str, line: &str) -> IgniterResult<()>;

    /// Stores the progress value.
    async fn set_progress(&self, queue: &str, id: &str, progress: Value) -> IgniterResult<()>;

    /// Reads the progress value.
    async fn get_progress(&self, queue: &str, id: &str) -> IgniterResult<Option<Value>>;

    /// Per-state counts for a queue.
    async fn counts(&self, queue: &str) -> IgniterResult<JobCounts>;

    /// Lists job records matching a filter.
    async fn jobs_by_filter(&self, queue: &str, filter: &JobFilter)
        -> IgniterResult<Vec<JobRecord>>;

    /// Stops dispatch from a queue.
    async fn pause(&self, queue: &str) -> IgniterResult<()>;

    /// Resumes dispatch.
    async fn resume(&self, queue: &str) -> IgniterResult<()>;

    /// True when the queue is paused.
    async fn is_paused(&self, queue: &str) -> IgniterResult<bool>;

    /// Removes all waiting jobs; returns the waiting count sampled before
    /// the removal.
    async fn drain(&self, queue: &str) -> IgniterResult<u64>;

    /// Removes finished (or old) records per the options; returns how many.
    async fn clean(&self, queue: &str, options: &CleanOptions) -> IgniterResult<u64>;

    /// Destroys the queue and everything in it. Refuses while jobs are
    /// active unless `force`.
    async fn obliterate(&self, queue: &str, force: bool) -> IgniterResult<()>;

    /// Removes one job from every structure.
    async fn remove(&self, queue: &str, id: &str) -> IgniterResult<()>;

    /// Moves a delayed job to waiting immediately.
    async fn promote(&self, queue: &str, id: &str) -> IgniterResult<()>;

    /// Moves a failed job back to waiting with a fresh attempt budget.
    async fn retry_job(&self, queue: &str, id: &str) -> IgniterResult<()>;

    /// Force-fails a job with a reason, wherever it currently is.
    async fn move_to_failed(&self, queue: &str, id: &str, reason: &str) -> IgniterResult<()>;
}

/// Shared broker handle.
pub type BrokerRef = Arc<dyn JobBroker>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_score_ordering() {
        // Higher priority sorts lower (first).
        assert!(priority_score(10, 1_000) < priority_score(0, 1_000));
        // Equal priority: earlier enqueue first.
        assert!(priority_score(0, 1_000) < priority_score(0, 2_000));
        // Priority dominates time.
        assert!(priority_score(1, i64::MAX / 2) < priority_score(0, 0));
    }
}
