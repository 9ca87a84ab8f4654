//! Job instances as stored by the broker.

use chrono::{DateTime, Utc};
use igniter_core::IgniterResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Total attempts granted when nothing else is configured.
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Lifecycle states of a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Ready to be picked up.
    Waiting,
    /// Held by a worker.
    Active,
    /// Finished successfully; `result` is present (possibly null).
    Completed,
    /// Terminally failed; `error` is present.
    Failed,
    /// Scheduled for a later time.
    Delayed,
    /// Waiting in a paused queue.
    Paused,
    /// Marked active but its worker is gone.
    Stalled,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Delayed => "delayed",
            JobState::Paused => "paused",
            JobState::Stalled => "stalled",
        };
        f.write_str(s)
    }
}

/// Backoff specification carried on job options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackoffSpec {
    /// Exponential growth from a 1s base, capped at `max` milliseconds.
    Exponential { multiplier: f64, max: u64 },
    /// Fixed delay in milliseconds.
    Fixed { delay: u64 },
    /// Explicit per-attempt delay table.
    Custom { settings: CustomBackoff },
}

/// Settings of a custom backoff table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomBackoff {
    /// Delay in milliseconds per retry, last entry repeating.
    pub delays: Vec<u64>,
}

/// Repeat specification carried on job options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepeatSpec {
    /// Cron pattern for recurring scheduling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,

    /// Fixed interval in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub every: Option<u64>,

    /// Maximum number of iterations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,

    /// Do not schedule past this time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,

    /// Fixed-offset timezone for cron evaluation, e.g. `+02:00`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tz: Option<String>,

    /// Do not schedule before this time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,

    /// Iterations already dispatched.
    #[serde(default)]
    pub count: u32,
}

/// Queue-level options attached to a job instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOptions {
    /// Initial delay in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,

    /// Total attempts allowed.
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Retry backoff.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffSpec>,

    /// Caller-chosen id; a second enqueue with the same id is a no-op.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,

    /// Recurrence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat: Option<RepeatSpec>,

    /// Free-form metadata (advanced scheduling, webhook, tags, timeout…).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,

    /// Drop the record once completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remove_on_complete: Option<bool>,

    /// Drop the record once terminally failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remove_on_fail: Option<bool>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            delay: None,
            attempts: DEFAULT_ATTEMPTS,
            backoff: None,
            job_id: None,
            repeat: None,
            metadata: None,
            remove_on_complete: None,
            remove_on_fail: None,
        }
    }
}

fn default_attempts() -> u32 {
    DEFAULT_ATTEMPTS
}

/// One job instance as stored under its state key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Instance id.
    pub id: String,

    /// Registered (namespaced) job name.
    pub name: String,

    /// Validated input payload.
    pub payload: Value,

    /// Current state.
    pub status: JobState,

    /// Base queue name this instance belongs to.
    pub queue: String,

    /// Enqueue time.
    pub created_at: DateTime<Utc>,

    /// Last dequeue time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,

    /// Completion time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Handler result, present once completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Last error, present once failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Attempts consumed so far.
    pub attempts_made: u32,

    /// Priority; higher runs first.
    pub priority: i32,

    /// Reported progress value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Value>,

    /// Options the instance was enqueued with.
    pub opts: JobOptions,
}

impl JobRecord {
    /// Creates a fresh waiting record.
    #[must_use]
    pub fn new(name: impl Into<String>, queue: impl Into<String>, payload: Value, opts: JobOptions) -> Self {
        let id = opts
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self {
            id,
            name: name.into(),
            payload,
            status: JobState::Waiting,
            queue: queue.into(),
            created_at: Utc::now(),
            processed_at: None,
            completed_at: None,
            result: None,
            error: None,
            attempts_made: 0,
            priority: 0,
            progress: None,
            opts,
        }
    }

    /// Serializes for storage.
    pub fn to_json(&self) -> IgniterResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserializes from storage.
    pub fn from_json(json: &str) -> IgniterResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Metadata value lookup, e.g. `metadata_str("webhookUrl")`.
    #[must_use]
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.opts.metadata.as_ref()?.get(key)?.as_str()
    }

    /// True once the last granted attempt is running or spent.
    #[must_use]
    pub fn is_final_attempt(&self) -> bool {
        self.attempts_made >= self.opts.attempts
    }
}

/// Per-queue job counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub paused: u64,
}
