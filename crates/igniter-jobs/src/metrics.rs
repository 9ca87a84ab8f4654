//! Prometheus metrics for the job queue.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names.
pub mod names {
    /// Total jobs enqueued.
    pub const JOBS_ENQUEUED_TOTAL: &str = "igniter_jobs_enqueued_total";
    /// Total jobs dequeued for processing.
    pub const JOBS_DEQUEUED_TOTAL: &str = "igniter_jobs_dequeued_total";
    /// Total jobs completed successfully.
    pub const JOBS_COMPLETED_TOTAL: &str = "igniter_jobs_completed_total";
    /// Total jobs terminally failed.
    pub const JOBS_FAILED_TOTAL: &str = "igniter_jobs_failed_total";
    /// Total retries scheduled.
    pub const JOBS_RETRIED_TOTAL: &str = "igniter_jobs_retried_total";
    /// Total dispatches skipped by scheduling rules.
    pub const JOBS_SKIPPED_TOTAL: &str = "igniter_jobs_skipped_total";

    /// Current waiting jobs.
    pub const JOBS_WAITING: &str = "igniter_jobs_waiting";
    /// Current active jobs.
    pub const JOBS_ACTIVE: &str = "igniter_jobs_active";
    /// Current delayed jobs.
    pub const JOBS_DELAYED: &str = "igniter_jobs_delayed";

    /// Handler execution duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "igniter_job_duration_seconds";

    /// Live worker handles.
    pub const WORKERS_ACTIVE: &str = "igniter_workers_active";
}

/// Registers all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_ENQUEUED_TOTAL, "Total number of jobs enqueued");
    describe_counter!(
        names::JOBS_DEQUEUED_TOTAL,
        "Total number of jobs dequeued for processing"
    );
    describe_counter!(
        names::JOBS_COMPLETED_TOTAL,
        "Total number of jobs completed successfully"
    );
    describe_counter!(
        names::JOBS_FAILED_TOTAL,
        "Total number of jobs that terminally failed"
    );
    describe_counter!(names::JOBS_RETRIED_TOTAL, "Total number of retries scheduled");
    describe_counter!(
        names::JOBS_SKIPPED_TOTAL,
        "Total number of dispatches skipped by scheduling rules"
    );

    describe_gauge!(names::JOBS_WAITING, "Current number of waiting jobs");
    describe_gauge!(names::JOBS_ACTIVE, "Current number of active jobs");
    describe_gauge!(names::JOBS_DELAYED, "Current number of delayed jobs");

    describe_histogram!(
        names::JOB_DURATION_SECONDS,
        "Handler execution duration in seconds"
    );

    describe_gauge!(names::WORKERS_ACTIVE, "Number of live worker handles");
}

/// Job metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    /// Records an enqueue.
    pub fn job_enqueued(queue: &str, job_name: &str) {
        counter!(
            names::JOBS_ENQUEUED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);
    }

    /// Records a dequeue.
    pub fn job_dequeued(queue: &str, job_name: &str) {
        counter!(
            names::JOBS_DEQUEUED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);
    }

    /// Records a completion.
    pub fn job_completed(queue: &str, job_name: &str, duration: Duration) {
        counter!(
            names::JOBS_COMPLETED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string(),
            "status" => "completed"
        )
        .record(duration.as_secs_f64());
    }

    /// Records a terminal failure.
    pub fn job_failed(queue: &str, job_name: &str, duration: Duration) {
        counter!(
            names::JOBS_FAILED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string(),
            "status" => "failed"
        )
        .record(duration.as_secs_f64());
    }

    /// Records a scheduled retry.
    pub fn job_retried(queue: &str, job_name: &str, attempt: u32) {
        counter!(
            names::JOBS_RETRIED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string(),
            "attempt" => attempt.to_string()
        )
        .increment(1);
    }

    /// Records a rule-gated skip.
    pub fn job_skipped(queue: &str, job_name: &str) {
        counter!(
            names::JOBS_SKIPPED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);
    }

    /// Updates queue depth gauges.
    pub fn update_queue_sizes(queue: &str, waiting: u64, active: u64, delayed: u64) {
        gauge!(names::JOBS_WAITING, "queue" => queue.to_string()).set(waiting as f64);
        gauge!(names::JOBS_ACTIVE, "queue" => queue.to_string()).set(active as f64);
        gauge!(names::JOBS_DELAYED, "queue" => queue.to_string()).set(delayed as f64);
    }

    /// Updates the live worker gauge.
    pub fn update_workers(count: usize) {
        gauge!(names::WORKERS_ACTIVE).set(count as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_metrics() {
        register_metrics();
    }

    #[test]
    fn test_recorders_do_not_panic() {
        JobMetrics::job_enqueued("default", "user.sync");
        JobMetrics::job_dequeued("default", "user.sync");
        JobMetrics::job_completed("default", "user.sync", Duration::from_millis(12));
        JobMetrics::job_failed("default", "user.sync", Duration::from_millis(5));
        JobMetrics::job_retried("default", "user.sync", 2);
        JobMetrics::job_skipped("default", "user.sync");
        JobMetrics::update_queue_sizes("default", 1, 2, 3);
        JobMetrics::update_workers(1);
    }
}
