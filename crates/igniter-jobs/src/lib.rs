//! Igniter Jobs - Redis-backed job queue
//!
//! Registration, scheduling, dispatch, and worker execution on BullMQ-style
//! queue semantics:
//!
//! - Job definitions with payload schemas and lifecycle hooks
//! - Routers merged into a namespaced registry (`<ns>.<jobId>`)
//! - Delayed and repeating (cron / fixed-interval) jobs
//! - Workers with concurrency slots, rate limits, and retry backoff
//! - Queue and per-job management surfaces
//!
//! # Example
//!
//! ```rust,ignore
//! use igniter_jobs::{JobQueues, JobsConfig, JobDefinition, router, WorkerOptions};
//! use serde_json::json;
//!
//! let engine = JobQueues::connect(JobsConfig::default()).await?;
//!
//! let send = JobDefinition::builder("send")
//!     .handler(|ctx| async move {
//!         println!("sending to {}", ctx.input["to"]);
//!         Ok(json!({"sent": true}))
//!     })
//!     .build();
//!
//! let executor = engine
//!     .merge(vec![("emails".into(), router("emails", vec![send]))])
//!     .await?;
//!
//! engine.worker(WorkerOptions {
//!     queues: vec!["default".into()],
//!     concurrency: 4,
//!     ..WorkerOptions::default()
//! });
//!
//! executor.namespace("emails")?.job("send")?
//!     .enqueue(json!({"to": "user@example.com"}))
//!     .await?;
//! ```

pub mod backoff;
pub mod broker;
pub mod config;
pub mod context;
pub mod cron;
pub mod definition;
pub mod engine;
pub mod jobs_api;
pub mod memory_broker;
pub mod metrics;
pub mod queues;
pub mod record;
pub mod redis_broker;
pub mod registry;
pub mod router;
pub mod schedule;
pub mod webhook;
pub mod worker;

pub use broker::{BrokerRef, CleanOptions, JobBroker, JobFilter};
pub use config::{AutoStartWorker, JobsConfig, QueueConfig, RedisConfig, WorkerConfig};
pub use context::{ContextFactory, ContextFactoryRef, FnContextFactory, NullContextFactory};
pub use cron::{cron_job, generate_cron_name, next_occurrence, validate_cron, CronJobOptions};
pub use definition::{
    CompleteContext, FailureContext, JobDefinition, JobExecutionContext, JobRuntimeInfo,
    RateLimit, StartContext, SuccessContext,
};
pub use engine::JobQueues;
pub use jobs_api::JobManager;
pub use memory_broker::MemoryBroker;
pub use metrics::{register_metrics, JobMetrics};
pub use queues::{QueueInfo, QueueManager};
pub use record::{BackoffSpec, JobCounts, JobOptions, JobRecord, JobState, RepeatSpec};
pub use redis_broker::RedisBroker;
pub use registry::JobRegistry;
pub use router::{router, JobDispatch, JobRouter, JobsExecutor, NamespaceExecutor};
pub use schedule::{
    translate, AdvancedScheduling, BusinessHours, EnqueueOptions, RepeatOptions, RetryStrategy,
    ScheduleOptions, ScheduleSpec, SkipIfRunning,
};
pub use webhook::{WebhookClient, WebhookPayload};
pub use worker::{
    WorkerEvent, WorkerEventHook, WorkerHandle, WorkerMetricsSnapshot, WorkerOptions, WorkerPool,
};

/// Re-export of commonly used items.
pub mod prelude {
    pub use crate::definition::{JobDefinition, JobExecutionContext};
    pub use crate::engine::JobQueues;
    pub use crate::router::router;
    pub use crate::schedule::{ScheduleOptions, ScheduleSpec};
    pub use crate::worker::WorkerOptions;
    pub use crate::{JobsConfig, WorkerConfig};
}
