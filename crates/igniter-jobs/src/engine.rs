//! The job queue engine: registration, scheduling, dispatch, management.
//!
//! Owns the broker, the definition registry, the queue directory, and the
//! worker pool. Routers merge into it; the resulting executor is the typed
//! front door for enqueues.

use crate::broker::{BrokerRef, JobBroker};
use crate::config::JobsConfig;
use crate::context::{ContextFactoryRef, NullContextFactory};
use crate::cron::next_occurrence;
use crate::definition::{JobDefinition, RateLimit};
use crate::jobs_api::JobManager;
use crate::metrics::JobMetrics;
use crate::queues::{QueueDirectory, QueueManager};
use crate::record::{JobOptions, JobRecord};
use crate::redis_broker::RedisBroker;
use crate::registry::JobRegistry;
use crate::router::{JobRouter, JobsExecutor};
use crate::schedule::{translate, EnqueueOptions, ScheduleSpec};
use crate::worker::{WorkerEvent, WorkerEventHook, WorkerHandle, WorkerOptions, WorkerPool};
use chrono::Utc;
use igniter_core::{IgniterError, IgniterResult};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// The job queue subsystem.
pub struct JobQueues {
    config: JobsConfig,
    broker: BrokerRef,
    registry: Arc<JobRegistry>,
    directory: Arc<QueueDirectory>,
    pool: WorkerPool,
}

impl JobQueues {
    /// Connects a Redis-backed engine.
    pub async fn connect(config: JobsConfig) -> IgniterResult<Arc<Self>> {
        let broker: BrokerRef = Arc::new(RedisBroker::connect(&config.redis).await?);
        Ok(Self::with_broker(config, broker, None))
    }

    /// Builds an engine over an explicit broker (in-memory, test double, or
    /// a shared Redis pool) and an optional context factory.
    #[must_use]
    pub fn with_broker(
        config: JobsConfig,
        broker: BrokerRef,
        context_factory: Option<ContextFactoryRef>,
    ) -> Arc<Self> {
        let registry = Arc::new(JobRegistry::new());
        let directory = Arc::new(QueueDirectory::new(config.queue.clone()));
        let context_factory = context_factory.unwrap_or_else(|| Arc::new(NullContextFactory));
        let pool = WorkerPool::new(
            broker.clone(),
            registry.clone(),
            context_factory,
            config.queue.clone(),
            config.worker.clone(),
        );

        Arc::new(Self {
            config,
            broker,
            registry,
            directory,
            pool,
        })
    }

    /// The definition registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Queue lifecycle and introspection surface.
    #[must_use]
    pub fn queues(&self) -> QueueManager {
        QueueManager::new(self.broker.clone(), self.directory.clone())
    }

    /// Cross-queue single-job surface.
    #[must_use]
    pub fn jobs(&self) -> JobManager {
        JobManager::new(self.broker.clone(), self.directory.clone())
    }

    /// Creates (or reuses) workers for the given queues.
    pub fn worker(&self, options: WorkerOptions) -> Vec<Arc<WorkerHandle>> {
        for queue in &options.queues {
            if !queue.contains('*') {
                self.directory.ensure(queue);
            }
        }
        self.pool.worker(options)
    }

    /// Live worker handles.
    #[must_use]
    pub fn get_workers(&self) -> Vec<Arc<WorkerHandle>> {
        self.pool.get_workers()
    }

    /// Validates input against the definition and adds the job.
    pub async fn enqueue(
        &self,
        name: &str,
        input: Value,
        options: Option<EnqueueOptions>,
    ) -> IgniterResult<String> {
        let definition = self.registry.require(name)?;

        if let Err(issues) = definition.input.validate(&input) {
            return Err(IgniterError::InvalidPayload {
                job: name.to_string(),
                issues,
            });
        }

        let options = options.unwrap_or_default();
        let repeat = options.repeat.clone().or_else(|| definition.repeat_spec());

        let mut delay = options.delay.or(definition.delay);
        if delay.is_none() {
            if let Some(repeat) = &repeat {
                delay = first_occurrence_delay(repeat);
            }
        }

        let job_opts = JobOptions {
            delay,
            attempts: options
                .attempts
                .or(definition.attempts)
                .unwrap_or(crate::record::DEFAULT_ATTEMPTS),
            backoff: options.backoff.clone().or_else(|| definition.backoff.clone()),
            job_id: options.job_id.clone(),
            repeat,
            metadata: merge_metadata(definition.metadata.clone(), options.metadata.clone()),
            remove_on_complete: definition.remove_on_complete,
            remove_on_fail: definition.remove_on_fail,
        };

        let base_queue = definition
            .queue
            .clone()
            .unwrap_or_else(|| self.config.queue.default_queue.clone());
        self.directory.ensure(&base_queue);

        let mut record = JobRecord::new(name, self.directory.full_name(&base_queue), input, job_opts);
        record.priority = options.priority.or(definition.priority).unwrap_or(0);

        JobMetrics::job_enqueued(&base_queue, name);
        let id = self.broker.enqueue(record).await?;
        debug!(job = %name, job_id = %id, queue = %base_queue, "Job enqueued");
        Ok(id)
    }

    /// Translates schedule options, then enqueues.
    pub async fn schedule(
        &self,
        name: &str,
        input: Value,
        spec: ScheduleSpec,
    ) -> IgniterResult<String> {
        let options = translate(spec)?;
        self.enqueue(name, input, Some(options)).await
    }

    /// Enqueues many payloads for one job.
    pub async fn bulk(
        &self,
        name: &str,
        items: Vec<(Value, Option<EnqueueOptions>)>,
    ) -> IgniterResult<Vec<String>> {
        let mut ids = Vec::with_capacity(items.len());
        for (input, options) in items {
            ids.push(self.enqueue(name, input, options).await?);
        }
        Ok(ids)
    }

    /// Registers definitions under their final names and auto-enqueues every
    /// cron-repeating one under `<name>__cron`, which makes repeated
    /// registration idempotent.
    pub async fn bulk_register(
        &self,
        definitions: Vec<(String, JobDefinition)>,
    ) -> IgniterResult<()> {
        let mut cron_jobs = Vec::new();
        for (name, definition) in definitions {
            if definition
                .repeat
                .as_ref()
                .and_then(|r| r.cron.as_ref())
                .is_some()
            {
                cron_jobs.push((name.clone(), definition.repeat_spec()));
            }
            self.registry.register(name, definition);
        }

        for (name, repeat) in cron_jobs {
            let options = EnqueueOptions {
                job_id: Some(format!("{name}__cron")),
                repeat,
                ..EnqueueOptions::default()
            };
            let id = self.enqueue(&name, Value::Null, Some(options)).await?;
            debug!(job = %name, job_id = %id, "Registered repeating cron job");
        }
        Ok(())
    }

    /// Merges named routers: flattens their jobs to `<ns>.<id>`, registers
    /// everything, optionally auto-starts a worker over the referenced
    /// queues, and returns the executor.
    pub async fn merge(
        self: &Arc<Self>,
        routers: Vec<(String, JobRouter)>,
    ) -> IgniterResult<JobsExecutor> {
        let mut namespaces: HashMap<String, Vec<String>> = HashMap::new();
        let mut defaults: HashMap<String, EnqueueOptions> = HashMap::new();
        let mut flattened: Vec<(String, JobDefinition)> = Vec::new();
        let mut queue_names: Vec<String> = Vec::new();
        let mut limiter: Option<RateLimit> = None;

        for (namespace, router) in routers {
            if namespaces.contains_key(&namespace) {
                return Err(IgniterError::InvalidJobNamespace { namespace });
            }

            let mut job_ids = Vec::new();
            for definition in router.jobs {
                let queue = definition
                    .queue
                    .clone()
                    .unwrap_or_else(|| self.config.queue.default_queue.clone());
                if !queue_names.contains(&queue) {
                    queue_names.push(queue);
                }
                if limiter.is_none() {
                    limiter = definition.limiter;
                }
                job_ids.push(definition.id.clone());
                flattened.push((format!("{namespace}.{}", definition.id), definition));
            }

            if let Some(options) = router.default_options {
                defaults.insert(namespace.clone(), options);
            }
            namespaces.insert(namespace, job_ids);
        }

        self.bulk_register(flattened).await?;

        if let Some(auto) = &self.config.auto_start_worker {
            let mut options = WorkerOptions {
                queues: queue_names,
                concurrency: auto.concurrency,
                limiter,
                ..WorkerOptions::default()
            };
            if auto.debug {
                options.on_active = Some(debug_event_hook());
                options.on_success = Some(debug_event_hook());
                options.on_failure = Some(debug_event_hook());
            }
            let started = self.worker(options);
            info!(workers = started.len(), "Auto-started workers for merged routers");
        }

        Ok(JobsExecutor::new(self.clone(), namespaces, defaults))
    }

    /// Graceful shutdown: workers first, then the definition registry.
    pub async fn shutdown(&self) {
        info!("Shutting down job queues");
        self.pool.shutdown().await;
        self.registry.clear();
    }
}

fn debug_event_hook() -> WorkerEventHook {
    Arc::new(|event: WorkerEvent| {
        Box::pin(async move {
            debug!(?event, "Worker event");
        })
    })
}

/// Delay until the first run of a repeat spec, when it defines one.
fn first_occurrence_delay(repeat: &crate::record::RepeatSpec) -> Option<u64> {
    let now = Utc::now();
    let anchor = match repeat.start_date {
        Some(start) if start > now => start,
        _ => now,
    };

    if let Some(cron) = &repeat.cron {
        let next = next_occurrence(cron, anchor, repeat.tz.as_deref()).ok()??;
        return Some((next - now).num_milliseconds().max(1) as u64);
    }
    if let Some(every) = repeat.every {
        let lead = (anchor - now).num_milliseconds().max(0) as u64;
        return Some(lead + every);
    }
    None
}

/// Shallow merge: per-call metadata wins over definition metadata.
fn merge_metadata(base: Option<Value>, overlay: Option<Value>) -> Option<Value> {
    match (base, overlay) {
        (None, None) => None,
        (Some(value), None) | (None, Some(value)) => Some(value),
        (Some(Value::Object(mut base)), Some(Value::Object(overlay))) => {
            for (key, value) in overlay {
                base.insert(key, value);
            }
            Some(Value::Object(base))
        }
        (_, Some(overlay)) => Some(overlay),
    }
}
