//! Worker pool: per-queue consumer handles with concurrency, rate limiting,
//! hook execution, scheduling gates, and retry semantics.
//!
//! One handle exists per queue, keyed `<queue>-worker`; asking for a worker
//! on the same queue twice reuses the live handle. Each handle runs a
//! dispatch loop that acquires a concurrency slot, honors the rate limiter,
//! pulls the next job from the broker, and executes it on its own task.

use crate::backoff::delay_for_attempt;
use crate::broker::{BrokerRef, JobBroker};
use crate::config::{QueueConfig, WorkerConfig};
use crate::context::ContextFactoryRef;
use crate::cron::next_occurrence;
use crate::definition::{
    CompleteContext, FailureContext, Hook, JobExecutionContext, JobJournal, JobRuntimeInfo,
    RateLimit, StartContext, SuccessContext,
};
use crate::metrics::JobMetrics;
use crate::record::{JobOptions, JobRecord, RepeatSpec};
use crate::registry::JobRegistry;
use crate::schedule::AdvancedScheduling;
use crate::webhook::{WebhookClient, WebhookPayload};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use governor::{Quota, RateLimiter as GovernorRateLimiter};
use igniter_core::{IgniterError, IgniterResult};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

type DirectLimiter = GovernorRateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
    governor::middleware::NoOpMiddleware,
>;

/// Worker lifecycle events surfaced to the configured observer hooks.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A job was picked up.
    Active { job_id: String, job_name: String },
    /// A job completed.
    Success {
        job_id: String,
        job_name: String,
        duration_ms: u64,
    },
    /// A job attempt threw.
    Failure {
        job_id: String,
        job_name: String,
        error: String,
    },
    /// The queue ran empty.
    Idle,
}

/// Observer invoked on worker lifecycle events; fire-and-forget.
pub type WorkerEventHook = Arc<dyn Fn(WorkerEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Worker creation options.
#[derive(Clone, Default)]
pub struct WorkerOptions {
    /// Base queue names to consume. Wildcards are logged and skipped.
    pub queues: Vec<String>,
    /// Concurrent handler invocations per queue; engine default when 0.
    pub concurrency: usize,
    /// Only run these job names; others go back to the queue untouched.
    pub job_filter: Option<Vec<String>>,
    /// At most `max` job starts per `duration_ms` window.
    pub limiter: Option<RateLimit>,
    /// Observer hooks.
    pub on_active: Option<WorkerEventHook>,
    pub on_success: Option<WorkerEventHook>,
    pub on_failure: Option<WorkerEventHook>,
    pub on_idle: Option<WorkerEventHook>,
}

/// Metrics snapshot of one worker handle.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerMetricsSnapshot {
    pub processed: u64,
    pub failed: u64,
    pub avg_duration_ms: f64,
    pub concurrency: usize,
    pub uptime: Duration,
}

/// One per-queue worker.
pub struct WorkerHandle {
    /// Handle id, `<queue>-worker`.
    pub id: String,
    /// Base queue name.
    pub queue_name: String,
    full_queue: String,
    concurrency: usize,
    started: Instant,
    processed: AtomicU64,
    failed: AtomicU64,
    total_duration_ms: AtomicU64,
    paused: AtomicBool,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    join: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WorkerHandle {
    /// Current metrics.
    #[must_use]
    pub fn get_metrics(&self) -> WorkerMetricsSnapshot {
        let processed = self.processed.load(Ordering::Relaxed);
        let total = self.total_duration_ms.load(Ordering::Relaxed);
        WorkerMetricsSnapshot {
            processed,
            failed: self.failed.load(Ordering::Relaxed),
            avg_duration_ms: if processed == 0 {
                0.0
            } else {
                total as f64 / processed as f64
            },
            concurrency: self.concurrency,
            uptime: self.started.elapsed(),
        }
    }

    /// Stops pulling new jobs; in-flight handlers continue.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Resumes pulling.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// True while paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// True once closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Cancels the dispatch loop and waits for in-flight handlers.
    /// Idempotent: closing twice is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        let join = self.join.lock().take();
        if let Some(join) = join {
            let _ = join.await;
        }
        info!(worker = %self.id, "Worker closed");
    }
}

struct WorkerShared {
    broker: BrokerRef,
    registry: Arc<JobRegistry>,
    context_factory: ContextFactoryRef,
    webhooks: WebhookClient,
    options: WorkerOptions,
}

/// Per-queue worker handles over one broker.
pub struct WorkerPool {
    broker: BrokerRef,
    registry: Arc<JobRegistry>,
    context_factory: ContextFactoryRef,
    webhooks: WebhookClient,
    queue_config: QueueConfig,
    worker_config: WorkerConfig,
    handles: RwLock<HashMap<String, Arc<WorkerHandle>>>,
}

impl WorkerPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new(
        broker: BrokerRef,
        registry: Arc<JobRegistry>,
        context_factory: ContextFactoryRef,
        queue_config: QueueConfig,
        worker_config: WorkerConfig,
    ) -> Self {
        Self {
            broker,
            registry,
            context_factory,
            webhooks: WebhookClient::new(),
            queue_config,
            worker_config,
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Creates (or reuses) one worker handle per non-wildcard queue.
    pub fn worker(&self, options: WorkerOptions) -> Vec<Arc<WorkerHandle>> {
        let mut created = Vec::new();

        for queue in &options.queues {
            if queue.contains('*') {
                warn!(queue = %queue, "Wildcard queue names are not supported, skipping");
                continue;
            }

            let key = format!("{queue}-worker");
            if let Some(existing) = self.handles.read().get(&key) {
                debug!(worker = %key, "Reusing existing worker");
                created.push(existing.clone());
                continue;
            }

            let concurrency = if options.concurrency == 0 {
                self.worker_config.concurrency
            } else {
                options.concurrency
            };

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let handle = Arc::new(WorkerHandle {
                id: key.clone(),
                queue_name: queue.clone(),
                full_queue: self.queue_config.full_name(queue),
                concurrency,
                started: Instant::now(),
                processed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                total_duration_ms: AtomicU64::new(0),
                paused: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                shutdown_tx,
                join: parking_lot::Mutex::new(None),
            });

            let shared = Arc::new(WorkerShared {
                broker: self.broker.clone(),
                registry: self.registry.clone(),
                context_factory: self.context_factory.clone(),
                webhooks: self.webhooks.clone(),
                options: options.clone(),
            });

            let join = tokio::spawn(run_dispatch(
                handle.clone(),
                shared,
                shutdown_rx,
                self.worker_config.poll_interval(),
                self.worker_config.shutdown_timeout(),
            ));
            *handle.join.lock() = Some(join);

            info!(worker = %key, queue = %queue, concurrency, "Worker started");
            self.handles.write().insert(key, handle.clone());
            created.push(handle);
        }

        JobMetrics::update_workers(self.handles.read().len());
        created
    }

    /// Live handles.
    #[must_use]
    pub fn get_workers(&self) -> Vec<Arc<WorkerHandle>> {
        self.handles.read().values().cloned().collect()
    }

    /// Looks up one handle by its `<queue>-worker` key.
    #[must_use]
    pub fn get_worker(&self, key: &str) -> Option<Arc<WorkerHandle>> {
        self.handles.read().get(key).cloned()
    }

    /// Gracefully closes every handle: pause, then close, then forget.
    pub async fn shutdown(&self) {
        let handles: Vec<Arc<WorkerHandle>> = {
            let mut map = self.handles.write();
            map.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &handles {
            handle.pause();
        }
        for handle in handles {
            handle.close().await;
        }
        JobMetrics::update_workers(0);
    }
}

fn build_limiter(limit: &RateLimit) -> Option<Arc<DirectLimiter>> {
    if limit.max == 0 || limit.duration_ms == 0 {
        return None;
    }
    let period = Duration::from_millis((limit.duration_ms / limit.max as u64).max(1));
    let quota = Quota::with_period(period)?.allow_burst(NonZeroU32::new(limit.max)?);
    Some(Arc::new(GovernorRateLimiter::direct(quota)))
}

async fn run_dispatch(
    handle: Arc<WorkerHandle>,
    shared: Arc<WorkerShared>,
    mut shutdown_rx: watch::Receiver<bool>,
    poll_interval: Duration,
    shutdown_timeout: Duration,
) {
    let semaphore = Arc::new(Semaphore::new(handle.concurrency));
    let limiter = shared.options.limiter.as_ref().and_then(build_limiter);
    let mut was_idle = false;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        if handle.is_paused() {
            tokio::select! {
                _ = shutdown_rx.changed() => continue,
                _ = tokio::time::sleep(poll_interval) => continue,
            }
        }

        // A free concurrency slot gates the next pull; all slots busy means
        // no dequeue happens at all.
        let permit = tokio::select! {
            _ = shutdown_rx.changed() => continue,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        if let Some(limiter) = &limiter {
            limiter.until_ready().await;
        }

        match shared.broker.dequeue(&handle.full_queue, &handle.id).await {
            Ok(Some(record)) => {
                was_idle = false;
                JobMetrics::job_dequeued(&handle.queue_name, &record.name);
                fire_event(
                    &shared.options.on_active,
                    WorkerEvent::Active {
                        job_id: record.id.clone(),
                        job_name: record.name.clone(),
                    },
                );

                let handle = handle.clone();
                let shared = shared.clone();
                tokio::spawn(async move {
                    execute_job(record, &shared, &handle).await;
                    drop(permit);
                });
            }
            Ok(None) => {
                drop(permit);
                if !was_idle {
                    was_idle = true;
                    fire_event(&shared.options.on_idle, WorkerEvent::Idle);
                }
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
            Err(e) => {
                drop(permit);
                error!(queue = %handle.queue_name, error = %e, "Dequeue failed");
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }
    }

    // In-flight handlers run to completion before the worker reports closed.
    let _ = tokio::time::timeout(shutdown_timeout, async {
        let _ = semaphore.acquire_many(handle.concurrency as u32).await;
    })
    .await;

    debug!(worker = %handle.id, "Dispatch loop stopped");
}

/// Broker-backed log/progress writer handed to handlers.
struct BrokerJournal {
    broker: BrokerRef,
    queue: String,
    job_id: String,
}

#[async_trait]
impl JobJournal for BrokerJournal {
    async fn log(&self, line: &str) -> IgniterResult<()> {
        self.broker.append_log(&self.queue, &self.job_id, line).await
    }

    async fn set_progress(&self, progress: Value) -> IgniterResult<()> {
        self.broker
            .set_progress(&self.queue, &self.job_id, progress)
            .await
    }
}

fn advanced_rules(record: &JobRecord) -> Option<AdvancedScheduling> {
    let value = record.opts.metadata.as_ref()?.get("advancedScheduling")?;
    serde_json::from_value(value.clone()).ok()
}

fn jitter_factor(record: &JobRecord) -> f64 {
    record
        .opts
        .metadata
        .as_ref()
        .and_then(|m| m.get("jitterFactor"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
}

fn tags(record: &JobRecord) -> Option<Vec<String>> {
    let tags = record.opts.metadata.as_ref()?.get("tags")?.as_array()?;
    Some(
        tags.iter()
            .filter_map(|t| t.as_str().map(str::to_string))
            .collect(),
    )
}

async fn run_hook<C>(hook: &Option<Hook<C>>, ctx: C, name: &str) {
    if let Some(hook) = hook {
        if let Err(e) = hook(ctx).await {
            warn!(hook = name, error = %e, "Lifecycle hook failed");
        }
    }
}

fn fire_event(hook: &Option<WorkerEventHook>, event: WorkerEvent) {
    if let Some(hook) = hook {
        let future = hook(event);
        tokio::spawn(future);
    }
}

async fn execute_job(record: JobRecord, shared: &WorkerShared, handle: &WorkerHandle) {
    // 1. Resolve the definition.
    let Some(definition) = shared.registry.get(&record.name) else {
        warn!(job = %record.name, job_id = %record.id, "No definition registered, ignoring job");
        return;
    };

    // 2. Job filter: untouched requeue, attempt refunded.
    if let Some(filter) = &shared.options.job_filter {
        if !filter.iter().any(|name| name == &record.name) {
            debug!(job = %record.name, "Filtered out, requeueing");
            if let Err(e) = shared.broker.requeue(&record).await {
                error!(job_id = %record.id, error = %e, "Requeue failed");
            }
            return;
        }
    }

    // 3. Advanced scheduling gate.
    if let Some(rules) = advanced_rules(&record) {
        if let Some(reason) = rules.skip_reason(Utc::now()) {
            debug!(job = %record.name, reason = %reason, "Dispatch gated, completing as skipped");
            let sentinel = json!({"skipped": true, "reason": reason});
            if let Err(e) = shared.broker.complete(&record, sentinel).await {
                error!(job_id = %record.id, error = %e, "Failed to complete skipped job");
            }
            handle.processed.fetch_add(1, Ordering::Relaxed);
            JobMetrics::job_skipped(&handle.queue_name, &record.name);
            schedule_next_repeat(&record, shared).await;
            return;
        }
    }

    let info = JobRuntimeInfo {
        id: record.id.clone(),
        name: record.name.clone(),
        attempts_made: record.attempts_made,
        created_at: record.created_at,
        metadata: record.opts.metadata.clone(),
    };

    // 4. on_start.
    run_hook(&definition.on_start, StartContext { job: info.clone() }, "on_start").await;

    let started = Instant::now();

    // 5. Context factory, then the handler.
    let outcome: IgniterResult<Value> = match shared.context_factory.create().await {
        Ok(context) => {
            let journal: Arc<dyn JobJournal> = Arc::new(BrokerJournal {
                broker: shared.broker.clone(),
                queue: record.queue.clone(),
                job_id: record.id.clone(),
            });
            let ctx = JobExecutionContext::new(
                record.payload.clone(),
                context,
                info.clone(),
                Some(journal),
            );
            (definition.handler)(ctx).await
        }
        Err(e) => Err(IgniterError::InvalidContext(e.to_string())),
    };

    let execution_time_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(result) => {
            // 6. Success: hook, webhook, completion.
            run_hook(
                &definition.on_success,
                SuccessContext {
                    job: info.clone(),
                    result: result.clone(),
                    execution_time_ms,
                },
                "on_success",
            )
            .await;

            if let Some(url) = record.metadata_str("webhookUrl") {
                let payload = WebhookPayload::completed(
                    &record.id,
                    &record.name,
                    Some(result.clone()),
                    execution_time_ms,
                    tags(&record),
                );
                let webhooks = shared.webhooks.clone();
                let url = url.to_string();
                tokio::spawn(async move {
                    if let Err(e) = webhooks.send(&url, &payload).await {
                        warn!(url = %url, error = %e, "Webhook delivery failed");
                    }
                });
            }

            if let Err(e) = shared.broker.complete(&record, result.clone()).await {
                error!(job_id = %record.id, error = %e, "Failed to mark job completed");
            }

            handle.processed.fetch_add(1, Ordering::Relaxed);
            handle
                .total_duration_ms
                .fetch_add(execution_time_ms, Ordering::Relaxed);
            JobMetrics::job_completed(
                &handle.queue_name,
                &record.name,
                Duration::from_millis(execution_time_ms),
            );
            fire_event(
                &shared.options.on_success,
                WorkerEvent::Success {
                    job_id: record.id.clone(),
                    job_name: record.name.clone(),
                    duration_ms: execution_time_ms,
                },
            );

            schedule_next_repeat(&record, shared).await;

            // 8. on_complete, after either outcome.
            run_hook(
                &definition.on_complete,
                CompleteContext {
                    job: info,
                    success: true,
                    result: Some(result),
                    error: None,
                    execution_time_ms,
                },
                "on_complete",
            )
            .await;
        }
        Err(e) => {
            // 7. Failure: hook, then retry or terminal state.
            let error_text = e.to_string();
            let is_final_attempt = record.is_final_attempt();

            run_hook(
                &definition.on_failure,
                FailureContext {
                    job: info.clone(),
                    error: error_text.clone(),
                    is_final_attempt,
                },
                "on_failure",
            )
            .await;

            if is_final_attempt {
                if let Err(e) = shared.broker.fail_terminal(&record, &error_text).await {
                    error!(job_id = %record.id, error = %e, "Failed to mark job failed");
                }
                handle.failed.fetch_add(1, Ordering::Relaxed);
                JobMetrics::job_failed(
                    &handle.queue_name,
                    &record.name,
                    Duration::from_millis(execution_time_ms),
                );
            } else {
                let delay = record
                    .opts
                    .backoff
                    .as_ref()
                    .map(|spec| delay_for_attempt(spec, record.attempts_made, jitter_factor(&record)))
                    .unwrap_or(Duration::ZERO);
                JobMetrics::job_retried(&handle.queue_name, &record.name, record.attempts_made);
                if let Err(e) = shared.broker.retry_later(&record, &error_text, delay).await {
                    error!(job_id = %record.id, error = %e, "Failed to schedule retry");
                }
            }

            fire_event(
                &shared.options.on_failure,
                WorkerEvent::Failure {
                    job_id: record.id.clone(),
                    job_name: record.name.clone(),
                    error: error_text.clone(),
                },
            );

            run_hook(
                &definition.on_complete,
                CompleteContext {
                    job: info,
                    success: false,
                    result: None,
                    error: Some(error_text),
                    execution_time_ms,
                },
                "on_complete",
            )
            .await;
        }
    }
}

/// Enqueues the next iteration of a repeating job after a completed one.
async fn schedule_next_repeat(record: &JobRecord, shared: &WorkerShared) {
    let Some(repeat) = &record.opts.repeat else { return };

    let completed_iterations = repeat.count + 1;
    if let Some(limit) = repeat.limit {
        if completed_iterations >= limit {
            debug!(job = %record.name, limit, "Repeat limit reached");
            return;
        }
    }

    let now = Utc::now();
    let next = if let Some(cron) = &repeat.cron {
        match next_occurrence(cron, now, repeat.tz.as_deref()) {
            Ok(Some(next)) => next,
            Ok(None) => return,
            Err(e) => {
                warn!(job = %record.name, error = %e, "Cannot compute next cron occurrence");
                return;
            }
        }
    } else if let Some(every) = repeat.every {
        now + chrono::Duration::milliseconds(every as i64)
    } else {
        return;
    };

    if let Some(until) = repeat.until {
        if next > until {
            debug!(job = %record.name, "Repeat end date reached");
            return;
        }
    }

    let delay_ms = (next - now).num_milliseconds().max(1) as u64;
    let next_opts = JobOptions {
        delay: Some(delay_ms),
        repeat: Some(RepeatSpec {
            count: completed_iterations,
            ..repeat.clone()
        }),
        ..record.opts.clone()
    };
    let mut next_record = JobRecord::new(&record.name, &record.queue, record.payload.clone(), next_opts);
    next_record.priority = record.priority;

    if let Err(e) = shared.broker.enqueue(next_record).await {
        warn!(job = %record.name, error = %e, "Failed to schedule next repeat iteration");
    } else {
        debug!(job = %record.name, at = %next, "Scheduled next repeat iteration");
    }
}
