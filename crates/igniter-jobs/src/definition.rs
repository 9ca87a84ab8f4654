//! Job definitions: payload schema, handler, queue placement, hooks.

use crate::record::{BackoffSpec, RepeatSpec};
use crate::schedule::RepeatOptions;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use igniter_core::{IgniterResult, SchemaRef};
use serde_json::Value;
use std::sync::Arc;

/// Rate limit: at most `max` job starts per `duration_ms` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max: u32,
    pub duration_ms: u64,
}

/// Runtime facts about the executing job instance, handed to handlers and
/// hooks.
#[derive(Debug, Clone)]
pub struct JobRuntimeInfo {
    /// Instance id.
    pub id: String,
    /// Registered (namespaced) job name.
    pub name: String,
    /// Attempts consumed, including the running one.
    pub attempts_made: u32,
    /// Enqueue time.
    pub created_at: DateTime<Utc>,
    /// Metadata the instance was enqueued with.
    pub metadata: Option<Value>,
}

/// Write access to the running job's log and progress, backed by the broker.
#[async_trait]
pub trait JobJournal: Send + Sync {
    /// Appends a log line to the job.
    async fn log(&self, line: &str) -> IgniterResult<()>;

    /// Reports a progress value.
    async fn set_progress(&self, progress: Value) -> IgniterResult<()>;
}

/// Everything a handler invocation sees.
pub struct JobExecutionContext {
    /// Validated input payload.
    pub input: Value,
    /// Application context from the injected factory.
    pub context: Value,
    /// Facts about the running instance.
    pub job: JobRuntimeInfo,
    journal: Option<Arc<dyn JobJournal>>,
}

impl JobExecutionContext {
    /// Builds an execution context.
    #[must_use]
    pub fn new(
        input: Value,
        context: Value,
        job: JobRuntimeInfo,
        journal: Option<Arc<dyn JobJournal>>,
    ) -> Self {
        Self {
            input,
            context,
            job,
            journal,
        }
    }

    /// Appends a line to the job's log.
    pub async fn log(&self, line: &str) -> IgniterResult<()> {
        match &self.journal {
            Some(journal) => journal.log(line).await,
            None => Ok(()),
        }
    }

    /// Reports progress.
    pub async fn set_progress(&self, progress: Value) -> IgniterResult<()> {
        match &self.journal {
            Some(journal) => journal.set_progress(progress).await,
            None => Ok(()),
        }
    }
}

/// Async job handler.
pub type JobHandler =
    Arc<dyn Fn(JobExecutionContext) -> BoxFuture<'static, IgniterResult<Value>> + Send + Sync>;

/// Hook payload: job started.
#[derive(Debug, Clone)]
pub struct StartContext {
    pub job: JobRuntimeInfo,
}

/// Hook payload: handler returned successfully.
#[derive(Debug, Clone)]
pub struct SuccessContext {
    pub job: JobRuntimeInfo,
    pub result: Value,
    pub execution_time_ms: u64,
}

/// Hook payload: handler threw.
#[derive(Debug, Clone)]
pub struct FailureContext {
    pub job: JobRuntimeInfo,
    pub error: String,
    pub is_final_attempt: bool,
}

/// Hook payload: execution finished either way.
#[derive(Debug, Clone)]
pub struct CompleteContext {
    pub job: JobRuntimeInfo,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

/// Fire-and-forget lifecycle hook; errors are logged, never propagated.
pub type Hook<C> = Arc<dyn Fn(C) -> BoxFuture<'static, IgniterResult<()>> + Send + Sync>;

/// A registered job: schema, handler, placement, and lifecycle hooks.
#[derive(Clone)]
pub struct JobDefinition {
    /// Bare id; router merge prefixes it with a namespace.
    pub id: String,
    /// Human-readable name; defaults to the id.
    pub name: String,
    /// Input payload schema.
    pub input: SchemaRef,
    /// The handler.
    pub handler: JobHandler,
    /// Base queue name; the engine default applies when absent.
    pub queue: Option<String>,
    /// Total attempts allowed.
    pub attempts: Option<u32>,
    /// Retry backoff.
    pub backoff: Option<BackoffSpec>,
    /// Priority; higher runs first.
    pub priority: Option<i32>,
    /// Initial delay in milliseconds.
    pub delay: Option<u64>,
    /// Drop the record once completed.
    pub remove_on_complete: Option<bool>,
    /// Drop the record once terminally failed.
    pub remove_on_fail: Option<bool>,
    /// Worker-side rate limit.
    pub limiter: Option<RateLimit>,
    /// Recurrence declared on the definition.
    pub repeat: Option<RepeatOptions>,
    /// Free-form metadata merged into every instance.
    pub metadata: Option<Value>,
    /// Lifecycle hooks.
    pub on_start: Option<Hook<StartContext>>,
    pub on_success: Option<Hook<SuccessContext>>,
    pub on_failure: Option<Hook<FailureContext>>,
    pub on_complete: Option<Hook<CompleteContext>>,
}

impl JobDefinition {
    /// Starts building a definition.
    pub fn builder(id: impl Into<String>) -> JobDefinitionBuilder {
        JobDefinitionBuilder::new(id)
    }

    /// The repeat options rendered down to broker-level [`RepeatSpec`].
    #[must_use]
    pub fn repeat_spec(&self) -> Option<RepeatSpec> {
        self.repeat.as_ref().map(RepeatOptions::to_spec)
    }
}

impl std::fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("queue", &self.queue)
            .field("attempts", &self.attempts)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Builder for [`JobDefinition`].
pub struct JobDefinitionBuilder {
    id: String,
    name: Option<String>,
    input: Option<SchemaRef>,
    handler: Option<JobHandler>,
    queue: Option<String>,
    attempts: Option<u32>,
    backoff: Option<BackoffSpec>,
    priority: Option<i32>,
    delay: Option<u64>,
    remove_on_complete: Option<bool>,
    remove_on_fail: Option<bool>,
    limiter: Option<RateLimit>,
    repeat: Option<RepeatOptions>,
    metadata: Option<Value>,
    on_start: Option<Hook<StartContext>>,
    on_success: Option<Hook<SuccessContext>>,
    on_failure: Option<Hook<FailureContext>>,
    on_complete: Option<Hook<CompleteContext>>,
}

impl JobDefinitionBuilder {
    fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            input: None,
            handler: None,
            queue: None,
            attempts: None,
            backoff: None,
            priority: None,
            delay: None,
            remove_on_complete: None,
            remove_on_fail: None,
            limiter: None,
            repeat: None,
            metadata: None,
            on_start: None,
            on_success: None,
            on_failure: None,
            on_complete: None,
        }
    }

    /// Display name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Input schema.
    #[must_use]
    pub fn input(mut self, schema: SchemaRef) -> Self {
        self.input = Some(schema);
        self
    }

    /// The async handler.
    #[must_use]
    pub fn handler<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(JobExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = IgniterResult<Value>> + Send + 'static,
    {
        self.handler = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    /// Base queue name.
    #[must_use]
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Total attempts allowed.
    #[must_use]
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    /// Retry backoff.
    #[must_use]
    pub fn backoff(mut self, backoff: BackoffSpec) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Priority; higher runs first.
    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Initial delay in milliseconds.
    #[must_use]
    pub fn delay(mut self, delay_ms: u64) -> Self {
        self.delay = Some(delay_ms);
        self
    }

    /// Drop the record once completed.
    #[must_use]
    pub fn remove_on_complete(mut self, remove: bool) -> Self {
        self.remove_on_complete = Some(remove);
        self
    }

    /// Drop the record once terminally failed.
    #[must_use]
    pub fn remove_on_fail(mut self, remove: bool) -> Self {
        self.remove_on_fail = Some(remove);
        self
    }

    /// Worker-side rate limit.
    #[must_use]
    pub fn limiter(mut self, max: u32, duration_ms: u64) -> Self {
        self.limiter = Some(RateLimit { max, duration_ms });
        self
    }

    /// Recurrence.
    #[must_use]
    pub fn repeat(mut self, repeat: RepeatOptions) -> Self {
        self.repeat = Some(repeat);
        self
    }

    /// Metadata merged into every instance.
    #[must_use]
    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Hook: before the handler runs.
    #[must_use]
    pub fn on_start<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(StartContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = IgniterResult<()>> + Send + 'static,
    {
        self.on_start = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    /// Hook: after a successful run.
    #[must_use]
    pub fn on_success<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(SuccessContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = IgniterResult<()>> + Send + 'static,
    {
        self.on_success = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    /// Hook: after a thrown attempt.
    #[must_use]
    pub fn on_failure<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(FailureContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = IgniterResult<()>> + Send + 'static,
    {
        self.on_failure = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    /// Hook: after every run, success or failure.
    #[must_use]
    pub fn on_complete<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(CompleteContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = IgniterResult<()>> + Send + 'static,
    {
        self.on_complete = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    /// Finishes the definition. A definition without a handler gets one that
    /// fails every run, which surfaces misconfiguration loudly.
    #[must_use]
    pub fn build(self) -> JobDefinition {
        let id = self.id;
        let handler = self.handler.unwrap_or_else(|| {
            Arc::new(|ctx: JobExecutionContext| {
                Box::pin(async move {
                    Err(igniter_core::IgniterError::internal(format!(
                        "Job '{}' has no handler",
                        ctx.job.name
                    )))
                })
            })
        });

        JobDefinition {
            name: self.name.unwrap_or_else(|| id.clone()),
            id,
            input: self.input.unwrap_or_else(igniter_core::schema::any),
            handler,
            queue: self.queue,
            attempts: self.attempts,
            backoff: self.backoff,
            priority: self.priority,
            delay: self.delay,
            remove_on_complete: self.remove_on_complete,
            remove_on_fail: self.remove_on_fail,
            limiter: self.limiter,
            repeat: self.repeat,
            metadata: self.metadata,
            on_start: self.on_start,
            on_success: self.on_success,
            on_failure: self.on_failure,
            on_complete: self.on_complete,
        }
    }
}
