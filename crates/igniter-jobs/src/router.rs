//! Routers and the typed executor.
//!
//! A router is a named bundle of job definitions. Merging routers into the
//! engine flattens their jobs to `<namespace>.<jobId>` and returns a
//! [`JobsExecutor`]: the static rendering of the source's dotted proxy.
//! `executor.namespace("emails")?.job("send")?.enqueue(input)` resolves at
//! access time and raises `INVALID_JOB` for unknown paths; input validation
//! happens on every dispatch.

use crate::engine::JobQueues;
use crate::jobs_api::JobManager;
use crate::queues::QueueManager;
use crate::schedule::{EnqueueOptions, ScheduleSpec};
use crate::worker::WorkerHandle;
use crate::definition::JobDefinition;
use igniter_core::{IgniterError, IgniterResult};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A named bundle of job definitions.
pub struct JobRouter {
    /// Default namespace when the merge entry does not name one.
    pub namespace: String,
    /// The bundled definitions.
    pub jobs: Vec<JobDefinition>,
    /// Options applied to every dispatch through this router's namespace.
    pub default_options: Option<EnqueueOptions>,
}

impl JobRouter {
    /// Creates an empty router.
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            jobs: Vec::new(),
            default_options: None,
        }
    }

    /// Adds a job definition.
    #[must_use]
    pub fn job(mut self, definition: JobDefinition) -> Self {
        self.jobs.push(definition);
        self
    }

    /// Sets namespace-wide default enqueue options.
    #[must_use]
    pub fn default_options(mut self, options: EnqueueOptions) -> Self {
        self.default_options = Some(options);
        self
    }
}

/// Creates a router with its jobs.
#[must_use]
pub fn router(namespace: impl Into<String>, jobs: Vec<JobDefinition>) -> JobRouter {
    let mut built = JobRouter::new(namespace);
    built.jobs = jobs;
    built
}

/// The merged, dispatchable view over all registered namespaces.
#[derive(Clone)]
pub struct JobsExecutor {
    engine: Arc<JobQueues>,
    namespaces: HashMap<String, Vec<String>>,
    defaults: HashMap<String, EnqueueOptions>,
}

impl std::fmt::Debug for JobsExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobsExecutor").finish_non_exhaustive()
    }
}

impl JobsExecutor {
    pub(crate) fn new(
        engine: Arc<JobQueues>,
        namespaces: HashMap<String, Vec<String>>,
        defaults: HashMap<String, EnqueueOptions>,
    ) -> Self {
        Self {
            engine,
            namespaces,
            defaults,
        }
    }

    /// Registered namespace names.
    #[must_use]
    pub fn namespaces(&self) -> Vec<String> {
        self.namespaces.keys().cloned().collect()
    }

    /// Resolves a namespace; unknown names raise `INVALID_JOB`.
    pub fn namespace(&self, namespace: &str) -> IgniterResult<NamespaceExecutor> {
        if !self.namespaces.contains_key(namespace) {
            return Err(IgniterError::InvalidJob {
                path: namespace.to_string(),
            });
        }
        Ok(NamespaceExecutor {
            executor: self.clone(),
            namespace: namespace.to_string(),
        })
    }

    /// Runtime dotted dispatch: `invoke("emails.send", input, opts)`.
    pub async fn invoke(
        &self,
        namespaced_id: &str,
        input: Value,
        options: Option<EnqueueOptions>,
    ) -> IgniterResult<String> {
        let (namespace, job) = namespaced_id.split_once('.').ok_or_else(|| {
            IgniterError::InvalidJob {
                path: namespaced_id.to_string(),
            }
        })?;
        self.namespace(namespace)?.job(job)?.enqueue_with(input, options).await
    }

    /// Queue management surface.
    #[must_use]
    pub fn queues(&self) -> QueueManager {
        self.engine.queues()
    }

    /// Single-job surface.
    #[must_use]
    pub fn job_manager(&self) -> JobManager {
        self.engine.jobs()
    }

    /// Live worker handles.
    #[must_use]
    pub fn workers(&self) -> Vec<Arc<WorkerHandle>> {
        self.engine.get_workers()
    }
}

/// Dispatch access to one namespace.
#[derive(Clone)]
pub struct NamespaceExecutor {
    executor: JobsExecutor,
    namespace: String,
}

impl std::fmt::Debug for NamespaceExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceExecutor")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl NamespaceExecutor {
    /// Job names registered under this namespace.
    #[must_use]
    pub fn jobs(&self) -> Vec<String> {
        self.executor
            .namespaces
            .get(&self.namespace)
            .cloned()
            .unwrap_or_default()
    }

    /// Resolves a job; unknown names raise `INVALID_JOB`.
    pub fn job(&self, name: &str) -> IgniterResult<JobDispatch> {
        let known = self
            .executor
            .namespaces
            .get(&self.namespace)
            .map(|jobs| jobs.iter().any(|j| j == name))
            .unwrap_or(false);
        if !known {
            return Err(IgniterError::InvalidJob {
                path: format!("{}.{}", self.namespace, name),
            });
        }
        Ok(JobDispatch {
            engine: self.executor.engine.clone(),
            defaults: self.executor.defaults.get(&self.namespace).cloned(),
            name: format!("{}.{}", self.namespace, name),
        })
    }
}

/// Dispatch access to one registered job.
#[derive(Clone)]
pub struct JobDispatch {
    engine: Arc<JobQueues>,
    defaults: Option<EnqueueOptions>,
    name: String,
}

impl std::fmt::Debug for JobDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDispatch")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl JobDispatch {
    /// The namespaced job name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues with the namespace defaults.
    pub async fn enqueue(&self, input: Value) -> IgniterResult<String> {
        self.enqueue_with(input, None).await
    }

    /// Enqueues with explicit options layered over the namespace defaults.
    pub async fn enqueue_with(
        &self,
        input: Value,
        options: Option<EnqueueOptions>,
    ) -> IgniterResult<String> {
        let merged = merge_options(self.defaults.clone(), options);
        self.engine.enqueue(&self.name, input, merged).await
    }

    /// Translates schedule options, then enqueues.
    pub async fn schedule(&self, input: Value, spec: ScheduleSpec) -> IgniterResult<String> {
        self.engine.schedule(&self.name, input, spec).await
    }

    /// Enqueues many payloads at once.
    pub async fn bulk(
        &self,
        items: Vec<(Value, Option<EnqueueOptions>)>,
    ) -> IgniterResult<Vec<String>> {
        let items = items
            .into_iter()
            .map(|(input, options)| (input, merge_options(self.defaults.clone(), options)))
            .collect();
        self.engine.bulk(&self.name, items).await
    }
}

/// Field-wise layering: explicit options win over namespace defaults.
fn merge_options(
    defaults: Option<EnqueueOptions>,
    explicit: Option<EnqueueOptions>,
) -> Option<EnqueueOptions> {
    match (defaults, explicit) {
        (None, None) => None,
        (Some(options), None) | (None, Some(options)) => Some(options),
        (Some(defaults), Some(explicit)) => Some(EnqueueOptions {
            delay: explicit.delay.or(defaults.delay),
            priority: explicit.priority.or(defaults.priority),
            attempts: explicit.attempts.or(defaults.attempts),
            backoff: explicit.backoff.or(defaults.backoff),
            job_id: explicit.job_id.or(defaults.job_id),
            repeat: explicit.repeat.or(defaults.repeat),
            metadata: explicit.metadata.or(defaults.metadata),
        }),
    }
}
