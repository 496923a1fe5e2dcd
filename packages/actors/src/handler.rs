//! Job handler trait and registry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bridge::NotificationBridge;
use broker::BrokerError;
use chrono::Utc;
use job_core::{Job, JobEvent, JobKind};
use serde_json::Value;
use tokio::runtime::Handle;

/// Result type for job handlers: optional structured output, or an error
/// message recorded on the failed job.
pub type HandlerResult = Result<Option<Value>, String>;

/// Future type for async job handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// The executable body a handler produces for one job.
pub enum JobBody {
    /// Cooperative body, subject to the dispatcher's execution timeout.
    Async(HandlerFuture),
    /// Blocking body, run on the blocking thread pool.
    Blocking(Box<dyn FnOnce() -> HandlerResult + Send + 'static>),
}

impl JobBody {
    pub fn future<F>(future: F) -> Self
    where
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        JobBody::Async(Box::pin(future))
    }

    pub fn blocking<F>(body: F) -> Self
    where
        F: FnOnce() -> HandlerResult + Send + 'static,
    {
        JobBody::Blocking(Box::new(body))
    }
}

/// What a handler gets to work with.
#[derive(Clone)]
pub struct JobContext {
    job: Job,
    bridge: NotificationBridge,
    runtime: Handle,
}

impl JobContext {
    /// Must be called inside a Tokio runtime.
    pub fn new(job: Job, bridge: NotificationBridge) -> Self {
        Self {
            job,
            bridge,
            runtime: Handle::current(),
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn payload(&self) -> &Value {
        &self.job.payload
    }

    /// Publish a progress update for this job on the work channel.
    pub async fn report_progress(&self, progress: Value) -> Result<(), BrokerError> {
        self.bridge
            .publish_event(&JobEvent::JobProgress {
                job_id: self.job.id,
                kind: self.job.kind,
                progress,
                timestamp: Utc::now(),
            })
            .await
    }

    /// [`report_progress`](Self::report_progress) for blocking bodies. Must
    /// not be called from async code.
    pub fn report_progress_blocking(&self, progress: Value) -> Result<(), BrokerError> {
        self.runtime.block_on(self.report_progress(progress))
    }
}

/// Trait for job handlers.
///
/// Implement this trait to define how jobs of a specific kind are processed.
pub trait JobHandler: Send + Sync + 'static {
    /// The job kind this handler processes.
    fn kind(&self) -> JobKind;

    /// Build the body that runs the job.
    fn handle(&self, ctx: JobContext) -> JobBody;
}

/// Registry for job handlers, keyed by kind.
#[derive(Default)]
pub struct JobHandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl JobHandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler, replacing any previous one for its kind.
    pub fn register<H: JobHandler>(&mut self, handler: H) {
        self.handlers.insert(handler.kind(), Arc::new(handler));
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<H: JobHandler>(mut self, handler: H) -> Self {
        self.register(handler);
        self
    }

    /// Get the handler for a job kind.
    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Kinds with no registered handler. Jobs of these kinds fail when
    /// dispatched.
    pub fn missing_kinds(&self) -> Vec<JobKind> {
        JobKind::ALL
            .into_iter()
            .filter(|kind| !self.handlers.contains_key(kind))
            .collect()
    }
}

/// A simple function-based job handler.
pub struct FnHandler<F>
where
    F: Fn(JobContext) -> JobBody + Send + Sync + 'static,
{
    kind: JobKind,
    handler: F,
}

impl<F> FnHandler<F>
where
    F: Fn(JobContext) -> JobBody + Send + Sync + 'static,
{
    /// Create a new function-based handler.
    pub fn new(kind: JobKind, handler: F) -> Self {
        Self { kind, handler }
    }
}

impl<F> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> JobBody + Send + Sync + 'static,
{
    fn kind(&self) -> JobKind {
        self.kind
    }

    fn handle(&self, ctx: JobContext) -> JobBody {
        (self.handler)(ctx)
    }
}

/// Helper macro for creating async job handlers from a block.
///
/// ```ignore
/// let handler = job_handler!(JobKind::CleanupJobs, |ctx| {
///     ctx.report_progress(serde_json::json!({"removed": 0}))
///         .await
///         .map_err(|e| e.to_string())?;
///     Ok(None)
/// });
/// ```
#[macro_export]
macro_rules! job_handler {
    ($kind:expr, |$ctx:ident| $body:expr) => {
        $crate::FnHandler::new($kind, |$ctx: $crate::JobContext| {
            $crate::JobBody::future(async move { $body })
        })
    };
}
