//! Dispatcher actor: claims ready jobs and runs them on the task runner.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use bridge::NotificationBridge;
use broker::BrokerError;
use futures_util::FutureExt;
use job_core::{DependencyPolicy, Job, JobId};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use ulid::Ulid;

use crate::handler::{HandlerFuture, HandlerResult, JobBody, JobContext, JobHandlerRegistry};
use crate::messages::DispatcherMessage;
use crate::queue::{JobOutcome, JobQueue, QueueError};
use crate::runner::{TaskHandle, TaskRunner, Work};

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Identity written on claimed jobs and on the worker's lease. Unique per
    /// process unless set explicitly.
    pub worker_id: String,
    /// Maximum jobs running at once.
    pub concurrency: usize,
    /// Interval of the promotion/release sweep.
    pub tick_interval: Duration,
    /// Limit for async bodies. Blocking bodies are not interrupted.
    pub execution_timeout: Option<Duration>,
    pub dependency_policy: DependencyPolicy,
    /// Running jobs of a worker that has not renewed its lease for this long
    /// are failed. Must be well above `tick_interval`.
    pub lease: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Ulid::new().to_string().to_lowercase()),
            concurrency: 4,
            tick_interval: Duration::from_secs(1),
            execution_timeout: Some(Duration::from_secs(600)),
            dependency_policy: DependencyPolicy::default(),
            lease: Duration::from_secs(30),
        }
    }
}

impl DispatcherConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_dependency_policy(mut self, policy: DependencyPolicy) -> Self {
        self.dependency_policy = policy;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }
}

/// Dispatcher arguments.
pub struct DispatcherArgs {
    pub config: DispatcherConfig,
    pub queue: JobQueue,
    pub handlers: Arc<JobHandlerRegistry>,
    pub bridge: NotificationBridge,
}

/// State for the dispatcher actor.
pub struct DispatcherState {
    config: DispatcherConfig,
    queue: JobQueue,
    handlers: Arc<JobHandlerRegistry>,
    bridge: NotificationBridge,
    runner: TaskRunner,
    in_flight: HashMap<JobId, TaskHandle>,
    /// Outcomes the broker has not accepted yet, retried every tick.
    undelivered: HashMap<JobId, JobOutcome>,
}

impl DispatcherState {
    fn free_slots(&self) -> usize {
        self.config.concurrency.saturating_sub(self.in_flight.len())
    }

    fn owned(&self) -> HashSet<JobId> {
        self.in_flight
            .keys()
            .chain(self.undelivered.keys())
            .copied()
            .collect()
    }
}

/// Dispatcher actor that executes jobs for one worker.
pub struct Dispatcher;

impl Actor for Dispatcher {
    type Msg = DispatcherMessage;
    type State = DispatcherState;
    type Arguments = DispatcherArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            "Starting dispatcher for {} (concurrency {})",
            args.config.worker_id,
            args.config.concurrency
        );

        // The lease must exist before the first claim.
        if let Err(e) = args.queue.heartbeat(&args.config.worker_id).await {
            tracing::warn!("Failed to take lease for {}: {}", args.config.worker_id, e);
        }

        // Pick up whatever is already waiting.
        myself.send_message(DispatcherMessage::Dispatch)?;

        Ok(DispatcherState {
            config: args.config,
            queue: args.queue,
            handlers: args.handlers,
            bridge: args.bridge,
            runner: TaskRunner::start(),
            in_flight: HashMap::new(),
            undelivered: HashMap::new(),
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            DispatcherMessage::Dispatch => {
                dispatch(&myself, state).await;
            }

            DispatcherMessage::Tick => {
                sweep(state).await;
                dispatch(&myself, state).await;
            }

            DispatcherMessage::JobFinished { job_id, outcome } => {
                state.in_flight.remove(&job_id);
                deliver(state, job_id, outcome).await;
                dispatch(&myself, state).await;
            }
        }

        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        for handle in state.in_flight.values() {
            handle.cancel();
        }
        if let Err(e) = state.runner.shutdown().await {
            tracing::warn!("Task runner for {} stopped with errors: {}", state.config.worker_id, e);
        }

        retry_undelivered(state).await;

        // Anything cut short is failed so its dependents are not stuck.
        let worker_id = &state.config.worker_id;
        match state.queue.fail_interrupted(worker_id).await {
            Ok(failed) if !failed.is_empty() => {
                tracing::info!("Failed {} interrupted job(s) of {}", failed.len(), worker_id)
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Failed to mark interrupted jobs of {}: {}", worker_id, e),
        }
        if let Err(e) = state.queue.retire(worker_id).await {
            tracing::warn!("Failed to give up lease of {}: {}", worker_id, e);
        }

        Ok(())
    }
}

/// Record an outcome, keeping it for a retry if the broker did not take it.
async fn deliver(state: &mut DispatcherState, job_id: JobId, outcome: JobOutcome) {
    match state.queue.finish(job_id, outcome.clone()).await {
        Ok(_) => {}
        // Already recorded, or the job left `running` some other way.
        Err(QueueError::Transition(e)) => {
            tracing::debug!("Outcome of job {} no longer applies: {}", job_id, e)
        }
        Err(QueueError::Broker(BrokerError::NotFound(_))) => {
            tracing::warn!("Job {} vanished before its outcome was recorded", job_id)
        }
        Err(e) => {
            tracing::warn!("Failed to record outcome of job {}, will retry: {}", job_id, e);
            state.undelivered.insert(job_id, outcome);
        }
    }
}

async fn retry_undelivered(state: &mut DispatcherState) {
    for (job_id, outcome) in std::mem::take(&mut state.undelivered) {
        deliver(state, job_id, outcome).await;
    }
}

/// The periodic sweep. Each step runs even if an earlier one failed.
async fn sweep(state: &mut DispatcherState) {
    retry_undelivered(state).await;

    let worker_id = state.config.worker_id.clone();
    if let Err(e) = state.queue.heartbeat(&worker_id).await {
        tracing::warn!("Failed to renew lease of {}: {}", worker_id, e);
    }
    if let Err(e) = state.queue.reap_abandoned(state.config.lease).await {
        tracing::warn!("Lease sweep failed: {}", e);
    }
    if let Err(e) = state.queue.fail_orphans(&worker_id, &state.owned()).await {
        tracing::warn!("Orphan sweep failed: {}", e);
    }
    if let Err(e) = state.queue.promote_due().await {
        tracing::warn!("Promotion sweep failed: {}", e);
    }
    if let Err(e) = state.queue.release_held().await {
        tracing::warn!("Dependency sweep failed: {}", e);
    }
    if let Err(e) = state.queue.reinstall_recurring().await {
        tracing::warn!("Recurrence sweep failed: {}", e);
    }
}

async fn dispatch(myself: &ActorRef<DispatcherMessage>, state: &mut DispatcherState) {
    let free = state.free_slots();
    if free == 0 {
        return;
    }

    let claimed = match state.queue.claim_ready(&state.config.worker_id, free).await {
        Ok(claimed) => claimed,
        Err(e) => {
            tracing::warn!("Failed to claim jobs: {}", e);
            return;
        }
    };

    for job in claimed {
        start_job(myself, state, job).await;
    }
}

async fn start_job(myself: &ActorRef<DispatcherMessage>, state: &mut DispatcherState, job: Job) {
    let job_id = job.id;
    let kind = job.kind;
    tracing::info!("Starting job {} ({})", job_id, kind);

    let Some(handler) = state.handlers.get(kind) else {
        let outcome = JobOutcome::Failed(format!("no handler registered for {}", kind));
        deliver(state, job_id, outcome).await;
        return;
    };

    let ctx = JobContext::new(job, state.bridge.clone());
    let body = match catch_unwind(AssertUnwindSafe(|| handler.handle(ctx))) {
        Ok(body) => body,
        Err(panic) => {
            deliver(state, job_id, JobOutcome::Failed(panic_message(panic))).await;
            return;
        }
    };

    let report = {
        let myself = myself.clone();
        move |outcome: JobOutcome| {
            let _ = myself.send_message(DispatcherMessage::JobFinished { job_id, outcome });
        }
    };

    let work = match body {
        JobBody::Async(future) => {
            let timeout = state.config.execution_timeout;
            Work::future(async move { report(run_async(future, timeout).await) })
        }
        JobBody::Blocking(body) => Work::blocking(move || {
            let result = catch_unwind(AssertUnwindSafe(body));
            report(into_outcome(result.map_err(panic_message)));
        }),
    };

    match state.runner.submit(work) {
        Ok(handle) => {
            state.in_flight.insert(job_id, handle);
        }
        Err(e) => deliver(state, job_id, JobOutcome::Failed(e.to_string())).await,
    }
}

async fn run_async(future: HandlerFuture, timeout: Option<Duration>) -> JobOutcome {
    let guarded = AssertUnwindSafe(future).catch_unwind();
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(result) => result,
            Err(_) => return JobOutcome::Failed(format!("timed out after {:?}", limit)),
        },
        None => guarded.await,
    };
    into_outcome(result.map_err(panic_message))
}

fn into_outcome(result: Result<HandlerResult, String>) -> JobOutcome {
    match result {
        Ok(Ok(output)) => JobOutcome::Completed(output),
        Ok(Err(error)) | Err(error) => JobOutcome::Failed(error),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_string());
    format!("job panicked: {}", detail)
}
