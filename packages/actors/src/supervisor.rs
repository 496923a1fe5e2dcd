//! Supervisor actor: owns the dispatcher, drives the periodic sweep and
//! serves the enqueue API.

use std::sync::Arc;
use std::time::Duration;

use bridge::NotificationBridge;
use broker::repositories::JobFilter;
use job_core::{EnqueueRequest, JobId, JobView};
use ractor::rpc::CallResult;
use ractor::{Actor, ActorProcessingErr, ActorRef, SupervisionEvent};

use crate::dispatcher::{Dispatcher, DispatcherArgs, DispatcherConfig};
use crate::handler::JobHandlerRegistry;
use crate::messages::{DispatcherMessage, SupervisorMessage};
use crate::queue::{JobQueue, QueueStats};

/// How long shutdown waits for the dispatcher to drain.
const DISPATCHER_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Supervisor arguments.
pub struct SupervisorArgs {
    pub config: DispatcherConfig,
    pub handlers: JobHandlerRegistry,
    pub bridge: NotificationBridge,
}

/// State for the supervisor actor.
pub struct SupervisorState {
    config: DispatcherConfig,
    queue: JobQueue,
    handlers: Arc<JobHandlerRegistry>,
    bridge: NotificationBridge,
    dispatcher: Option<ActorRef<DispatcherMessage>>,
    shutting_down: bool,
    restarts: u32,
}

impl SupervisorState {
    fn dispatcher_args(&self) -> DispatcherArgs {
        DispatcherArgs {
            config: self.config.clone(),
            queue: self.queue.clone(),
            handlers: self.handlers.clone(),
            bridge: self.bridge.clone(),
        }
    }
}

async fn spawn_dispatcher(
    myself: &ActorRef<SupervisorMessage>,
    state: &mut SupervisorState,
) -> Result<(), ActorProcessingErr> {
    let (dispatcher, _handle) =
        Actor::spawn_linked(None, Dispatcher, state.dispatcher_args(), myself.get_cell())
            .await
            .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn dispatcher: {}", e)))?;

    state.dispatcher = Some(dispatcher);
    Ok(())
}

/// Supervisor actor for one worker process.
pub struct Supervisor;

impl Actor for Supervisor {
    type Msg = SupervisorMessage;
    type State = SupervisorState;
    type Arguments = SupervisorArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting job supervisor for {}", args.config.worker_id);

        let missing = args.handlers.missing_kinds();
        if !missing.is_empty() {
            tracing::warn!("No handler registered for: {:?}", missing);
        }

        let queue = JobQueue::new(args.bridge.clone()).with_policy(args.config.dependency_policy);
        let mut state = SupervisorState {
            config: args.config,
            queue,
            handlers: Arc::new(args.handlers),
            bridge: args.bridge,
            dispatcher: None,
            shutting_down: false,
            restarts: 0,
        };

        spawn_dispatcher(&myself, &mut state).await?;

        // Start periodic tick
        let myself_clone = myself.clone();
        let period = state.config.tick_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if myself_clone.send_message(SupervisorMessage::Tick).is_err() {
                    break;
                }
            }
        });

        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisorMessage::Enqueue { request, reply } => {
                match state.queue.submit(request).await {
                    Ok(job_id) => {
                        if let Some(dispatcher) = &state.dispatcher {
                            let _ = dispatcher.send_message(DispatcherMessage::Dispatch);
                        }
                        let _ = reply.send(Ok(job_id));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e.to_string()));
                    }
                }
            }

            SupervisorMessage::GetJob { job_id, reply } => {
                let job = match state.queue.find(job_id).await {
                    Ok(job) => job.map(|j| j.view()),
                    Err(e) => {
                        tracing::warn!("Failed to load job {}: {}", job_id, e);
                        None
                    }
                };
                let _ = reply.send(job);
            }

            SupervisorMessage::ListJobs { limit, reply } => {
                let filter = JobFilter {
                    newest_first: true,
                    limit: Some(limit),
                    ..Default::default()
                };
                let jobs = match state.queue.list(filter).await {
                    Ok(jobs) => jobs.iter().map(|j| j.view()).collect(),
                    Err(e) => {
                        tracing::warn!("Failed to list jobs: {}", e);
                        Vec::new()
                    }
                };
                let _ = reply.send(jobs);
            }

            SupervisorMessage::GetStats { reply } => {
                let _ = reply.send(state.queue.stats().await.map_err(|e| e.to_string()));
            }

            SupervisorMessage::Tick => {
                if let Some(dispatcher) = &state.dispatcher {
                    let _ = dispatcher.send_message(DispatcherMessage::Tick);
                }
            }

            SupervisorMessage::Shutdown => {
                tracing::info!("Shutting down supervisor for {}", state.config.worker_id);
                state.shutting_down = true;
                if let Some(dispatcher) = state.dispatcher.take()
                    && let Err(e) = dispatcher
                        .stop_and_wait(None, Some(DISPATCHER_STOP_TIMEOUT))
                        .await
                {
                    tracing::warn!("Dispatcher did not stop cleanly: {}", e);
                }
                myself.stop(None);
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let (cell, reason) = match message {
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                (cell, reason.unwrap_or_else(|| "stopped".to_string()))
            }
            SupervisionEvent::ActorFailed(cell, err) => (cell, err.to_string()),
            _ => return Ok(()),
        };

        let is_dispatcher = state
            .dispatcher
            .as_ref()
            .is_some_and(|d| d.get_id() == cell.get_id());
        if !is_dispatcher {
            return Ok(());
        }
        state.dispatcher = None;

        if state.shutting_down {
            return Ok(());
        }

        state.restarts += 1;
        tracing::warn!(
            "Dispatcher for {} terminated ({}), restarting (restart #{})",
            state.config.worker_id,
            reason,
            state.restarts
        );
        spawn_dispatcher(&myself, state).await
    }
}

/// Start a supervisor for one worker.
pub async fn start_supervisor(
    config: DispatcherConfig,
    handlers: JobHandlerRegistry,
    bridge: NotificationBridge,
) -> Result<(ActorRef<SupervisorMessage>, tokio::task::JoinHandle<()>), ractor::SpawnErr> {
    let name = format!("supervisor-{}", config.worker_id);
    let args = SupervisorArgs {
        config,
        handlers,
        bridge,
    };
    let (actor, handle) = Actor::spawn(Some(name), Supervisor, args).await?;

    Ok((actor, handle))
}

/// Time allowed for request/reply calls to the supervisor.
const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Enqueue through a running supervisor.
pub async fn enqueue(
    supervisor: &ActorRef<SupervisorMessage>,
    request: EnqueueRequest,
) -> Result<JobId, String> {
    let result = ractor::rpc::call(
        supervisor,
        |reply| SupervisorMessage::Enqueue { request, reply },
        Some(CALL_TIMEOUT),
    )
    .await;

    match result {
        Ok(CallResult::Success(outcome)) => outcome,
        Ok(CallResult::Timeout) => Err("supervisor did not answer in time".into()),
        Ok(CallResult::SenderError) => Err("supervisor dropped the request".into()),
        Err(e) => Err(format!("supervisor unavailable: {}", e)),
    }
}

/// Look up a job's client view through a running supervisor.
pub async fn job_view(supervisor: &ActorRef<SupervisorMessage>, job_id: JobId) -> Option<JobView> {
    let result = ractor::rpc::call(
        supervisor,
        |reply| SupervisorMessage::GetJob { job_id, reply },
        Some(CALL_TIMEOUT),
    )
    .await;

    match result {
        Ok(CallResult::Success(view)) => view,
        _ => None,
    }
}

/// Most recent jobs, newest first, through a running supervisor.
pub async fn list_jobs(supervisor: &ActorRef<SupervisorMessage>, limit: usize) -> Vec<JobView> {
    let result = ractor::rpc::call(
        supervisor,
        |reply| SupervisorMessage::ListJobs { limit, reply },
        Some(CALL_TIMEOUT),
    )
    .await;

    match result {
        Ok(CallResult::Success(jobs)) => jobs,
        _ => Vec::new(),
    }
}

/// Job counts per state through a running supervisor.
pub async fn queue_stats(supervisor: &ActorRef<SupervisorMessage>) -> Result<QueueStats, String> {
    let result = ractor::rpc::call(
        supervisor,
        |reply| SupervisorMessage::GetStats { reply },
        Some(CALL_TIMEOUT),
    )
    .await;

    match result {
        Ok(CallResult::Success(stats)) => stats,
        Ok(CallResult::Timeout) => Err("supervisor did not answer in time".into()),
        Ok(CallResult::SenderError) => Err("supervisor dropped the request".into()),
        Err(e) => Err(format!("supervisor unavailable: {}", e)),
    }
}
