//! Job execution for worker processes.
//!
//! This crate provides the queue operations over the shared broker, the
//! task runner that executes job bodies and the Ractor actors that tie them
//! together in each worker process.
//!
//! # Architecture
//!
//! - `Supervisor` - Top-level actor; serves enqueue requests, drives the
//!   periodic sweep and restarts the dispatcher if it dies
//! - `Dispatcher` - Claims ready jobs and runs them on a `TaskRunner`; keeps
//!   the worker's lease alive
//! - `JobQueue` - Enqueue modes, promotion, dependency release and recovery
//!   of jobs whose worker is gone
//! - `CronScheduler` - Installs the recurring-job catalogue exactly once
//!
//! # Usage
//!
//! ```ignore
//! use actors::{DispatcherConfig, JobHandlerRegistry, start_supervisor};
//!
//! let bridge = bridge::NotificationBridge::connect().await?;
//! let (supervisor, handle) =
//!     start_supervisor(DispatcherConfig::new("worker-1"), handlers, bridge).await?;
//!
//! let job_id = actors::enqueue(&supervisor, EnqueueRequest::now(kind, payload)).await?;
//! ```

mod cron;
mod dispatcher;
mod handler;
mod messages;
mod queue;
mod runner;
mod supervisor;

pub use cron::{BootstrapOutcome, CRON_LOCK_KEY, CronScheduler, default_catalogue};
pub use dispatcher::{Dispatcher, DispatcherArgs, DispatcherConfig};
pub use handler::{
    FnHandler, HandlerFuture, HandlerResult, JobBody, JobContext, JobHandler, JobHandlerRegistry,
};
pub use messages::{DispatcherMessage, SupervisorMessage};
pub use queue::{INTERRUPTED, JobOutcome, JobQueue, QueueError, QueueStats};
pub use runner::{RunnerError, TaskHandle, TaskRunner, Work};
pub use supervisor::{
    Supervisor, SupervisorArgs, enqueue, job_view, list_jobs, queue_stats, start_supervisor,
};

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort, concurrency};
