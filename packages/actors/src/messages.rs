//! Message types for actor communication.

use job_core::{EnqueueRequest, JobId, JobView};
use ractor::RpcReplyPort;

use crate::queue::{JobOutcome, QueueStats};

/// Messages for the Dispatcher.
#[derive(Debug)]
pub enum DispatcherMessage {
    /// Claim ready jobs up to the free concurrency and start them.
    Dispatch,

    /// Periodic sweep: retry unrecorded outcomes, renew the lease, fail
    /// abandoned jobs, promote and release, re-install recurring jobs, then
    /// dispatch.
    Tick,

    /// A job body finished on the task runner.
    JobFinished { job_id: JobId, outcome: JobOutcome },
}

/// Messages for the Supervisor.
#[derive(Debug)]
pub enum SupervisorMessage {
    /// Enqueue a job and trigger an immediate dispatch.
    Enqueue {
        request: EnqueueRequest,
        reply: RpcReplyPort<Result<JobId, String>>,
    },

    /// Get a job's client view.
    GetJob {
        job_id: JobId,
        reply: RpcReplyPort<Option<JobView>>,
    },

    /// Most recent jobs, newest first.
    ListJobs {
        limit: usize,
        reply: RpcReplyPort<Vec<JobView>>,
    },

    /// Job counts per state.
    GetStats {
        reply: RpcReplyPort<Result<QueueStats, String>>,
    },

    /// Periodic tick, forwarded to the dispatcher.
    Tick,

    /// Stop the dispatcher, then the supervisor.
    Shutdown,
}
