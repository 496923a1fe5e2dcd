//! Event types for real-time updates.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{JobId, JobKind, JobView};

/// Name of a pub/sub topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Channel(Cow<'static, str>);

impl Channel {
    /// Progress and general work notifications.
    pub const WORK: Channel = Channel::from_static("WORK_CHANNEL");
    /// A job was picked up by a worker.
    pub const JOB_STARTED: Channel = Channel::from_static("STARTED_MUSIC_JOB_CHANNEL");
    /// A job reached a terminal state.
    pub const JOB_COMPLETED: Channel = Channel::from_static("COMPLETED_MUSIC_JOB_CHANNEL");
    /// A subscription refresh finished.
    pub const SUBSCRIPTION_REFRESH_COMPLETED: Channel =
        Channel::from_static("COMPLETED_YOUTUBE_SUBSCRIPTION_JOB_CHANNEL");

    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Job lifecycle events published to live clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// A new job was accepted by the queue.
    JobEnqueued {
        job: JobView,
        timestamp: DateTime<Utc>,
    },
    /// A job started executing.
    JobStarted {
        job_id: JobId,
        kind: JobKind,
        worker_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A running job reported progress.
    JobProgress {
        job_id: JobId,
        kind: JobKind,
        progress: Value,
        timestamp: DateTime<Utc>,
    },
    /// A job completed successfully.
    JobCompleted {
        job_id: JobId,
        kind: JobKind,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// A job failed.
    JobFailed {
        job_id: JobId,
        kind: JobKind,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            JobEvent::JobEnqueued { timestamp, .. } => *timestamp,
            JobEvent::JobStarted { timestamp, .. } => *timestamp,
            JobEvent::JobProgress { timestamp, .. } => *timestamp,
            JobEvent::JobCompleted { timestamp, .. } => *timestamp,
            JobEvent::JobFailed { timestamp, .. } => *timestamp,
        }
    }

    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::JobEnqueued { job, .. } => job.id,
            JobEvent::JobStarted { job_id, .. } => *job_id,
            JobEvent::JobProgress { job_id, .. } => *job_id,
            JobEvent::JobCompleted { job_id, .. } => *job_id,
            JobEvent::JobFailed { job_id, .. } => *job_id,
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            JobEvent::JobEnqueued { job, .. } => job.kind,
            JobEvent::JobStarted { kind, .. } => *kind,
            JobEvent::JobProgress { kind, .. } => *kind,
            JobEvent::JobCompleted { kind, .. } => *kind,
            JobEvent::JobFailed { kind, .. } => *kind,
        }
    }

    /// Channels this event is announced on.
    ///
    /// Terminal events go to the generic completion channel; a finished
    /// subscription refresh is also announced on its own channel.
    pub fn channels(&self) -> Vec<Channel> {
        match self {
            JobEvent::JobEnqueued { .. } | JobEvent::JobProgress { .. } => vec![Channel::WORK],
            JobEvent::JobStarted { .. } => vec![Channel::JOB_STARTED],
            JobEvent::JobCompleted { kind, .. } if *kind == JobKind::RefreshSubscriptions => {
                vec![Channel::JOB_COMPLETED, Channel::SUBSCRIPTION_REFRESH_COMPLETED]
            }
            JobEvent::JobCompleted { .. } | JobEvent::JobFailed { .. } => {
                vec![Channel::JOB_COMPLETED]
            }
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            JobEvent::JobEnqueued { job, .. } => format!("Job {} ({}) enqueued", job.id, job.kind),
            JobEvent::JobStarted {
                job_id, worker_id, ..
            } => format!("Job {} started by {}", job_id, worker_id),
            JobEvent::JobProgress { job_id, .. } => format!("Job {} progress", job_id),
            JobEvent::JobCompleted {
                job_id,
                duration_ms,
                ..
            } => format!("Job {} completed in {}ms", job_id, duration_ms),
            JobEvent::JobFailed { job_id, error, .. } => {
                format!("Job {} failed: {}", job_id, error)
            }
        }
    }
}
