//! Job domain types for work items in the queue.

use std::sync::{LazyLock, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::{Generator, Ulid};

use crate::error::{TransitionError, ValidationError};
use crate::schedule::Recurrence;

/// Process-wide monotonic ULID source, so ids issued by one producer sort in
/// the order they were requested even within the same millisecond.
static ID_GENERATOR: LazyLock<Mutex<Generator>> = LazyLock::new(|| Mutex::new(Generator::new()));

/// Unique identifier for a job, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Create a new unique job ID.
    pub fn new() -> Self {
        let mut generator = ID_GENERATOR.lock().unwrap_or_else(PoisonError::into_inner);
        // Overflow only happens after 2^80 ids in one millisecond.
        Self(generator.generate().unwrap_or_else(|_| Ulid::new()))
    }

    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The closed set of work functions a job can name.
///
/// Handlers are registered per kind, so adding a variant without a handler is
/// caught by [`JobKind::ALL`] coverage checks at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Refresh the video category catalogue. Payload: `{"force": bool}`.
    RefreshVideoCategories,
    /// Refresh metadata for channels that still have subscribers.
    RefreshActiveChannels,
    /// Refresh subscriptions, for one account or all. Payload: `{"email": string?}`.
    RefreshSubscriptions,
    /// Remove channels nobody subscribes to anymore.
    ChannelCleanup,
    /// Remove stale download jobs and their files.
    CleanupJobs,
    /// Run a single music download. Payload: `{"job_id": string}`.
    MusicDownload,
}

impl JobKind {
    pub const ALL: [JobKind; 6] = [
        JobKind::RefreshVideoCategories,
        JobKind::RefreshActiveChannels,
        JobKind::RefreshSubscriptions,
        JobKind::ChannelCleanup,
        JobKind::CleanupJobs,
        JobKind::MusicDownload,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::RefreshVideoCategories => "refresh_video_categories",
            JobKind::RefreshActiveChannels => "refresh_active_channels",
            JobKind::RefreshSubscriptions => "refresh_subscriptions",
            JobKind::ChannelCleanup => "channel_cleanup",
            JobKind::CleanupJobs => "cleanup_jobs",
            JobKind::MusicDownload => "music_download",
        }
    }

    /// Check that `payload` carries the arguments this kind expects.
    pub fn validate(&self, payload: &Value) -> Result<(), ValidationError> {
        let object = match payload {
            Value::Null => None,
            Value::Object(map) => Some(map),
            _ => {
                return Err(ValidationError::PayloadNotObject { kind: *self });
            }
        };
        let field = |name: &str| object.and_then(|map| map.get(name));

        match self {
            JobKind::RefreshVideoCategories => match field("force") {
                None | Some(Value::Bool(_)) => Ok(()),
                Some(_) => Err(ValidationError::InvalidField {
                    kind: *self,
                    field: "force",
                    expected: "boolean",
                }),
            },
            JobKind::RefreshSubscriptions => match field("email") {
                None | Some(Value::Null) => Ok(()),
                Some(Value::String(email)) if email.contains('@') => Ok(()),
                Some(_) => Err(ValidationError::InvalidField {
                    kind: *self,
                    field: "email",
                    expected: "email address or null",
                }),
            },
            JobKind::MusicDownload => match field("job_id") {
                Some(Value::String(id)) if !id.is_empty() => Ok(()),
                Some(_) => Err(ValidationError::InvalidField {
                    kind: *self,
                    field: "job_id",
                    expected: "non-empty string",
                }),
                None => Err(ValidationError::MissingField {
                    kind: *self,
                    field: "job_id",
                }),
            },
            JobKind::RefreshActiveChannels | JobKind::ChannelCleanup | JobKind::CleanupJobs => {
                Ok(())
            }
        }
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown job kind: {s}"))
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a job as reported to external readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// Dispatch state of a job inside the queue.
///
/// `Held`, `Scheduled` and `Ready` all surface as [`JobStatus::Pending`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for the job named in `depends_on` to reach a terminal state.
    Held,
    /// Waiting for its scheduled entry to be promoted.
    Scheduled,
    /// Eligible for dispatch.
    #[default]
    Ready,
    /// Claimed by a worker.
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn status(&self) -> JobStatus {
        match self {
            JobState::Held | JobState::Scheduled | JobState::Ready => JobStatus::Pending,
            JobState::Running => JobStatus::Running,
            JobState::Completed => JobStatus::Completed,
            JobState::Failed => JobStatus::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Held, Ready)
                | (Held, Failed)
                | (Scheduled, Ready)
                | (Scheduled, Held)
                | (Ready, Running)
                | (Running, Completed)
                | (Running, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Held => "held",
            JobState::Scheduled => "scheduled",
            JobState::Ready => "ready",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "held" => Ok(JobState::Held),
            "scheduled" => Ok(JobState::Scheduled),
            "ready" => Ok(JobState::Ready),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a dependent job reacts when the job it waits on fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyPolicy {
    /// Any terminal state releases the dependent.
    #[default]
    RunAfterAny,
    /// A failed dependency fails the dependent without running it.
    AbortOnFailure,
}

impl DependencyPolicy {
    /// Decide what a held job becomes once its dependency is in `dependency`.
    /// `None` means the dependency no longer exists. Returns `None` while the
    /// dependency is still unresolved.
    pub fn resolve(&self, dependency: Option<JobState>) -> Option<JobState> {
        match dependency {
            None => Some(JobState::Ready),
            Some(JobState::Completed) => Some(JobState::Ready),
            Some(JobState::Failed) => match self {
                DependencyPolicy::RunAfterAny => Some(JobState::Ready),
                DependencyPolicy::AbortOnFailure => Some(JobState::Failed),
            },
            Some(_) => None,
        }
    }
}

impl std::str::FromStr for DependencyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run_after_any" => Ok(DependencyPolicy::RunAfterAny),
            "abort_on_failure" => Ok(DependencyPolicy::AbortOnFailure),
            other => Err(format!("unknown dependency policy: {other}")),
        }
    }
}

/// A job represents a unit of work to be executed by the queue system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job.
    pub id: JobId,
    /// Work function to run.
    pub kind: JobKind,
    /// Arguments for the work function.
    pub payload: Value,
    /// Current dispatch state.
    pub state: JobState,
    /// When the job is due, for jobs enqueued with a timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Job that must be terminal before this one may run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<JobId>,
    /// Cron recurrence carried forward after each run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<Recurrence>,
    /// Worker that claimed the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure reason for failed jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Structured output for completed jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Next occurrence of a recurring job, once it has been installed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successor: Option<JobId>,
}

impl Job {
    /// Create a new job that is ready to run.
    pub fn new(kind: JobKind, payload: Value) -> Self {
        Self {
            id: JobId::new(),
            kind,
            payload,
            state: JobState::Ready,
            scheduled_at: None,
            depends_on: None,
            recurrence: None,
            worker_id: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            result: None,
            successor: None,
        }
    }

    /// Schedule the job to become ready at `at`.
    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.state = JobState::Scheduled;
        self.scheduled_at = Some(at);
        self
    }

    /// Hold the job until `dependency` is terminal.
    pub fn depending_on(mut self, dependency: JobId) -> Self {
        self.state = JobState::Held;
        self.depends_on = Some(dependency);
        self
    }

    /// Attach a recurrence that re-installs the job after it runs.
    pub fn with_recurrence(mut self, recurrence: Recurrence) -> Self {
        self.recurrence = Some(recurrence);
        self
    }

    pub fn status(&self) -> JobStatus {
        self.state.status()
    }

    /// Move the job to `next`, stamping the matching timestamp.
    pub fn transition(&mut self, next: JobState, at: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                job_id: self.id.to_string(),
                from: self.state,
                to: next,
            });
        }
        match next {
            JobState::Running => self.started_at = Some(at),
            JobState::Completed | JobState::Failed => self.finished_at = Some(at),
            _ => {}
        }
        self.state = next;
        Ok(())
    }

    /// Read model handed to clients.
    pub fn view(&self) -> JobView {
        JobView {
            id: self.id,
            kind: self.kind,
            status: self.status(),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            error: self.error.clone(),
        }
    }
}

/// Client-facing projection of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// When an enqueued job becomes eligible to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueMode {
    Immediate,
    At(DateTime<Utc>),
    After(JobId),
}

/// A request to put work on the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueRequest {
    pub kind: JobKind,
    pub payload: Value,
    pub mode: EnqueueMode,
}

impl EnqueueRequest {
    pub fn now(kind: JobKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            mode: EnqueueMode::Immediate,
        }
    }

    pub fn at(at: DateTime<Utc>, kind: JobKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            mode: EnqueueMode::At(at),
        }
    }

    pub fn after(dependency: JobId, kind: JobKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            mode: EnqueueMode::After(dependency),
        }
    }

    /// Validate the payload and build the job record.
    pub fn into_job(self) -> Result<Job, ValidationError> {
        self.kind.validate(&self.payload)?;
        let job = Job::new(self.kind, self.payload);
        Ok(match self.mode {
            EnqueueMode::Immediate => job,
            EnqueueMode::At(at) => job.scheduled_for(at),
            EnqueueMode::After(dependency) => job.depending_on(dependency),
        })
    }
}
