//! Broker-backed job queue: enqueue modes, promotion, dependency gating and
//! the completion path.
//!
//! Every state change goes through [`JobRepository::compare_and_set`], so any
//! number of queues in any number of processes can share one broker. Work
//! that follows a state change (events, dependents, the next occurrence of a
//! recurring job) is repeated by the periodic sweeps when it fails.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use bridge::NotificationBridge;
use broker::BrokerError;
use broker::repositories::{
    JobFilter, JobRepository, ScheduleRepository, StateChange, WorkerRepository,
};
use chrono::{DateTime, Utc};
use job_core::{
    DependencyPolicy, EnqueueRequest, Job, JobEvent, JobId, JobKind, JobState, Recurrence,
    ScheduledEntry, TransitionError, ValidationError,
};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::runner::RunnerError;

/// Scheduled entries promoted per sweep.
const PROMOTE_BATCH: usize = 256;

/// Error recorded on jobs whose worker stopped before they finished.
pub const INTERRUPTED: &str = "interrupted";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Invalid job: {0}")]
    Validation(#[from] ValidationError),
    #[error("Broker unavailable: {0}")]
    Broker(#[from] BrokerError),
    #[error("Illegal transition: {0}")]
    Transition(#[from] TransitionError),
    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),
}

/// How a job body ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(Option<Value>),
    Failed(String),
}

/// Job counts per dispatch state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub held: u64,
    pub scheduled: u64,
    pub ready: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStats {
    /// Jobs that report `pending` to clients.
    pub fn pending(&self) -> u64 {
        self.held + self.scheduled + self.ready
    }
}

/// Handle to the shared queue.
#[derive(Clone)]
pub struct JobQueue {
    bridge: NotificationBridge,
    policy: DependencyPolicy,
}

impl JobQueue {
    pub fn new(bridge: NotificationBridge) -> Self {
        Self {
            bridge,
            policy: DependencyPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: DependencyPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Enqueue a job that is ready to run.
    pub async fn enqueue(&self, kind: JobKind, payload: Value) -> Result<JobId, QueueError> {
        self.submit(EnqueueRequest::now(kind, payload)).await
    }

    /// Enqueue a job that becomes ready once the broker's clock passes `at`.
    pub async fn enqueue_at(
        &self,
        at: DateTime<Utc>,
        kind: JobKind,
        payload: Value,
    ) -> Result<JobId, QueueError> {
        self.submit(EnqueueRequest::at(at, kind, payload)).await
    }

    /// Enqueue a job held until `depends_on` is terminal.
    pub async fn enqueue_call(
        &self,
        kind: JobKind,
        payload: Value,
        depends_on: JobId,
    ) -> Result<JobId, QueueError> {
        self.submit(EnqueueRequest::after(depends_on, kind, payload)).await
    }

    /// Schedule the next occurrence of a recurring job after `now`.
    pub async fn enqueue_recurring(
        &self,
        kind: JobKind,
        payload: Value,
        recurrence: Recurrence,
        now: DateTime<Utc>,
    ) -> Result<JobId, QueueError> {
        kind.validate(&payload)?;
        let fire_at = recurrence.next_after(now)?;
        let job = Job::new(kind, payload)
            .scheduled_for(fire_at)
            .with_recurrence(recurrence);
        self.insert(job).await
    }

    /// Validate and persist a request.
    pub async fn submit(&self, request: EnqueueRequest) -> Result<JobId, QueueError> {
        let job = request.into_job()?;
        self.insert(job).await
    }

    async fn insert(&self, job: Job) -> Result<JobId, QueueError> {
        let job = JobRepository::create(&job).await?;

        match job.state {
            JobState::Scheduled => {
                let fire_at = job.scheduled_at.unwrap_or_else(Utc::now);
                let entry = ScheduledEntry {
                    job_id: job.id,
                    fire_at,
                };
                if let Err(e) = ScheduleRepository::insert(&entry).await {
                    // Without its entry the job would never be promoted.
                    if let Err(cleanup) = JobRepository::delete(job.id).await {
                        tracing::warn!("Failed to remove unscheduled job {}: {}", job.id, cleanup);
                    }
                    return Err(e.into());
                }
                tracing::debug!("Job {} ({}) scheduled for {}", job.id, job.kind, fire_at);
            }
            JobState::Held => {
                // The dependency may have finished before the insert landed.
                self.settle(&job).await?;
            }
            _ => tracing::debug!("Job {} ({}) enqueued", job.id, job.kind),
        }

        self.bridge
            .publish_event(&JobEvent::JobEnqueued {
                job: job.view(),
                timestamp: Utc::now(),
            })
            .await?;

        Ok(job.id)
    }

    /// Promote scheduled jobs whose fire time has passed on the broker clock.
    pub async fn promote_due(&self) -> Result<usize, QueueError> {
        let due = ScheduleRepository::due(PROMOTE_BATCH).await?;
        let mut promoted = 0;

        for entry in due {
            // Only the caller that removes the entry may promote the job.
            if ScheduleRepository::take(entry.job_id).await?.is_none() {
                continue;
            }

            match self.promote(entry.job_id).await {
                Ok(true) => promoted += 1,
                Ok(false) => {}
                Err(e) => {
                    if let Err(restore) = ScheduleRepository::insert(&entry).await {
                        tracing::warn!("Failed to restore entry for {}: {}", entry.job_id, restore);
                    }
                    return Err(e);
                }
            }
        }

        if promoted > 0 {
            tracing::debug!("Promoted {} scheduled job(s)", promoted);
        }

        Ok(promoted)
    }

    async fn promote(&self, job_id: JobId) -> Result<bool, QueueError> {
        let Some(job) = JobRepository::find(job_id).await? else {
            tracing::warn!("Scheduled entry for missing job {}", job_id);
            return Ok(false);
        };

        let target = if job.depends_on.is_some() {
            JobState::Held
        } else {
            JobState::Ready
        };

        match JobRepository::compare_and_set(job_id, JobState::Scheduled, StateChange::to(target))
            .await?
        {
            Some(promoted) => {
                if target == JobState::Held {
                    self.settle(&promoted).await?;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Re-evaluate every held job against its dependency.
    pub async fn release_held(&self) -> Result<usize, QueueError> {
        let mut released = 0;
        for job in JobRepository::held().await? {
            if self.settle(&job).await?.is_some() {
                released += 1;
            }
        }
        Ok(released)
    }

    /// Resolve one held job and cascade to its own dependents if it failed.
    async fn settle(&self, job: &Job) -> Result<Option<JobState>, QueueError> {
        let settled = self.resolve_held(job).await?;
        if settled == Some(JobState::Failed) {
            self.release_dependents(job.id).await?;
        }
        Ok(settled)
    }

    async fn resolve_held(&self, job: &Job) -> Result<Option<JobState>, QueueError> {
        let dependency_state = match job.depends_on {
            Some(dependency) => JobRepository::state_of(dependency).await?,
            None => None,
        };

        let Some(next) = self.policy.resolve(dependency_state) else {
            return Ok(None);
        };

        let change = match next {
            JobState::Failed => StateChange::fail(
                format!(
                    "dependency {} failed",
                    job.depends_on.map(|id| id.to_string()).unwrap_or_default()
                ),
                Utc::now(),
            ),
            other => StateChange::to(other),
        };

        let Some(moved) = JobRepository::compare_and_set(job.id, JobState::Held, change).await?
        else {
            return Ok(None);
        };

        if moved.state == JobState::Failed {
            self.bridge
                .publish_event(&JobEvent::JobFailed {
                    job_id: moved.id,
                    kind: moved.kind,
                    error: moved.error.clone().unwrap_or_default(),
                    timestamp: Utc::now(),
                })
                .await?;
        }
        tracing::debug!("Held job {} released as {}", moved.id, moved.state);

        Ok(Some(moved.state))
    }

    /// Release the jobs held on `dependency`, following failures down the
    /// chain when the policy aborts dependents.
    async fn release_dependents(&self, dependency: JobId) -> Result<usize, QueueError> {
        let mut pending = vec![dependency];
        let mut released = 0;

        while let Some(dependency) = pending.pop() {
            for job in JobRepository::held_on(dependency).await? {
                if let Some(state) = self.resolve_held(&job).await? {
                    released += 1;
                    if state == JobState::Failed {
                        pending.push(job.id);
                    }
                }
            }
        }

        Ok(released)
    }

    /// Claim up to `limit` ready jobs for `worker_id`, oldest first.
    ///
    /// A job claimed by another worker in the meantime is skipped. If a start
    /// event cannot be published the error is returned; jobs claimed by then
    /// stay running under `worker_id` and are failed by
    /// [`fail_orphans`](Self::fail_orphans).
    pub async fn claim_ready(
        &self,
        worker_id: &str,
        limit: usize,
    ) -> Result<Vec<Job>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut claimed = Vec::new();
        for candidate in JobRepository::ready(limit).await? {
            let change = StateChange::claim(worker_id, Utc::now());
            let Some(job) =
                JobRepository::compare_and_set(candidate.id, JobState::Ready, change).await?
            else {
                continue;
            };

            self.bridge
                .publish_event(&JobEvent::JobStarted {
                    job_id: job.id,
                    kind: job.kind,
                    worker_id: worker_id.to_string(),
                    timestamp: Utc::now(),
                })
                .await?;
            claimed.push(job);
        }

        Ok(claimed)
    }

    /// Record the outcome of a running job.
    ///
    /// The state change is committed first. Publishing the lifecycle event,
    /// releasing dependents and, for recurring jobs, installing the next
    /// occurrence follow; if one of them fails its error is returned and the
    /// sweeps pick up the dependents and the next occurrence.
    pub async fn finish(&self, job_id: JobId, outcome: JobOutcome) -> Result<Job, QueueError> {
        let now = Utc::now();
        let (change, target) = match outcome {
            JobOutcome::Completed(result) => {
                (StateChange::complete(result, now), JobState::Completed)
            }
            JobOutcome::Failed(error) => (StateChange::fail(error, now), JobState::Failed),
        };

        let Some(job) = JobRepository::compare_and_set(job_id, JobState::Running, change).await?
        else {
            return Err(match JobRepository::state_of(job_id).await? {
                Some(from) => TransitionError {
                    job_id: job_id.to_string(),
                    from,
                    to: target,
                }
                .into(),
                None => BrokerError::NotFound(format!("Job not found: {}", job_id)).into(),
            });
        };

        self.conclude(&job).await?;
        Ok(job)
    }

    /// Follow-up work for a job that just reached a terminal state.
    async fn conclude(&self, job: &Job) -> Result<(), QueueError> {
        let event = match job.state {
            JobState::Completed => {
                let duration_ms = match (job.started_at, job.finished_at) {
                    (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
                    _ => 0,
                };
                tracing::info!("Job {} ({}) completed in {}ms", job.id, job.kind, duration_ms);
                JobEvent::JobCompleted {
                    job_id: job.id,
                    kind: job.kind,
                    duration_ms,
                    timestamp: Utc::now(),
                }
            }
            _ => {
                let error = job.error.clone().unwrap_or_default();
                tracing::warn!("Job {} ({}) failed: {}", job.id, job.kind, error);
                JobEvent::JobFailed {
                    job_id: job.id,
                    kind: job.kind,
                    error,
                    timestamp: Utc::now(),
                }
            }
        };

        let published = self.bridge.publish_event(&event).await;
        let released = self.release_dependents(job.id).await;
        let installed = self.install_next(job).await;

        published?;
        released?;
        if let Some(next) = installed? {
            tracing::info!("Recurring {} re-installed as job {}", job.kind, next);
        }
        Ok(())
    }

    /// Install the next occurrence of a finished recurring job, unless
    /// someone already did.
    async fn install_next(&self, job: &Job) -> Result<Option<JobId>, QueueError> {
        let Some(recurrence) = &job.recurrence else {
            return Ok(None);
        };

        let fire_at = recurrence.next_after(Utc::now())?;
        let next = Job::new(job.kind, job.payload.clone())
            .scheduled_for(fire_at)
            .with_recurrence(recurrence.clone());

        if !JobRepository::install_successor(job.id, &next, fire_at).await? {
            return Ok(None);
        }

        self.bridge
            .publish_event(&JobEvent::JobEnqueued {
                job: next.view(),
                timestamp: Utc::now(),
            })
            .await?;

        Ok(Some(next.id))
    }

    /// Install the next occurrence of every finished recurring job that
    /// lacks one. Returns how many were installed.
    pub async fn reinstall_recurring(&self) -> Result<usize, QueueError> {
        let mut installed = 0;
        for job in JobRepository::awaiting_successor().await? {
            match self.install_next(&job).await {
                Ok(Some(next)) => {
                    tracing::info!("Recurring {} re-installed as job {}", job.kind, next);
                    installed += 1;
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("Failed to re-install after job {}: {}", job.id, e),
            }
        }
        Ok(installed)
    }

    /// Fail a running job whose worker is gone. Returns `false` if the job
    /// had already left `running`.
    async fn interrupt(&self, job: &Job) -> Result<bool, QueueError> {
        let change = StateChange::fail(INTERRUPTED, Utc::now());
        let Some(failed) = JobRepository::compare_and_set(job.id, JobState::Running, change).await?
        else {
            return Ok(false);
        };

        tracing::warn!(
            "Job {} ({}) interrupted on {}",
            failed.id,
            failed.kind,
            failed.worker_id.as_deref().unwrap_or("unknown worker")
        );
        self.conclude(&failed).await?;
        Ok(true)
    }

    async fn interrupt_all(&self, jobs: Vec<Job>) -> Result<Vec<JobId>, QueueError> {
        let mut failed = Vec::new();
        for job in jobs {
            if self.interrupt(&job).await? {
                failed.push(job.id);
            }
        }
        Ok(failed)
    }

    /// Fail every job `worker_id` still has running. Used when that worker
    /// stops or restarts.
    pub async fn fail_interrupted(&self, worker_id: &str) -> Result<Vec<JobId>, QueueError> {
        let running = JobRepository::running_for(worker_id).await?;
        self.interrupt_all(running).await
    }

    /// Fail jobs running under `worker_id` that are not in `owned`: claims
    /// the worker lost track of.
    pub async fn fail_orphans(
        &self,
        worker_id: &str,
        owned: &HashSet<JobId>,
    ) -> Result<Vec<JobId>, QueueError> {
        let orphans = JobRepository::running_for(worker_id)
            .await?
            .into_iter()
            .filter(|job| !owned.contains(&job.id))
            .collect();
        self.interrupt_all(orphans).await
    }

    /// Renew the liveness lease of `worker_id`.
    pub async fn heartbeat(&self, worker_id: &str) -> Result<(), QueueError> {
        Ok(WorkerRepository::heartbeat(worker_id).await?)
    }

    /// Give up the lease of `worker_id`.
    pub async fn retire(&self, worker_id: &str) -> Result<(), QueueError> {
        Ok(WorkerRepository::retire(worker_id).await?)
    }

    /// Fail running jobs whose worker has not renewed its lease for `lease`.
    pub async fn reap_abandoned(&self, lease: Duration) -> Result<Vec<JobId>, QueueError> {
        let abandoned = JobRepository::abandoned(lease.as_millis() as i64).await?;
        let failed = self.interrupt_all(abandoned).await?;
        if !failed.is_empty() {
            tracing::warn!("Failed {} job(s) left by vanished workers", failed.len());
        }
        Ok(failed)
    }

    /// Remove a scheduled job before it fires. Returns whether this call
    /// removed it.
    pub async fn cancel_scheduled(&self, job_id: JobId) -> Result<bool, QueueError> {
        if ScheduleRepository::take(job_id).await?.is_none() {
            return Ok(false);
        }
        JobRepository::delete(job_id).await?;
        tracing::info!("Cancelled scheduled job {}", job_id);
        Ok(true)
    }

    /// Remove every scheduled job. Returns how many were removed.
    pub async fn clear_scheduled(&self) -> Result<usize, QueueError> {
        let removed = ScheduleRepository::clear().await?;
        for entry in &removed {
            JobRepository::delete(entry.job_id).await?;
        }
        if !removed.is_empty() {
            tracing::info!("Cleared {} scheduled job(s)", removed.len());
        }
        Ok(removed.len())
    }

    /// Stop finished recurring jobs from waiting on a next occurrence.
    pub async fn retire_recurrences(&self) -> Result<usize, QueueError> {
        Ok(JobRepository::retire_recurrences().await?)
    }

    /// Scheduled entries, earliest first.
    pub async fn scheduled(&self) -> Result<Vec<ScheduledEntry>, QueueError> {
        Ok(ScheduleRepository::list().await?)
    }

    pub async fn get(&self, job_id: JobId) -> Result<Job, QueueError> {
        Ok(JobRepository::get(job_id).await?)
    }

    pub async fn find(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(JobRepository::find(job_id).await?)
    }

    pub async fn list(&self, filter: JobFilter) -> Result<Vec<Job>, QueueError> {
        Ok(JobRepository::list(filter).await?)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let counts: HashMap<JobState, u64> = JobRepository::count_by_state().await?;
        let count = |state: JobState| counts.get(&state).copied().unwrap_or(0);

        Ok(QueueStats {
            held: count(JobState::Held),
            scheduled: count(JobState::Scheduled),
            ready: count(JobState::Ready),
            running: count(JobState::Running),
            completed: count(JobState::Completed),
            failed: count(JobState::Failed),
        })
    }
}
