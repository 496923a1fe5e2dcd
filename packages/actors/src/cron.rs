//! Singleton installer of the recurring-job catalogue.
//!
//! Ownership is a broker lock record created with create-if-absent, so of
//! any number of processes starting together exactly one installs the
//! catalogue. Installed jobs carry their [`Recurrence`](job_core::Recurrence)
//! and the queue re-installs the next occurrence whenever one finishes.

use broker::repositories::LockRepository;
use chrono::Utc;
use job_core::{CronDefinition, JobId, JobKind, ValidationError};
use serde_json::{Value, json};

use crate::queue::{JobQueue, QueueError};

/// Broker key of the scheduling lock.
pub const CRON_LOCK_KEY: &str = "crons_added";

/// Result of [`CronScheduler::bootstrap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// This process took the lock and installed this many entries.
    Installed(usize),
    /// Another process owns scheduling.
    AlreadyOwned,
}

pub struct CronScheduler {
    queue: JobQueue,
    catalogue: Vec<CronDefinition>,
    owner: String,
}

impl CronScheduler {
    pub fn new(queue: JobQueue, catalogue: Vec<CronDefinition>, owner: impl Into<String>) -> Self {
        Self {
            queue,
            catalogue,
            owner: owner.into(),
        }
    }

    /// Take the scheduling lock and install the catalogue, or do nothing if
    /// another process holds the lock.
    pub async fn bootstrap(&self) -> Result<BootstrapOutcome, QueueError> {
        if !LockRepository::try_acquire(CRON_LOCK_KEY, &self.owner).await? {
            tracing::info!("Cron catalogue already owned, skipping install");
            return Ok(BootstrapOutcome::AlreadyOwned);
        }

        match self.install().await {
            Ok(installed) => {
                tracing::info!("Installed {} cron job(s) as {}", installed, self.owner);
                Ok(BootstrapOutcome::Installed(installed))
            }
            Err(e) => {
                if let Err(release) = LockRepository::release(CRON_LOCK_KEY, &self.owner).await {
                    tracing::warn!("Failed to release cron lock after error: {}", release);
                }
                Err(e)
            }
        }
    }

    async fn install(&self) -> Result<usize, QueueError> {
        // A previous owner may have crashed and left entries behind. Its
        // finished recurring jobs must not grow a second chain.
        let retired = self.queue.retire_recurrences().await?;
        if retired > 0 {
            tracing::info!("Retired {} recurrence(s) of a previous install", retired);
        }
        let stale = self.queue.clear_scheduled().await?;
        if stale > 0 {
            tracing::info!("Removed {} stale scheduled job(s)", stale);
        }

        let now = Utc::now();
        for definition in &self.catalogue {
            let job_id = self
                .queue
                .enqueue_recurring(
                    definition.kind,
                    definition.payload.clone(),
                    definition.recurrence.clone(),
                    now,
                )
                .await?;
            tracing::debug!(
                "Scheduled {} ({}) as job {}",
                definition.kind,
                definition.expression(),
                job_id
            );
        }

        Ok(self.catalogue.len())
    }

    /// Release the lock if this process holds it. Scheduled entries stay.
    pub async fn shutdown(&self) -> Result<bool, QueueError> {
        let released = LockRepository::release(CRON_LOCK_KEY, &self.owner).await?;
        if released {
            tracing::info!("Released cron lock held by {}", self.owner);
        }
        Ok(released)
    }

    /// Enqueue the full refresh sequence as one dependency chain: categories,
    /// active channels, subscriptions, channel cleanup, job cleanup.
    pub async fn run_refresh_chain(&self) -> Result<Vec<JobId>, QueueError> {
        let steps: [(JobKind, Value); 5] = [
            (JobKind::RefreshVideoCategories, json!({ "force": false })),
            (JobKind::RefreshActiveChannels, json!({})),
            (JobKind::RefreshSubscriptions, json!({ "email": null })),
            (JobKind::ChannelCleanup, json!({})),
            (JobKind::CleanupJobs, json!({})),
        ];

        let mut chain: Vec<JobId> = Vec::with_capacity(steps.len());
        for (kind, payload) in steps {
            let job_id = match chain.last() {
                Some(&previous) => self.queue.enqueue_call(kind, payload, previous).await?,
                None => self.queue.enqueue(kind, payload).await?,
            };
            chain.push(job_id);
        }

        tracing::info!("Enqueued refresh chain of {} jobs", chain.len());
        Ok(chain)
    }
}

/// The production catalogue, evaluated at `offset_secs` from UTC.
pub fn default_catalogue(offset_secs: i32) -> Result<Vec<CronDefinition>, ValidationError> {
    Ok(vec![
        CronDefinition::new(
            "0 0 * * *",
            JobKind::RefreshVideoCategories,
            json!({ "force": true }),
            offset_secs,
        )?,
        CronDefinition::new("0 0 * * *", JobKind::CleanupJobs, json!({}), offset_secs)?,
        CronDefinition::new("0 1 * * *", JobKind::RefreshActiveChannels, json!({}), offset_secs)?,
        CronDefinition::new("0 3 * * *", JobKind::RefreshSubscriptions, json!({}), offset_secs)?,
        CronDefinition::new("0 5 * * Sun", JobKind::ChannelCleanup, json!({}), offset_secs)?,
    ])
}
