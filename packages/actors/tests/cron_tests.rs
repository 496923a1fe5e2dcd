mod common;

use std::error::Error;

use actors::{BootstrapOutcome, CRON_LOCK_KEY, CronScheduler, JobQueue, default_catalogue};
use bridge::NotificationBridge;
use broker::repositories::{JobRepository, LockRepository, ScheduleRepository, StateChange};
use chrono::{Duration, Utc};
use job_core::{DEFAULT_CRON_OFFSET_SECS, Job, JobKind, JobState, Recurrence};
use serde_json::json;

async fn scheduler(owner: &str) -> Result<CronScheduler, Box<dyn Error>> {
    let queue = JobQueue::new(NotificationBridge::connect().await?);
    Ok(CronScheduler::new(
        queue,
        default_catalogue(DEFAULT_CRON_OFFSET_SECS)?,
        owner,
    ))
}

#[test]
fn concurrent_bootstraps_install_the_catalogue_once() -> Result<(), Box<dyn Error>> {
    common::run(async move {
    let _guard = common::setup_broker().await?;

    let mut tasks = tokio::task::JoinSet::new();
    for n in 0..5 {
        let scheduler = scheduler(&format!("process-{n}")).await?;
        tasks.spawn(async move { scheduler.bootstrap().await });
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        outcomes.push(joined??);
    }

    let installed: Vec<_> = outcomes
        .iter()
        .filter(|o| matches!(o, BootstrapOutcome::Installed(_)))
        .collect();
    assert_eq!(installed, vec![&BootstrapOutcome::Installed(5)]);
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == BootstrapOutcome::AlreadyOwned)
            .count(),
        4
    );

    assert_eq!(ScheduleRepository::count().await?, 5);
    let holder = LockRepository::holder(CRON_LOCK_KEY).await?.ok_or("no lock holder")?;
    assert!(holder.owner.starts_with("process-"));

    let now = Utc::now();
    for entry in ScheduleRepository::list().await? {
        assert!(entry.fire_at > now);
        let job = JobRepository::get(entry.job_id).await?;
        assert_eq!(job.state, JobState::Scheduled);
        assert!(job.recurrence.is_some());
    }

    Ok(())
    })
}

#[test]
fn bootstrap_replaces_stale_schedule_entries() -> Result<(), Box<dyn Error>> {
    common::run(async move {
    let _guard = common::setup_broker().await?;
    let queue = JobQueue::new(NotificationBridge::connect().await?);

    let stale = queue
        .enqueue_at(Utc::now() + Duration::days(2), JobKind::ChannelCleanup, json!({}))
        .await?;

    let outcome = scheduler("fresh-owner").await?.bootstrap().await?;
    assert_eq!(outcome, BootstrapOutcome::Installed(5));

    let entries = ScheduleRepository::list().await?;
    assert_eq!(entries.len(), 5);
    assert!(entries.iter().all(|entry| entry.job_id != stale));

    Ok(())
    })
}

#[test]
fn bootstrap_retires_chains_of_a_previous_install() -> Result<(), Box<dyn Error>> {
    common::run(async move {
    let _guard = common::setup_broker().await?;
    let queue = JobQueue::new(NotificationBridge::connect().await?);

    // A previous owner's recurring job finished without a successor.
    let recurrence = Recurrence::new("0 0 * * *", DEFAULT_CRON_OFFSET_SECS)?;
    let old = Job::new(JobKind::CleanupJobs, json!({})).with_recurrence(recurrence);
    JobRepository::create(&old).await?;
    queue.claim_ready("old-owner", 1).await?;
    let change = StateChange::complete(None, Utc::now());
    JobRepository::compare_and_set(old.id, JobState::Running, change).await?;

    let outcome = scheduler("new-owner").await?.bootstrap().await?;
    assert_eq!(outcome, BootstrapOutcome::Installed(5));

    assert_eq!(queue.reinstall_recurring().await?, 0);
    assert_eq!(ScheduleRepository::count().await?, 5);
    assert!(JobRepository::get(old.id).await?.recurrence.is_none());

    Ok(())
    })
}

#[test]
fn only_the_owner_releases_the_lock() -> Result<(), Box<dyn Error>> {
    common::run(async move {
    let _guard = common::setup_broker().await?;

    let owner = scheduler("owner").await?;
    let bystander = scheduler("bystander").await?;

    assert_eq!(owner.bootstrap().await?, BootstrapOutcome::Installed(5));
    assert_eq!(bystander.bootstrap().await?, BootstrapOutcome::AlreadyOwned);

    assert!(!bystander.shutdown().await?);
    assert!(LockRepository::holder(CRON_LOCK_KEY).await?.is_some());

    assert!(owner.shutdown().await?);
    assert!(LockRepository::holder(CRON_LOCK_KEY).await?.is_none());
    // Installed entries outlive the owner.
    assert_eq!(ScheduleRepository::count().await?, 5);

    // The next owner starts from a clean slate.
    assert_eq!(bystander.bootstrap().await?, BootstrapOutcome::Installed(5));
    assert_eq!(ScheduleRepository::count().await?, 5);

    Ok(())
    })
}

#[test]
fn refresh_chain_links_each_step_to_the_previous() -> Result<(), Box<dyn Error>> {
    common::run(async move {
    let _guard = common::setup_broker().await?;

    let chain = scheduler("chain").await?.run_refresh_chain().await?;
    assert_eq!(chain.len(), 5);

    let first = JobRepository::get(chain[0]).await?;
    assert_eq!(first.kind, JobKind::RefreshVideoCategories);
    assert_eq!(first.state, JobState::Ready);
    assert_eq!(first.payload, json!({ "force": false }));

    let kinds = [
        JobKind::RefreshActiveChannels,
        JobKind::RefreshSubscriptions,
        JobKind::ChannelCleanup,
        JobKind::CleanupJobs,
    ];
    for (pair, kind) in chain.windows(2).zip(kinds) {
        let job = JobRepository::get(pair[1]).await?;
        assert_eq!(job.kind, kind);
        assert_eq!(job.state, JobState::Held);
        assert_eq!(job.depends_on, Some(pair[0]));
    }

    Ok(())
    })
}
