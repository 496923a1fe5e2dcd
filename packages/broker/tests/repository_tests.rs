mod common;

use std::error::Error;

use chrono::{Duration, Utc};
use job_core::{Job, JobId, JobKind, JobState, Recurrence, ScheduledEntry};
use serde_json::json;
use tokio::task::JoinSet;

use broker::BrokerError;
use broker::repositories::{
    EventRepository, JobFilter, JobRepository, LockRepository, ScheduleRepository, StateChange,
    WorkerRepository,
};

#[tokio::test]
async fn job_record_round_trips_through_the_broker() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_broker().await?;

    let dependency = Job::new(JobKind::RefreshActiveChannels, json!({}));
    let recurrence = Recurrence::new("0 1 * * *", -5 * 3600)?;
    let job = Job::new(JobKind::RefreshSubscriptions, json!({"email": "a@b.c"}))
        .depending_on(dependency.id)
        .with_recurrence(recurrence.clone());

    let created = JobRepository::create(&job).await?;
    assert_eq!(created.id, job.id);
    assert_eq!(created.state, JobState::Held);

    let loaded = JobRepository::get(job.id).await?;
    assert_eq!(loaded.kind, JobKind::RefreshSubscriptions);
    assert_eq!(loaded.payload, json!({"email": "a@b.c"}));
    assert_eq!(loaded.depends_on, Some(dependency.id));
    assert_eq!(loaded.recurrence, Some(recurrence));
    assert_eq!(
        loaded.created_at.timestamp_millis(),
        job.created_at.timestamp_millis()
    );
    assert!(loaded.started_at.is_none());

    JobRepository::delete(job.id).await?;
    assert!(JobRepository::find(job.id).await?.is_none());
    assert!(matches!(
        JobRepository::get(job.id).await,
        Err(BrokerError::NotFound(_))
    ));
    assert!(JobRepository::state_of(job.id).await?.is_none());

    Ok(())
}

#[tokio::test]
async fn ready_jobs_come_back_in_enqueue_order() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_broker().await?;

    let mut ids = Vec::new();
    for _ in 0..5 {
        let job = Job::new(JobKind::CleanupJobs, json!({}));
        ids.push(job.id);
        JobRepository::create(&job).await?;
    }
    let held = Job::new(JobKind::ChannelCleanup, json!({})).depending_on(ids[0]);
    JobRepository::create(&held).await?;

    let ready: Vec<JobId> = JobRepository::ready(10).await?.iter().map(|j| j.id).collect();
    assert_eq!(ready, ids);

    let first_two = JobRepository::ready(2).await?;
    assert_eq!(first_two.len(), 2);
    assert_eq!(first_two[0].id, ids[0]);

    let newest = JobRepository::list(JobFilter {
        newest_first: true,
        limit: Some(1),
        ..Default::default()
    })
    .await?;
    assert_eq!(newest[0].id, held.id);

    let by_kind = JobRepository::list(JobFilter {
        kind: Some(JobKind::ChannelCleanup),
        ..Default::default()
    })
    .await?;
    assert_eq!(by_kind.len(), 1);

    let waiting = JobRepository::held_on(ids[0]).await?;
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].id, held.id);
    assert!(JobRepository::held_on(ids[1]).await?.is_empty());

    let counts = JobRepository::count_by_state().await?;
    assert_eq!(counts.get(&JobState::Ready), Some(&5));
    assert_eq!(counts.get(&JobState::Held), Some(&1));

    Ok(())
}

#[tokio::test]
async fn compare_and_set_walks_the_state_machine() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_broker().await?;

    let job = Job::new(JobKind::MusicDownload, json!({"job_id": "m-1"}));
    JobRepository::create(&job).await?;

    let started = Utc::now();
    let running = JobRepository::compare_and_set(
        job.id,
        JobState::Ready,
        StateChange::claim("worker-a", started),
    )
    .await?
    .ok_or("claim lost")?;
    assert_eq!(running.state, JobState::Running);
    assert_eq!(running.worker_id.as_deref(), Some("worker-a"));
    assert_eq!(
        running.started_at.map(|t| t.timestamp_millis()),
        Some(started.timestamp_millis())
    );

    // Stale expectation does nothing.
    let again = JobRepository::compare_and_set(
        job.id,
        JobState::Ready,
        StateChange::claim("worker-b", Utc::now()),
    )
    .await?;
    assert!(again.is_none());

    let done = JobRepository::compare_and_set(
        job.id,
        JobState::Running,
        StateChange::complete(Some(json!({"files": 3})), Utc::now()),
    )
    .await?
    .ok_or("finish lost")?;
    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.result, Some(json!({"files": 3})));
    assert_eq!(done.worker_id.as_deref(), Some("worker-a"));
    assert!(done.started_at <= done.finished_at);

    let illegal = JobRepository::compare_and_set(
        job.id,
        JobState::Completed,
        StateChange::to(JobState::Ready),
    )
    .await;
    assert!(illegal.is_err());

    Ok(())
}

#[tokio::test]
async fn concurrent_claims_have_exactly_one_winner() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_broker().await?;

    let job = Job::new(JobKind::CleanupJobs, json!({}));
    JobRepository::create(&job).await?;

    let mut claims = JoinSet::new();
    for worker in 0..8 {
        let id = job.id;
        claims.spawn(async move {
            JobRepository::compare_and_set(
                id,
                JobState::Ready,
                StateChange::claim(format!("worker-{worker}"), Utc::now()),
            )
            .await
        });
    }

    let mut winners = 0;
    while let Some(claim) = claims.join_next().await {
        if claim??.is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    Ok(())
}

async fn claim(job: &Job, worker: &str) -> Result<Job, Box<dyn Error>> {
    JobRepository::create(job).await?;
    let change = StateChange::claim(worker, Utc::now());
    let claimed = JobRepository::compare_and_set(job.id, JobState::Ready, change)
        .await?
        .ok_or("claim lost")?;
    Ok(claimed)
}

#[tokio::test]
async fn running_jobs_never_go_back_to_ready() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_broker().await?;

    let job = Job::new(JobKind::CleanupJobs, json!({}));
    claim(&job, "worker-a").await?;

    let back =
        JobRepository::compare_and_set(job.id, JobState::Running, StateChange::to(JobState::Ready))
            .await;
    assert!(back.is_err());
    assert_eq!(JobRepository::state_of(job.id).await?, Some(JobState::Running));

    Ok(())
}

#[tokio::test]
async fn lapsed_leases_mark_running_jobs_abandoned() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_broker().await?;

    let live = Job::new(JobKind::CleanupJobs, json!({}));
    let orphan = Job::new(JobKind::CleanupJobs, json!({}));
    claim(&live, "worker-live").await?;
    claim(&orphan, "worker-gone").await?;

    WorkerRepository::heartbeat("worker-live").await?;
    assert!(WorkerRepository::last_seen("worker-live").await?.is_some());
    assert!(WorkerRepository::last_seen("worker-gone").await?.is_none());

    let running = JobRepository::running_for("worker-live").await?;
    assert_eq!(running.iter().map(|job| job.id).collect::<Vec<_>>(), vec![live.id]);

    let abandoned = JobRepository::abandoned(30_000).await?;
    assert_eq!(abandoned.iter().map(|job| job.id).collect::<Vec<_>>(), vec![orphan.id]);

    WorkerRepository::retire("worker-live").await?;
    let abandoned = JobRepository::abandoned(30_000).await?;
    assert_eq!(abandoned.len(), 2);

    Ok(())
}

#[tokio::test]
async fn successor_is_installed_once() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_broker().await?;

    let recurrence = Recurrence::new("0 0 * * *", 0)?;
    let job = Job::new(JobKind::CleanupJobs, json!({})).with_recurrence(recurrence.clone());
    let running = claim(&job, "worker-a").await?;
    let change = StateChange::complete(None, Utc::now());
    JobRepository::compare_and_set(running.id, JobState::Running, change)
        .await?
        .ok_or("finish lost")?;
    assert_eq!(JobRepository::awaiting_successor().await?.len(), 1);

    let fire_at = recurrence.next_after(Utc::now())?;
    let previous = job.id;
    let mut installers = JoinSet::new();
    for _ in 0..4 {
        let next = Job::new(JobKind::CleanupJobs, json!({}))
            .scheduled_for(fire_at)
            .with_recurrence(recurrence.clone());
        installers.spawn(async move {
            JobRepository::install_successor(previous, &next, fire_at)
                .await
                .map(|installed| installed.then_some(next.id))
        });
    }

    let mut installed = Vec::new();
    while let Some(outcome) = installers.join_next().await {
        if let Some(id) = outcome?? {
            installed.push(id);
        }
    }
    assert_eq!(installed.len(), 1);

    let previous = JobRepository::get(job.id).await?;
    assert_eq!(previous.successor, Some(installed[0]));
    assert!(JobRepository::awaiting_successor().await?.is_empty());

    let entries = ScheduleRepository::list().await?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].job_id, installed[0]);
    assert_eq!(JobRepository::get(installed[0]).await?.state, JobState::Scheduled);

    Ok(())
}

#[tokio::test]
async fn retired_recurrences_stop_waiting_for_a_successor() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_broker().await?;

    let job = Job::new(JobKind::ChannelCleanup, json!({}))
        .with_recurrence(Recurrence::new("0 5 * * 0", 0)?);
    claim(&job, "worker-a").await?;
    let change = StateChange::fail("boom", Utc::now());
    JobRepository::compare_and_set(job.id, JobState::Running, change)
        .await?
        .ok_or("finish lost")?;

    assert_eq!(JobRepository::retire_recurrences().await?, 1);
    assert!(JobRepository::awaiting_successor().await?.is_empty());
    assert!(JobRepository::get(job.id).await?.recurrence.is_none());

    Ok(())
}

#[tokio::test]
async fn event_feed_sees_events_published_after_it_opened() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_broker().await?;

    EventRepository::publish("WORK_CHANNEL", &json!({"before": true})).await?;
    let mut feed = EventRepository::listen().await?;

    for n in 0..3 {
        EventRepository::publish("WORK_CHANNEL", &json!({"n": n})).await?;
    }
    for n in 0..3 {
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), feed.next())
            .await?
            .ok_or("feed closed")??;
        assert_eq!(event.channel, "WORK_CHANNEL");
        assert_eq!(event.message, json!({"n": n}));
    }

    assert_eq!(EventRepository::prune(std::time::Duration::from_secs(3600)).await?, 0);

    Ok(())
}

#[tokio::test]
async fn due_entries_are_taken_once() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_broker().await?;

    let past = ScheduledEntry {
        job_id: JobId::new(),
        fire_at: Utc::now() - Duration::seconds(30),
    };
    let later = ScheduledEntry {
        job_id: JobId::new(),
        fire_at: Utc::now() + Duration::hours(2),
    };
    ScheduleRepository::insert(&later).await?;
    ScheduleRepository::insert(&past).await?;

    let listed = ScheduleRepository::list().await?;
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].job_id, past.job_id);
    assert_eq!(ScheduleRepository::count().await?, 2);

    let due = ScheduleRepository::due(10).await?;
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].job_id, past.job_id);

    let mut takers = JoinSet::new();
    for _ in 0..4 {
        let id = past.job_id;
        takers.spawn(async move { ScheduleRepository::take(id).await });
    }
    let mut taken = 0;
    while let Some(result) = takers.join_next().await {
        if result??.is_some() {
            taken += 1;
        }
    }
    assert_eq!(taken, 1);
    assert!(ScheduleRepository::get(past.job_id).await?.is_none());

    let cleared = ScheduleRepository::clear().await?;
    assert_eq!(cleared.len(), 1);
    assert_eq!(ScheduleRepository::count().await?, 0);

    Ok(())
}

#[tokio::test]
async fn lock_has_a_single_owner() -> Result<(), Box<dyn Error>> {
    let _guard = common::setup_broker().await?;

    let mut contenders = JoinSet::new();
    for worker in 0..6 {
        contenders.spawn(async move {
            let owner = format!("worker-{worker}");
            LockRepository::try_acquire("crons_added", &owner)
                .await
                .map(|acquired| (owner, acquired))
        });
    }

    let mut owners = Vec::new();
    while let Some(result) = contenders.join_next().await {
        let (owner, acquired) = result??;
        if acquired {
            owners.push(owner);
        }
    }
    assert_eq!(owners.len(), 1);
    let owner = owners.remove(0);

    let holder = LockRepository::holder("crons_added").await?.ok_or("no holder")?;
    assert_eq!(holder.owner, owner);

    assert!(!LockRepository::release("crons_added", "someone-else").await?);
    assert!(LockRepository::holder("crons_added").await?.is_some());

    assert!(LockRepository::release("crons_added", &owner).await?);
    assert!(LockRepository::holder("crons_added").await?.is_none());
    assert!(LockRepository::try_acquire("crons_added", "worker-x").await?);

    Ok(())
}
