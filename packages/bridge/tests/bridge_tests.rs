mod common;

use std::convert::Infallible;
use std::error::Error;
use std::time::Duration;

use bridge::{NotificationBridge, ServerMessage, SessionConfig, SessionEnd, SessionError};
use chrono::Utc;
use job_core::{Channel, JobEvent, JobId, JobKind, JobStatus, JobView};
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

fn sample_view() -> JobView {
    JobView {
        id: JobId::new(),
        kind: JobKind::MusicDownload,
        status: JobStatus::Running,
        created_at: Utc::now(),
        started_at: Some(Utc::now()),
        finished_at: None,
        error: None,
    }
}

fn slow_heartbeat() -> SessionConfig {
    SessionConfig {
        heartbeat: Duration::from_secs(3600),
        ..Default::default()
    }
}

async fn next(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("session closed the channel")
}

async fn received(rx: &mut broadcast::Receiver<Value>) -> Result<Value, Box<dyn Error>> {
    Ok(timeout(Duration::from_secs(5), rx.recv()).await??)
}

#[test]
fn publishing_without_listeners_succeeds() -> Result<(), Box<dyn Error>> {
    common::run(async move {
    let _guard = common::setup_broker().await?;
    let bridge = NotificationBridge::connect().await?;

    bridge.publish(&Channel::WORK, json!({"x": 1})).await?;

    let event = JobEvent::JobFailed {
        job_id: JobId::new(),
        kind: JobKind::CleanupJobs,
        error: "boom".into(),
        timestamp: Utc::now(),
    };
    bridge.publish_event(&event).await?;
    assert_eq!(bridge.active_channels(), 0);

    Ok(())
    })
}

#[test]
fn subscribers_receive_events_on_their_channels() -> Result<(), Box<dyn Error>> {
    common::run(async move {
    let _guard = common::setup_broker().await?;
    let bridge = NotificationBridge::connect().await?;
    let mut completed = bridge.subscribe(&Channel::JOB_COMPLETED);
    let mut refreshes = bridge.subscribe(&Channel::SUBSCRIPTION_REFRESH_COMPLETED);
    let mut work = bridge.subscribe(&Channel::WORK);

    let event = JobEvent::JobCompleted {
        job_id: JobId::new(),
        kind: JobKind::RefreshSubscriptions,
        duration_ms: 12,
        timestamp: Utc::now(),
    };
    bridge.publish_event(&event).await?;

    let message = received(&mut completed).await?;
    assert_eq!(message["event"], "job_completed");
    assert_eq!(message["kind"], "refresh_subscriptions");
    assert_eq!(received(&mut refreshes).await?, message);
    assert!(work.try_recv().is_err());

    Ok(())
    })
}

#[test]
fn messages_reach_subscribers_of_other_bridges() -> Result<(), Box<dyn Error>> {
    common::run(async move {
    let _guard = common::setup_broker().await?;
    let web = NotificationBridge::connect().await?;
    let worker = NotificationBridge::connect().await?;
    let mut started = web.subscribe(&Channel::JOB_STARTED);

    for n in 0..3 {
        worker.publish(&Channel::JOB_STARTED, json!({"n": n})).await?;
    }
    for n in 0..3 {
        assert_eq!(received(&mut started).await?, json!({"n": n}));
    }
    assert_eq!(worker.active_channels(), 0);

    Ok(())
    })
}

#[test]
fn idle_channels_are_pruned() -> Result<(), Box<dyn Error>> {
    common::run(async move {
    let _guard = common::setup_broker().await?;
    let bridge = NotificationBridge::connect().await?;

    // Torn down by the session below.
    drop(bridge.subscribe(&Channel::new("download-1")));
    let (tx, mut rx) = mpsc::channel(16);
    let config = SessionConfig {
        channels: vec![Channel::new("download-2")],
        ..slow_heartbeat()
    };
    let server = bridge.clone();
    let session = tokio::spawn(async move {
        server
            .serve(tx, config, async { Ok::<_, Infallible>(Vec::new()) })
            .await
    });
    next(&mut rx).await;
    assert_eq!(bridge.active_channels(), 2);

    drop(rx);
    timeout(Duration::from_secs(5), session).await???;
    assert_eq!(bridge.active_channels(), 0);

    // Pruned when a message finds nobody listening.
    let channel = Channel::new("download-3");
    drop(bridge.subscribe(&channel));
    assert_eq!(bridge.active_channels(), 1);
    bridge.publish(&channel, json!({"percent": 10})).await?;
    timeout(Duration::from_secs(5), async {
        while bridge.active_channels() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    Ok(())
    })
}

#[test]
fn session_sends_snapshot_then_relays_in_order() -> Result<(), Box<dyn Error>> {
    common::run(async move {
    let _guard = common::setup_broker().await?;
    let bridge = NotificationBridge::connect().await?;
    let (tx, mut rx) = mpsc::channel(16);
    let view = sample_view();
    let jobs = vec![view.clone()];

    let server = bridge.clone();
    let session = tokio::spawn(async move {
        server
            .serve(tx, slow_heartbeat(), async move { Ok::<_, Infallible>(jobs) })
            .await
    });

    let first = next(&mut rx).await;
    assert_eq!(first, ServerMessage::Snapshot { jobs: vec![view.clone()] });
    let wire = first.to_json();
    assert_eq!(wire["type"], "ALL");
    assert_eq!(wire["jobs"][0]["id"], view.id.to_string());
    assert_eq!(wire["jobs"][0]["status"], "running");

    for n in 0..3 {
        bridge.publish(&Channel::WORK, json!({"progress": n})).await?;
    }
    for n in 0..3 {
        match next(&mut rx).await {
            ServerMessage::Relay { channel, message } => {
                assert_eq!(channel, Channel::WORK);
                assert_eq!(message, json!({"progress": n}));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    drop(rx);
    let end = timeout(Duration::from_secs(5), session).await???;
    assert_eq!(end, SessionEnd::ClientClosed);

    Ok(())
    })
}

#[test]
fn heartbeat_keeps_an_idle_session_alive() -> Result<(), Box<dyn Error>> {
    common::run(async move {
    let _guard = common::setup_broker().await?;
    let bridge = NotificationBridge::connect().await?;
    let (tx, mut rx) = mpsc::channel(16);
    let config = SessionConfig {
        channels: vec![Channel::WORK],
        heartbeat: Duration::from_millis(20),
    };

    let server = bridge.clone();
    let session = tokio::spawn(async move {
        server
            .serve(tx, config, async { Ok::<_, Infallible>(Vec::new()) })
            .await
    });

    assert_eq!(next(&mut rx).await, ServerMessage::Snapshot { jobs: vec![] });
    for _ in 0..3 {
        let message = next(&mut rx).await;
        assert_eq!(message, ServerMessage::KeepAlive);
        assert_eq!(message.to_json(), json!({}));
    }

    drop(rx);
    let end = timeout(Duration::from_secs(5), session).await??;
    assert!(matches!(end, Ok(SessionEnd::ClientClosed)));

    Ok(())
    })
}

#[test]
fn disconnect_stops_every_listener() -> Result<(), Box<dyn Error>> {
    common::run(async move {
    let _guard = common::setup_broker().await?;
    let bridge = NotificationBridge::connect().await?;
    assert_eq!(bridge.active_listeners(), 0);

    let mut sessions = Vec::new();
    let mut receivers = Vec::new();
    for _ in 0..3 {
        let (tx, mut rx) = mpsc::channel(16);
        let server = bridge.clone();
        sessions.push(tokio::spawn(async move {
            server
                .serve(tx, slow_heartbeat(), async { Ok::<_, Infallible>(Vec::new()) })
                .await
        }));
        next(&mut rx).await;
        receivers.push(rx);
    }

    // Listeners are spawned right after the snapshot is sent.
    timeout(Duration::from_secs(5), async {
        while bridge.active_listeners() < 9 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;
    assert_eq!(bridge.active_sessions(), 3);

    drop(receivers);
    for session in sessions {
        let end = timeout(Duration::from_secs(5), session).await??;
        assert!(matches!(end, Ok(SessionEnd::ClientClosed)));
    }

    assert_eq!(bridge.active_listeners(), 0);
    assert_eq!(bridge.active_sessions(), 0);
    assert_eq!(bridge.active_channels(), 0);

    Ok(())
    })
}

#[test]
fn failed_snapshot_ends_the_session() -> Result<(), Box<dyn Error>> {
    common::run(async move {
    let _guard = common::setup_broker().await?;
    let bridge = NotificationBridge::connect().await?;
    let (tx, mut rx) = mpsc::channel(16);

    let result = bridge
        .serve(tx, SessionConfig::default(), async { Err::<Vec<JobView>, _>("broker down") })
        .await;

    assert!(matches!(result, Err(SessionError::Snapshot(reason)) if reason == "broker down"));
    assert!(rx.recv().await.is_none());
    assert_eq!(bridge.active_sessions(), 0);
    assert_eq!(bridge.active_channels(), 0);

    Ok(())
    })
}
