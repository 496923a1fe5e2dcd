//! Client sessions: snapshot, relay and heartbeat.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use job_core::{Channel, JobView};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::{self, Instant};

use crate::{Gauge, NotificationBridge};

/// What a session subscribes to and how often it pings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub channels: Vec<Channel>,
    pub heartbeat: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channels: vec![Channel::JOB_STARTED, Channel::JOB_COMPLETED, Channel::WORK],
            heartbeat: Duration::from_secs(1),
        }
    }
}

/// Messages sent to a connected client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Current job list, always the first message of a session.
    Snapshot { jobs: Vec<JobView> },
    /// A message published on one of the session's channels, forwarded as is.
    Relay { channel: Channel, message: Value },
    /// Empty keepalive.
    KeepAlive,
}

impl ServerMessage {
    /// Wire form of the message.
    pub fn to_json(&self) -> Value {
        match self {
            ServerMessage::Snapshot { jobs } => json!({ "type": "ALL", "jobs": jobs }),
            ServerMessage::Relay { message, .. } => message.clone(),
            ServerMessage::KeepAlive => json!({}),
        }
    }
}

/// How a session ended normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    ClientClosed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Snapshot failed: {0}")]
    Snapshot(String),
    #[error("Listener for {channel} stopped unexpectedly")]
    ListenerStopped { channel: Channel },
    #[error("Listener panicked: {0}")]
    ListenerPanicked(String),
}

struct PruneOnDrop<'a>(&'a NotificationBridge);

impl Drop for PruneOnDrop<'_> {
    fn drop(&mut self) {
        self.0.prune_idle();
    }
}

enum ListenerExit {
    ClientGone,
    ChannelClosed(Channel),
}

impl NotificationBridge {
    /// Serve one client until it disconnects.
    ///
    /// The caller owns the transport and drains `outbound`; dropping the
    /// receiving half is how a disconnect is signalled. Subscriptions are
    /// taken before the snapshot is read, so nothing published after the
    /// snapshot is missed. Every listener is stopped before this returns.
    pub async fn serve<F, E>(
        &self,
        outbound: mpsc::Sender<ServerMessage>,
        config: SessionConfig,
        snapshot: F,
    ) -> Result<SessionEnd, SessionError>
    where
        F: Future<Output = Result<Vec<JobView>, E>>,
        E: Display,
    {
        // Declared first so it runs after every receiver below is gone.
        let _prune = PruneOnDrop(self);
        let _session = self.gauge(Gauge::Sessions);

        let receivers: Vec<(Channel, broadcast::Receiver<Value>)> = config
            .channels
            .iter()
            .map(|channel| (channel.clone(), self.subscribe(channel)))
            .collect();

        let jobs = snapshot
            .await
            .map_err(|e| SessionError::Snapshot(e.to_string()))?;
        tracing::info!("Session opened with {} jobs in snapshot", jobs.len());

        if outbound.send(ServerMessage::Snapshot { jobs }).await.is_err() {
            return Ok(SessionEnd::ClientClosed);
        }

        let mut listeners = JoinSet::new();
        for (channel, receiver) in receivers {
            let guard = self.gauge(Gauge::Listeners);
            let outbound = outbound.clone();
            listeners.spawn(async move {
                let _guard = guard;
                relay(channel, receiver, outbound).await
            });
        }

        let period = config.heartbeat.max(Duration::from_millis(1));
        let mut ticker = time::interval_at(Instant::now() + period, period);

        let outcome = loop {
            tokio::select! {
                _ = outbound.closed() => break Ok(SessionEnd::ClientClosed),
                _ = ticker.tick() => {
                    if outbound.send(ServerMessage::KeepAlive).await.is_err() {
                        break Ok(SessionEnd::ClientClosed);
                    }
                }
                Some(joined) = listeners.join_next() => match joined {
                    Ok(ListenerExit::ClientGone) => break Ok(SessionEnd::ClientClosed),
                    Ok(ListenerExit::ChannelClosed(channel)) => {
                        break Err(SessionError::ListenerStopped { channel });
                    }
                    Err(e) => break Err(SessionError::ListenerPanicked(e.to_string())),
                },
            }
        };

        listeners.abort_all();
        while listeners.join_next().await.is_some() {}

        match &outcome {
            Ok(_) => tracing::info!("Session closed by client"),
            Err(e) => tracing::warn!("Session torn down: {}", e),
        }

        outcome
    }
}

async fn relay(
    channel: Channel,
    mut receiver: broadcast::Receiver<Value>,
    outbound: mpsc::Sender<ServerMessage>,
) -> ListenerExit {
    loop {
        match receiver.recv().await {
            Ok(message) => {
                let forwarded = ServerMessage::Relay {
                    channel: channel.clone(),
                    message,
                };
                if outbound.send(forwarded).await.is_err() {
                    return ListenerExit::ClientGone;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Listener on {} lagged, skipped {} messages", channel, skipped);
            }
            Err(broadcast::error::RecvError::Closed) => {
                return ListenerExit::ChannelClosed(channel);
            }
        }
    }
}
