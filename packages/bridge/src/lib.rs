//! Pub/sub notification bridge between job execution and live clients.
//!
//! Producers publish JSON messages on named [`Channel`]s. Every message goes
//! through the broker's event log, so a worker in one process reaches the
//! client sessions of every other process sharing the broker. Each bridge
//! follows the log with a live query and fans messages out to its local
//! subscribers.
//!
//! Each connected client gets a session that sends a snapshot of the job
//! list, relays every message on its subscribed channels and keeps the
//! connection alive with an empty heartbeat.

mod session;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use broker::BrokerError;
use broker::repositories::{EventFeed, EventRepository};
use job_core::{Channel, JobEvent};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio::time::{self, Instant};

pub use session::{ServerMessage, SessionConfig, SessionEnd, SessionError};

/// Per-channel buffer. Slow listeners that fall further behind skip ahead.
const CHANNEL_CAPACITY: usize = 1024;

/// How long published events stay in the broker's log.
const EVENT_RETENTION: Duration = Duration::from_secs(60);

/// Pub/sub hub backed by the broker.
///
/// Cheap to clone; clones share channels, counters and the broker feed. The
/// feed stops when the last clone is dropped.
#[derive(Clone)]
pub struct NotificationBridge {
    inner: Arc<Inner>,
}

struct Inner {
    channels: RwLock<HashMap<Channel, broadcast::Sender<Value>>>,
    listeners: AtomicUsize,
    sessions: AtomicUsize,
    /// Dropped with the last handle, which ends the feed task.
    _feed: oneshot::Sender<()>,
}

impl Inner {
    /// Hand a message from the feed to local subscribers of `channel`.
    fn deliver(&self, channel: &Channel, message: Value) -> usize {
        let delivered = {
            let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
            match channels.get(channel) {
                Some(sender) => sender.send(message).ok(),
                None => return 0,
            }
        };

        match delivered {
            Some(count) => count,
            None => {
                self.prune_idle();
                0
            }
        }
    }

    /// Drop channels nobody listens to anymore.
    fn prune_idle(&self) {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}

impl NotificationBridge {
    /// Attach to the broker's event log. Messages published from anywhere
    /// after this returns reach this bridge's subscribers.
    pub async fn connect() -> Result<Self, BrokerError> {
        let events = EventRepository::listen().await?;
        let (feed, stopped) = oneshot::channel();

        let inner = Arc::new(Inner {
            channels: RwLock::new(HashMap::new()),
            listeners: AtomicUsize::new(0),
            sessions: AtomicUsize::new(0),
            _feed: feed,
        });
        tokio::spawn(follow(Arc::downgrade(&inner), events, stopped));

        Ok(Self { inner })
    }

    /// Publish `message` on `channel` for every bridge on the broker.
    pub async fn publish(&self, channel: &Channel, message: Value) -> Result<(), BrokerError> {
        EventRepository::publish(channel.as_str(), &message).await
    }

    /// Publish a job event on every channel it belongs to.
    pub async fn publish_event(&self, event: &JobEvent) -> Result<(), BrokerError> {
        let message = serde_json::to_value(event)
            .map_err(|e| BrokerError::Serialization(e.to_string()))?;

        tracing::debug!("Publishing: {}", event.description());

        for channel in event.channels() {
            self.publish(&channel, message.clone()).await?;
        }

        Ok(())
    }

    /// Subscribe to a channel, creating it on first use.
    pub fn subscribe(&self, channel: &Channel) -> broadcast::Receiver<Value> {
        let mut channels = self
            .inner
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(channel.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Channels this bridge holds. Idle ones are dropped when a session ends
    /// or when a message finds nobody listening.
    pub fn active_channels(&self) -> usize {
        self.inner
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Channel listeners currently running across all sessions.
    pub fn active_listeners(&self) -> usize {
        self.inner.listeners.load(Ordering::SeqCst)
    }

    /// Sessions currently being served.
    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.load(Ordering::SeqCst)
    }

    fn prune_idle(&self) {
        self.inner.prune_idle();
    }

    fn gauge(&self, which: Gauge) -> GaugeGuard {
        let counter = match which {
            Gauge::Listeners => &self.inner.listeners,
            Gauge::Sessions => &self.inner.sessions,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        GaugeGuard {
            inner: self.inner.clone(),
            which,
        }
    }
}

/// Relay the broker feed into local channels until the bridge is dropped or
/// the broker ends the feed. Also trims the event log now and then.
async fn follow(inner: Weak<Inner>, mut events: EventFeed, mut stopped: oneshot::Receiver<()>) {
    let mut prune = time::interval_at(Instant::now() + EVENT_RETENTION, EVENT_RETENTION);

    loop {
        tokio::select! {
            _ = &mut stopped => break,
            next = events.next() => {
                let Some(inner) = inner.upgrade() else { break };
                match next {
                    Some(Ok(event)) => {
                        inner.deliver(&Channel::new(event.channel), event.message);
                    }
                    Some(Err(e)) => tracing::warn!("Skipping unreadable event: {}", e),
                    None => {
                        tracing::error!("Broker closed the event feed");
                        // Closing every channel ends the sessions relaying them.
                        inner
                            .channels
                            .write()
                            .unwrap_or_else(PoisonError::into_inner)
                            .clear();
                        break;
                    }
                }
            }
            _ = prune.tick() => match EventRepository::prune(EVENT_RETENTION).await {
                Ok(0) => {}
                Ok(removed) => tracing::debug!("Pruned {} old event(s)", removed),
                Err(e) => tracing::warn!("Failed to prune events: {}", e),
            },
        }
    }

    tracing::debug!("Event feed stopped");
}

#[derive(Clone, Copy)]
enum Gauge {
    Listeners,
    Sessions,
}

/// Decrements its gauge when dropped, including when a task is aborted.
struct GaugeGuard {
    inner: Arc<Inner>,
    which: Gauge,
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        let counter = match self.which {
            Gauge::Listeners => &self.inner.listeners,
            Gauge::Sessions => &self.inner.sessions,
        };
        counter.fetch_sub(1, Ordering::SeqCst);
    }
}
