//! Event repository: the broker-side log that carries pub/sub messages
//! between processes.

use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use surrealdb::sql::Thing;
use surrealdb::{Action, Notification};

use crate::{BrokerError, get_db};

/// Repository for published events.
///
/// Publishing creates a record; subscribers hold a live query on the table
/// and see every record created after they attached.
pub struct EventRepository;

#[derive(Debug, Serialize, Deserialize)]
struct EventRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Thing>,
    #[serde(default)]
    channel: String,
    #[serde(default)]
    message: Value,
    /// Epoch milliseconds on the broker clock.
    #[serde(default)]
    published_at: i64,
}

/// A message as it was published.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedEvent {
    pub channel: String,
    pub message: Value,
}

/// Live feed of events published after it was opened, in commit order.
pub struct EventFeed {
    stream: BoxStream<'static, Result<Notification<EventRecord>, surrealdb::Error>>,
}

impl EventFeed {
    /// Wait for the next published event. `None` means the broker ended the
    /// live query.
    pub async fn next(&mut self) -> Option<Result<PublishedEvent, BrokerError>> {
        loop {
            match self.stream.next().await? {
                Ok(notification) if matches!(notification.action, Action::Create) => {
                    let record = notification.data;
                    return Some(Ok(PublishedEvent {
                        channel: record.channel,
                        message: record.message,
                    }));
                }
                // Pruned records.
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

impl EventRepository {
    /// Record `message` on `channel`.
    pub async fn publish(channel: &str, message: &Value) -> Result<(), BrokerError> {
        let db = get_db()?;

        db.query(
            r#"
            CREATE event SET
                channel = $channel,
                message = $message,
                published_at = time::unix(time::now()) * 1000
            "#,
        )
        .bind(("channel", channel.to_string()))
        .bind(("message", message.clone()))
        .await?
        .check()?;

        Ok(())
    }

    /// Open a live feed of newly published events.
    pub async fn listen() -> Result<EventFeed, BrokerError> {
        let db = get_db()?;

        let stream = db.select::<Vec<EventRecord>>("event").live().await?;

        Ok(EventFeed {
            stream: stream.boxed(),
        })
    }

    /// Delete events older than `retention`. Returns how many were removed.
    pub async fn prune(retention: Duration) -> Result<usize, BrokerError> {
        let db = get_db()?;

        let mut result = db
            .query(
                r#"
                DELETE event
                WHERE published_at < time::unix(time::now()) * 1000 - $retention_ms
                RETURN BEFORE
                "#,
            )
            .bind(("retention_ms", retention.as_millis() as i64))
            .await?;

        let removed: Vec<EventRecord> = result.take(0)?;

        Ok(removed.len())
    }
}
