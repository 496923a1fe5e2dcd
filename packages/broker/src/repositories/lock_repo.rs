//! Lock repository: named cross-process locks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::sql::Thing;

use crate::{BrokerError, get_db};

/// Repository for named locks.
///
/// A lock is held while its record exists. Acquisition is a record create,
/// which the broker rejects when the record is already there.
pub struct LockRepository;

#[derive(Debug, Serialize, Deserialize)]
struct LockRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Thing>,
    owner: String,
    /// Epoch milliseconds.
    acquired_at: i64,
}

/// Current holder of a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
}

impl From<LockRecord> for LockHolder {
    fn from(record: LockRecord) -> Self {
        Self {
            owner: record.owner,
            acquired_at: DateTime::from_timestamp_millis(record.acquired_at).unwrap_or_default(),
        }
    }
}

impl LockRepository {
    /// Try to take `key` for `owner`. Returns `false` if someone holds it.
    pub async fn try_acquire(key: &str, owner: &str) -> Result<bool, BrokerError> {
        let db = get_db()?;

        let created: Result<Option<LockRecord>, surrealdb::Error> = db
            .create(("lock", key.to_string()))
            .content(LockRecord {
                id: None,
                owner: owner.to_string(),
                acquired_at: Utc::now().timestamp_millis(),
            })
            .await;

        match created {
            Ok(Some(_)) => {
                tracing::debug!("Lock {} acquired by {}", key, owner);
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(err) => match Self::holder(key).await? {
                Some(holder) => {
                    tracing::debug!("Lock {} already held by {}", key, holder.owner);
                    Ok(false)
                }
                None => Err(err.into()),
            },
        }
    }

    /// Release `key` if `owner` holds it. Returns whether it was released.
    pub async fn release(key: &str, owner: &str) -> Result<bool, BrokerError> {
        let db = get_db()?;

        let mut result = db
            .query("DELETE type::thing('lock', $key) WHERE owner = $owner RETURN BEFORE")
            .bind(("key", key.to_string()))
            .bind(("owner", owner.to_string()))
            .await?;

        let released: Vec<LockRecord> = result.take(0)?;

        Ok(!released.is_empty())
    }

    /// Who holds `key`, if anyone.
    pub async fn holder(key: &str) -> Result<Option<LockHolder>, BrokerError> {
        let db = get_db()?;

        let record: Option<LockRecord> = db.select(("lock", key.to_string())).await?;

        Ok(record.map(LockHolder::from))
    }
}
