//! Worker repository: liveness leases of running workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::sql::Thing;

use crate::{BrokerError, get_db};

/// Repository for worker leases.
///
/// A worker renews its lease on every sweep. Jobs running under a worker
/// whose lease has lapsed are considered abandoned.
pub struct WorkerRepository;

#[derive(Debug, Serialize, Deserialize)]
struct WorkerRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Thing>,
    worker_id: String,
    /// Epoch milliseconds on the broker clock.
    last_seen: i64,
}

impl WorkerRepository {
    /// Renew the lease of `worker_id`.
    pub async fn heartbeat(worker_id: &str) -> Result<(), BrokerError> {
        let db = get_db()?;

        db.query(
            r#"
            UPSERT type::thing('worker', $worker_id) SET
                worker_id = $worker_id,
                last_seen = time::unix(time::now()) * 1000
            "#,
        )
        .bind(("worker_id", worker_id.to_string()))
        .await?
        .check()?;

        Ok(())
    }

    /// When `worker_id` last renewed its lease, if it holds one.
    pub async fn last_seen(worker_id: &str) -> Result<Option<DateTime<Utc>>, BrokerError> {
        let db = get_db()?;

        let record: Option<WorkerRecord> = db.select(("worker", worker_id.to_string())).await?;

        Ok(record.and_then(|record| DateTime::from_timestamp_millis(record.last_seen)))
    }

    /// Give up the lease of `worker_id`.
    pub async fn retire(worker_id: &str) -> Result<(), BrokerError> {
        let db = get_db()?;

        let _: Option<WorkerRecord> = db.delete(("worker", worker_id.to_string())).await?;

        Ok(())
    }
}
