//! Schedule repository: future promotions of scheduled jobs.

use chrono::{DateTime, Utc};
use job_core::{JobId, ScheduledEntry};
use serde::{Deserialize, Serialize};
use surrealdb::sql::Thing;

use crate::{BrokerError, get_db};

/// Repository for the schedule of future jobs.
///
/// Entries are keyed by job id, so a job has at most one pending promotion.
pub struct ScheduleRepository;

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ScheduledRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Thing>,
    job_id: String,
    /// Epoch milliseconds.
    fire_at: i64,
}

impl ScheduledRecord {
    pub(crate) fn new(job_id: JobId, fire_at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            job_id: job_id.to_string(),
            fire_at: fire_at.timestamp_millis(),
        }
    }

    fn into_entry(self) -> Result<ScheduledEntry, BrokerError> {
        let job_id = JobId::parse(&self.job_id).map_err(|e| {
            BrokerError::Serialization(format!("bad job id {}: {}", self.job_id, e))
        })?;
        let fire_at = DateTime::from_timestamp_millis(self.fire_at).ok_or_else(|| {
            BrokerError::Serialization(format!("timestamp out of range: {}", self.fire_at))
        })?;
        Ok(ScheduledEntry { job_id, fire_at })
    }
}

fn into_entries(records: Vec<ScheduledRecord>) -> Result<Vec<ScheduledEntry>, BrokerError> {
    records.into_iter().map(ScheduledRecord::into_entry).collect()
}

impl ScheduleRepository {
    /// Add a scheduled entry.
    pub async fn insert(entry: &ScheduledEntry) -> Result<(), BrokerError> {
        let db = get_db()?;

        let _: Option<ScheduledRecord> = db
            .create(("scheduled", entry.job_id.to_string()))
            .content(ScheduledRecord::new(entry.job_id, entry.fire_at))
            .await?;

        Ok(())
    }

    /// Entries whose fire time has passed, earliest first.
    ///
    /// "Now" is read from the broker's clock so that workers with skewed
    /// clocks agree on what is due.
    pub async fn due(limit: usize) -> Result<Vec<ScheduledEntry>, BrokerError> {
        let db = get_db()?;

        let mut result = db
            .query(
                r#"
                SELECT * FROM scheduled
                WHERE fire_at <= time::unix(time::now()) * 1000
                ORDER BY fire_at ASC
                LIMIT $limit
                "#,
            )
            .bind(("limit", limit as i64))
            .await?;

        let records: Vec<ScheduledRecord> = result.take(0)?;

        into_entries(records)
    }

    /// Remove an entry, returning it only to the caller that removed it.
    ///
    /// Concurrent callers racing for the same entry see it at most once.
    pub async fn take(job_id: JobId) -> Result<Option<ScheduledEntry>, BrokerError> {
        let db = get_db()?;

        let outcome = db
            .query("DELETE type::thing('scheduled', $id) RETURN BEFORE")
            .bind(("id", job_id.to_string()))
            .await
            .map_err(BrokerError::from)
            .and_then(|mut response| Ok(response.take::<Vec<ScheduledRecord>>(0)?));

        match outcome {
            Ok(records) => records
                .into_iter()
                .next()
                .map(ScheduledRecord::into_entry)
                .transpose(),
            Err(err) => {
                if Self::get(job_id).await?.is_some() {
                    return Err(err);
                }
                tracing::debug!("Scheduled entry {} taken concurrently: {}", job_id, err);
                Ok(None)
            }
        }
    }

    /// Look up the entry for a job.
    pub async fn get(job_id: JobId) -> Result<Option<ScheduledEntry>, BrokerError> {
        let db = get_db()?;

        let record: Option<ScheduledRecord> = db.select(("scheduled", job_id.to_string())).await?;

        record.map(ScheduledRecord::into_entry).transpose()
    }

    /// Every entry, earliest first.
    pub async fn list() -> Result<Vec<ScheduledEntry>, BrokerError> {
        let db = get_db()?;

        let mut result = db
            .query("SELECT * FROM scheduled ORDER BY fire_at ASC")
            .await?;

        let records: Vec<ScheduledRecord> = result.take(0)?;

        into_entries(records)
    }

    pub async fn count() -> Result<usize, BrokerError> {
        Ok(Self::list().await?.len())
    }

    /// Remove every entry. Returns the removed entries.
    pub async fn clear() -> Result<Vec<ScheduledEntry>, BrokerError> {
        let db = get_db()?;

        let mut result = db.query("DELETE scheduled RETURN BEFORE").await?;

        let records: Vec<ScheduledRecord> = result.take(0)?;

        into_entries(records)
    }
}
