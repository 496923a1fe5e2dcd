//! Job repository: the record store and the dispatch state machine.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use job_core::{Job, JobId, JobKind, JobState, Recurrence};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use surrealdb::sql::Thing;

use super::schedule_repo::ScheduledRecord;
use crate::{BrokerError, get_db};

/// Repository for job persistence operations.
pub struct JobRepository;

/// Internal record type for SurrealDB.
///
/// The record id is the job's ULID; `job_id` repeats it as a plain string so
/// it can be ordered and compared in queries.
#[derive(Debug, Serialize, Deserialize)]
struct JobRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Thing>,
    job_id: String,
    kind: String,
    #[serde(default)]
    payload: Value,
    state: String,
    #[serde(default)]
    scheduled_at: Option<i64>,
    #[serde(default)]
    depends_on: Option<String>,
    #[serde(default)]
    recurrence: Option<Recurrence>,
    #[serde(default)]
    worker_id: Option<String>,
    created_at: i64,
    #[serde(default)]
    started_at: Option<i64>,
    #[serde(default)]
    finished_at: Option<i64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    successor: Option<String>,
}

impl JobRecord {
    fn from_job(job: &Job) -> Self {
        Self {
            id: None,
            job_id: job.id.to_string(),
            kind: job.kind.as_str().to_string(),
            payload: job.payload.clone(),
            state: job.state.as_str().to_string(),
            scheduled_at: job.scheduled_at.map(|t| t.timestamp_millis()),
            depends_on: job.depends_on.map(|id| id.to_string()),
            recurrence: job.recurrence.clone(),
            worker_id: job.worker_id.clone(),
            created_at: job.created_at.timestamp_millis(),
            started_at: job.started_at.map(|t| t.timestamp_millis()),
            finished_at: job.finished_at.map(|t| t.timestamp_millis()),
            error: job.error.clone(),
            result: job.result.clone(),
            successor: job.successor.map(|id| id.to_string()),
        }
    }

    fn into_job(self) -> Result<Job, BrokerError> {
        let id = parse_id(&self.job_id)?;
        let depends_on = self.depends_on.as_deref().map(parse_id).transpose()?;
        let successor = self.successor.as_deref().map(parse_id).transpose()?;

        Ok(Job {
            id,
            kind: self.kind.parse().map_err(BrokerError::Serialization)?,
            payload: self.payload,
            state: self.state.parse().map_err(BrokerError::Serialization)?,
            scheduled_at: self.scheduled_at.map(from_millis).transpose()?,
            depends_on,
            recurrence: self.recurrence,
            worker_id: self.worker_id,
            created_at: from_millis(self.created_at)?,
            started_at: self.started_at.map(from_millis).transpose()?,
            finished_at: self.finished_at.map(from_millis).transpose()?,
            error: self.error,
            result: self.result,
            successor,
        })
    }
}

fn parse_id(raw: &str) -> Result<JobId, BrokerError> {
    JobId::parse(raw).map_err(|e| BrokerError::Serialization(format!("bad job id {raw}: {e}")))
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, BrokerError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| BrokerError::Serialization(format!("timestamp out of range: {ms}")))
}

fn into_jobs(records: Vec<JobRecord>) -> Result<Vec<Job>, BrokerError> {
    records.into_iter().map(JobRecord::into_job).collect()
}

/// Filter options for listing jobs.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub kind: Option<JobKind>,
    /// Return the most recently created jobs first.
    pub newest_first: bool,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Fields written together with a state change.
///
/// Only the fields that are set end up in the update.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub to: JobState,
    pub worker_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result: Option<Value>,
}

impl StateChange {
    pub fn to(state: JobState) -> Self {
        Self {
            to: state,
            worker_id: None,
            started_at: None,
            finished_at: None,
            error: None,
            result: None,
        }
    }

    /// ready -> running, owned by `worker_id`.
    pub fn claim(worker_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            worker_id: Some(worker_id.into()),
            started_at: Some(at),
            ..Self::to(JobState::Running)
        }
    }

    /// running -> completed.
    pub fn complete(result: Option<Value>, at: DateTime<Utc>) -> Self {
        Self {
            finished_at: Some(at),
            result,
            ..Self::to(JobState::Completed)
        }
    }

    /// Any non-terminal state -> failed.
    pub fn fail(error: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            finished_at: Some(at),
            error: Some(error.into()),
            ..Self::to(JobState::Failed)
        }
    }

    fn patch(&self) -> Value {
        let mut patch = Map::new();
        patch.insert("state".into(), Value::from(self.to.as_str()));
        if let Some(worker_id) = &self.worker_id {
            patch.insert("worker_id".into(), Value::from(worker_id.clone()));
        }
        if let Some(at) = self.started_at {
            patch.insert("started_at".into(), Value::from(at.timestamp_millis()));
        }
        if let Some(at) = self.finished_at {
            patch.insert("finished_at".into(), Value::from(at.timestamp_millis()));
        }
        if let Some(error) = &self.error {
            patch.insert("error".into(), Value::from(error.clone()));
        }
        if let Some(result) = &self.result {
            patch.insert("result".into(), result.clone());
        }
        Value::Object(patch)
    }
}

impl JobRepository {
    /// Create a new job in the broker.
    pub async fn create(job: &Job) -> Result<Job, BrokerError> {
        let db = get_db()?;

        let record: Option<JobRecord> = db
            .create(("job", job.id.to_string()))
            .content(JobRecord::from_job(job))
            .await?;

        record
            .ok_or_else(|| BrokerError::Query("Failed to create job".into()))?
            .into_job()
    }

    /// Get a job by ID, or `None` if it does not exist.
    pub async fn find(id: JobId) -> Result<Option<Job>, BrokerError> {
        let db = get_db()?;

        let record: Option<JobRecord> = db.select(("job", id.to_string())).await?;

        record.map(JobRecord::into_job).transpose()
    }

    /// Get a job by ID.
    pub async fn get(id: JobId) -> Result<Job, BrokerError> {
        Self::find(id)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("Job not found: {}", id)))
    }

    /// Current state of a job, `None` if it does not exist.
    pub async fn state_of(id: JobId) -> Result<Option<JobState>, BrokerError> {
        Ok(Self::find(id).await?.map(|job| job.state))
    }

    /// List jobs with optional filtering.
    pub async fn list(filter: JobFilter) -> Result<Vec<Job>, BrokerError> {
        let db = get_db()?;

        let mut conditions = Vec::new();
        let mut bindings: Vec<(&'static str, Value)> = Vec::new();

        if let Some(state) = filter.state {
            conditions.push("state = $state");
            bindings.push(("state", Value::from(state.as_str())));
        }

        if let Some(kind) = filter.kind {
            conditions.push("kind = $kind");
            bindings.push(("kind", Value::from(kind.as_str())));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let order = if filter.newest_first { "DESC" } else { "ASC" };

        let limit_clause = filter
            .limit
            .map(|l| format!("LIMIT {}", l))
            .unwrap_or_default();

        let offset_clause = filter
            .offset
            .map(|o| format!("START {}", o))
            .unwrap_or_default();

        let query = format!(
            "SELECT * FROM job {} ORDER BY job_id {} {} {}",
            where_clause, order, limit_clause, offset_clause
        );

        let mut result = db.query(&query);

        for (name, value) in bindings {
            result = result.bind((name, value));
        }

        let mut response = result.await?;
        let records: Vec<JobRecord> = response.take(0)?;

        into_jobs(records)
    }

    /// Ready jobs in enqueue order.
    pub async fn ready(limit: usize) -> Result<Vec<Job>, BrokerError> {
        Self::list(JobFilter {
            state: Some(JobState::Ready),
            limit: Some(limit),
            ..Default::default()
        })
        .await
    }

    /// Every job still waiting on a dependency.
    pub async fn held() -> Result<Vec<Job>, BrokerError> {
        Self::list(JobFilter {
            state: Some(JobState::Held),
            ..Default::default()
        })
        .await
    }

    /// Held jobs waiting on `dependency`.
    pub async fn held_on(dependency: JobId) -> Result<Vec<Job>, BrokerError> {
        let db = get_db()?;

        let mut result = db
            .query(
                r#"
                SELECT * FROM job
                WHERE state = "held" AND depends_on = $dependency
                ORDER BY job_id ASC
                "#,
            )
            .bind(("dependency", dependency.to_string()))
            .await?;

        let records: Vec<JobRecord> = result.take(0)?;

        into_jobs(records)
    }

    /// Apply `change` only if the job is still in `expected`.
    ///
    /// Returns the updated job, or `None` when the job is missing or another
    /// writer moved it first. This is the only way job state changes after
    /// creation, so every transition is decided by the broker.
    pub async fn compare_and_set(
        id: JobId,
        expected: JobState,
        change: StateChange,
    ) -> Result<Option<Job>, BrokerError> {
        if !expected.can_transition_to(change.to) {
            return Err(BrokerError::Query(format!(
                "illegal transition for job {}: {} -> {}",
                id, expected, change.to
            )));
        }

        let db = get_db()?;

        let outcome = db
            .query(
                "UPDATE type::thing('job', $id) MERGE $patch WHERE state = $expected RETURN AFTER",
            )
            .bind(("id", id.to_string()))
            .bind(("patch", change.patch()))
            .bind(("expected", expected.as_str()))
            .await
            .map_err(BrokerError::from)
            .and_then(|mut response| Ok(response.take::<Vec<JobRecord>>(0)?));

        match outcome {
            Ok(records) => records.into_iter().next().map(JobRecord::into_job).transpose(),
            Err(err) => {
                // A conflicting concurrent write surfaces as an error; if the
                // job has already left `expected`, the race was simply lost.
                match Self::state_of(id).await? {
                    Some(state) if state == expected => Err(err),
                    _ => {
                        tracing::debug!("Lost state race for job {}: {}", id, err);
                        Ok(None)
                    }
                }
            }
        }
    }

    /// Jobs currently running under `worker_id`, oldest first.
    pub async fn running_for(worker_id: &str) -> Result<Vec<Job>, BrokerError> {
        let db = get_db()?;

        let mut result = db
            .query(
                r#"
                SELECT * FROM job
                WHERE state = "running" AND worker_id = $worker_id
                ORDER BY job_id ASC
                "#,
            )
            .bind(("worker_id", worker_id.to_string()))
            .await?;

        let records: Vec<JobRecord> = result.take(0)?;

        into_jobs(records)
    }

    /// Running jobs whose worker has not renewed its lease within `lease_ms`
    /// of the broker's clock, or never held one.
    pub async fn abandoned(lease_ms: i64) -> Result<Vec<Job>, BrokerError> {
        let db = get_db()?;

        let mut result = db
            .query(
                r#"
                LET $cutoff = time::unix(time::now()) * 1000 - $lease_ms;
                LET $alive = (SELECT VALUE worker_id FROM worker WHERE last_seen >= $cutoff);
                SELECT * FROM job
                WHERE state = "running" AND worker_id NOTINSIDE $alive
                ORDER BY job_id ASC;
                "#,
            )
            .bind(("lease_ms", lease_ms))
            .await?;

        let records: Vec<JobRecord> = result.take(2)?;

        into_jobs(records)
    }

    /// Finished recurring jobs whose next occurrence is not installed yet.
    pub async fn awaiting_successor() -> Result<Vec<Job>, BrokerError> {
        let db = get_db()?;

        let mut result = db
            .query(
                r#"
                SELECT * FROM job
                WHERE state INSIDE ["completed", "failed"]
                    AND type::is::object(recurrence)
                    AND successor = NONE
                ORDER BY job_id ASC
                "#,
            )
            .await?;

        let records: Vec<JobRecord> = result.take(0)?;

        into_jobs(records)
    }

    /// Atomically link `next` to `previous` as its successor, create `next`
    /// and schedule it for `fire_at`.
    ///
    /// Returns `false` without writing anything when `previous` already has a
    /// successor, so concurrent installers produce exactly one next job.
    pub async fn install_successor(
        previous: JobId,
        next: &Job,
        fire_at: DateTime<Utc>,
    ) -> Result<bool, BrokerError> {
        let db = get_db()?;

        let outcome = db
            .query(
                r#"
                BEGIN TRANSACTION;
                LET $linked = (
                    UPDATE type::thing('job', $previous) SET successor = $next
                    WHERE successor = NONE RETURN AFTER
                );
                IF array::len($linked) = 0 { THROW "successor already installed" };
                CREATE type::thing('job', $next) CONTENT $job;
                CREATE type::thing('scheduled', $next) CONTENT $entry;
                COMMIT TRANSACTION;
                "#,
            )
            .bind(("previous", previous.to_string()))
            .bind(("next", next.id.to_string()))
            .bind(("job", JobRecord::from_job(next)))
            .bind(("entry", ScheduledRecord::new(next.id, fire_at)))
            .await
            .and_then(|response| response.check());

        match outcome {
            Ok(_) => Ok(true),
            Err(err) => {
                // Either another installer won, or the broker failed.
                match Self::find(previous).await? {
                    Some(job) if job.successor.is_some_and(|id| id != next.id) => {
                        tracing::debug!("Successor of {} installed elsewhere: {}", previous, err);
                        Ok(false)
                    }
                    Some(job) if job.successor == Some(next.id) => Ok(true),
                    _ => Err(err.into()),
                }
            }
        }
    }

    /// Stop every finished job that still waits for a successor from
    /// recurring. Used when a fresh catalogue replaces the old chains.
    pub async fn retire_recurrences() -> Result<usize, BrokerError> {
        let db = get_db()?;

        let mut result = db
            .query(
                r#"
                UPDATE job SET recurrence = NONE
                WHERE state INSIDE ["completed", "failed"]
                    AND type::is::object(recurrence)
                    AND successor = NONE
                RETURN AFTER
                "#,
            )
            .await?;

        let records: Vec<JobRecord> = result.take(0)?;

        Ok(records.len())
    }

    /// Delete a job.
    pub async fn delete(id: JobId) -> Result<(), BrokerError> {
        let db = get_db()?;

        let _: Option<JobRecord> = db.delete(("job", id.to_string())).await?;

        Ok(())
    }

    /// Count jobs by dispatch state.
    pub async fn count_by_state() -> Result<HashMap<JobState, u64>, BrokerError> {
        let db = get_db()?;

        let mut result = db
            .query("SELECT state, count() AS count FROM job GROUP BY state")
            .await?;

        #[derive(Deserialize)]
        struct StateCount {
            state: Option<String>,
            count: i64,
        }

        let counts: Vec<StateCount> = result.take(0)?;

        let mut map = HashMap::new();
        for count in counts {
            if let Some(state) = count.state.and_then(|s| s.parse::<JobState>().ok()) {
                map.insert(state, count.count as u64);
            }
        }

        Ok(map)
    }
}
