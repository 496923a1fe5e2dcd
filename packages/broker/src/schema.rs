//! Broker table definitions using SurrealQL.

use crate::{BrokerError, get_db};

/// Initialize the broker schema.
///
/// This creates all necessary tables and indexes. Safe to run from every
/// process sharing the broker.
pub async fn init_schema() -> Result<(), BrokerError> {
    let db = get_db()?;

    tracing::info!("Initializing broker schema...");

    db.query(JOB_SCHEMA).await?.check()?;
    db.query(SCHEDULED_SCHEMA).await?.check()?;
    db.query(LOCK_SCHEMA).await?.check()?;
    db.query(EVENT_SCHEMA).await?.check()?;
    db.query(WORKER_SCHEMA).await?.check()?;

    tracing::info!("Broker schema initialized");

    Ok(())
}

/// Job table: the job record store and the dispatch state machine.
///
/// Timestamps are stored as epoch milliseconds so the broker can compare them
/// numerically.
const JOB_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job SCHEMALESS;

DEFINE INDEX IF NOT EXISTS job_state ON job FIELDS state;
DEFINE INDEX IF NOT EXISTS job_depends_on ON job FIELDS depends_on;
DEFINE INDEX IF NOT EXISTS job_kind ON job FIELDS kind;
DEFINE INDEX IF NOT EXISTS job_worker ON job FIELDS worker_id;
DEFINE INDEX IF NOT EXISTS job_order ON job FIELDS state, job_id;
"#;

/// Scheduled entries waiting for promotion, keyed by job id.
const SCHEDULED_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS scheduled SCHEMALESS;

DEFINE INDEX IF NOT EXISTS scheduled_fire_at ON scheduled FIELDS fire_at;
"#;

/// Cross-process locks. A record's presence means the lock is held.
const LOCK_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS lock SCHEMALESS;
"#;

/// Published pub/sub messages. Bridges follow the table with a live query.
const EVENT_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS event SCHEMALESS;

DEFINE INDEX IF NOT EXISTS event_published_at ON event FIELDS published_at;
"#;

/// Worker leases, keyed by worker id.
const WORKER_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS worker SCHEMALESS;

DEFINE INDEX IF NOT EXISTS worker_last_seen ON worker FIELDS last_seen;
"#;
