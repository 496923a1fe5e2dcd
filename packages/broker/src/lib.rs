//! SurrealDB-backed broker for the job subsystem.
//!
//! Every worker process connects to the same broker. It holds the job record
//! store, the schedule of future jobs, the cross-process locks, the worker
//! leases and the published event log, and it offers the atomic conditional
//! writes the queue relies on.
//!
//! # Features
//!
//! - `memory` (default): Use in-memory storage for testing
//! - `rocksdb`: Use RocksDB for persistent file-based storage

mod connection;
mod schema;
pub mod repositories;

pub use connection::{BrokerConfig, BrokerError, Database, get_db, init_db};
pub use schema::init_schema;

/// Initialize the broker with the given configuration.
///
/// This should be called once at application startup.
pub async fn init(config: BrokerConfig) -> Result<(), BrokerError> {
    init_db(config).await?;
    init_schema().await?;
    Ok(())
}
