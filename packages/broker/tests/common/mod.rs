use std::sync::LazyLock;

use tokio::runtime::{Builder, Runtime};
use tokio::sync::{Mutex, MutexGuard};

use broker::{BrokerConfig, BrokerError};

static TEST_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

/// Owns the broker connection's background task. Every `#[tokio::test]` runs
/// on its own runtime, and the connection outlives all of them.
static BROKER_RUNTIME: LazyLock<Runtime> = LazyLock::new(|| {
    Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .expect("failed to build broker runtime")
});

async fn reset_broker() -> Result<(), BrokerError> {
    broker::init(BrokerConfig::memory()).await?;
    let db = broker::get_db()?;
    db.query("DELETE job; DELETE scheduled; DELETE lock; DELETE event; DELETE worker;")
        .await?;
    Ok(())
}

pub async fn setup_broker() -> Result<MutexGuard<'static, ()>, BrokerError> {
    let guard = TEST_LOCK.lock().await;
    BROKER_RUNTIME
        .spawn(reset_broker())
        .await
        .map_err(|e| BrokerError::Query(e.to_string()))??;
    Ok(guard)
}
