use std::sync::LazyLock;

use tokio::runtime::{Builder, Runtime};
use tokio::sync::{Mutex, MutexGuard};

use broker::{BrokerConfig, BrokerError};

static TEST_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

/// Owns the broker connection's background task. Tests run on it through
/// [`run`], so live queries they open are torn down by a runtime that keeps
/// running, and the connection outlives all of them.
static BROKER_RUNTIME: LazyLock<Runtime> = LazyLock::new(|| {
    Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .expect("failed to build broker runtime")
});

/// Run a test body on the broker runtime.
pub fn run<F: Future>(test: F) -> F::Output {
    BROKER_RUNTIME.block_on(test)
}

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
