#![allow(dead_code)]

use std::error::Error;
use std::sync::LazyLock;
use std::time::Duration;

use serde_json::Value;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::{Mutex, MutexGuard, broadcast};

use broker::repositories::JobRepository;
use broker::{BrokerConfig, BrokerError};
use job_core::{Job, JobId};

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

/// Poll the broker until `done` holds for the job, or give up after `limit`.
pub async fn wait_for<F>(job_id: JobId, limit: Duration, done: F) -> Result<Job, BrokerError>
where
    F: Fn(&Job) -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let job = JobRepository::get(job_id).await?;
        if done(&job) || tokio::time::Instant::now() >= deadline {
            return Ok(job);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_terminal(job_id: JobId) -> Result<Job, BrokerError> {
    wait_for(job_id, Duration::from_secs(10), |job| job.state.is_terminal()).await
}

/// Next message on a bridge subscription, failing after five seconds.
pub async fn received(rx: &mut broadcast::Receiver<Value>) -> Result<Value, Box<dyn Error>> {
    Ok(tokio::time::timeout(Duration::from_secs(5), rx.recv()).await??)
}
