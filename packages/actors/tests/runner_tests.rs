use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use actors::{RunnerError, TaskRunner, Work};
use tokio::sync::oneshot;
use tokio::time::timeout;

async fn settle(runner: &TaskRunner) {
    timeout(Duration::from_secs(5), async {
        while runner.active() > 0 || runner.tracked() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("runner did not settle");
}

async fn explode() {
    panic!("job body exploded")
}

#[tokio::test]
async fn submitted_work_runs_and_is_released() -> Result<(), Box<dyn Error>> {
    let runner = TaskRunner::start();
    let counter = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let counter = counter.clone();
        handles.push(runner.submit(Work::future(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }))?);
    }

    settle(&runner).await;
    assert_eq!(counter.load(Ordering::SeqCst), 10);
    assert!(handles.iter().all(|handle| handle.is_done()));

    runner.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn blocking_work_does_not_stall_async_work() -> Result<(), Box<dyn Error>> {
    // Single-threaded runtime: a blocking call on it would hold up everything.
    let runner = TaskRunner::start();
    let (blocking_done_tx, blocking_done) = oneshot::channel();
    let (async_done_tx, async_done) = oneshot::channel();

    runner.submit(Work::blocking(move || {
        std::thread::sleep(Duration::from_millis(300));
        let _ = blocking_done_tx.send(());
    }))?;
    runner.submit(Work::future(async move {
        let _ = async_done_tx.send(());
    }))?;

    timeout(Duration::from_millis(200), async_done).await??;
    timeout(Duration::from_secs(5), blocking_done).await??;

    runner.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn cancel_stops_pending_work_and_is_idempotent() -> Result<(), Box<dyn Error>> {
    let runner = TaskRunner::start();
    let handle = runner.submit(Work::future(std::future::pending()))?;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!handle.is_done());
    assert_eq!(runner.active(), 1);

    handle.cancel();
    handle.cancel();
    settle(&runner).await;
    assert!(handle.is_done());

    runner.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn a_panicking_task_does_not_disturb_the_others() -> Result<(), Box<dyn Error>> {
    let runner = TaskRunner::start();

    runner.submit(Work::future(explode()))?;
    settle(&runner).await;

    let (tx, rx) = oneshot::channel();
    runner.submit(Work::future(async move {
        let _ = tx.send(42);
    }))?;
    assert_eq!(timeout(Duration::from_secs(5), rx).await??, 42);

    let result = runner.shutdown().await;
    assert!(matches!(result, Err(RunnerError::TaskPanics(1))));
    Ok(())
}

#[tokio::test]
async fn shutdown_cancels_in_flight_work() -> Result<(), Box<dyn Error>> {
    let runner = TaskRunner::start();
    let handles = (0..5)
        .map(|_| runner.submit(Work::future(std::future::pending())))
        .collect::<Result<Vec<_>, _>>()?;

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(runner.active(), 5);

    timeout(Duration::from_secs(5), runner.shutdown()).await??;
    assert!(handles.iter().all(|handle| handle.is_done()));
    assert_eq!(runner.active(), 0);
    assert_eq!(runner.tracked(), 0);

    assert!(matches!(
        runner.submit(Work::future(async {})),
        Err(RunnerError::ShutDown)
    ));
    runner.shutdown().await?;
    Ok(())
}
