//! Background job worker.
//!
//! Connects to the shared broker, fails jobs a previous run of this worker
//! left running, starts the supervisor and, in production, installs the cron
//! catalogue.

use actors::{
    BootstrapOutcome, CronScheduler, JobQueue, SupervisorMessage, default_catalogue,
    start_supervisor,
};
use bridge::NotificationBridge;
use tracing_subscriber::EnvFilter;

use config::AppConfig;

mod config;
mod handlers;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env()?;
    tracing::info!(
        "Starting {} in {} (cron: {})",
        config.dispatcher.worker_id,
        config.environment,
        config.cron_enabled
    );

    broker::init(config.broker.clone()).await?;

    let bridge = NotificationBridge::connect().await?;
    let queue = JobQueue::new(bridge.clone()).with_policy(config.dispatcher.dependency_policy);

    // Only matches anything when WORKER_ID is stable across restarts. Other
    // workers reap the rest once the lease runs out.
    let interrupted = queue.fail_interrupted(&config.dispatcher.worker_id).await?;
    if !interrupted.is_empty() {
        tracing::info!("Failed {} job(s) interrupted by a restart", interrupted.len());
    }

    let (supervisor, handle) =
        start_supervisor(config.dispatcher.clone(), handlers::registry(), bridge).await?;

    let cron = if config.cron_enabled {
        let scheduler = CronScheduler::new(
            queue.clone(),
            default_catalogue(config.cron_offset_secs)?,
            config.dispatcher.worker_id.clone(),
        );
        match scheduler.bootstrap().await? {
            BootstrapOutcome::Installed(count) => {
                tracing::info!("This worker owns the cron catalogue ({} entries)", count)
            }
            BootstrapOutcome::AlreadyOwned => {
                tracing::info!("Cron catalogue is owned by another worker")
            }
        }
        Some(scheduler)
    } else {
        None
    };

    if config.run_refresh_chain {
        let chain = match &cron {
            Some(scheduler) => scheduler.run_refresh_chain().await?,
            None => {
                CronScheduler::new(queue.clone(), Vec::new(), config.dispatcher.worker_id.clone())
                    .run_refresh_chain()
                    .await?
            }
        };
        if let Some(first) = chain.first() {
            tracing::info!("Refresh chain enqueued, starting with job {}", first);
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    if let Some(scheduler) = &cron
        && let Err(e) = scheduler.shutdown().await
    {
        tracing::warn!("Failed to release cron lock: {}", e);
    }

    match actors::queue_stats(&supervisor).await {
        Ok(stats) => tracing::info!(
            "Queue at shutdown: {} pending, {} running, {} completed, {} failed",
            stats.pending(),
            stats.running,
            stats.completed,
            stats.failed
        ),
        Err(e) => tracing::warn!("Failed to read queue stats: {}", e),
    }

    supervisor
        .send_message(SupervisorMessage::Shutdown)
        .map_err(|e| e.to_string())?;
    handle.await?;

    tracing::info!("Worker stopped");
    Ok(())
}
