//! Handler registry for the worker binary.
//!
//! The bodies only log and report progress. The services they drive (video
//! catalogue, channel store, subscription sync, downloads) live outside this
//! workspace and are wired in by replacing the entries here.

use actors::{FnHandler, JobBody, JobContext, JobHandlerRegistry, job_handler};
use job_core::JobKind;
use serde_json::json;

pub fn registry() -> JobHandlerRegistry {
    JobHandlerRegistry::new()
        .with(job_handler!(JobKind::RefreshVideoCategories, |ctx| {
            let force = ctx.payload()["force"].as_bool().unwrap_or(false);
            tracing::info!("Refreshing video categories (force: {})", force);
            Ok(Some(json!({ "force": force })))
        }))
        .with(job_handler!(JobKind::RefreshActiveChannels, |ctx| {
            tracing::info!("Refreshing active channels for job {}", ctx.job().id);
            ctx.report_progress(json!({ "stage": "channels" }))
                .await
                .map_err(|e| e.to_string())?;
            Ok(None)
        }))
        .with(job_handler!(JobKind::RefreshSubscriptions, |ctx| {
            match ctx.payload()["email"].as_str() {
                Some(email) => tracing::info!("Refreshing subscriptions for {}", email),
                None => tracing::info!("Refreshing subscriptions for all users"),
            }
            Ok(None)
        }))
        .with(job_handler!(JobKind::ChannelCleanup, |_ctx| {
            tracing::info!("Cleaning up unused channels");
            Ok(None)
        }))
        .with(job_handler!(JobKind::CleanupJobs, |_ctx| {
            tracing::info!("Cleaning up finished jobs");
            Ok(None)
        }))
        .with(FnHandler::new(JobKind::MusicDownload, download))
}

fn download(ctx: JobContext) -> JobBody {
    let request = ctx.payload()["job_id"].as_str().unwrap_or_default().to_string();
    JobBody::blocking(move || {
        tracing::info!("Downloading music for request {}", request);
        ctx.report_progress_blocking(json!({ "request": request, "percent": 100 }))
            .map_err(|e| e.to_string())?;
        Ok(Some(json!({ "request": request })))
    })
}
