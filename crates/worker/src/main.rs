//! billsync Background Worker
//!
//! Handles scheduled jobs:
//! - Reconciliation against the provider's subscription list (every 15
//!   minutes by default, `RECONCILE_CRON` to override)
//! - Hourly event outcome summary for operational visibility
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use billsync_engine::SyncEngine;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting billsync worker");

    let database_url =
        std::env::var("DATABASE_URL").map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = billsync_shared::create_pool(&database_url).await?;

    let engine = Arc::new(SyncEngine::from_env(pool)?);

    let scheduler = JobScheduler::new().await?;

    // Job 1: reconciliation pass on a fixed interval. A failed or partial
    // pass is retried on the next tick, never looped immediately.
    let reconcile_cron =
        std::env::var("RECONCILE_CRON").unwrap_or_else(|_| "0 */15 * * * *".to_string());
    let reconcile_engine = engine.clone();
    scheduler
        .add(Job::new_async(
            reconcile_cron.as_str(),
            move |_uuid, _l| {
                let engine = reconcile_engine.clone();
                Box::pin(async move {
                    info!("Running scheduled reconciliation pass");
                    let report = engine.reconciler.reconcile().await;
                    if report.partial || !report.errors.is_empty() {
                        error!(
                            partial = report.partial,
                            errors = report.errors.len(),
                            "Reconciliation pass completed with problems"
                        );
                    }
                })
            },
        )?)
        .await?;
    info!("Scheduled: reconciliation ({})", reconcile_cron);

    // Job 2: hourly outcome summary
    let summary_engine = engine.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let engine = summary_engine.clone();
            Box::pin(async move {
                let since = time::OffsetDateTime::now_utc() - time::Duration::hours(1);
                match engine.outcomes.event_summary(since).await {
                    Ok(summary) => info!(
                        total = summary.total,
                        succeeded = summary.succeeded,
                        failed = summary.failed,
                        processing = summary.processing,
                        "Hourly event outcome summary"
                    ),
                    Err(e) => error!(error = %e, "Failed to read outcome summary"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: outcome summary (hourly)");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("billsync worker started successfully with 3 scheduled jobs");

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
