//! Scheduled maintenance jobs

pub mod cleanup;

use std::sync::Arc;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::db::Database;
use crate::services::extractor::ExtractorService;

/// Initialize and start the job scheduler
pub async fn start_scheduler(
    db: Database,
    extractor: Arc<ExtractorService>,
    retention_days: i64,
) -> anyhow::Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    // Retention cleanup - run daily at 3 AM
    let cleanup_job = Job::new_async("0 0 3 * * *", move |_uuid, _l| {
        let db = db.clone();
        let extractor = extractor.clone();
        Box::pin(async move {
            info!("Running retention cleanup");
            if let Err(e) = cleanup::run_cleanup(&db, &extractor, retention_days).await {
                tracing::error!("Retention cleanup error: {}", e);
            }
        })
    })?;
    scheduler.add(cleanup_job).await?;

    scheduler.start().await?;

    info!("Job scheduler started");
    Ok(scheduler)
}
