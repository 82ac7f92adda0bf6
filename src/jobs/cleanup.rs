//! Retention cleanup for finished jobs and stale extraction directories

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::info;

use crate::db::Database;
use crate::services::extractor::ExtractorService;

/// Extraction directories older than this are assumed abandoned
pub const STALE_EXTRACTION_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// What one cleanup pass removed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub jobs_deleted: u64,
    pub extractions_removed: usize,
}

/// Delete completed/failed jobs past retention and stale extraction dirs
pub async fn run_cleanup(
    db: &Database,
    extractor: &ExtractorService,
    retention_days: i64,
) -> Result<CleanupReport> {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days.max(0));
    let jobs_deleted = db.processing_jobs().delete_finished_before(cutoff).await?;
    let extractions_removed = extractor
        .cleanup_old_extractions(STALE_EXTRACTION_AGE)
        .await?;

    info!(
        jobs_deleted,
        extractions_removed,
        retention_days,
        "Retention cleanup completed"
    );
    Ok(CleanupReport {
        jobs_deleted,
        extractions_removed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CreateDownload, CreateProcessingJob};

    #[tokio::test]
    async fn test_cleanup_keeps_active_and_recent_jobs() {
        let db = Database::in_memory().await.unwrap();
        let work = tempfile::tempdir().unwrap();
        let extractor = ExtractorService::new(work.path().to_path_buf());

        let download = db
            .downloads()
            .create(CreateDownload {
                title: "Leviathan Wakes".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let job = db
            .processing_jobs()
            .try_create(CreateProcessingJob {
                download_id: download.id,
                source_path: "/downloads/Leviathan Wakes".to_string(),
                client_id: None,
                priority: 0,
                max_retries: 3,
            })
            .await
            .unwrap()
            .unwrap();

        let report = run_cleanup(&db, &extractor, 0).await.unwrap();
        assert_eq!(report.jobs_deleted, 0);
        assert!(db.processing_jobs().get(job.id).await.unwrap().is_some());

        db.processing_jobs().mark_failed(job.id, "gone").await.unwrap();
        let report = run_cleanup(&db, &extractor, 7).await.unwrap();
        assert_eq!(report.jobs_deleted, 0);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let report = run_cleanup(&db, &extractor, 0).await.unwrap();
        assert_eq!(report.jobs_deleted, 1);
        assert!(db.processing_jobs().get(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_without_work_dir() {
        let db = Database::in_memory().await.unwrap();
        let extractor = ExtractorService::new("/nonexistent/librarian-work".into());

        let report = run_cleanup(&db, &extractor, 7).await.unwrap();
        assert_eq!(report, CleanupReport::default());
    }
}
