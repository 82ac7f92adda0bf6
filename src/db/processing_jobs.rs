//! Processing jobs database repository
//!
//! One row per finalization attempt of a download. Rows are never deleted by
//! the worker; completed and failed jobs are kept for audit until the retention
//! cleanup removes them.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[cfg(feature = "sqlite")]
use sqlx::SqlitePool;

#[cfg(feature = "sqlite")]
type DbPool = SqlitePool;

/// Processing job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Retry,
    Completed,
    Failed,
}

impl JobStatus {
    /// Non-terminal statuses; at most one such job may exist per download
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Processing | JobStatus::Retry)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Retry => write!(f, "retry"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "queued" | "pending" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "retry" => Ok(JobStatus::Retry),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(anyhow::anyhow!("Unknown job status: {}", s)),
        }
    }
}

/// Processing job record from database
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingJobRecord {
    pub id: Uuid,
    pub download_id: Uuid,
    pub job_type: String,
    pub status: JobStatus,
    pub priority: i32,
    /// Source path as resolved when the job was enqueued
    pub source_path: String,
    pub destination_path: Option<String>,
    pub client_id: Option<Uuid>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub error_message: Option<String>,
    pub processing_log: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl ProcessingJobRecord {
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

#[cfg(feature = "sqlite")]
impl sqlx::FromRow<'_, sqlx::sqlite::SqliteRow> for ProcessingJobRecord {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> sqlx::Result<Self> {
        use crate::db::sqlite_helpers::{
            decode_err, str_to_datetime, str_to_datetime_opt, str_to_uuid, str_to_uuid_opt,
        };
        use sqlx::Row;

        let id_str: String = row.try_get("id")?;
        let download_id_str: String = row.try_get("download_id")?;
        let status_str: String = row.try_get("status")?;
        let client_id_str: Option<String> = row.try_get("client_id")?;
        let created_at_str: String = row.try_get("created_at")?;
        let started_at_str: Option<String> = row.try_get("started_at")?;
        let updated_at_str: String = row.try_get("updated_at")?;
        let completed_at_str: Option<String> = row.try_get("completed_at")?;
        let next_retry_at_str: Option<String> = row.try_get("next_retry_at")?;

        Ok(Self {
            id: str_to_uuid(&id_str).map_err(decode_err)?,
            download_id: str_to_uuid(&download_id_str).map_err(decode_err)?,
            job_type: row.try_get("job_type")?,
            status: status_str.parse().map_err(decode_err)?,
            priority: row.try_get("priority")?,
            source_path: row.try_get("source_path")?,
            destination_path: row.try_get("destination_path")?,
            client_id: str_to_uuid_opt(client_id_str.as_deref()).map_err(decode_err)?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            error_message: row.try_get("error_message")?,
            processing_log: row.try_get("processing_log")?,
            created_at: str_to_datetime(&created_at_str).map_err(decode_err)?,
            started_at: str_to_datetime_opt(started_at_str.as_deref()).map_err(decode_err)?,
            updated_at: str_to_datetime(&updated_at_str).map_err(decode_err)?,
            completed_at: str_to_datetime_opt(completed_at_str.as_deref()).map_err(decode_err)?,
            next_retry_at: str_to_datetime_opt(next_retry_at_str.as_deref()).map_err(decode_err)?,
        })
    }
}

/// Data for creating a new processing job
#[derive(Debug, Clone)]
pub struct CreateProcessingJob {
    pub download_id: Uuid,
    pub source_path: String,
    pub client_id: Option<Uuid>,
    pub priority: i32,
    pub max_retries: i32,
}

/// Job counts per status
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct QueueStats {
    pub queued: i64,
    pub processing: i64,
    pub retry: i64,
    pub completed: i64,
    pub failed: i64,
    pub oldest_queued_at: Option<DateTime<Utc>>,
}

impl QueueStats {
    pub fn active(&self) -> i64 {
        self.queued + self.processing + self.retry
    }
}

/// Format a processing log line the way every job log is written
pub fn log_line(message: &str) -> String {
    format!("[{}] {}", Utc::now().format("%Y-%m-%d %H:%M:%S"), message)
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, download_id, job_type, status, priority, source_path, destination_path,
           client_id, retry_count, max_retries, error_message, processing_log,
           created_at, started_at, updated_at, completed_at, next_retry_at
    FROM processing_jobs
"#;

/// Processing jobs database repository
pub struct ProcessingJobRepository {
    pool: DbPool,
}

impl ProcessingJobRepository {
    /// Create a new repository instance
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get a job by ID
    #[cfg(feature = "sqlite")]
    pub async fn get(&self, id: Uuid) -> Result<Option<ProcessingJobRecord>> {
        use crate::db::sqlite_helpers::uuid_to_str;

        let record =
            sqlx::query_as::<_, ProcessingJobRecord>(&format!("{SELECT_COLUMNS} WHERE id = ?1"))
                .bind(uuid_to_str(id))
                .fetch_optional(&self.pool)
                .await?;

        Ok(record)
    }

    /// Get the non-terminal job for a download, if any
    #[cfg(feature = "sqlite")]
    pub async fn get_active_for_download(
        &self,
        download_id: Uuid,
    ) -> Result<Option<ProcessingJobRecord>> {
        use crate::db::sqlite_helpers::uuid_to_str;

        let record = sqlx::query_as::<_, ProcessingJobRecord>(&format!(
            r#"{SELECT_COLUMNS}
            WHERE download_id = ?1 AND status IN ('queued', 'processing', 'retry')
            LIMIT 1"#
        ))
        .bind(uuid_to_str(download_id))
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// All jobs ever created for a download, newest first
    #[cfg(feature = "sqlite")]
    pub async fn list_for_download(&self, download_id: Uuid) -> Result<Vec<ProcessingJobRecord>> {
        use crate::db::sqlite_helpers::uuid_to_str;

        let records = sqlx::query_as::<_, ProcessingJobRecord>(&format!(
            "{SELECT_COLUMNS} WHERE download_id = ?1 ORDER BY created_at DESC"
        ))
        .bind(uuid_to_str(download_id))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Insert a job unless the download already has an active one.
    ///
    /// Returns `None` when the partial unique index rejected the insert, which
    /// means another finalization won the race.
    #[cfg(feature = "sqlite")]
    pub async fn try_create(
        &self,
        data: CreateProcessingJob,
    ) -> Result<Option<ProcessingJobRecord>> {
        use crate::db::sqlite_helpers::{now_iso8601, uuid_to_str};

        let id = Uuid::new_v4();
        let now = now_iso8601();
        let log = log_line(&format!("Job created for source {}", data.source_path));

        let inserted = sqlx::query(
            r#"
            INSERT INTO processing_jobs (
                id, download_id, job_type, status, priority, source_path, client_id,
                retry_count, max_retries, processing_log, created_at, updated_at
            )
            VALUES (?1, ?2, 'import_download', 'queued', ?3, ?4, ?5, 0, ?6, ?7, ?8, ?8)
            "#,
        )
        .bind(uuid_to_str(id))
        .bind(uuid_to_str(data.download_id))
        .bind(data.priority)
        .bind(&data.source_path)
        .bind(data.client_id.map(uuid_to_str))
        .bind(data.max_retries)
        .bind(&log)
        .bind(&now)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => self.get(id).await,
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Highest-priority, oldest queued job
    #[cfg(feature = "sqlite")]
    pub async fn next_queued(&self) -> Result<Option<ProcessingJobRecord>> {
        let record = sqlx::query_as::<_, ProcessingJobRecord>(&format!(
            r#"{SELECT_COLUMNS}
            WHERE status = 'queued'
            ORDER BY priority DESC, created_at ASC
            LIMIT 1"#
        ))
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Atomically move a queued job to processing.
    ///
    /// Returns false if another worker claimed it first.
    #[cfg(feature = "sqlite")]
    pub async fn claim(&self, id: Uuid) -> Result<bool> {
        use crate::db::sqlite_helpers::{now_iso8601, uuid_to_str};

        let now = now_iso8601();
        let result = sqlx::query(
            r#"
            UPDATE processing_jobs
            SET status = 'processing',
                started_at = ?2,
                updated_at = ?2,
                processing_log = COALESCE(processing_log || char(10), '') || ?3
            WHERE id = ?1 AND status = 'queued'
            "#,
        )
        .bind(uuid_to_str(id))
        .bind(&now)
        .bind(log_line("Processing started"))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Retry jobs whose scheduled time has passed
    #[cfg(feature = "sqlite")]
    pub async fn due_retries(&self, now: DateTime<Utc>) -> Result<Vec<ProcessingJobRecord>> {
        use crate::db::sqlite_helpers::datetime_to_str;

        let records = sqlx::query_as::<_, ProcessingJobRecord>(&format!(
            r#"{SELECT_COLUMNS}
            WHERE status = 'retry' AND next_retry_at IS NOT NULL AND next_retry_at <= ?1
            ORDER BY next_retry_at ASC"#
        ))
        .bind(datetime_to_str(now))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Put a due retry back in the queue
    #[cfg(feature = "sqlite")]
    pub async fn requeue(&self, id: Uuid) -> Result<bool> {
        use crate::db::sqlite_helpers::{now_iso8601, uuid_to_str};

        let result = sqlx::query(
            r#"
            UPDATE processing_jobs
            SET status = 'queued',
                updated_at = ?2,
                processing_log = COALESCE(processing_log || char(10), '') || ?3
            WHERE id = ?1 AND status = 'retry'
            "#,
        )
        .bind(uuid_to_str(id))
        .bind(now_iso8601())
        .bind(log_line("Requeued for retry"))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Mark a job completed
    #[cfg(feature = "sqlite")]
    pub async fn mark_completed(
        &self,
        id: Uuid,
        destination_path: Option<&str>,
        message: &str,
    ) -> Result<()> {
        use crate::db::sqlite_helpers::{now_iso8601, uuid_to_str};

        let now = now_iso8601();
        sqlx::query(
            r#"
            UPDATE processing_jobs
            SET status = 'completed',
                destination_path = COALESCE(?2, destination_path),
                error_message = NULL,
                next_retry_at = NULL,
                completed_at = ?3,
                updated_at = ?3,
                processing_log = COALESCE(processing_log || char(10), '') || ?4
            WHERE id = ?1
            "#,
        )
        .bind(uuid_to_str(id))
        .bind(destination_path)
        .bind(&now)
        .bind(log_line(message))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Schedule a retry with an incremented retry count
    #[cfg(feature = "sqlite")]
    pub async fn mark_retry(
        &self,
        id: Uuid,
        retry_count: i32,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<()> {
        use crate::db::sqlite_helpers::{datetime_to_str, now_iso8601, uuid_to_str};

        sqlx::query(
            r#"
            UPDATE processing_jobs
            SET status = 'retry',
                retry_count = ?2,
                error_message = ?3,
                next_retry_at = ?4,
                updated_at = ?5,
                processing_log = COALESCE(processing_log || char(10), '') || ?6
            WHERE id = ?1
            "#,
        )
        .bind(uuid_to_str(id))
        .bind(retry_count)
        .bind(error)
        .bind(datetime_to_str(next_retry_at))
        .bind(now_iso8601())
        .bind(log_line(&format!(
            "Retry {} scheduled for {}: {}",
            retry_count,
            datetime_to_str(next_retry_at),
            error
        )))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Mark a job failed terminally
    #[cfg(feature = "sqlite")]
    pub async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()> {
        use crate::db::sqlite_helpers::{now_iso8601, uuid_to_str};

        let now = now_iso8601();
        sqlx::query(
            r#"
            UPDATE processing_jobs
            SET status = 'failed',
                error_message = ?2,
                next_retry_at = NULL,
                completed_at = ?3,
                updated_at = ?3,
                processing_log = COALESCE(processing_log || char(10), '') || ?4
            WHERE id = ?1
            "#,
        )
        .bind(uuid_to_str(id))
        .bind(error)
        .bind(&now)
        .bind(log_line(&format!("Failed: {}", error)))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Append a line to a job's processing log
    #[cfg(feature = "sqlite")]
    pub async fn append_log(&self, id: Uuid, message: &str) -> Result<()> {
        use crate::db::sqlite_helpers::uuid_to_str;

        sqlx::query(
            r#"
            UPDATE processing_jobs
            SET processing_log = COALESCE(processing_log || char(10), '') || ?2
            WHERE id = ?1
            "#,
        )
        .bind(uuid_to_str(id))
        .bind(log_line(message))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Requeue jobs left in processing by a worker that stopped mid-job
    #[cfg(feature = "sqlite")]
    pub async fn requeue_interrupted(&self) -> Result<u64> {
        use crate::db::sqlite_helpers::now_iso8601;

        let result = sqlx::query(
            r#"
            UPDATE processing_jobs
            SET status = 'queued',
                updated_at = ?1,
                processing_log = COALESCE(processing_log || char(10), '') || ?2
            WHERE status = 'processing'
            "#,
        )
        .bind(now_iso8601())
        .bind(log_line("Requeued after interrupted processing"))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Reset a failed job so the worker picks it up again.
    ///
    /// Returns false if the job is not failed or the download already has
    /// another active job.
    #[cfg(feature = "sqlite")]
    pub async fn reset_failed(&self, id: Uuid) -> Result<bool> {
        use crate::db::sqlite_helpers::{now_iso8601, uuid_to_str};

        let result = sqlx::query(
            r#"
            UPDATE processing_jobs
            SET status = 'queued',
                retry_count = 0,
                error_message = NULL,
                next_retry_at = NULL,
                completed_at = NULL,
                updated_at = ?2,
                processing_log = COALESCE(processing_log || char(10), '') || ?3
            WHERE id = ?1 AND status = 'failed'
            "#,
        )
        .bind(uuid_to_str(id))
        .bind(now_iso8601())
        .bind(log_line("Manually requeued"))
        .execute(&self.pool)
        .await;

        match result {
            Ok(r) => Ok(r.rows_affected() == 1),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Job counts per status plus the age of the oldest queued job
    #[cfg(feature = "sqlite")]
    pub async fn stats(&self) -> Result<QueueStats> {
        use crate::db::sqlite_helpers::str_to_datetime_opt;

        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM processing_jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            match status.parse::<JobStatus>() {
                Ok(JobStatus::Queued) => stats.queued = count,
                Ok(JobStatus::Processing) => stats.processing = count,
                Ok(JobStatus::Retry) => stats.retry = count,
                Ok(JobStatus::Completed) => stats.completed = count,
                Ok(JobStatus::Failed) => stats.failed = count,
                Err(_) => tracing::warn!(status = %status, "Unknown job status in queue stats"),
            }
        }

        let oldest: Option<(String,)> = sqlx::query_as(
            "SELECT MIN(created_at) FROM processing_jobs WHERE status = 'queued' HAVING COUNT(*) > 0",
        )
        .fetch_optional(&self.pool)
        .await?;
        stats.oldest_queued_at = str_to_datetime_opt(oldest.as_ref().map(|(s,)| s.as_str()))?;

        Ok(stats)
    }

    /// Most recently touched jobs
    #[cfg(feature = "sqlite")]
    pub async fn recent(&self, limit: i64) -> Result<Vec<ProcessingJobRecord>> {
        let records = sqlx::query_as::<_, ProcessingJobRecord>(&format!(
            "{SELECT_COLUMNS} ORDER BY updated_at DESC LIMIT ?1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Delete completed and failed jobs finished before `cutoff`
    #[cfg(feature = "sqlite")]
    pub async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        use crate::db::sqlite_helpers::datetime_to_str;

        let result = sqlx::query(
            r#"
            DELETE FROM processing_jobs
            WHERE status IN ('completed', 'failed')
              AND COALESCE(completed_at, updated_at) < ?1
            "#,
        )
        .bind(datetime_to_str(cutoff))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CreateDownload, Database};
    use assert_matches::assert_matches;
    use chrono::Duration;

    async fn setup() -> (Database, Uuid) {
        let db = Database::in_memory().await.unwrap();
        let download = db
            .downloads()
            .create(CreateDownload {
                title: "Project Hail Mary".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        (db, download.id)
    }

    fn new_job(download_id: Uuid) -> CreateProcessingJob {
        CreateProcessingJob {
            download_id,
            source_path: "/downloads/Project Hail Mary".to_string(),
            client_id: None,
            priority: 0,
            max_retries: 3,
        }
    }

    #[tokio::test]
    async fn test_second_active_job_is_rejected() {
        let (db, download_id) = setup().await;
        let repo = db.processing_jobs();

        let first = repo.try_create(new_job(download_id)).await.unwrap();
        assert_matches!(first, Some(ref job) if job.status == JobStatus::Queued);

        let second = repo.try_create(new_job(download_id)).await.unwrap();
        assert!(second.is_none());

        // Once the first job is terminal a new one is allowed
        let first = first.unwrap();
        repo.mark_completed(first.id, None, "done").await.unwrap();
        assert!(repo.try_create(new_job(download_id)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let (db, download_id) = setup().await;
        let repo = db.processing_jobs();
        let job = repo.try_create(new_job(download_id)).await.unwrap().unwrap();

        assert!(repo.claim(job.id).await.unwrap());
        assert!(!repo.claim(job.id).await.unwrap());

        let stored = repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
        assert!(stored.started_at.is_some());
        assert!(stored.processing_log.unwrap().contains("Processing started"));
    }

    #[tokio::test]
    async fn test_retry_becomes_due_and_requeues() {
        let (db, download_id) = setup().await;
        let repo = db.processing_jobs();
        let job = repo.try_create(new_job(download_id)).await.unwrap().unwrap();
        repo.claim(job.id).await.unwrap();

        let next = Utc::now() + Duration::seconds(30);
        repo.mark_retry(job.id, 1, "Source file not found", next).await.unwrap();

        assert!(repo.due_retries(Utc::now()).await.unwrap().is_empty());
        let due = repo.due_retries(next + Duration::seconds(1)).await.unwrap();
        assert_eq!(due.len(), 1);

        assert!(repo.requeue(job.id).await.unwrap());
        let stored = repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.retry_count, 1);
    }

    #[tokio::test]
    async fn test_next_queued_prefers_priority() {
        let db = Database::in_memory().await.unwrap();
        let repo = db.processing_jobs();
        let mut ids = Vec::new();
        for (title, priority) in [("Low", 0), ("High", 5)] {
            let download = db
                .downloads()
                .create(CreateDownload {
                    title: title.to_string(),
                    ..Default::default()
                })
                .await
                .unwrap();
            let mut data = new_job(download.id);
            data.priority = priority;
            ids.push(repo.try_create(data).await.unwrap().unwrap().id);
        }

        let next = repo.next_queued().await.unwrap().unwrap();
        assert_eq!(next.id, ids[1]);
    }

    #[tokio::test]
    async fn test_stats_and_cleanup() {
        let (db, download_id) = setup().await;
        let repo = db.processing_jobs();
        let job = repo.try_create(new_job(download_id)).await.unwrap().unwrap();

        let stats = repo.stats().await.unwrap();
        assert_eq!(stats.queued, 1);
        assert!(stats.oldest_queued_at.is_some());

        repo.mark_failed(job.id, "gave up").await.unwrap();
        let stats = repo.stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.active(), 0);
        assert!(stats.oldest_queued_at.is_none());

        assert_eq!(repo.delete_finished_before(Utc::now() - Duration::days(7)).await.unwrap(), 0);
        assert_eq!(repo.delete_finished_before(Utc::now() + Duration::seconds(1)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reset_failed_job() {
        let (db, download_id) = setup().await;
        let repo = db.processing_jobs();
        let job = repo.try_create(new_job(download_id)).await.unwrap().unwrap();
        repo.mark_retry(job.id, 3, "missing", Utc::now()).await.unwrap();
        repo.mark_failed(job.id, "Max retries (3) exceeded").await.unwrap();

        assert!(repo.reset_failed(job.id).await.unwrap());
        let stored = repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.retry_count, 0);
        assert!(stored.error_message.is_none());
    }

    #[tokio::test]
    async fn test_interrupted_jobs_are_requeued() {
        let (db, download_id) = setup().await;
        let repo = db.processing_jobs();
        let job = repo.try_create(new_job(download_id)).await.unwrap().unwrap();
        repo.claim(job.id).await.unwrap();

        assert_eq!(repo.requeue_interrupted().await.unwrap(), 1);
        let stored = repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(repo.requeue_interrupted().await.unwrap(), 0);
    }
}
