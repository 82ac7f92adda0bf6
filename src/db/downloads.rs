//! Downloads database repository
//!
//! One row per acquisition attempt. The completion detector owns progress and
//! candidacy updates, the processing worker owns `final_path` and the terminal
//! status.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[cfg(feature = "sqlite")]
use sqlx::SqlitePool;

#[cfg(feature = "sqlite")]
type DbPool = SqlitePool;

/// Download lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Processing,
    Ready,
    Moved,
    Failed,
}

impl DownloadStatus {
    /// Forward order used to keep transitions monotonic.
    fn rank(self) -> u8 {
        match self {
            DownloadStatus::Queued => 0,
            DownloadStatus::Downloading | DownloadStatus::Paused => 1,
            DownloadStatus::Completed => 2,
            DownloadStatus::Processing => 3,
            DownloadStatus::Ready => 4,
            DownloadStatus::Moved => 5,
            DownloadStatus::Failed => 6,
        }
    }

    /// Statuses that client progress reports may no longer overwrite
    pub fn is_locked(self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed
                | DownloadStatus::Processing
                | DownloadStatus::Ready
                | DownloadStatus::Moved
                | DownloadStatus::Failed
        )
    }

    /// Whether a record in this status is still watched by the detector
    pub fn is_monitored(self) -> bool {
        matches!(
            self,
            DownloadStatus::Queued
                | DownloadStatus::Downloading
                | DownloadStatus::Paused
                | DownloadStatus::Completed
        )
    }

    /// Whether moving from `self` to `next` keeps the lifecycle monotonic.
    ///
    /// Failure may be entered from anywhere but `Moved`; leaving `Failed` is
    /// only allowed back into `Queued` or `Processing` (an explicit retry).
    pub fn can_transition_to(self, next: DownloadStatus) -> bool {
        if self == next {
            return true;
        }
        match (self, next) {
            (DownloadStatus::Moved, _) => false,
            (_, DownloadStatus::Failed) => true,
            (DownloadStatus::Failed, DownloadStatus::Queued)
            | (DownloadStatus::Failed, DownloadStatus::Processing) => true,
            (DownloadStatus::Failed, _) => false,
            (DownloadStatus::Downloading, DownloadStatus::Paused)
            | (DownloadStatus::Paused, DownloadStatus::Downloading) => true,
            (from, to) => to.rank() > from.rank(),
        }
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownloadStatus::Queued => write!(f, "queued"),
            DownloadStatus::Downloading => write!(f, "downloading"),
            DownloadStatus::Paused => write!(f, "paused"),
            DownloadStatus::Completed => write!(f, "completed"),
            DownloadStatus::Processing => write!(f, "processing"),
            DownloadStatus::Ready => write!(f, "ready"),
            DownloadStatus::Moved => write!(f, "moved"),
            DownloadStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for DownloadStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(DownloadStatus::Queued),
            "downloading" => Ok(DownloadStatus::Downloading),
            "paused" => Ok(DownloadStatus::Paused),
            "completed" => Ok(DownloadStatus::Completed),
            "processing" => Ok(DownloadStatus::Processing),
            "ready" => Ok(DownloadStatus::Ready),
            "moved" => Ok(DownloadStatus::Moved),
            "failed" => Ok(DownloadStatus::Failed),
            _ => Err(anyhow::anyhow!("Unknown download status: {}", s)),
        }
    }
}

/// Download record from database
#[derive(Debug, Clone, Serialize)]
pub struct DownloadRecord {
    pub id: Uuid,
    pub title: String,
    pub status: DownloadStatus,
    pub client_id: Option<Uuid>,
    /// Identifier the download client uses for this item
    pub client_item_id: Option<String>,
    pub library_item_id: Option<Uuid>,
    /// Path as reported by the download client
    pub download_path: Option<String>,
    /// Local path of the resolved source, set once finalization found it
    pub final_path: Option<String>,
    pub total_size: i64,
    pub downloaded_size: i64,
    pub progress: f64,
    /// Open key-value bag (alternate ids such as a torrent hash)
    pub metadata: HashMap<String, String>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl DownloadRecord {
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

#[cfg(feature = "sqlite")]
impl sqlx::FromRow<'_, sqlx::sqlite::SqliteRow> for DownloadRecord {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> sqlx::Result<Self> {
        use crate::db::sqlite_helpers::{
            decode_err, from_json_opt, str_to_datetime, str_to_datetime_opt, str_to_uuid,
            str_to_uuid_opt,
        };
        use sqlx::Row;

        let id_str: String = row.try_get("id")?;
        let status_str: String = row.try_get("status")?;
        let client_id_str: Option<String> = row.try_get("client_id")?;
        let item_id_str: Option<String> = row.try_get("library_item_id")?;
        let metadata_str: Option<String> = row.try_get("metadata")?;
        let started_at_str: String = row.try_get("started_at")?;
        let completed_at_str: Option<String> = row.try_get("completed_at")?;
        let updated_at_str: String = row.try_get("updated_at")?;

        Ok(Self {
            id: str_to_uuid(&id_str).map_err(decode_err)?,
            title: row.try_get("title")?,
            status: status_str.parse().map_err(decode_err)?,
            client_id: str_to_uuid_opt(client_id_str.as_deref()).map_err(decode_err)?,
            client_item_id: row.try_get("client_item_id")?,
            library_item_id: str_to_uuid_opt(item_id_str.as_deref()).map_err(decode_err)?,
            download_path: row.try_get("download_path")?,
            final_path: row.try_get("final_path")?,
            total_size: row.try_get("total_size")?,
            downloaded_size: row.try_get("downloaded_size")?,
            progress: row.try_get("progress")?,
            metadata: from_json_opt(metadata_str.as_deref())
                .map_err(decode_err)?
                .unwrap_or_default(),
            error_message: row.try_get("error_message")?,
            started_at: str_to_datetime(&started_at_str).map_err(decode_err)?,
            completed_at: str_to_datetime_opt(completed_at_str.as_deref()).map_err(decode_err)?,
            updated_at: str_to_datetime(&updated_at_str).map_err(decode_err)?,
        })
    }
}

/// Data for creating a new download
#[derive(Debug, Clone, Default)]
pub struct CreateDownload {
    pub title: String,
    pub client_id: Option<Uuid>,
    pub client_item_id: Option<String>,
    pub library_item_id: Option<Uuid>,
    pub download_path: Option<String>,
    pub total_size: i64,
    pub metadata: HashMap<String, String>,
}

/// Progress observed on one poll
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressUpdate {
    pub progress: f64,
    pub downloaded_size: i64,
    pub total_size: i64,
    pub status: DownloadStatus,
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, title, status, client_id, client_item_id, library_item_id,
           download_path, final_path, total_size, downloaded_size, progress,
           metadata, error_message, started_at, completed_at, updated_at
    FROM downloads
"#;

/// Downloads database repository
pub struct DownloadRepository {
    pool: DbPool,
}

impl DownloadRepository {
    /// Create a new repository instance
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get a download by ID
    #[cfg(feature = "sqlite")]
    pub async fn get(&self, id: Uuid) -> Result<Option<DownloadRecord>> {
        use crate::db::sqlite_helpers::uuid_to_str;

        let record = sqlx::query_as::<_, DownloadRecord>(&format!("{SELECT_COLUMNS} WHERE id = ?1"))
            .bind(uuid_to_str(id))
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    /// List downloads, newest first
    #[cfg(feature = "sqlite")]
    pub async fn list(&self, limit: i64) -> Result<Vec<DownloadRecord>> {
        let records = sqlx::query_as::<_, DownloadRecord>(&format!(
            "{SELECT_COLUMNS} ORDER BY started_at DESC LIMIT ?1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Downloads on a client that the detector still needs to watch
    #[cfg(feature = "sqlite")]
    pub async fn list_monitored_for_client(&self, client_id: Uuid) -> Result<Vec<DownloadRecord>> {
        use crate::db::sqlite_helpers::uuid_to_str;

        let records = sqlx::query_as::<_, DownloadRecord>(&format!(
            r#"{SELECT_COLUMNS}
            WHERE client_id = ?1
              AND status IN ('queued', 'downloading', 'paused', 'completed')
            ORDER BY started_at ASC"#
        ))
        .bind(uuid_to_str(client_id))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Create a new download
    #[cfg(feature = "sqlite")]
    pub async fn create(&self, data: CreateDownload) -> Result<DownloadRecord> {
        use crate::db::sqlite_helpers::{now_iso8601, to_json, uuid_to_str};

        let id = Uuid::new_v4();
        let now = now_iso8601();

        sqlx::query(
            r#"
            INSERT INTO downloads (
                id, title, status, client_id, client_item_id, library_item_id,
                download_path, total_size, metadata, started_at, updated_at
            )
            VALUES (?1, ?2, 'queued', ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
            "#,
        )
        .bind(uuid_to_str(id))
        .bind(&data.title)
        .bind(data.client_id.map(uuid_to_str))
        .bind(&data.client_item_id)
        .bind(data.library_item_id.map(uuid_to_str))
        .bind(&data.download_path)
        .bind(data.total_size)
        .bind(to_json(&data.metadata))
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.get(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Failed to retrieve download after insert"))
    }

    /// Apply progress from a poll.
    ///
    /// Rows already in a locked status keep their status and progress, so a
    /// late or out-of-order report can never move a record backwards.
    #[cfg(feature = "sqlite")]
    pub async fn update_progress(&self, id: Uuid, update: ProgressUpdate) -> Result<bool> {
        use crate::db::sqlite_helpers::{now_iso8601, uuid_to_str};

        let result = sqlx::query(
            r#"
            UPDATE downloads
            SET progress = ?2,
                downloaded_size = ?3,
                total_size = CASE WHEN ?4 > 0 THEN ?4 ELSE total_size END,
                status = ?5,
                updated_at = ?6
            WHERE id = ?1
              AND status NOT IN ('completed', 'processing', 'ready', 'moved', 'failed')
            "#,
        )
        .bind(uuid_to_str(id))
        .bind(update.progress)
        .bind(update.downloaded_size)
        .bind(update.total_size)
        .bind(update.status.to_string())
        .bind(now_iso8601())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Record that the client reported the download as finished
    #[cfg(feature = "sqlite")]
    pub async fn mark_completed(&self, id: Uuid, reported_path: Option<&str>) -> Result<()> {
        use crate::db::sqlite_helpers::{now_iso8601, uuid_to_str};

        sqlx::query(
            r#"
            UPDATE downloads
            SET status = 'completed',
                progress = 100.0,
                downloaded_size = CASE WHEN total_size > 0 THEN total_size ELSE downloaded_size END,
                download_path = COALESCE(?2, download_path),
                completed_at = COALESCE(completed_at, ?3),
                updated_at = ?3
            WHERE id = ?1
              AND status IN ('queued', 'downloading', 'paused', 'completed')
            "#,
        )
        .bind(uuid_to_str(id))
        .bind(reported_path)
        .bind(now_iso8601())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Move a download to a new status, refusing backwards transitions
    #[cfg(feature = "sqlite")]
    pub async fn set_status(
        &self,
        id: Uuid,
        status: DownloadStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        use crate::db::sqlite_helpers::{now_iso8601, uuid_to_str};

        let Some(current) = self.get(id).await? else {
            anyhow::bail!("Download {} not found", id);
        };
        if !current.status.can_transition_to(status) {
            tracing::debug!(
                download_id = %id,
                from = %current.status,
                to = %status,
                "Ignoring non-monotonic download status change"
            );
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE downloads
            SET status = ?2,
                error_message = ?3,
                updated_at = ?4
            WHERE id = ?1
            "#,
        )
        .bind(uuid_to_str(id))
        .bind(status.to_string())
        .bind(error_message)
        .bind(now_iso8601())
        .execute(&self.pool)
        .await?;

        Ok(true)
    }

    /// Record the resolved local source for a download
    #[cfg(feature = "sqlite")]
    pub async fn set_final_path(&self, id: Uuid, final_path: &str) -> Result<()> {
        use crate::db::sqlite_helpers::{now_iso8601, uuid_to_str};

        sqlx::query("UPDATE downloads SET final_path = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(uuid_to_str(id))
            .bind(final_path)
            .bind(now_iso8601())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Link a download to the library item it was imported into
    #[cfg(feature = "sqlite")]
    pub async fn set_library_item_id(&self, id: Uuid, item_id: Uuid) -> Result<()> {
        use crate::db::sqlite_helpers::{now_iso8601, uuid_to_str};

        sqlx::query(
            r#"
            UPDATE downloads
            SET library_item_id = ?2, updated_at = ?3
            WHERE id = ?1 AND library_item_id IS NULL
            "#,
        )
        .bind(uuid_to_str(id))
        .bind(uuid_to_str(item_id))
        .bind(now_iso8601())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Undo [`set_library_item_id`](Self::set_library_item_id) if the link still points at `item_id`
    #[cfg(feature = "sqlite")]
    pub async fn clear_library_item_id(&self, id: Uuid, item_id: Uuid) -> Result<()> {
        use crate::db::sqlite_helpers::{now_iso8601, uuid_to_str};

        sqlx::query(
            r#"
            UPDATE downloads
            SET library_item_id = NULL, updated_at = ?3
            WHERE id = ?1 AND library_item_id = ?2
            "#,
        )
        .bind(uuid_to_str(id))
        .bind(uuid_to_str(item_id))
        .bind(now_iso8601())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Remember the client-side id matched for this download
    #[cfg(feature = "sqlite")]
    pub async fn set_client_item_id(&self, id: Uuid, client_item_id: &str) -> Result<()> {
        use crate::db::sqlite_helpers::{now_iso8601, uuid_to_str};

        sqlx::query("UPDATE downloads SET client_item_id = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(uuid_to_str(id))
            .bind(client_item_id)
            .bind(now_iso8601())
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
