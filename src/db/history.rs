//! Import history (audit log) repository
//!
//! Policy decisions such as a quality skip or a containment refusal are not
//! errors, but they must stay inspectable, so they are recorded here next to
//! the successful imports.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[cfg(feature = "sqlite")]
use sqlx::SqlitePool;

#[cfg(feature = "sqlite")]
type DbPool = SqlitePool;

/// Kind of history event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryEventType {
    /// A file was placed in the library and recorded
    FileAdded,
    /// A whole download finished importing
    Imported,
    /// A candidate was not imported because existing content is as good or better
    QualitySkipped,
    /// A file was refused because it lies outside its item's directory
    Refused,
    /// A file or archive could not be processed
    Failed,
}

impl std::fmt::Display for HistoryEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HistoryEventType::FileAdded => write!(f, "file_added"),
            HistoryEventType::Imported => write!(f, "imported"),
            HistoryEventType::QualitySkipped => write!(f, "quality_skipped"),
            HistoryEventType::Refused => write!(f, "refused"),
            HistoryEventType::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for HistoryEventType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "file_added" => Ok(HistoryEventType::FileAdded),
            "imported" => Ok(HistoryEventType::Imported),
            "quality_skipped" => Ok(HistoryEventType::QualitySkipped),
            "refused" => Ok(HistoryEventType::Refused),
            "failed" => Ok(HistoryEventType::Failed),
            _ => Err(anyhow::anyhow!("Unknown history event type: {}", s)),
        }
    }
}

/// History record from database
#[derive(Debug, Clone, Serialize)]
pub struct HistoryRecord {
    pub id: Uuid,
    pub event_type: HistoryEventType,
    pub item_id: Option<Uuid>,
    pub download_id: Option<Uuid>,
    pub message: String,
    pub details: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
}

#[cfg(feature = "sqlite")]
impl sqlx::FromRow<'_, sqlx::sqlite::SqliteRow> for HistoryRecord {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> sqlx::Result<Self> {
        use crate::db::sqlite_helpers::{
            decode_err, from_json_opt, str_to_datetime, str_to_uuid, str_to_uuid_opt,
        };
        use sqlx::Row;

        let id_str: String = row.try_get("id")?;
        let event_type_str: String = row.try_get("event_type")?;
        let item_id_str: Option<String> = row.try_get("item_id")?;
        let download_id_str: Option<String> = row.try_get("download_id")?;
        let details_str: Option<String> = row.try_get("details")?;
        let created_at_str: String = row.try_get("created_at")?;

        Ok(Self {
            id: str_to_uuid(&id_str).map_err(decode_err)?,
            event_type: event_type_str.parse().map_err(decode_err)?,
            item_id: str_to_uuid_opt(item_id_str.as_deref()).map_err(decode_err)?,
            download_id: str_to_uuid_opt(download_id_str.as_deref()).map_err(decode_err)?,
            message: row.try_get("message")?,
            details: from_json_opt(details_str.as_deref()).map_err(decode_err)?,
            created_at: str_to_datetime(&created_at_str).map_err(decode_err)?,
        })
    }
}

/// Data for a new history entry
#[derive(Debug, Clone)]
pub struct CreateHistoryEntry {
    pub event_type: HistoryEventType,
    pub item_id: Option<Uuid>,
    pub download_id: Option<Uuid>,
    pub message: String,
    pub details: Option<JsonValue>,
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, event_type, item_id, download_id, message, details, created_at
    FROM history
"#;

/// History database repository
pub struct HistoryRepository {
    pool: DbPool,
}

impl HistoryRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    #[cfg(feature = "sqlite")]
    pub async fn record(&self, entry: CreateHistoryEntry) -> Result<Uuid> {
        use crate::db::sqlite_helpers::{now_iso8601, to_json, uuid_to_str};

        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO history (id, event_type, item_id, download_id, message, details, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(uuid_to_str(id))
        .bind(entry.event_type.to_string())
        .bind(entry.item_id.map(uuid_to_str))
        .bind(entry.download_id.map(uuid_to_str))
        .bind(&entry.message)
        .bind(entry.details.as_ref().map(to_json))
        .bind(now_iso8601())
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Most recent entries, optionally filtered by type
    #[cfg(feature = "sqlite")]
    pub async fn list(
        &self,
        event_type: Option<HistoryEventType>,
        limit: i64,
    ) -> Result<Vec<HistoryRecord>> {
        let records = match event_type {
            Some(event_type) => {
                sqlx::query_as::<_, HistoryRecord>(&format!(
                    "{SELECT_COLUMNS} WHERE event_type = ?1 ORDER BY created_at DESC LIMIT ?2"
                ))
                .bind(event_type.to_string())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, HistoryRecord>(&format!(
                    "{SELECT_COLUMNS} ORDER BY created_at DESC LIMIT ?1"
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(records)
    }

    #[cfg(feature = "sqlite")]
    pub async fn list_for_download(&self, download_id: Uuid) -> Result<Vec<HistoryRecord>> {
        use crate::db::sqlite_helpers::uuid_to_str;

        let records = sqlx::query_as::<_, HistoryRecord>(&format!(
            "{SELECT_COLUMNS} WHERE download_id = ?1 ORDER BY created_at ASC"
        ))
        .bind(uuid_to_str(download_id))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}
