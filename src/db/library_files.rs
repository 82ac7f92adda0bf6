//! Library files database repository
//!
//! A library file is an audio file already associated with a library item.
//! Rows are only written by the importer after a successful placement.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[cfg(feature = "sqlite")]
use sqlx::SqlitePool;

#[cfg(feature = "sqlite")]
type DbPool = SqlitePool;

/// Library file record from database
#[derive(Debug, Clone, Serialize)]
pub struct LibraryFileRecord {
    pub id: Uuid,
    pub item_id: Uuid,
    pub path: String,
    pub size_bytes: i64,
    pub duration_secs: Option<f64>,
    /// Audio format, lowercase extension style ("mp3", "flac", "m4b")
    pub format: Option<String>,
    pub container: Option<String>,
    pub codec: Option<String>,
    /// Bitrate in kbps
    pub bitrate: Option<i32>,
    pub sample_rate: Option<i32>,
    pub channels: Option<i32>,
    /// Provenance tag ("download", "scan", "manual")
    pub source: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(feature = "sqlite")]
impl sqlx::FromRow<'_, sqlx::sqlite::SqliteRow> for LibraryFileRecord {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> sqlx::Result<Self> {
        use crate::db::sqlite_helpers::{decode_err, str_to_datetime, str_to_uuid};
        use sqlx::Row;

        let id_str: String = row.try_get("id")?;
        let item_id_str: String = row.try_get("item_id")?;
        let created_at_str: String = row.try_get("created_at")?;

        Ok(Self {
            id: str_to_uuid(&id_str).map_err(decode_err)?,
            item_id: str_to_uuid(&item_id_str).map_err(decode_err)?,
            path: row.try_get("path")?,
            size_bytes: row.try_get("size_bytes")?,
            duration_secs: row.try_get("duration_secs")?,
            format: row.try_get("format")?,
            container: row.try_get("container")?,
            codec: row.try_get("codec")?,
            bitrate: row.try_get("bitrate")?,
            sample_rate: row.try_get("sample_rate")?,
            channels: row.try_get("channels")?,
            source: row.try_get("source")?,
            created_at: str_to_datetime(&created_at_str).map_err(decode_err)?,
        })
    }
}

/// Data for creating a library file
#[derive(Debug, Clone, Default)]
pub struct CreateLibraryFile {
    pub item_id: Uuid,
    pub path: String,
    pub size_bytes: i64,
    pub duration_secs: Option<f64>,
    pub format: Option<String>,
    pub container: Option<String>,
    pub codec: Option<String>,
    pub bitrate: Option<i32>,
    pub sample_rate: Option<i32>,
    pub channels: Option<i32>,
    pub source: String,
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, item_id, path, size_bytes, duration_secs, format, container, codec,
           bitrate, sample_rate, channels, source, created_at
    FROM library_files
"#;

/// Library files database repository
pub struct LibraryFileRepository {
    pool: DbPool,
}

impl LibraryFileRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    #[cfg(feature = "sqlite")]
    pub async fn get(&self, id: Uuid) -> Result<Option<LibraryFileRecord>> {
        use crate::db::sqlite_helpers::uuid_to_str;

        let record =
            sqlx::query_as::<_, LibraryFileRecord>(&format!("{SELECT_COLUMNS} WHERE id = ?1"))
                .bind(uuid_to_str(id))
                .fetch_optional(&self.pool)
                .await?;

        Ok(record)
    }

    /// All files associated with an item
    #[cfg(feature = "sqlite")]
    pub async fn list_for_item(&self, item_id: Uuid) -> Result<Vec<LibraryFileRecord>> {
        use crate::db::sqlite_helpers::uuid_to_str;

        let records = sqlx::query_as::<_, LibraryFileRecord>(&format!(
            "{SELECT_COLUMNS} WHERE item_id = ?1 ORDER BY created_at ASC"
        ))
        .bind(uuid_to_str(item_id))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    /// Insert a file record.
    ///
    /// Returns `None` if the (item, path) pair already exists, which callers
    /// treat as "already recorded" rather than an error.
    #[cfg(feature = "sqlite")]
    pub async fn create(&self, data: CreateLibraryFile) -> Result<Option<LibraryFileRecord>> {
        use crate::db::sqlite_helpers::{now_iso8601, uuid_to_str};

        let id = Uuid::new_v4();

        let inserted = sqlx::query(
            r#"
            INSERT INTO library_files (
                id, item_id, path, size_bytes, duration_secs, format, container, codec,
                bitrate, sample_rate, channels, source, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(uuid_to_str(id))
        .bind(uuid_to_str(data.item_id))
        .bind(&data.path)
        .bind(data.size_bytes)
        .bind(data.duration_secs)
        .bind(&data.format)
        .bind(&data.container)
        .bind(&data.codec)
        .bind(data.bitrate)
        .bind(data.sample_rate)
        .bind(data.channels)
        .bind(&data.source)
        .bind(now_iso8601())
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => self.get(id).await,
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    #[cfg(feature = "sqlite")]
    pub async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM library_files")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CreateLibraryItem, Database};

    #[tokio::test]
    async fn test_duplicate_path_is_already_created() {
        let db = Database::in_memory().await.unwrap();
        let item = db
            .library_items()
            .create(CreateLibraryItem {
                title: "Leviathan Wakes".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let data = CreateLibraryFile {
            item_id: item.id,
            path: "James S. A. Corey/Leviathan Wakes/part1.mp3".to_string(),
            bitrate: Some(128),
            source: "download".to_string(),
            ..Default::default()
        };

        assert!(db.library_files().create(data.clone()).await.unwrap().is_some());
        assert!(db.library_files().create(data).await.unwrap().is_none());
        assert_eq!(db.library_files().list_for_item(item.id).await.unwrap().len(), 1);
    }
}
