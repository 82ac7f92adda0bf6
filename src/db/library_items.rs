//! Library items (audiobooks) database repository

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[cfg(feature = "sqlite")]
use sqlx::SqlitePool;

#[cfg(feature = "sqlite")]
type DbPool = SqlitePool;

/// Library item record from database
#[derive(Debug, Clone, Serialize)]
pub struct LibraryItemRecord {
    pub id: Uuid,
    pub title: String,
    pub author: Option<String>,
    pub series: Option<String>,
    pub series_number: Option<String>,
    pub year: Option<i32>,
    pub narrator: Option<String>,
    /// Directory all of this item's files live under, once known
    pub base_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(feature = "sqlite")]
impl sqlx::FromRow<'_, sqlx::sqlite::SqliteRow> for LibraryItemRecord {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> sqlx::Result<Self> {
        use crate::db::sqlite_helpers::{decode_err, str_to_datetime, str_to_uuid};
        use sqlx::Row;

        let id_str: String = row.try_get("id")?;
        let created_at_str: String = row.try_get("created_at")?;
        let updated_at_str: String = row.try_get("updated_at")?;

        Ok(Self {
            id: str_to_uuid(&id_str).map_err(decode_err)?,
            title: row.try_get("title")?,
            author: row.try_get("author")?,
            series: row.try_get("series")?,
            series_number: row.try_get("series_number")?,
            year: row.try_get("year")?,
            narrator: row.try_get("narrator")?,
            base_path: row.try_get("base_path")?,
            created_at: str_to_datetime(&created_at_str).map_err(decode_err)?,
            updated_at: str_to_datetime(&updated_at_str).map_err(decode_err)?,
        })
    }
}

/// Data for creating a library item
#[derive(Debug, Clone, Default)]
pub struct CreateLibraryItem {
    pub title: String,
    pub author: Option<String>,
    pub series: Option<String>,
    pub series_number: Option<String>,
    pub year: Option<i32>,
    pub narrator: Option<String>,
    pub base_path: Option<String>,
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, title, author, series, series_number, year, narrator, base_path,
           created_at, updated_at
    FROM library_items
"#;

/// Library items database repository
pub struct LibraryItemRepository {
    pool: DbPool,
}

impl LibraryItemRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    #[cfg(feature = "sqlite")]
    pub async fn get(&self, id: Uuid) -> Result<Option<LibraryItemRecord>> {
        use crate::db::sqlite_helpers::uuid_to_str;

        let record =
            sqlx::query_as::<_, LibraryItemRecord>(&format!("{SELECT_COLUMNS} WHERE id = ?1"))
                .bind(uuid_to_str(id))
                .fetch_optional(&self.pool)
                .await?;

        Ok(record)
    }

    #[cfg(feature = "sqlite")]
    pub async fn list(&self) -> Result<Vec<LibraryItemRecord>> {
        let records =
            sqlx::query_as::<_, LibraryItemRecord>(&format!("{SELECT_COLUMNS} ORDER BY title"))
                .fetch_all(&self.pool)
                .await?;

        Ok(records)
    }

    #[cfg(feature = "sqlite")]
    pub async fn create(&self, data: CreateLibraryItem) -> Result<LibraryItemRecord> {
        use crate::db::sqlite_helpers::{now_iso8601, uuid_to_str};

        let id = Uuid::new_v4();
        let now = now_iso8601();

        sqlx::query(
            r#"
            INSERT INTO library_items (
                id, title, author, series, series_number, year, narrator, base_path,
                created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
            "#,
        )
        .bind(uuid_to_str(id))
        .bind(&data.title)
        .bind(&data.author)
        .bind(&data.series)
        .bind(&data.series_number)
        .bind(data.year)
        .bind(&data.narrator)
        .bind(&data.base_path)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.get(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Failed to retrieve library item after insert"))
    }

    /// Set the item's base directory if it has none yet
    #[cfg(feature = "sqlite")]
    pub async fn set_base_path_if_missing(&self, id: Uuid, base_path: &str) -> Result<()> {
        use crate::db::sqlite_helpers::{now_iso8601, uuid_to_str};

        sqlx::query(
            r#"
            UPDATE library_items
            SET base_path = ?2, updated_at = ?3
            WHERE id = ?1 AND (base_path IS NULL OR base_path = '')
            "#,
        )
        .bind(uuid_to_str(id))
        .bind(base_path)
        .bind(now_iso8601())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Forget the base directory of an item that still has no files
    #[cfg(feature = "sqlite")]
    pub async fn clear_base_path_if_empty(&self, id: Uuid) -> Result<bool> {
        use crate::db::sqlite_helpers::{now_iso8601, uuid_to_str};

        let result = sqlx::query(
            r#"
            UPDATE library_items
            SET base_path = NULL, updated_at = ?2
            WHERE id = ?1
              AND NOT EXISTS (SELECT 1 FROM library_files WHERE item_id = ?1)
            "#,
        )
        .bind(uuid_to_str(id))
        .bind(now_iso8601())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Delete an item that never received a file
    #[cfg(feature = "sqlite")]
    pub async fn delete_if_empty(&self, id: Uuid) -> Result<bool> {
        use crate::db::sqlite_helpers::uuid_to_str;

        let result = sqlx::query(
            r#"
            DELETE FROM library_items
            WHERE id = ?1
              AND NOT EXISTS (SELECT 1 FROM library_files WHERE item_id = ?1)
            "#,
        )
        .bind(uuid_to_str(id))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
