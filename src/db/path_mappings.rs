//! Remote path mappings repository
//!
//! A mapping rewrites the prefix a download client reports (its own view of
//! the filesystem, often inside a container or on another host) into the
//! prefix this process sees.

use anyhow::Result;
use serde::Serialize;
use uuid::Uuid;

#[cfg(feature = "sqlite")]
use sqlx::SqlitePool;

#[cfg(feature = "sqlite")]
type DbPool = SqlitePool;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PathMappingRecord {
    pub id: Uuid,
    pub client_id: Uuid,
    pub remote_path: String,
    pub local_path: String,
}

#[cfg(feature = "sqlite")]
impl sqlx::FromRow<'_, sqlx::sqlite::SqliteRow> for PathMappingRecord {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> sqlx::Result<Self> {
        use crate::db::sqlite_helpers::{decode_err, str_to_uuid};
        use sqlx::Row;

        let id_str: String = row.try_get("id")?;
        let client_id_str: String = row.try_get("client_id")?;

        Ok(Self {
            id: str_to_uuid(&id_str).map_err(decode_err)?,
            client_id: str_to_uuid(&client_id_str).map_err(decode_err)?,
            remote_path: row.try_get("remote_path")?,
            local_path: row.try_get("local_path")?,
        })
    }
}

pub struct PathMappingRepository {
    pool: DbPool,
}

impl PathMappingRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    #[cfg(feature = "sqlite")]
    pub async fn list_for_client(&self, client_id: Uuid) -> Result<Vec<PathMappingRecord>> {
        use crate::db::sqlite_helpers::uuid_to_str;

        let records = sqlx::query_as::<_, PathMappingRecord>(
            r#"
            SELECT id, client_id, remote_path, local_path
            FROM remote_path_mappings
            WHERE client_id = ?1
            "#,
        )
        .bind(uuid_to_str(client_id))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    #[cfg(feature = "sqlite")]
    pub async fn create(
        &self,
        client_id: Uuid,
        remote_path: &str,
        local_path: &str,
    ) -> Result<PathMappingRecord> {
        use crate::db::sqlite_helpers::{now_iso8601, uuid_to_str};

        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO remote_path_mappings (id, client_id, remote_path, local_path, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(uuid_to_str(id))
        .bind(uuid_to_str(client_id))
        .bind(remote_path)
        .bind(local_path)
        .bind(now_iso8601())
        .execute(&self.pool)
        .await?;

        Ok(PathMappingRecord {
            id,
            client_id,
            remote_path: remote_path.to_string(),
            local_path: local_path.to_string(),
        })
    }
}
