//! Download clients repository

use anyhow::Result;
use serde::Serialize;
use uuid::Uuid;

#[cfg(feature = "sqlite")]
use sqlx::SqlitePool;

#[cfg(feature = "sqlite")]
type DbPool = SqlitePool;

/// Supported download client protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    Qbittorrent,
    Sabnzbd,
}

impl std::fmt::Display for ClientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientKind::Qbittorrent => write!(f, "qbittorrent"),
            ClientKind::Sabnzbd => write!(f, "sabnzbd"),
        }
    }
}

impl std::str::FromStr for ClientKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "qbittorrent" | "qbit" => Ok(ClientKind::Qbittorrent),
            "sabnzbd" | "sab" => Ok(ClientKind::Sabnzbd),
            _ => Err(anyhow::anyhow!("Unknown download client kind: {}", s)),
        }
    }
}

/// What to do with the client's copy once a download has been imported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PostImportAction {
    #[default]
    None,
    Remove,
    RemoveAndDelete,
}

impl std::fmt::Display for PostImportAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PostImportAction::None => write!(f, "none"),
            PostImportAction::Remove => write!(f, "remove"),
            PostImportAction::RemoveAndDelete => write!(f, "remove_and_delete"),
        }
    }
}

impl std::str::FromStr for PostImportAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "" | "none" => Ok(PostImportAction::None),
            "remove" => Ok(PostImportAction::Remove),
            "remove_and_delete" | "delete" => Ok(PostImportAction::RemoveAndDelete),
            _ => Err(anyhow::anyhow!("Unknown post-import action: {}", s)),
        }
    }
}

/// Configured download client
#[derive(Debug, Clone, Serialize)]
pub struct DownloadClientRecord {
    pub id: Uuid,
    pub name: String,
    pub kind: ClientKind,
    pub base_url: String,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub category: Option<String>,
    pub enabled: bool,
    pub post_import_action: PostImportAction,
}

#[cfg(feature = "sqlite")]
impl sqlx::FromRow<'_, sqlx::sqlite::SqliteRow> for DownloadClientRecord {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> sqlx::Result<Self> {
        use crate::db::sqlite_helpers::{decode_err, str_to_uuid};
        use sqlx::Row;

        let id_str: String = row.try_get("id")?;
        let kind_str: String = row.try_get("kind")?;
        let action_str: String = row.try_get("post_import_action")?;
        let enabled: i32 = row.try_get("enabled")?;

        Ok(Self {
            id: str_to_uuid(&id_str).map_err(decode_err)?,
            name: row.try_get("name")?,
            kind: kind_str.parse().map_err(decode_err)?,
            base_url: row.try_get("base_url")?,
            username: row.try_get("username")?,
            password: row.try_get("password")?,
            api_key: row.try_get("api_key")?,
            category: row.try_get("category")?,
            enabled: enabled != 0,
            post_import_action: action_str.parse().map_err(decode_err)?,
        })
    }
}

/// Data for registering a download client
#[derive(Debug, Clone)]
pub struct CreateDownloadClient {
    pub name: String,
    pub kind: ClientKind,
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub api_key: Option<String>,
    pub category: Option<String>,
    pub enabled: bool,
    pub post_import_action: PostImportAction,
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, name, kind, base_url, username, password, api_key, category, enabled,
           post_import_action
    FROM download_clients
"#;

pub struct DownloadClientRepository {
    pool: DbPool,
}

impl DownloadClientRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    #[cfg(feature = "sqlite")]
    pub async fn get(&self, id: Uuid) -> Result<Option<DownloadClientRecord>> {
        use crate::db::sqlite_helpers::uuid_to_str;

        let record =
            sqlx::query_as::<_, DownloadClientRecord>(&format!("{SELECT_COLUMNS} WHERE id = ?1"))
                .bind(uuid_to_str(id))
                .fetch_optional(&self.pool)
                .await?;

        Ok(record)
    }

    #[cfg(feature = "sqlite")]
    pub async fn list_enabled(&self) -> Result<Vec<DownloadClientRecord>> {
        let records = sqlx::query_as::<_, DownloadClientRecord>(&format!(
            "{SELECT_COLUMNS} WHERE enabled = 1 ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    #[cfg(feature = "sqlite")]
    pub async fn create(&self, data: CreateDownloadClient) -> Result<DownloadClientRecord> {
        use crate::db::sqlite_helpers::{now_iso8601, uuid_to_str};

        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO download_clients (
                id, name, kind, base_url, username, password, api_key, category, enabled,
                post_import_action, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(uuid_to_str(id))
        .bind(&data.name)
        .bind(data.kind.to_string())
        .bind(&data.base_url)
        .bind(&data.username)
        .bind(&data.password)
        .bind(&data.api_key)
        .bind(&data.category)
        .bind(if data.enabled { 1 } else { 0 })
        .bind(data.post_import_action.to_string())
        .bind(now_iso8601())
        .execute(&self.pool)
        .await?;

        self.get(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Failed to retrieve download client after insert"))
    }
}
