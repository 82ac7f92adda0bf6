//! Schema bootstrap for the ingest database
//!
//! Every table is created with `CREATE TABLE IF NOT EXISTS`, so running the sync
//! on every startup is safe. Column renames and type changes are not handled.

use sqlx::SqlitePool;
use tracing::{debug, info, warn};

/// Result of a schema sync operation
#[derive(Debug, Default)]
pub struct SchemaSyncResult {
    pub tables_created: Vec<String>,
    pub errors: Vec<String>,
}

impl SchemaSyncResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Tables in creation order, paired with their DDL
const TABLES: &[(&str, &str)] = &[
    (
        "downloads",
        r#"CREATE TABLE IF NOT EXISTS downloads (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'queued',
            client_id TEXT,
            client_item_id TEXT,
            library_item_id TEXT,
            download_path TEXT,
            final_path TEXT,
            total_size INTEGER NOT NULL DEFAULT 0,
            downloaded_size INTEGER NOT NULL DEFAULT 0,
            progress REAL NOT NULL DEFAULT 0,
            metadata TEXT NOT NULL DEFAULT '{}',
            error_message TEXT,
            started_at TEXT NOT NULL,
            completed_at TEXT,
            updated_at TEXT NOT NULL
        )"#,
    ),
    (
        "processing_jobs",
        r#"CREATE TABLE IF NOT EXISTS processing_jobs (
            id TEXT PRIMARY KEY,
            download_id TEXT NOT NULL,
            job_type TEXT NOT NULL DEFAULT 'import_download',
            status TEXT NOT NULL DEFAULT 'queued',
            priority INTEGER NOT NULL DEFAULT 0,
            source_path TEXT NOT NULL,
            destination_path TEXT,
            client_id TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            error_message TEXT,
            processing_log TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            updated_at TEXT NOT NULL,
            completed_at TEXT,
            next_retry_at TEXT
        )"#,
    ),
    (
        "library_items",
        r#"CREATE TABLE IF NOT EXISTS library_items (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            author TEXT,
            series TEXT,
            series_number TEXT,
            year INTEGER,
            narrator TEXT,
            base_path TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )"#,
    ),
    (
        "library_files",
        r#"CREATE TABLE IF NOT EXISTS library_files (
            id TEXT PRIMARY KEY,
            item_id TEXT NOT NULL,
            path TEXT NOT NULL,
            size_bytes INTEGER NOT NULL DEFAULT 0,
            duration_secs REAL,
            format TEXT,
            container TEXT,
            codec TEXT,
            bitrate INTEGER,
            sample_rate INTEGER,
            channels INTEGER,
            source TEXT NOT NULL DEFAULT 'download',
            created_at TEXT NOT NULL,
            UNIQUE (item_id, path)
        )"#,
    ),
    (
        "history",
        r#"CREATE TABLE IF NOT EXISTS history (
            id TEXT PRIMARY KEY,
            event_type TEXT NOT NULL,
            item_id TEXT,
            download_id TEXT,
            message TEXT NOT NULL,
            details TEXT,
            created_at TEXT NOT NULL
        )"#,
    ),
    (
        "remote_path_mappings",
        r#"CREATE TABLE IF NOT EXISTS remote_path_mappings (
            id TEXT PRIMARY KEY,
            client_id TEXT NOT NULL,
            remote_path TEXT NOT NULL,
            local_path TEXT NOT NULL,
            created_at TEXT NOT NULL
        )"#,
    ),
    (
        "download_clients",
        r#"CREATE TABLE IF NOT EXISTS download_clients (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            base_url TEXT NOT NULL,
            username TEXT,
            password TEXT,
            api_key TEXT,
            category TEXT,
            enabled INTEGER NOT NULL DEFAULT 1,
            post_import_action TEXT NOT NULL DEFAULT 'none',
            created_at TEXT NOT NULL
        )"#,
    ),
];

/// Indexes created after the tables.
///
/// `ux_processing_jobs_active` is what makes "one active job per download"
/// hold even when two finalizations race between check and insert.
const INDEXES: &[&str] = &[
    r#"CREATE UNIQUE INDEX IF NOT EXISTS ux_processing_jobs_active
        ON processing_jobs(download_id)
        WHERE status IN ('queued', 'processing', 'retry')"#,
    r#"CREATE INDEX IF NOT EXISTS idx_processing_jobs_pending
        ON processing_jobs(status, priority DESC, created_at)"#,
    r#"CREATE INDEX IF NOT EXISTS idx_downloads_client
        ON downloads(client_id, status)"#,
    r#"CREATE INDEX IF NOT EXISTS idx_library_files_item
        ON library_files(item_id)"#,
    r#"CREATE INDEX IF NOT EXISTS idx_history_created
        ON history(created_at DESC)"#,
    r#"CREATE INDEX IF NOT EXISTS idx_path_mappings_client
        ON remote_path_mappings(client_id)"#,
];

/// Check if a table exists in the database
async fn table_exists(pool: &SqlitePool, table_name: &str) -> Result<bool, sqlx::Error> {
    let result: Option<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' AND name = ?")
            .bind(table_name)
            .fetch_optional(pool)
            .await?;

    Ok(result.is_some())
}

/// Create any missing tables and indexes.
///
/// Failures are collected rather than returned early so a single bad statement
/// is reported alongside everything else that went wrong.
pub async fn sync_schema(pool: &SqlitePool) -> SchemaSyncResult {
    let mut result = SchemaSyncResult::default();

    for (table, ddl) in TABLES {
        let existed = table_exists(pool, table).await.unwrap_or(false);
        debug!(table = %table, existed, "Syncing table");

        if let Err(e) = sqlx::query(ddl).execute(pool).await {
            let msg = format!("Failed to create table {}: {}", table, e);
            warn!("{}", msg);
            result.errors.push(msg);
        } else if !existed {
            result.tables_created.push(table.to_string());
        }
    }

    for ddl in INDEXES {
        if let Err(e) = sqlx::query(ddl).execute(pool).await {
            let msg = format!("Failed to create index: {}", e);
            warn!("{}", msg);
            result.errors.push(msg);
        }
    }

    if !result.tables_created.is_empty() {
        info!(tables = ?result.tables_created, "Created database tables");
    }

    result
}
