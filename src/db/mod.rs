//! Database connection and repositories

pub mod download_clients;
pub mod downloads;
pub mod history;
pub mod library_files;
pub mod library_items;
pub mod path_mappings;
pub mod processing_jobs;
pub mod schema_sync;
pub mod sqlite_helpers;

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::{info, warn};

pub use download_clients::{
    ClientKind, CreateDownloadClient, DownloadClientRecord, DownloadClientRepository,
    PostImportAction,
};
pub use downloads::{CreateDownload, DownloadRecord, DownloadRepository, DownloadStatus, ProgressUpdate};
pub use history::{CreateHistoryEntry, HistoryEventType, HistoryRecord, HistoryRepository};
pub use library_files::{CreateLibraryFile, LibraryFileRecord, LibraryFileRepository};
pub use library_items::{CreateLibraryItem, LibraryItemRecord, LibraryItemRepository};
pub use path_mappings::{PathMappingRecord, PathMappingRepository};
pub use processing_jobs::{
    CreateProcessingJob, JobStatus, ProcessingJobRecord, ProcessingJobRepository, QueueStats,
};

/// Database wrapper providing connection pool access
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database wrapper from an existing pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get the maximum connection pool size from environment or default
    fn get_max_connections() -> u32 {
        std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5)
    }

    /// Open (creating if needed) a SQLite database and sync the schema.
    ///
    /// Accepts either a `sqlite:` URL or a plain file path.
    pub async fn connect(url: &str) -> Result<Self> {
        let url = if url.starts_with("sqlite:") {
            url.to_string()
        } else {
            if let Some(parent) = std::path::Path::new(url).parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create database directory {}", parent.display()))?;
            }
            format!("sqlite://{}", url)
        };

        let options = SqliteConnectOptions::from_str(&url)
            .with_context(|| format!("Invalid database URL: {}", url))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(Self::get_max_connections())
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Connect, retrying every `retry_interval` until it succeeds
    pub async fn connect_with_retry(url: &str, retry_interval: Duration) -> Self {
        loop {
            match Self::connect(url).await {
                Ok(db) => return db,
                Err(e) => {
                    warn!(
                        error = %e,
                        retry_in_secs = retry_interval.as_secs(),
                        "Database connection failed, retrying"
                    );
                    tokio::time::sleep(retry_interval).await;
                }
            }
        }
    }

    /// Private in-memory database with the schema applied.
    ///
    /// A single connection that never expires, since every new connection to
    /// `sqlite::memory:` would see an empty database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Create missing tables and indexes
    pub async fn migrate(&self) -> Result<()> {
        let result = schema_sync::sync_schema(&self.pool).await;
        if !result.is_ok() {
            anyhow::bail!("Schema sync failed: {}", result.errors.join("; "));
        }
        info!(tables_created = result.tables_created.len(), "Database schema ready");
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn downloads(&self) -> DownloadRepository {
        DownloadRepository::new(self.pool.clone())
    }

    pub fn processing_jobs(&self) -> ProcessingJobRepository {
        ProcessingJobRepository::new(self.pool.clone())
    }

    pub fn library_items(&self) -> LibraryItemRepository {
        LibraryItemRepository::new(self.pool.clone())
    }

    pub fn library_files(&self) -> LibraryFileRepository {
        LibraryFileRepository::new(self.pool.clone())
    }

    pub fn history(&self) -> HistoryRepository {
        HistoryRepository::new(self.pool.clone())
    }

    pub fn path_mappings(&self) -> PathMappingRepository {
        PathMappingRepository::new(self.pool.clone())
    }

    pub fn download_clients(&self) -> DownloadClientRepository {
        DownloadClientRepository::new(self.pool.clone())
    }
}
