//! Download client adapters
//!
//! Each protocol gets an adapter that reports its items in one normalized
//! shape. The completion detector only ever sees [`QueueItem`] and
//! [`HistoryItem`], never a client's own wire format.

mod qbittorrent;
mod sabnzbd;

pub use qbittorrent::QbittorrentAdapter;
pub use sabnzbd::SabnzbdAdapter;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{ClientKind, DownloadClientRecord};

/// Errors talking to a download client
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{client} rejected the credentials")]
    Unauthorized { client: String },

    #[error("{client} returned HTTP {status}")]
    Status { client: String, status: u16 },

    #[error("unexpected response from {client}: {reason}")]
    InvalidResponse { client: String, reason: String },

    #[error("{client} is missing required setting '{setting}'")]
    MissingSetting {
        client: String,
        setting: &'static str,
    },

    #[error("{client} has an invalid base URL: {reason}")]
    InvalidUrl { client: String, reason: String },

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// Check a configured base URL and return it without a trailing slash
pub fn normalize_base_url(record: &DownloadClientRecord) -> Result<String, ClientError> {
    let invalid = |reason: String| ClientError::InvalidUrl {
        client: record.name.clone(),
        reason,
    };

    let parsed = url::Url::parse(record.base_url.trim()).map_err(|e| invalid(e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", parsed.scheme())));
    }
    if parsed.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    Ok(record.base_url.trim().trim_end_matches('/').to_string())
}

/// Normalized state of a client item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    Queued,
    Downloading,
    Paused,
    Seeding,
    Completed,
    Failed,
    Unknown,
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ItemState::Queued => "queued",
            ItemState::Downloading => "downloading",
            ItemState::Paused => "paused",
            ItemState::Seeding => "seeding",
            ItemState::Completed => "completed",
            ItemState::Failed => "failed",
            ItemState::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// One item in a client's live queue
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueItem {
    pub id: String,
    pub title: String,
    pub state: ItemState,
    /// Percentage, 0.0 to 100.0
    pub progress: f64,
    pub size: i64,
    pub downloaded: i64,
    /// Where the payload lives, in the client's view of the filesystem
    pub content_path: Option<String>,
}

impl QueueItem {
    /// Whether the client reports this item as finished
    pub fn is_complete(&self) -> bool {
        match self.state {
            ItemState::Completed => true,
            ItemState::Seeding => self.progress >= 100.0,
            _ => false,
        }
    }
}

/// One entry in a queue-style client's completed list
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryItem {
    pub id: String,
    pub title: String,
    pub failed: bool,
    pub size: i64,
    /// Final location reported by the client
    pub content_path: Option<String>,
}

/// Operations the pipeline needs from a download client
#[async_trait]
pub trait DownloadClientAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn test_connection(&self) -> Result<(), ClientError>;

    /// Hand a release URL (magnet, .torrent or .nzb link) to the client,
    /// returning the client's id for the new item
    async fn add(&self, url: &str) -> Result<String, ClientError>;

    async fn remove(&self, client_item_id: &str, delete_files: bool) -> Result<(), ClientError>;

    async fn queue(&self) -> Result<Vec<QueueItem>, ClientError>;

    /// Completed items reported separately from the queue. Torrent clients
    /// keep finished items in the queue and report nothing here.
    async fn history(&self, _limit: usize) -> Result<Vec<HistoryItem>, ClientError> {
        Ok(Vec::new())
    }
}

/// Parse a progress percentage that may arrive as a number or a numeric
/// string such as `"50.5"`.
pub fn parse_progress(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse::<f64>().ok(),
        _ => None,
    }?;
    parsed.is_finite().then(|| parsed.clamp(0.0, 100.0))
}

/// Parse a number that may be encoded as a string
pub fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Downloaded bytes implied by a percentage of the total size
pub fn derive_downloaded(progress: f64, total_size: i64) -> i64 {
    if total_size <= 0 {
        return 0;
    }
    let bytes = (progress.clamp(0.0, 100.0) / 100.0) * total_size as f64;
    (bytes.floor() as i64).clamp(0, total_size)
}

/// Build the adapter for a configured client
pub fn build_adapter(
    record: &DownloadClientRecord,
) -> Result<Arc<dyn DownloadClientAdapter>, ClientError> {
    let adapter: Arc<dyn DownloadClientAdapter> = match record.kind {
        ClientKind::Qbittorrent => Arc::new(QbittorrentAdapter::from_record(record)?),
        ClientKind::Sabnzbd => Arc::new(SabnzbdAdapter::from_record(record)?),
    };
    Ok(adapter)
}

/// Adapters keyed by client id
#[derive(Default)]
pub struct ClientRegistry {
    adapters: RwLock<HashMap<Uuid, Arc<dyn DownloadClientAdapter>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build adapters for every record. A client whose adapter cannot be
    /// built is logged and left out rather than failing the others.
    pub fn from_records(records: &[DownloadClientRecord]) -> Self {
        let registry = Self::new();
        for record in records {
            match build_adapter(record) {
                Ok(adapter) => {
                    info!(client = %record.name, kind = %record.kind, "Registered download client");
                    registry.insert(record.id, adapter);
                }
                Err(e) => {
                    warn!(client = %record.name, error = %e, "Skipping download client");
                }
            }
        }
        registry
    }

    pub fn insert(&self, client_id: Uuid, adapter: Arc<dyn DownloadClientAdapter>) {
        self.adapters.write().insert(client_id, adapter);
    }

    pub fn get(&self, client_id: Uuid) -> Option<Arc<dyn DownloadClientAdapter>> {
        self.adapters.read().get(&client_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.adapters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.read().is_empty()
    }
}
