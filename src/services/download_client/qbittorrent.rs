//! qBittorrent Web API v2 adapter

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{ClientError, DownloadClientAdapter, ItemState, QueueItem, normalize_base_url, parse_number};
use crate::db::DownloadClientRecord;
use crate::services::rate_limiter::RateLimitedClient;

#[derive(Debug, Deserialize)]
struct TorrentInfo {
    #[serde(default)]
    hash: String,
    #[serde(default)]
    name: String,
    /// Fraction 0.0..=1.0
    #[serde(default)]
    progress: Value,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    downloaded: i64,
    #[serde(default)]
    state: String,
    #[serde(default)]
    save_path: String,
    #[serde(default)]
    content_path: String,
}

pub struct QbittorrentAdapter {
    name: String,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    category: Option<String>,
    http: RateLimitedClient,
    authenticated: AtomicBool,
}

impl QbittorrentAdapter {
    pub fn from_record(record: &DownloadClientRecord) -> Result<Self, ClientError> {
        Ok(Self {
            name: record.name.clone(),
            base_url: normalize_base_url(record)?,
            username: record.username.clone(),
            password: record.password.clone(),
            category: record.category.clone(),
            http: RateLimitedClient::for_download_client(&record.name)?,
            authenticated: AtomicBool::new(false),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v2/{}", self.base_url, path)
    }

    async fn login(&self) -> Result<(), ClientError> {
        let Some(username) = self.username.as_deref() else {
            // No credentials: rely on the client's localhost/subnet bypass
            self.authenticated.store(true, Ordering::Relaxed);
            return Ok(());
        };
        let password = self.password.as_deref().unwrap_or_default();

        let resp = self
            .http
            .post_form(
                &self.url("auth/login"),
                &[("username", username), ("password", password)],
            )
            .await?;

        if resp.status() == StatusCode::FORBIDDEN {
            return Err(ClientError::Unauthorized {
                client: self.name.clone(),
            });
        }
        let status = resp.status();
        let body = resp.text().await.map_err(anyhow::Error::from)?;
        if !status.is_success() || body.trim() != "Ok." {
            return Err(ClientError::Unauthorized {
                client: self.name.clone(),
            });
        }

        debug!(client = %self.name, "Logged in to qBittorrent");
        self.authenticated.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn ensure_login(&self) -> Result<(), ClientError> {
        if self.authenticated.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.login().await
    }

    fn check_status(&self, status: StatusCode) -> Result<(), ClientError> {
        if status == StatusCode::FORBIDDEN {
            return Err(ClientError::Unauthorized {
                client: self.name.clone(),
            });
        }
        if !status.is_success() {
            return Err(ClientError::Status {
                client: self.name.clone(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }

    /// GET an endpoint, logging in again once if the session expired
    async fn get_text(&self, path: &str, query: &[(&str, &str)]) -> Result<String, ClientError> {
        self.ensure_login().await?;
        let mut resp = self.http.get_with_query(&self.url(path), query).await?;
        if resp.status() == StatusCode::FORBIDDEN {
            self.authenticated.store(false, Ordering::Relaxed);
            self.login().await?;
            resp = self.http.get_with_query(&self.url(path), query).await?;
        }
        self.check_status(resp.status())?;
        Ok(resp.text().await.map_err(anyhow::Error::from)?)
    }

    /// POST a form, logging in again once if the session expired
    async fn post(&self, path: &str, form: &[(&str, &str)]) -> Result<(), ClientError> {
        self.ensure_login().await?;
        let mut resp = self.http.post_form(&self.url(path), form).await?;
        if resp.status() == StatusCode::FORBIDDEN {
            self.authenticated.store(false, Ordering::Relaxed);
            self.login().await?;
            resp = self.http.post_form(&self.url(path), form).await?;
        }
        self.check_status(resp.status())
    }

    async fn torrents(&self) -> Result<Vec<TorrentInfo>, ClientError> {
        let mut query = Vec::new();
        if let Some(category) = self.category.as_deref() {
            query.push(("category", category));
        }
        let body = self.get_text("torrents/info", &query).await?;
        serde_json::from_str(&body).map_err(|e| ClientError::InvalidResponse {
            client: self.name.clone(),
            reason: e.to_string(),
        })
    }

    async fn hashes(&self) -> Result<HashSet<String>, ClientError> {
        Ok(self
            .torrents()
            .await?
            .into_iter()
            .map(|t| t.hash.to_lowercase())
            .collect())
    }
}

/// Map a qBittorrent state string onto the normalized state
fn map_state(state: &str, progress: f64) -> ItemState {
    let mapped = match state {
        "downloading" | "metaDL" | "forcedDL" | "forcedMetaDL" | "stalledDL" | "checkingDL"
        | "checkingResumeData" | "moving" | "allocating" => ItemState::Downloading,
        "pausedDL" | "stoppedDL" => ItemState::Paused,
        "queuedDL" | "queuedUP" => ItemState::Queued,
        "uploading" | "stalledUP" | "checkingUP" | "forcedUP" => ItemState::Seeding,
        "pausedUP" | "stoppedUP" => ItemState::Paused,
        "error" | "missingFiles" => ItemState::Failed,
        _ => ItemState::Unknown,
    };

    let finished_upload_state = matches!(
        state,
        "uploading" | "stalledUP" | "checkingUP" | "forcedUP" | "pausedUP" | "stoppedUP"
    );
    if progress >= 100.0 && finished_upload_state {
        return ItemState::Completed;
    }
    mapped
}

/// Info hash from a magnet link, lowercased
fn magnet_hash(url: &str) -> Option<String> {
    let query = url.strip_prefix("magnet:?")?;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key != "xt" {
            return None;
        }
        let hash = value.strip_prefix("urn:btih:")?;
        (!hash.is_empty()).then(|| hash.to_lowercase())
    })
}

fn to_queue_item(t: TorrentInfo) -> QueueItem {
    let progress = parse_number(&t.progress)
        .map(|p| (p * 100.0).clamp(0.0, 100.0))
        .unwrap_or(0.0);

    let content_path = if !t.content_path.is_empty() {
        Some(t.content_path)
    } else if !t.save_path.is_empty() {
        Some(format!("{}/{}", t.save_path.trim_end_matches(['/', '\\']), t.name))
    } else {
        None
    };

    QueueItem {
        state: map_state(&t.state, progress),
        id: t.hash.to_lowercase(),
        title: t.name,
        progress,
        size: t.size,
        downloaded: t.downloaded,
        content_path,
    }
}

#[async_trait]
impl DownloadClientAdapter for QbittorrentAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn test_connection(&self) -> Result<(), ClientError> {
        self.login().await?;
        let version = self.get_text("app/version", &[]).await?;
        debug!(client = %self.name, version = %version.trim(), "qBittorrent reachable");
        Ok(())
    }

    async fn add(&self, url: &str) -> Result<String, ClientError> {
        let known_hash = magnet_hash(url);
        let before = if known_hash.is_none() {
            self.hashes().await?
        } else {
            HashSet::new()
        };

        let mut form = vec![("urls", url)];
        if let Some(category) = self.category.as_deref() {
            form.push(("category", category));
        }
        self.post("torrents/add", &form).await?;

        if let Some(hash) = known_hash {
            return Ok(hash);
        }

        let after = self.hashes().await?;
        after
            .difference(&before)
            .next()
            .cloned()
            .ok_or_else(|| ClientError::InvalidResponse {
                client: self.name.clone(),
                reason: "added torrent did not appear in the torrent list".to_string(),
            })
    }

    async fn remove(&self, client_item_id: &str, delete_files: bool) -> Result<(), ClientError> {
        let delete = if delete_files { "true" } else { "false" };
        self.post(
            "torrents/delete",
            &[("hashes", client_item_id), ("deleteFiles", delete)],
        )
        .await
    }

    async fn queue(&self) -> Result<Vec<QueueItem>, ClientError> {
        Ok(self.torrents().await?.into_iter().map(to_queue_item).collect())
    }
}
