//! SABnzbd JSON API adapter

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{
    ClientError, DownloadClientAdapter, HistoryItem, ItemState, QueueItem, derive_downloaded,
    normalize_base_url, parse_number, parse_progress,
};
use crate::db::DownloadClientRecord;
use crate::services::rate_limiter::RateLimitedClient;

const MB: f64 = 1024.0 * 1024.0;

pub struct SabnzbdAdapter {
    name: String,
    api_url: String,
    api_key: String,
    category: Option<String>,
    http: RateLimitedClient,
}

impl SabnzbdAdapter {
    pub fn from_record(record: &DownloadClientRecord) -> Result<Self, ClientError> {
        let api_key = record
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ClientError::MissingSetting {
                client: record.name.clone(),
                setting: "api_key",
            })?;

        let base = normalize_base_url(record)?;
        let api_url = if base.ends_with("/api") {
            base.to_string()
        } else {
            format!("{}/api", base)
        };

        Ok(Self {
            name: record.name.clone(),
            api_url,
            api_key,
            category: record.category.clone(),
            http: RateLimitedClient::for_download_client(&record.name)?,
        })
    }

    async fn call(&self, mode: &str, extra: &[(&str, &str)]) -> Result<Value, ClientError> {
        let mut query = vec![
            ("mode", mode),
            ("output", "json"),
            ("apikey", self.api_key.as_str()),
        ];
        query.extend_from_slice(extra);

        let resp = self.http.get_with_query(&self.api_url, &query).await?;
        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
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

        let body: Value = resp.json().await.map_err(|e| ClientError::InvalidResponse {
            client: self.name.clone(),
            reason: e.to_string(),
        })?;

        // SABnzbd reports API errors with HTTP 200 and an "error" field
        if let Some(error) = body.get("error").and_then(Value::as_str) {
            if error.to_lowercase().contains("api key") {
                return Err(ClientError::Unauthorized {
                    client: self.name.clone(),
                });
            }
            return Err(ClientError::InvalidResponse {
                client: self.name.clone(),
                reason: error.to_string(),
            });
        }

        Ok(body)
    }

    fn slots<'a>(&self, body: &'a Value, section: &str) -> &'a [Value] {
        body.get(section)
            .and_then(|s| s.get("slots"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

fn map_status(status: &str) -> ItemState {
    match status.to_lowercase().as_str() {
        "downloading" | "fetching" | "grabbing" | "checking" | "extracting" | "moving"
        | "verifying" | "repairing" | "running" => ItemState::Downloading,
        "paused" => ItemState::Paused,
        "queued" | "propagating" => ItemState::Queued,
        "completed" => ItemState::Completed,
        "failed" => ItemState::Failed,
        _ => ItemState::Queued,
    }
}

fn str_field(slot: &Value, key: &str) -> String {
    slot.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn to_queue_item(slot: &Value) -> QueueItem {
    let size_mb = slot.get("mb").and_then(parse_number).unwrap_or(0.0);
    let left_mb = slot.get("mbleft").and_then(parse_number);
    let progress = slot
        .get("percentage")
        .and_then(parse_progress)
        .unwrap_or(0.0);

    let size = (size_mb * MB) as i64;
    let downloaded = match left_mb {
        Some(left) => (((size_mb - left).max(0.0)) * MB) as i64,
        None => derive_downloaded(progress, size),
    };

    QueueItem {
        id: str_field(slot, "nzo_id"),
        title: str_field(slot, "filename"),
        state: map_status(&str_field(slot, "status")),
        progress,
        size,
        downloaded,
        content_path: None,
    }
}

fn to_history_item(slot: &Value) -> HistoryItem {
    let storage = str_field(slot, "storage");
    HistoryItem {
        id: str_field(slot, "nzo_id"),
        title: str_field(slot, "name"),
        failed: str_field(slot, "status").eq_ignore_ascii_case("failed"),
        size: slot.get("bytes").and_then(parse_number).unwrap_or(0.0) as i64,
        content_path: (!storage.is_empty()).then_some(storage),
    }
}

#[async_trait]
impl DownloadClientAdapter for SabnzbdAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn test_connection(&self) -> Result<(), ClientError> {
        let body = self.call("version", &[]).await?;
        let version = body
            .get("version")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown");
        debug!(client = %self.name, version, "SABnzbd reachable");
        Ok(())
    }

    async fn add(&self, url: &str) -> Result<String, ClientError> {
        let mut extra = vec![("name", url)];
        if let Some(category) = self.category.as_deref() {
            extra.push(("cat", category));
        }
        let body = self.call("addurl", &extra).await?;

        body.get("nzo_ids")
            .and_then(Value::as_array)
            .and_then(|ids| ids.first())
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ClientError::InvalidResponse {
                client: self.name.clone(),
                reason: "addurl response carried no nzo_id".to_string(),
            })
    }

    async fn remove(&self, client_item_id: &str, delete_files: bool) -> Result<(), ClientError> {
        let del_files = if delete_files { "1" } else { "0" };
        // Imported items live in history; queued ones are removed from the queue
        self.call(
            "history",
            &[("name", "delete"), ("value", client_item_id), ("del_files", del_files)],
        )
        .await?;
        self.call(
            "queue",
            &[("name", "delete"), ("value", client_item_id), ("del_files", del_files)],
        )
        .await?;
        Ok(())
    }

    async fn queue(&self) -> Result<Vec<QueueItem>, ClientError> {
        let body = self.call("queue", &[]).await?;
        Ok(self.slots(&body, "queue").iter().map(to_queue_item).collect())
    }

    async fn history(&self, limit: usize) -> Result<Vec<HistoryItem>, ClientError> {
        let limit = limit.to_string();
        let mut extra = vec![("limit", limit.as_str())];
        if let Some(category) = self.category.as_deref() {
            extra.push(("category", category));
        }
        let body = self.call("history", &extra).await?;
        Ok(self
            .slots(&body, "history")
            .iter()
            .map(to_history_item)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ClientKind, PostImportAction};
    use serde_json::json;
    use uuid::Uuid;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record(base_url: &str, api_key: Option<&str>) -> DownloadClientRecord {
        DownloadClientRecord {
            id: Uuid::new_v4(),
            name: "sab".to_string(),
            kind: ClientKind::Sabnzbd,
            base_url: base_url.to_string(),
            username: None,
            password: None,
            api_key: api_key.map(str::to_string),
            category: None,
            enabled: true,
            post_import_action: PostImportAction::None,
        }
    }

    #[test]
    fn test_missing_api_key_is_rejected() {
        let err = SabnzbdAdapter::from_record(&record("http://localhost:8080", None))
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::MissingSetting { setting: "api_key", .. }));
    }

    #[tokio::test]
    async fn test_queue_parses_string_numbers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api"))
            .and(query_param("mode", "queue"))
            .and(query_param("apikey", "k"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "queue": {
                    "slots": [
                        {
                            "nzo_id": "SABnzbd_nzo_1",
                            "filename": "Dune",
                            "status": "Downloading",
                            "mb": "100",
                            "percentage": "50.5"
                        }
                    ]
                }
            })))
            .mount(&server)
            .await;

        let adapter = SabnzbdAdapter::from_record(&record(&server.uri(), Some("k"))).unwrap();
        let items = adapter.queue().await.unwrap();

        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.id, "SABnzbd_nzo_1");
        assert_eq!(item.state, ItemState::Downloading);
        assert!(item.progress > 50.0 && item.progress < 51.0);
        let total = 100 * 1024 * 1024;
        assert_eq!(item.size, total);
        assert!(item.downloaded >= total / 2 && item.downloaded <= total * 51 / 100);
    }

    #[tokio::test]
    async fn test_history_reports_storage_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api"))
            .and(query_param("mode", "history"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "history": {
                    "slots": [
                        {
                            "nzo_id": "SABnzbd_nzo_2",
                            "name": "Emma (Unabridged)",
                            "status": "Completed",
                            "storage": "/complete/Emma (Unabridged)",
                            "bytes": 2048
                        },
                        {
                            "nzo_id": "SABnzbd_nzo_3",
                            "name": "Broken",
                            "status": "Failed",
                            "storage": ""
                        }
                    ]
                }
            })))
            .mount(&server)
            .await;

        let adapter = SabnzbdAdapter::from_record(&record(&server.uri(), Some("k"))).unwrap();
        let history = adapter.history(50).await.unwrap();

        assert_eq!(history.len(), 2);
        assert_eq!(
            history[0].content_path.as_deref(),
            Some("/complete/Emma (Unabridged)")
        );
        assert!(!history[0].failed);
        assert!(history[1].failed);
        assert_eq!(history[1].content_path, None);
    }

    #[tokio::test]
    async fn test_connection_reads_version() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api"))
            .and(query_param("mode", "version"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"version": "4.3.2"})))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = SabnzbdAdapter::from_record(&record(&server.uri(), Some("k"))).unwrap();
        adapter.test_connection().await.unwrap();
    }

    #[tokio::test]
    async fn test_api_error_field_maps_to_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"status": false, "error": "API Key Incorrect"})),
            )
            .mount(&server)
            .await;

        let adapter = SabnzbdAdapter::from_record(&record(&server.uri(), Some("bad"))).unwrap();
        let err = adapter.test_connection().await.unwrap_err();
        assert!(matches!(err, ClientError::Unauthorized { .. }));
    }
}
