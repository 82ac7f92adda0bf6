//! Download completion detection
//!
//! Each enabled download client is polled on its own task. Every monitored
//! download is matched to what the client reports, its progress is written
//! back, and once the client has reported it finished for a full debounce
//! window it is finalized: the reported path is resolved locally and a
//! processing job is enqueued.
//!
//! Candidates live in a bounded in-memory map from download id to the first
//! time a finished report was seen. An entry is dropped when its job is
//! enqueued, when the client stops reporting the download as finished, or
//! when the map is full and the entry is the oldest.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::download_client::{ClientRegistry, HistoryItem, ItemState, QueueItem};
use super::events::{EventBus, PipelineEvent};
use super::metrics::{self, Metrics};
use super::path_resolver::PathResolver;
use super::text_utils::titles_overlap;
use crate::db::{CreateProcessingJob, Database, DownloadRecord, DownloadStatus, ProgressUpdate};

/// Metadata keys that may hold a client-side id for a download
pub const ALTERNATE_ID_KEYS: &[&str] = &[
    "torrent_hash",
    "info_hash",
    "nzo_id",
    "history_id",
    "download_id",
];

/// How many history entries to request per poll
const HISTORY_LIMIT: usize = 100;

/// Bounded map of downloads currently reported as finished
pub struct CandidateTracker {
    capacity: usize,
    first_seen: Mutex<HashMap<Uuid, Instant>>,
}

impl CandidateTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            first_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record a finished report and return when the current streak started.
    ///
    /// A new entry evicts the oldest one when the map is full.
    pub fn observe(&self, download_id: Uuid, now: Instant) -> Instant {
        let mut first_seen = self.first_seen.lock();
        if let Some(seen) = first_seen.get(&download_id) {
            return *seen;
        }

        if first_seen.len() >= self.capacity
            && let Some(oldest) = first_seen
                .iter()
                .min_by_key(|(_, seen)| **seen)
                .map(|(id, _)| *id)
        {
            debug!(download_id = %oldest, "Candidate map full, evicting oldest entry");
            first_seen.remove(&oldest);
        }

        first_seen.insert(download_id, now);
        now
    }

    pub fn clear(&self, download_id: Uuid) {
        self.first_seen.lock().remove(&download_id);
    }

    pub fn contains(&self, download_id: Uuid) -> bool {
        self.first_seen.lock().contains_key(&download_id)
    }

    pub fn len(&self) -> usize {
        self.first_seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What the client says about one download, whichever list it came from
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub client_item_id: String,
    pub state: ItemState,
    pub progress: f64,
    pub size: i64,
    pub downloaded: i64,
    pub complete: bool,
    pub content_path: Option<String>,
}

impl From<&QueueItem> for Observation {
    fn from(item: &QueueItem) -> Self {
        Self {
            client_item_id: item.id.clone(),
            state: item.state,
            progress: item.progress,
            size: item.size,
            downloaded: item.downloaded,
            complete: item.is_complete(),
            content_path: item.content_path.clone(),
        }
    }
}

impl From<&HistoryItem> for Observation {
    fn from(item: &HistoryItem) -> Self {
        Self {
            client_item_id: item.id.clone(),
            state: if item.failed {
                ItemState::Failed
            } else {
                ItemState::Completed
            },
            progress: if item.failed { 0.0 } else { 100.0 },
            size: item.size,
            downloaded: if item.failed { 0 } else { item.size },
            complete: !item.failed,
            content_path: item.content_path.clone(),
        }
    }
}

fn same_id(a: &str, b: &str) -> bool {
    !a.is_empty() && a.eq_ignore_ascii_case(b)
}

/// Find what the client reports for `download`.
///
/// Tried in order: the stored client id, any alternate id from the metadata
/// bag, then title containment against the client's history.
pub fn match_download(
    download: &DownloadRecord,
    queue: &[QueueItem],
    history: &[HistoryItem],
) -> Option<Observation> {
    let mut ids: Vec<&str> = Vec::new();
    if let Some(id) = download.client_item_id.as_deref() {
        ids.push(id);
    }
    ids.extend(ALTERNATE_ID_KEYS.iter().filter_map(|key| download.metadata_value(key)));

    for id in ids {
        if let Some(item) = queue.iter().find(|q| same_id(&q.id, id)) {
            return Some(item.into());
        }
        if let Some(item) = history.iter().find(|h| same_id(&h.id, id)) {
            return Some(item.into());
        }
    }

    history
        .iter()
        .find(|h| titles_overlap(&h.title, &download.title))
        .map(Observation::from)
}

fn progress_status(state: ItemState) -> DownloadStatus {
    match state {
        ItemState::Paused => DownloadStatus::Paused,
        ItemState::Queued | ItemState::Unknown => DownloadStatus::Queued,
        _ => DownloadStatus::Downloading,
    }
}

/// Counts from one poll of one client
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollSummary {
    pub monitored: usize,
    pub updated: usize,
    pub pending: usize,
    pub enqueued: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub poll_interval: Duration,
    pub debounce: Duration,
    pub candidate_capacity: usize,
    pub max_retries: u32,
}

pub struct CompletionDetector {
    db: Database,
    clients: Arc<ClientRegistry>,
    resolver: Arc<PathResolver>,
    candidates: CandidateTracker,
    /// Finished downloads already warned about for lacking a path
    pathless: Mutex<HashSet<Uuid>>,
    events: EventBus,
    metrics: Metrics,
    config: DetectorConfig,
}

impl CompletionDetector {
    pub fn new(
        db: Database,
        clients: Arc<ClientRegistry>,
        resolver: Arc<PathResolver>,
        events: EventBus,
        metrics: Metrics,
        config: DetectorConfig,
    ) -> Self {
        Self {
            db,
            clients,
            resolver,
            candidates: CandidateTracker::new(config.candidate_capacity),
            pathless: Mutex::new(HashSet::new()),
            events,
            metrics,
            config,
        }
    }

    pub fn candidates(&self) -> &CandidateTracker {
        &self.candidates
    }

    /// Poll every enabled client on its own task until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let clients = match self.db.download_clients().list_enabled().await {
            Ok(clients) => clients,
            Err(e) => {
                warn!(error = %e, "Failed to load download clients, detector not started");
                return;
            }
        };

        let mut tasks = JoinSet::new();
        for client in clients {
            if self.clients.get(client.id).is_none() {
                continue;
            }
            let detector = self.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                detector.poll_loop(client.id, client.name, cancel).await;
            });
        }

        info!(clients = tasks.len(), "Completion detector started");
        while tasks.join_next().await.is_some() {}
        info!("Completion detector stopped");
    }

    async fn poll_loop(&self, client_id: Uuid, name: String, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.poll_client(client_id) => match result {
                    Ok(summary) if summary.enqueued > 0 || summary.updated > 0 => {
                        debug!(client = %name, ?summary, "Poll complete");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        self.metrics.increment(metrics::POLL_FAILED);
                        warn!(client = %name, error = %e, "Download client poll failed");
                    }
                },
            }
        }
    }

    pub async fn poll_client(&self, client_id: Uuid) -> Result<PollSummary> {
        self.poll_client_at(client_id, Instant::now()).await
    }

    /// One poll of one client as of `now`
    pub async fn poll_client_at(&self, client_id: Uuid, now: Instant) -> Result<PollSummary> {
        let adapter = self
            .clients
            .get(client_id)
            .with_context(|| format!("No adapter registered for client {}", client_id))?;

        let downloads = self.db.downloads().list_monitored_for_client(client_id).await?;
        let mut summary = PollSummary {
            monitored: downloads.len(),
            ..Default::default()
        };
        if downloads.is_empty() {
            return Ok(summary);
        }

        let queue = adapter.queue().await?;
        let history = match adapter.history(HISTORY_LIMIT).await {
            Ok(history) => history,
            Err(e) => {
                warn!(client = %adapter.name(), error = %e, "Failed to fetch client history");
                Vec::new()
            }
        };

        for download in downloads {
            let Some(observation) = match_download(&download, &queue, &history) else {
                self.candidates.clear(download.id);
                continue;
            };

            if download.client_item_id.is_none() {
                self.db
                    .downloads()
                    .set_client_item_id(download.id, &observation.client_item_id)
                    .await?;
            }

            if observation.state == ItemState::Failed {
                self.candidates.clear(download.id);
                let message = format!("{} reported the download as failed", adapter.name());
                if self
                    .db
                    .downloads()
                    .set_status(download.id, DownloadStatus::Failed, Some(&message))
                    .await?
                {
                    warn!(download_id = %download.id, client = %adapter.name(), "Download failed in client");
                    summary.failed += 1;
                }
                continue;
            }

            if !observation.complete {
                self.candidates.clear(download.id);
                self.record_progress(&download, &observation).await?;
                summary.updated += 1;
                continue;
            }

            let first_seen = self.candidates.observe(download.id, now);
            if now.saturating_duration_since(first_seen) < self.config.debounce {
                debug!(download_id = %download.id, "Completion pending debounce");
                summary.pending += 1;
                continue;
            }

            if self.finalize(&download, &observation).await? {
                summary.enqueued += 1;
            }
        }

        Ok(summary)
    }

    async fn record_progress(&self, download: &DownloadRecord, observation: &Observation) -> Result<()> {
        let status = progress_status(observation.state);
        let updated = self
            .db
            .downloads()
            .update_progress(
                download.id,
                ProgressUpdate {
                    progress: observation.progress,
                    downloaded_size: observation.downloaded,
                    total_size: observation.size,
                    status,
                },
            )
            .await?;

        if updated {
            self.events.publish(PipelineEvent::DownloadProgress {
                download_id: download.id,
                progress: observation.progress,
                status,
            });
        }
        Ok(())
    }

    /// Resolve the payload and enqueue a processing job.
    ///
    /// Returns true if a job was enqueued. A download that already has an
    /// active job is left alone.
    async fn finalize(&self, download: &DownloadRecord, observation: &Observation) -> Result<bool> {
        let jobs = self.db.processing_jobs();
        if jobs.get_active_for_download(download.id).await?.is_some() {
            debug!(download_id = %download.id, "Active job exists, skipping finalization");
            self.candidates.clear(download.id);
            return Ok(false);
        }

        let Some(reported) = observation
            .content_path
            .clone()
            .or_else(|| download.download_path.clone())
        else {
            // Restart the debounce window so a path reported later is picked up
            self.candidates.clear(download.id);
            if self.pathless.lock().insert(download.id) {
                warn!(download_id = %download.id, "Client reported completion without a path");
            } else {
                debug!(download_id = %download.id, "Still no path for finished download");
            }
            return Ok(false);
        };
        self.pathless.lock().remove(&download.id);

        let resolved = self.resolver.resolve(download.client_id, &reported).await?;
        let source_path = resolved.path.to_string_lossy().to_string();

        self.db.downloads().mark_completed(download.id, Some(&reported)).await?;
        if resolved.exists {
            self.db.downloads().set_final_path(download.id, &source_path).await?;
        } else {
            self.metrics.increment(metrics::SOURCE_MISSING);
            warn!(
                download_id = %download.id,
                reported = %reported,
                candidate = %source_path,
                "Completed download not found locally, enqueuing with best guess"
            );
        }
        self.events.publish(PipelineEvent::DownloadCompleted {
            download_id: download.id,
            title: download.title.clone(),
        });

        let created = jobs
            .try_create(CreateProcessingJob {
                download_id: download.id,
                source_path: source_path.clone(),
                client_id: download.client_id,
                priority: 0,
                max_retries: self.config.max_retries as i32,
            })
            .await?;
        self.candidates.clear(download.id);

        let Some(job) = created else {
            debug!(download_id = %download.id, "Another finalization enqueued this download first");
            return Ok(false);
        };

        info!(
            download_id = %download.id,
            job_id = %job.id,
            source = %source_path,
            heuristic = resolved.heuristic.unwrap_or("none"),
            "Download complete, processing job enqueued"
        );
        self.events.publish(PipelineEvent::JobQueued {
            job_id: job.id,
            download_id: download.id,
            source_path,
        });
        Ok(true)
    }
}
