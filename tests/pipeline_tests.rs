//! Integration tests for the completion and import pipeline
//!
//! Download clients are replaced with an in-memory stub, metadata comes from
//! a fixed extractor and everything else (database, path resolution, queue
//! worker, importer, filesystem) is the real thing running against a temp
//! directory and an in-memory SQLite database.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use uuid::Uuid;

use librarian_ingest::config::{CompletedFileAction, PipelineSettings};
use librarian_ingest::db::{
    ClientKind, CreateDownload, CreateDownloadClient, CreateLibraryFile, CreateLibraryItem,
    CreateProcessingJob, Database, DownloadRecord, DownloadStatus, HistoryEventType, JobStatus,
    LibraryItemRecord, PostImportAction,
};
use librarian_ingest::services::download_client::{
    ClientError, ClientRegistry, DownloadClientAdapter, HistoryItem, ItemState, QueueItem,
    derive_downloaded, parse_progress,
};
use librarian_ingest::services::metadata::{AudioMetadata, MetadataExtractor};
use librarian_ingest::services::metrics;
use librarian_ingest::services::path_resolver::PathResolver;
use librarian_ingest::services::{DatabasePathMapper, PipelineEvent};
use librarian_ingest::Pipeline;

// ============================================================================
// Fixtures
// ============================================================================

#[derive(Default)]
struct StubClient {
    queue: Mutex<Vec<QueueItem>>,
    history: Mutex<Vec<HistoryItem>>,
    removed: Mutex<Vec<(String, bool)>>,
}

impl StubClient {
    fn set_queue(&self, items: Vec<QueueItem>) {
        *self.queue.lock() = items;
    }

    fn set_history(&self, items: Vec<HistoryItem>) {
        *self.history.lock() = items;
    }
}

#[async_trait]
impl DownloadClientAdapter for StubClient {
    fn name(&self) -> &str {
        "stub"
    }

    async fn test_connection(&self) -> Result<(), ClientError> {
        Ok(())
    }

    async fn add(&self, url: &str) -> Result<String, ClientError> {
        Ok(url.to_string())
    }

    async fn remove(&self, client_item_id: &str, delete_files: bool) -> Result<(), ClientError> {
        self.removed
            .lock()
            .push((client_item_id.to_string(), delete_files));
        Ok(())
    }

    async fn queue(&self) -> Result<Vec<QueueItem>, ClientError> {
        Ok(self.queue.lock().clone())
    }

    async fn history(&self, _limit: usize) -> Result<Vec<HistoryItem>, ClientError> {
        Ok(self.history.lock().clone())
    }
}

struct FixedMetadata(Option<u32>);

#[async_trait]
impl MetadataExtractor for FixedMetadata {
    async fn extract(&self, path: &Path) -> anyhow::Result<AudioMetadata> {
        Ok(AudioMetadata {
            bitrate: self.0,
            ..AudioMetadata::from_extension(path)
        })
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    root: PathBuf,
    db: Database,
    pipeline: Pipeline,
    client: Arc<StubClient>,
    client_id: Uuid,
}

impl Harness {
    async fn new(bitrate: Option<u32>) -> Self {
        Self::with_settings(bitrate, |_| {}).await
    }

    async fn with_settings(bitrate: Option<u32>, tweak: impl FnOnce(&mut PipelineSettings)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        let db = Database::in_memory().await.unwrap();

        let record = db
            .download_clients()
            .create(CreateDownloadClient {
                name: "stub".to_string(),
                kind: ClientKind::Qbittorrent,
                base_url: "http://localhost:8080".to_string(),
                username: None,
                password: None,
                api_key: None,
                category: None,
                enabled: true,
                post_import_action: PostImportAction::Remove,
            })
            .await
            .unwrap();

        let client = Arc::new(StubClient::default());
        let registry = Arc::new(ClientRegistry::new());
        registry.insert(record.id, client.clone());

        let mut settings = PipelineSettings {
            output_path: root.join("library"),
            work_path: root.join("work"),
            missing_source_retry_initial_delay: Duration::from_secs(30),
            missing_source_max_retries: 2,
            ..Default::default()
        };
        tweak(&mut settings);

        let pipeline = Pipeline::new(
            db.clone(),
            settings,
            registry,
            Arc::new(FixedMetadata(bitrate)),
        )
        .unwrap();

        Self {
            _dir: dir,
            root,
            db,
            pipeline,
            client,
            client_id: record.id,
        }
    }

    fn touch(&self, relative: &str) -> PathBuf {
        let path = self.root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"audio").unwrap();
        path
    }

    async fn download(&self, title: &str, client_item_id: Option<&str>) -> DownloadRecord {
        self.db
            .downloads()
            .create(CreateDownload {
                title: title.to_string(),
                client_id: Some(self.client_id),
                client_item_id: client_item_id.map(str::to_string),
                total_size: 1000,
                ..Default::default()
            })
            .await
            .unwrap()
    }

    async fn item(&self, title: &str, author: &str, base_path: &Path) -> LibraryItemRecord {
        self.db
            .library_items()
            .create(CreateLibraryItem {
                title: title.to_string(),
                author: Some(author.to_string()),
                base_path: Some(base_path.to_string_lossy().to_string()),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    async fn download_for_item(&self, title: &str, item_id: Uuid) -> DownloadRecord {
        self.db
            .downloads()
            .create(CreateDownload {
                title: title.to_string(),
                client_id: Some(self.client_id),
                library_item_id: Some(item_id),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    async fn enqueue(&self, download_id: Uuid, source: &Path) -> Uuid {
        self.db
            .processing_jobs()
            .try_create(CreateProcessingJob {
                download_id,
                source_path: source.to_string_lossy().to_string(),
                client_id: Some(self.client_id),
                priority: 0,
                max_retries: 2,
            })
            .await
            .unwrap()
            .unwrap()
            .id
    }

    async fn process(&self, job_id: Uuid) -> JobStatus {
        let job = self.db.processing_jobs().get(job_id).await.unwrap().unwrap();
        self.pipeline.worker.process_job(job).await.unwrap()
    }

    async fn history_types(&self, download_id: Uuid) -> Vec<HistoryEventType> {
        self.db
            .history()
            .list_for_download(download_id)
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.event_type)
            .collect()
    }
}

fn finished(id: &str, path: &Path) -> QueueItem {
    QueueItem {
        id: id.to_string(),
        title: "irrelevant".to_string(),
        state: ItemState::Completed,
        progress: 100.0,
        size: 1000,
        downloaded: 1000,
        content_path: Some(path.to_string_lossy().to_string()),
    }
}

fn downloading(id: &str, progress: f64) -> QueueItem {
    QueueItem {
        id: id.to_string(),
        title: "irrelevant".to_string(),
        state: ItemState::Downloading,
        progress,
        size: 1000,
        downloaded: derive_downloaded(progress, 1000),
        content_path: None,
    }
}

fn write_zip(path: &Path, entries: &[(&str, &str)]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut zip = zip::ZipWriter::new(std::fs::File::create(path).unwrap());
    for (name, data) in entries {
        zip.start_file(*name, zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(data.as_bytes()).unwrap();
    }
    zip.finish().unwrap();
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

// ============================================================================
// Completion detection
// ============================================================================

#[tokio::test]
async fn test_progress_string_parses_and_is_recorded() {
    let progress = parse_progress(&serde_json::json!("50.5")).unwrap();
    assert!(progress > 50.0 && progress < 51.0);
    let downloaded = derive_downloaded(progress, 1000);
    assert!((500..=510).contains(&downloaded));

    let h = Harness::new(Some(64)).await;
    let dl = h.download("Dune", Some("abc")).await;
    h.client.set_queue(vec![downloading("abc", progress)]);
    let mut events = h.pipeline.events.subscribe();

    let summary = h
        .pipeline
        .detector
        .poll_client_at(h.client_id, Instant::now())
        .await
        .unwrap();
    assert_eq!(summary.updated, 1);

    let stored = h.db.downloads().get(dl.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DownloadStatus::Downloading);
    assert!(stored.progress > 50.0 && stored.progress < 51.0);
    assert_eq!(stored.downloaded_size, downloaded);

    assert_matches!(
        events.try_recv(),
        Ok(PipelineEvent::DownloadProgress { download_id, .. }) if download_id == dl.id
    );
}

#[tokio::test]
async fn test_completion_waits_for_debounce_and_survives_flaps() {
    let h = Harness::new(Some(64)).await;
    let payload = h.touch("downloads/Dune/01.mp3").parent().unwrap().to_path_buf();
    let dl = h.download("Dune", Some("abc")).await;
    let detector = &h.pipeline.detector;
    let jobs = h.db.processing_jobs();
    let t0 = Instant::now();

    h.client.set_queue(vec![finished("abc", &payload)]);
    assert_eq!(detector.poll_client_at(h.client_id, t0).await.unwrap().pending, 1);
    assert_eq!(detector.poll_client_at(h.client_id, t0 + secs(5)).await.unwrap().pending, 1);

    // transient flap back to downloading resets the window
    h.client.set_queue(vec![downloading("abc", 99.0)]);
    detector.poll_client_at(h.client_id, t0 + secs(8)).await.unwrap();
    assert!(!detector.candidates().contains(dl.id));

    h.client.set_queue(vec![finished("abc", &payload)]);
    detector.poll_client_at(h.client_id, t0 + secs(10)).await.unwrap();
    let summary = detector.poll_client_at(h.client_id, t0 + secs(20)).await.unwrap();
    assert_eq!(summary.enqueued, 0);
    assert!(jobs.get_active_for_download(dl.id).await.unwrap().is_none());

    let summary = detector.poll_client_at(h.client_id, t0 + secs(26)).await.unwrap();
    assert_eq!(summary.enqueued, 1);
    assert!(!detector.candidates().contains(dl.id));

    let job = jobs.get_active_for_download(dl.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(PathBuf::from(&job.source_path), payload);

    let stored = h.db.downloads().get(dl.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DownloadStatus::Completed);
    assert_eq!(stored.final_path.map(PathBuf::from), Some(payload));
    assert_eq!(h.pipeline.metrics.get(metrics::SOURCE_MISSING), 0);
}

#[tokio::test]
async fn test_finished_without_path_restarts_debounce() {
    let h = Harness::new(Some(64)).await;
    let payload = h.touch("downloads/Dune.m4b");
    let dl = h.download("Dune", Some("abc")).await;
    let detector = &h.pipeline.detector;
    let t0 = Instant::now();

    let mut pathless = finished("abc", &payload);
    pathless.content_path = None;
    h.client.set_queue(vec![pathless]);
    assert_eq!(detector.poll_client_at(h.client_id, t0).await.unwrap().pending, 1);

    let summary = detector.poll_client_at(h.client_id, t0 + secs(30)).await.unwrap();
    assert_eq!(summary.enqueued, 0);
    assert!(!detector.candidates().contains(dl.id));

    // Next poll starts a fresh window instead of retrying finalization
    assert_eq!(detector.poll_client_at(h.client_id, t0 + secs(31)).await.unwrap().pending, 1);

    h.client.set_queue(vec![finished("abc", &payload)]);
    let summary = detector.poll_client_at(h.client_id, t0 + secs(60)).await.unwrap();
    assert_eq!(summary.enqueued, 1);
    let stored = h.db.downloads().get(dl.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DownloadStatus::Completed);
}

#[tokio::test]
async fn test_no_second_job_while_one_is_active() {
    let h = Harness::new(Some(64)).await;
    let payload = h.touch("downloads/Dune.m4b");
    let dl = h.download("Dune", Some("abc")).await;
    let detector = &h.pipeline.detector;
    let t0 = Instant::now();

    h.client.set_queue(vec![finished("abc", &payload)]);
    detector.poll_client_at(h.client_id, t0).await.unwrap();
    assert_eq!(detector.poll_client_at(h.client_id, t0 + secs(16)).await.unwrap().enqueued, 1);

    // still reported complete: no new job and no metric
    detector.poll_client_at(h.client_id, t0 + secs(40)).await.unwrap();
    let summary = detector.poll_client_at(h.client_id, t0 + secs(60)).await.unwrap();
    assert_eq!(summary.enqueued, 0);
    assert_eq!(h.db.processing_jobs().list_for_download(dl.id).await.unwrap().len(), 1);
    assert_eq!(h.pipeline.metrics.get(metrics::SOURCE_MISSING), 0);

    // and the database refuses a second active job on its own
    let second = h
        .db
        .processing_jobs()
        .try_create(CreateProcessingJob {
            download_id: dl.id,
            source_path: "/elsewhere".to_string(),
            client_id: None,
            priority: 0,
            max_retries: 3,
        })
        .await
        .unwrap();
    assert!(second.is_none());
}

#[tokio::test]
async fn test_missing_payload_is_enqueued_with_best_guess() {
    let h = Harness::new(Some(64)).await;
    let missing = h.root.join("downloads/Nowhere");
    let dl = h.download("Nowhere", Some("abc")).await;
    let t0 = Instant::now();

    h.client.set_queue(vec![finished("abc", &missing)]);
    h.pipeline.detector.poll_client_at(h.client_id, t0).await.unwrap();
    let summary = h
        .pipeline
        .detector
        .poll_client_at(h.client_id, t0 + secs(15))
        .await
        .unwrap();

    assert_eq!(summary.enqueued, 1);
    assert_eq!(h.pipeline.metrics.get(metrics::SOURCE_MISSING), 1);
    let job = h
        .db
        .processing_jobs()
        .get_active_for_download(dl.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(PathBuf::from(job.source_path), missing);
    let stored = h.db.downloads().get(dl.id).await.unwrap().unwrap();
    assert!(stored.final_path.is_none());
}

#[tokio::test]
async fn test_history_title_match_sets_client_id() {
    let h = Harness::new(Some(64)).await;
    let payload = h.touch("complete/Frank.Herbert.Dune.2019/dune.m4b");
    let dl = h.download("Frank Herbert - Dune", None).await;
    let t0 = Instant::now();

    h.client.set_history(vec![HistoryItem {
        id: "SABnzbd_nzo_1".to_string(),
        title: "Frank.Herbert.Dune.2019".to_string(),
        failed: false,
        size: 1000,
        content_path: Some(payload.parent().unwrap().to_string_lossy().to_string()),
    }]);

    h.pipeline.detector.poll_client_at(h.client_id, t0).await.unwrap();
    let summary = h
        .pipeline
        .detector
        .poll_client_at(h.client_id, t0 + secs(15))
        .await
        .unwrap();
    assert_eq!(summary.enqueued, 1);

    let stored = h.db.downloads().get(dl.id).await.unwrap().unwrap();
    assert_eq!(stored.client_item_id.as_deref(), Some("SABnzbd_nzo_1"));
}

#[tokio::test]
async fn test_failed_history_item_fails_download() {
    let h = Harness::new(Some(64)).await;
    let dl = h.download("Dune", Some("nzo_2")).await;

    h.client.set_history(vec![HistoryItem {
        id: "nzo_2".to_string(),
        title: "Dune".to_string(),
        failed: true,
        size: 0,
        content_path: None,
    }]);

    let summary = h
        .pipeline
        .detector
        .poll_client_at(h.client_id, Instant::now())
        .await
        .unwrap();
    assert_eq!(summary.failed, 1);

    let stored = h.db.downloads().get(dl.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DownloadStatus::Failed);
    assert!(stored.error_message.is_some());
}

// ============================================================================
// Path resolution
// ============================================================================

#[tokio::test]
async fn test_numeric_suffix_only_stripped_after_suffixed_path_fails() {
    let h = Harness::new(None).await;
    let resolver = PathResolver::new(Arc::new(DatabasePathMapper::new(h.db.clone())));
    std::fs::create_dir_all(h.root.join("downloads/Dune")).unwrap();

    let reported = h.root.join("downloads/Dune.1");
    let resolved = resolver
        .resolve(Some(h.client_id), &reported.to_string_lossy())
        .await
        .unwrap();
    assert!(resolved.exists);
    assert_eq!(resolved.path, h.root.join("downloads/Dune"));
    assert!(resolved.heuristic.is_some());

    std::fs::create_dir_all(&reported).unwrap();
    let resolved = resolver
        .resolve(Some(h.client_id), &reported.to_string_lossy())
        .await
        .unwrap();
    assert_eq!(resolved.path, reported);
    assert!(resolved.heuristic.is_none());
}

// ============================================================================
// Processing queue
// ============================================================================

#[tokio::test]
async fn test_missing_source_retries_then_fails() {
    let h = Harness::new(Some(64)).await;
    let dl = h.download("Ghost Book", None).await;
    let job_id = h.enqueue(dl.id, &h.root.join("downloads/ghost.mp3")).await;
    let jobs = h.db.processing_jobs();

    for attempt in 1..=2 {
        assert_eq!(h.process(job_id).await, JobStatus::Retry);
        let job = jobs.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Retry);
        assert_eq!(job.retry_count, attempt);
        assert!(job.error_message.unwrap().contains("not found"));
        assert!(job.next_retry_at.is_some());
    }

    assert_eq!(h.process(job_id).await, JobStatus::Failed);
    let job = jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);

    let stored = h.db.downloads().get(dl.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DownloadStatus::Failed);
    assert!(stored.error_message.unwrap().contains("not found"));
    assert_eq!(h.pipeline.metrics.get(metrics::SOURCE_MISSING), 3);
    assert_eq!(h.pipeline.metrics.get(metrics::JOBS_FAILED), 1);
}

#[tokio::test]
async fn test_retry_delay_doubles() {
    let h = Harness::new(Some(64)).await;
    let dl = h.download("Ghost Book", None).await;
    let job_id = h.enqueue(dl.id, &h.root.join("downloads/ghost.mp3")).await;
    let jobs = h.db.processing_jobs();

    let before = chrono::Utc::now();
    h.process(job_id).await;
    let first = jobs.get(job_id).await.unwrap().unwrap().next_retry_at.unwrap();
    h.process(job_id).await;
    let second = jobs.get(job_id).await.unwrap().unwrap().next_retry_at.unwrap();

    let first_delay = (first - before).num_seconds();
    let second_delay = (second - before).num_seconds();
    assert!((29..=31).contains(&first_delay), "first delay {}", first_delay);
    assert!((59..=61).contains(&second_delay), "second delay {}", second_delay);
}

#[tokio::test]
async fn test_full_flow_from_poll_to_library() {
    let h = Harness::new(Some(64)).await;
    let payload = h.touch("downloads/Frank Herbert - Dune/Dune.m4b");
    let payload_dir = payload.parent().unwrap().to_path_buf();
    let dl = h.download("Frank Herbert - Dune", Some("abc")).await;
    let t0 = Instant::now();

    h.client.set_queue(vec![finished("abc", &payload_dir)]);
    h.pipeline.detector.poll_client_at(h.client_id, t0).await.unwrap();
    h.pipeline
        .detector
        .poll_client_at(h.client_id, t0 + secs(15))
        .await
        .unwrap();

    let processed = h.pipeline.worker.clone().run_once().await.unwrap();
    assert_eq!(processed, 1);

    let stored = h.db.downloads().get(dl.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DownloadStatus::Moved);
    let item_id = stored.library_item_id.unwrap();

    let files = h.db.library_files().list_for_item(item_id).await.unwrap();
    assert_eq!(files.len(), 1);
    let expected = h.root.join("library/Frank Herbert/Dune/Dune.m4b");
    assert_eq!(PathBuf::from(&files[0].path), expected);
    assert!(expected.exists());
    assert!(!payload.exists());

    let types = h.history_types(dl.id).await;
    assert!(types.contains(&HistoryEventType::FileAdded));
    assert!(types.contains(&HistoryEventType::Imported));
    assert_eq!(h.client.removed.lock().clone(), vec![("abc".to_string(), false)]);

    let job = h.db.processing_jobs().list_for_download(dl.id).await.unwrap().remove(0);
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.processing_log.unwrap().contains("Imported"));
}

#[tokio::test]
async fn test_job_is_idempotent_once_imported() {
    let h = Harness::new(Some(64)).await;
    let source = h.touch("downloads/Emma.mp3");
    let dl = h.download("Jane Austen - Emma", None).await;

    let first = h.enqueue(dl.id, &source).await;
    assert_eq!(h.process(first).await, JobStatus::Completed);
    assert!(!source.exists());

    let second = h.enqueue(dl.id, &source).await;
    assert_eq!(h.process(second).await, JobStatus::Completed);

    let job = h.db.processing_jobs().get(second).await.unwrap().unwrap();
    assert_eq!(job.retry_count, 0);
    assert!(job.destination_path.unwrap().ends_with("Emma.mp3"));
    assert_eq!(h.db.library_files().count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_copy_action_leaves_source_and_marks_ready() {
    let h = Harness::with_settings(Some(64), |s| {
        s.completed_file_action = CompletedFileAction::Copy;
    })
    .await;
    let source = h.touch("downloads/Emma.mp3");
    let dl = h.download("Jane Austen - Emma", None).await;

    let job = h.enqueue(dl.id, &source).await;
    assert_eq!(h.process(job).await, JobStatus::Completed);

    assert!(source.exists());
    assert!(h.root.join("library/Jane Austen/Emma/Emma.mp3").exists());
    let stored = h.db.downloads().get(dl.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DownloadStatus::Ready);
}

// ============================================================================
// Content resolution and import
// ============================================================================

#[tokio::test]
async fn test_lower_quality_candidate_is_skipped() {
    let h = Harness::new(Some(128)).await;
    let base = h.root.join("library/Andy Weir/Project Hail Mary");
    let item = h.item("Project Hail Mary", "Andy Weir", &base).await;
    h.db
        .library_files()
        .create(CreateLibraryFile {
            item_id: item.id,
            path: base.join("Project Hail Mary.mp3").to_string_lossy().to_string(),
            size_bytes: 1000,
            bitrate: Some(320),
            format: Some("mp3".to_string()),
            source: "download".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    let source = h.touch("downloads/phm_128.mp3");
    let dl = h.download_for_item("Project Hail Mary", item.id).await;
    let job = h.enqueue(dl.id, &source).await;

    assert_eq!(h.process(job).await, JobStatus::Completed);
    assert_eq!(h.db.library_files().list_for_item(item.id).await.unwrap().len(), 1);
    assert!(source.exists());
    assert!(h.history_types(dl.id).await.contains(&HistoryEventType::QualitySkipped));
    assert_eq!(h.pipeline.metrics.get(metrics::QUALITY_SKIPPED), 1);
    assert_eq!(h.pipeline.metrics.get(metrics::FILES_ADDED), 0);
}

#[tokio::test]
async fn test_collisions_get_numbered_within_a_batch() {
    let h = Harness::new(Some(64)).await;
    let base = h.root.join("library/Andy Weir/The Martian");
    let item = h.item("The Martian", "Andy Weir", &base).await;
    std::fs::create_dir_all(&base).unwrap();
    std::fs::write(base.join("chapter.mp3"), b"existing").unwrap();

    h.touch("downloads/The Martian/chapter.mp3");
    h.touch("downloads/The Martian/disc2/chapter.mp3");
    let dl = h.download_for_item("The Martian", item.id).await;
    let job = h.enqueue(dl.id, &h.root.join("downloads/The Martian")).await;

    assert_eq!(h.process(job).await, JobStatus::Completed);

    let mut names: Vec<String> = h
        .db
        .library_files()
        .list_for_item(item.id)
        .await
        .unwrap()
        .into_iter()
        .map(|f| {
            PathBuf::from(f.path)
                .file_name()
                .unwrap()
                .to_string_lossy()
                .to_string()
        })
        .collect();
    names.sort();
    assert_eq!(names, vec!["chapter (1).mp3", "chapter (2).mp3"]);
    assert_eq!(std::fs::read(base.join("chapter.mp3")).unwrap(), b"existing");
}

#[tokio::test]
async fn test_nested_archive_imports_extracted_file() {
    let h = Harness::new(Some(64)).await;
    let source = h.root.join("downloads/Leviathan Wakes");
    write_zip(
        &source.join("parts/book.zip"),
        &[("track01.mp3", "audio"), ("readme.nfo", "x")],
    );
    let dl = h.download("James S. A. Corey - Leviathan Wakes", None).await;
    let job = h.enqueue(dl.id, &source).await;

    assert_eq!(h.process(job).await, JobStatus::Completed);

    let stored = h.db.downloads().get(dl.id).await.unwrap().unwrap();
    let files = h
        .db
        .library_files()
        .list_for_item(stored.library_item_id.unwrap())
        .await
        .unwrap();
    assert_eq!(files.len(), 1);
    assert!(files[0].path.ends_with("track01.mp3"));

    // extraction directories are cleaned up afterwards
    let leftovers = std::fs::read_dir(h.root.join("work"))
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn test_corrupt_archive_does_not_block_siblings() {
    let h = Harness::new(Some(64)).await;
    let source = h.root.join("downloads/Mixed");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(source.join("broken.zip"), b"not a zip").unwrap();
    h.touch("downloads/Mixed/01.mp3");
    let dl = h.download("Some Author - Mixed", None).await;
    let job = h.enqueue(dl.id, &source).await;

    assert_eq!(h.process(job).await, JobStatus::Completed);
    assert_eq!(h.db.library_files().count().await.unwrap(), 1);
    assert!(h.history_types(dl.id).await.contains(&HistoryEventType::Failed));
    assert_eq!(h.pipeline.metrics.get(metrics::EXTRACTION_FAILED), 1);
}

#[tokio::test]
async fn test_item_outside_library_is_refused() {
    let h = Harness::new(Some(64)).await;
    let outside = h.root.join("elsewhere/Dune");
    let item = h.item("Dune", "Frank Herbert", &outside).await;

    let source = h.touch("downloads/dune.mp3");
    let dl = h.download_for_item("Dune", item.id).await;
    let job = h.enqueue(dl.id, &source).await;
    let mut events = h.pipeline.events.subscribe();

    assert_eq!(h.process(job).await, JobStatus::Completed);

    assert!(source.exists());
    assert!(!outside.exists());
    assert_eq!(h.db.library_files().count().await.unwrap(), 0);
    assert!(h.history_types(dl.id).await.contains(&HistoryEventType::Refused));
    assert_eq!(h.pipeline.metrics.get(metrics::IMPORT_REFUSED), 1);

    let mut refused = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, PipelineEvent::ImportRefused { .. }) {
            refused = true;
        }
    }
    assert!(refused);
}

#[tokio::test]
async fn test_directory_without_audio_fails_job() {
    let h = Harness::new(Some(64)).await;
    let source = h.root.join("downloads/Covers");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(source.join("cover.jpg"), b"jpg").unwrap();
    let dl = h.download("Covers", None).await;
    let job = h.enqueue(dl.id, &source).await;

    assert_eq!(h.process(job).await, JobStatus::Failed);
    let job = h.db.processing_jobs().get(job).await.unwrap().unwrap();
    assert!(job.error_message.unwrap().contains("No importable audio files"));

    // nothing was imported, so no library item is left behind
    assert!(h.db.library_items().list().await.unwrap().is_empty());
    let stored = h.db.downloads().get(dl.id).await.unwrap().unwrap();
    assert_eq!(stored.library_item_id, None);
    assert!(!h.root.join("library").exists());
}

#[tokio::test]
async fn test_only_corrupt_archives_leave_no_item() {
    let h = Harness::new(Some(64)).await;
    let source = h.root.join("downloads/Broken");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(source.join("book.zip"), b"not a zip").unwrap();
    let dl = h.download("Some Author - Broken", None).await;
    let job = h.enqueue(dl.id, &source).await;

    assert_eq!(h.process(job).await, JobStatus::Failed);
    assert!(h.db.library_items().list().await.unwrap().is_empty());
    let stored = h.db.downloads().get(dl.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DownloadStatus::Failed);
    assert_eq!(stored.library_item_id, None);
}

#[tokio::test]
async fn test_rerun_imports_remaining_chapters() {
    let h = Harness::new(Some(64)).await;
    let source = h.root.join("downloads/Dune");
    h.touch("downloads/Dune/01.mp3");
    let dl = h.download("Frank Herbert - Dune", None).await;

    let first = h.enqueue(dl.id, &source).await;
    assert_eq!(h.process(first).await, JobStatus::Completed);

    // the rest of the book shows up and the download is processed again
    let second_chapter = h.touch("downloads/Dune/02.mp3");
    let second = h.enqueue(dl.id, &source).await;
    assert_eq!(h.process(second).await, JobStatus::Completed);

    assert!(!second_chapter.exists());
    let base = h.root.join("library/Frank Herbert/Dune");
    assert!(base.join("01.mp3").exists());
    assert!(base.join("02.mp3").exists());
    assert_eq!(h.db.library_files().count().await.unwrap(), 2);
    assert_eq!(h.pipeline.metrics.get(metrics::QUALITY_SKIPPED), 0);
}
