//! Processing job queue worker
//!
//! Drains the durable `processing_jobs` table. Each pass first requeues
//! retries whose delay has elapsed, then claims queued jobs (priority
//! descending, oldest first) and runs them with bounded parallelism. A job
//! resolves its source into audio files, imports each one and writes the
//! terminal status back to both the job and its download.
//!
//! A missing source is treated as transient: the job is rescheduled with
//! exponential backoff until `max_retries` is exhausted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::content_resolver::{ContentItem, ContentResolver};
use super::download_client::ClientRegistry;
use super::events::{EventBus, PipelineEvent};
use super::extractor::ExtractorService;
use super::importer::{ImportBatch, ImportError, ImportOutcome, Importer};
use super::metrics::{self, Metrics};
use super::rate_limiter::RetryConfig;
use crate::config::CompletedFileAction;
use crate::db::{
    CreateHistoryEntry, Database, DownloadRecord, DownloadStatus, HistoryEventType, JobStatus,
    PostImportAction, ProcessingJobRecord,
};

/// Worker tuning
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub interval: std::time::Duration,
    pub max_concurrent: usize,
    pub retry: RetryConfig,
    pub action: CompletedFileAction,
}

/// Message recorded when a job's source is not on disk
pub fn source_missing_message(path: &str) -> String {
    format!("Source file not found at processing time: {}", path)
}

/// Per-job tally of import outcomes
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported: Vec<String>,
    pub skipped: usize,
    pub refused: usize,
    pub errors: Vec<String>,
}

impl ImportSummary {
    fn handled(&self) -> usize {
        self.imported.len() + self.skipped + self.refused
    }

    fn describe(&self) -> String {
        format!(
            "Imported {} file(s), skipped {}, refused {}, errors {}",
            self.imported.len(),
            self.skipped,
            self.refused,
            self.errors.len()
        )
    }
}

pub struct ProcessingWorker {
    db: Database,
    resolver: Arc<ContentResolver>,
    importer: Arc<Importer>,
    extractor: Arc<ExtractorService>,
    clients: Arc<ClientRegistry>,
    events: EventBus,
    metrics: Metrics,
    config: WorkerConfig,
    semaphore: Arc<Semaphore>,
}

impl ProcessingWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        resolver: Arc<ContentResolver>,
        importer: Arc<Importer>,
        extractor: Arc<ExtractorService>,
        clients: Arc<ClientRegistry>,
        events: EventBus,
        metrics: Metrics,
        config: WorkerConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            db,
            resolver,
            importer,
            extractor,
            clients,
            events,
            metrics,
            config,
            semaphore,
        }
    }

    /// Run the worker loop until `cancel` fires.
    ///
    /// Cancellation is only observed between passes, so jobs already running
    /// finish their file operations first.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            max_concurrent = self.config.max_concurrent,
            "Processing worker started"
        );

        match self.db.processing_jobs().requeue_interrupted().await {
            Ok(0) => {}
            Ok(count) => info!(count, "Requeued jobs interrupted by a previous shutdown"),
            Err(e) => warn!(error = %e, "Failed to requeue interrupted jobs"),
        }

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Processing worker shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.clone().run_once().await {
                        error!(error = %e, "Processing pass failed");
                    }
                }
            }
        }
    }

    /// One pass: requeue due retries, then process everything queued.
    ///
    /// Returns the number of jobs processed.
    pub async fn run_once(self: Arc<Self>) -> Result<usize> {
        let jobs = self.db.processing_jobs();

        for job in jobs.due_retries(Utc::now()).await? {
            if jobs.requeue(job.id).await? {
                debug!(job_id = %job.id, retry_count = job.retry_count, "Retry due, requeued");
                self.publish_status(&job, JobStatus::Queued, None);
            }
        }

        let mut tasks = JoinSet::new();
        while let Some(job) = jobs.next_queued().await? {
            if !jobs.claim(job.id).await? {
                continue;
            }
            self.publish_status(&job, JobStatus::Processing, None);

            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .context("Processing semaphore closed")?;
            let worker = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let job_id = job.id;
                if let Err(e) = worker.process_job(job).await {
                    error!(job_id = %job_id, error = %e, "Processing job crashed");
                    worker.fail_job_after_error(job_id, &format!("{:#}", e)).await;
                }
            });
        }

        let mut processed = 0;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Processing task panicked");
            }
            processed += 1;
        }
        Ok(processed)
    }

    /// Run one claimed job to a terminal or retry state
    pub async fn process_job(&self, job: ProcessingJobRecord) -> Result<JobStatus> {
        let Some(download) = self.db.downloads().get(job.download_id).await? else {
            let message = format!("Download {} no longer exists", job.download_id);
            self.db.processing_jobs().mark_failed(job.id, &message).await?;
            self.publish_status(&job, JobStatus::Failed, Some(message));
            return Ok(JobStatus::Failed);
        };

        self.db
            .downloads()
            .set_status(download.id, DownloadStatus::Processing, None)
            .await?;

        let source = PathBuf::from(&job.source_path);
        if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
            if let Some(destination) = self.previously_imported(&job, &download).await? {
                return self.complete_already_done(&job, &download, &destination).await;
            }
            return self.handle_missing_source(&job, &download).await;
        }

        let summary = self.import_source(&job, &download, &source).await?;

        if summary.handled() == 0 {
            let message = if summary.errors.is_empty() {
                format!("No importable audio files found in {}", job.source_path)
            } else {
                summary.errors.join("; ")
            };
            self.fail(&job, &download, &message).await?;
            return Ok(JobStatus::Failed);
        }

        self.complete(&job, &download, &summary).await?;
        Ok(JobStatus::Completed)
    }

    async fn import_source(
        &self,
        job: &ProcessingJobRecord,
        download: &DownloadRecord,
        source: &Path,
    ) -> Result<ImportSummary> {
        let repo = self.db.processing_jobs();
        let keep_source_names = source.is_dir() || super::extractor::is_archive(source);

        // Settled on the first audio file so a source without any leaves the
        // library untouched
        let mut batch: Option<ImportBatch> = None;
        let mut summary = ImportSummary::default();
        let mut stream = self.resolver.resolve(source);

        while let Some(item) = stream.next().await {
            match item {
                ContentItem::File(path) => {
                    if batch.is_none() {
                        let started = self.importer.begin_batch(download, keep_source_names).await?;
                        repo.append_log(
                            job.id,
                            &format!(
                                "Importing into {} for item '{}'",
                                started.base_dir.display(),
                                started.item.title
                            ),
                        )
                        .await?;
                        batch = Some(started);
                    }
                    let Some(batch) = batch.as_ref() else {
                        continue;
                    };
                    self.import_one(job, batch, &path, &mut summary).await?;
                }
                ContentItem::ExtractionFailed { archive, error } => {
                    self.metrics.increment(metrics::EXTRACTION_FAILED);
                    let message = format!("Failed to extract {}: {}", archive.display(), error);
                    repo.append_log(job.id, &message).await?;
                    self.db
                        .history()
                        .record(CreateHistoryEntry {
                            event_type: HistoryEventType::Failed,
                            item_id: batch
                                .as_ref()
                                .map(|b| b.item.id)
                                .or(download.library_item_id),
                            download_id: Some(download.id),
                            message: message.clone(),
                            details: Some(json!({
                                "archive": archive.to_string_lossy(),
                                "error": error,
                            })),
                        })
                        .await?;
                    summary.errors.push(message);
                }
            }
        }

        for dir in stream.extraction_dirs() {
            if let Err(e) = self.extractor.cleanup(dir).await {
                warn!(path = %dir.display(), error = %e, "Failed to remove extraction directory");
            }
        }

        if let Some(batch) = &batch
            && summary.handled() == 0
            && let Err(e) = self.importer.abandon_batch(batch).await
        {
            warn!(job_id = %job.id, error = %e, "Failed to roll back library item");
        }

        Ok(summary)
    }

    async fn import_one(
        &self,
        job: &ProcessingJobRecord,
        batch: &ImportBatch,
        path: &Path,
        summary: &mut ImportSummary,
    ) -> Result<()> {
        let repo = self.db.processing_jobs();
        match self.importer.import_file(batch, path).await {
            Ok(ImportOutcome::Imported(file)) => {
                repo.append_log(job.id, &format!("Imported {} -> {}", path.display(), file.path))
                    .await?;
                summary.imported.push(file.path);
            }
            Ok(ImportOutcome::QualitySkipped { candidate, existing }) => {
                repo.append_log(
                    job.id,
                    &format!(
                        "Skipped {}: {} is not better than {}",
                        path.display(),
                        candidate,
                        existing
                    ),
                )
                .await?;
                summary.skipped += 1;
            }
            Ok(ImportOutcome::Refused { reason, .. }) => {
                repo.append_log(job.id, &format!("Refused {}: {}", path.display(), reason))
                    .await?;
                summary.refused += 1;
            }
            Err(ImportError::Other(e)) => return Err(e),
            Err(e) => {
                warn!(job_id = %job.id, path = %path.display(), error = %e, "File import failed");
                repo.append_log(job.id, &format!("Error: {}", e)).await?;
                summary.errors.push(e.to_string());
            }
        }
        Ok(())
    }

    /// Destination recorded by an earlier run of the same download that is
    /// still on disk
    async fn previously_imported(
        &self,
        job: &ProcessingJobRecord,
        download: &DownloadRecord,
    ) -> Result<Option<String>> {
        if let Some(destination) = job.destination_path.as_deref()
            && tokio::fs::try_exists(destination).await.unwrap_or(false)
        {
            return Ok(Some(destination.to_string()));
        }

        let history = self.db.history().list_for_download(download.id).await?;
        for entry in history
            .iter()
            .filter(|h| h.event_type == HistoryEventType::FileAdded)
        {
            let destination = entry
                .details
                .as_ref()
                .and_then(|d| d.get("destination"))
                .and_then(|d| d.as_str());
            if let Some(destination) = destination
                && tokio::fs::try_exists(destination).await.unwrap_or(false)
            {
                return Ok(Some(destination.to_string()));
            }
        }
        Ok(None)
    }

    async fn complete_already_done(
        &self,
        job: &ProcessingJobRecord,
        download: &DownloadRecord,
        destination: &str,
    ) -> Result<JobStatus> {
        info!(
            job_id = %job.id,
            download_id = %download.id,
            destination = %destination,
            "Source gone but destination exists, treating job as done"
        );
        let message = format!("Source already imported to {}", destination);
        self.db
            .processing_jobs()
            .mark_completed(job.id, Some(destination), &message)
            .await?;
        self.finish_download(download, self.config.action).await?;
        self.metrics.increment(metrics::JOBS_COMPLETED);
        self.publish_status(job, JobStatus::Completed, Some(message));
        Ok(JobStatus::Completed)
    }

    async fn handle_missing_source(
        &self,
        job: &ProcessingJobRecord,
        download: &DownloadRecord,
    ) -> Result<JobStatus> {
        let message = source_missing_message(&job.source_path);
        self.metrics.increment(metrics::SOURCE_MISSING);

        let attempt = job.retry_count + 1;
        if attempt > job.max_retries {
            warn!(
                job_id = %job.id,
                download_id = %download.id,
                retries = job.retry_count,
                "Source still missing after max retries, failing job"
            );
            let final_message = format!("{} (max retries {} exceeded)", message, job.max_retries);
            self.fail(job, download, &final_message).await?;
            return Ok(JobStatus::Failed);
        }

        let delay = self.config.retry.delay_for_attempt(attempt as u32);
        let next_retry_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(6));
        self.db
            .processing_jobs()
            .mark_retry(job.id, attempt, &message, next_retry_at)
            .await?;
        self.metrics.increment(metrics::JOBS_RETRIED);

        info!(
            job_id = %job.id,
            download_id = %download.id,
            retry_count = attempt,
            delay_secs = delay.as_secs(),
            "Source missing, retry scheduled"
        );
        self.publish_status(job, JobStatus::Retry, Some(message));
        Ok(JobStatus::Retry)
    }

    async fn complete(
        &self,
        job: &ProcessingJobRecord,
        download: &DownloadRecord,
        summary: &ImportSummary,
    ) -> Result<()> {
        let message = summary.describe();
        let destination = summary.imported.first().map(String::as_str);
        self.db
            .processing_jobs()
            .mark_completed(job.id, destination, &message)
            .await?;

        let action = if summary.imported.is_empty() {
            CompletedFileAction::Copy
        } else {
            self.config.action
        };
        self.finish_download(download, action).await?;

        if !summary.imported.is_empty() {
            self.post_import_cleanup(download).await;
        }

        self.db
            .history()
            .record(CreateHistoryEntry {
                event_type: HistoryEventType::Imported,
                item_id: self
                    .db
                    .downloads()
                    .get(download.id)
                    .await?
                    .and_then(|d| d.library_item_id),
                download_id: Some(download.id),
                message: format!("{}: {}", download.title, message),
                details: Some(json!({
                    "job_id": job.id,
                    "imported": summary.imported,
                    "skipped": summary.skipped,
                    "refused": summary.refused,
                    "errors": summary.errors,
                })),
            })
            .await?;

        self.metrics.increment(metrics::JOBS_COMPLETED);
        info!(job_id = %job.id, download_id = %download.id, "{}", message);
        self.publish_status(job, JobStatus::Completed, Some(message));
        Ok(())
    }

    /// Moved when files left the client's directory, Ready otherwise
    async fn finish_download(&self, download: &DownloadRecord, action: CompletedFileAction) -> Result<()> {
        let status = match action {
            CompletedFileAction::Move => DownloadStatus::Moved,
            CompletedFileAction::Copy => DownloadStatus::Ready,
        };
        self.db.downloads().set_status(download.id, status, None).await?;
        Ok(())
    }

    async fn fail(&self, job: &ProcessingJobRecord, download: &DownloadRecord, message: &str) -> Result<()> {
        self.db.processing_jobs().mark_failed(job.id, message).await?;
        self.db
            .downloads()
            .set_status(download.id, DownloadStatus::Failed, Some(message))
            .await?;
        self.db
            .history()
            .record(CreateHistoryEntry {
                event_type: HistoryEventType::Failed,
                item_id: download.library_item_id,
                download_id: Some(download.id),
                message: message.to_string(),
                details: Some(json!({ "job_id": job.id, "source": job.source_path })),
            })
            .await?;
        self.metrics.increment(metrics::JOBS_FAILED);
        self.publish_status(job, JobStatus::Failed, Some(message.to_string()));
        Ok(())
    }

    /// Best effort: a job that errored out is failed with the error text
    async fn fail_job_after_error(&self, job_id: uuid::Uuid, message: &str) {
        let jobs = self.db.processing_jobs();
        let job = match jobs.get(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Failed to load crashed job");
                return;
            }
        };
        let result = match self.db.downloads().get(job.download_id).await {
            Ok(Some(download)) => self.fail(&job, &download, message).await,
            Ok(None) => jobs.mark_failed(job.id, message).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!(job_id = %job_id, error = %e, "Failed to record job failure");
        }
    }

    /// Apply the client's post-import action. Failures are logged only.
    async fn post_import_cleanup(&self, download: &DownloadRecord) {
        let (Some(client_id), Some(item_id)) = (download.client_id, download.client_item_id.as_deref())
        else {
            return;
        };

        let record = match self.db.download_clients().get(client_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                warn!(download_id = %download.id, error = %e, "Failed to load download client");
                return;
            }
        };

        let delete_files = match record.post_import_action {
            PostImportAction::None => return,
            PostImportAction::Remove => false,
            PostImportAction::RemoveAndDelete => true,
        };

        let Some(adapter) = self.clients.get(client_id) else {
            warn!(client = %record.name, "No adapter for download client, skipping removal");
            return;
        };

        match adapter.remove(item_id, delete_files).await {
            Ok(()) => info!(
                download_id = %download.id,
                client = %record.name,
                delete_files,
                "Removed imported item from download client"
            ),
            Err(e) => warn!(
                download_id = %download.id,
                client = %record.name,
                error = %e,
                "Failed to remove imported item from download client"
            ),
        }
    }

    fn publish_status(&self, job: &ProcessingJobRecord, status: JobStatus, message: Option<String>) {
        self.events.publish(PipelineEvent::JobStatusChanged {
            job_id: job.id,
            download_id: job.download_id,
            status,
            message,
        });
    }
}
