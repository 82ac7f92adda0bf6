//! Construction of the detector, worker and their shared collaborators

use std::sync::Arc;

use anyhow::Result;

use crate::config::PipelineSettings;
use crate::db::Database;
use crate::services::extractor::ArchiveExtractor;
use crate::services::metadata::MetadataExtractor;
use crate::services::rate_limiter::RetryConfig;
use crate::services::{
    ClientRegistry, CompletionDetector, ContentResolver, DatabasePathMapper, DetectorConfig,
    EventBus, ExtractorService, Importer, LoftyExtractor, MetadataService, Metrics, PathResolver,
    ProcessingWorker, Service, TaskService, WorkerConfig,
};

/// Capacity of the in-process event channel
const EVENT_CAPACITY: usize = 256;

/// Every long-lived pipeline component, wired together
pub struct Pipeline {
    pub db: Database,
    pub settings: PipelineSettings,
    pub clients: Arc<ClientRegistry>,
    pub extractor: Arc<ExtractorService>,
    pub importer: Arc<Importer>,
    pub detector: Arc<CompletionDetector>,
    pub worker: Arc<ProcessingWorker>,
    pub events: EventBus,
    pub metrics: Metrics,
}

impl Pipeline {
    /// Build adapters for every enabled client in the database and wire the pipeline
    pub async fn from_database(db: Database, settings: PipelineSettings) -> Result<Self> {
        let records = db.download_clients().list_enabled().await?;
        let clients = Arc::new(ClientRegistry::from_records(&records));
        let metadata = Arc::new(MetadataService::new(
            Arc::new(LoftyExtractor),
            settings.metadata_max_concurrent,
            settings.metadata_rate_per_second,
        ));
        Self::new(db, settings, clients, metadata)
    }

    /// Wire the pipeline around explicit clients and metadata extractor
    pub fn new(
        db: Database,
        settings: PipelineSettings,
        clients: Arc<ClientRegistry>,
        metadata: Arc<dyn MetadataExtractor>,
    ) -> Result<Self> {
        let events = EventBus::new(EVENT_CAPACITY);
        let metrics = Metrics::new();

        let extractor = Arc::new(ExtractorService::new(settings.work_path.clone()));
        let archive_extractor: Arc<dyn ArchiveExtractor> = extractor.clone();
        let resolver = Arc::new(ContentResolver::new(
            archive_extractor,
            settings.allowed_extensions.clone(),
            settings.extract_archives,
            settings.work_path.clone(),
        ));
        let importer = Arc::new(Importer::new(
            db.clone(),
            metadata,
            &settings,
            events.clone(),
            metrics.clone(),
        )?);

        let path_resolver = Arc::new(PathResolver::new(Arc::new(DatabasePathMapper::new(
            db.clone(),
        ))));
        let detector = Arc::new(CompletionDetector::new(
            db.clone(),
            clients.clone(),
            path_resolver,
            events.clone(),
            metrics.clone(),
            DetectorConfig {
                poll_interval: settings.poll_interval,
                debounce: settings.completion_debounce,
                candidate_capacity: settings.candidate_capacity,
                max_retries: settings.missing_source_max_retries,
            },
        ));

        let worker = Arc::new(ProcessingWorker::new(
            db.clone(),
            resolver,
            importer.clone(),
            extractor.clone(),
            clients.clone(),
            events.clone(),
            metrics.clone(),
            WorkerConfig {
                interval: settings.queue_worker_interval,
                max_concurrent: settings.queue_max_concurrent,
                retry: RetryConfig::missing_source(
                    settings.missing_source_retry_initial_delay,
                    settings.missing_source_max_retries,
                ),
                action: settings.completed_file_action,
            },
        ));

        Ok(Self {
            db,
            settings,
            clients,
            extractor,
            importer,
            detector,
            worker,
            events,
            metrics,
        })
    }

    /// Background services for the manager: the worker starts before the detector
    pub fn services(&self) -> Vec<Arc<dyn Service>> {
        let worker = self.worker.clone();
        let detector = self.detector.clone();

        vec![
            Arc::new(TaskService::new("processing_worker", move |cancel| {
                worker.clone().run(cancel)
            })),
            Arc::new(
                TaskService::new("completion_detector", move |cancel| {
                    detector.clone().run(cancel)
                })
                .depends_on("processing_worker"),
            ),
        ]
    }
}
