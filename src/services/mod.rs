//! Pipeline services

pub mod completion_detector;
pub mod content_resolver;
pub mod download_client;
pub mod events;
pub mod extractor;
pub mod file_ops;
pub mod importer;
pub mod manager;
pub mod metadata;
pub mod metrics;
pub mod naming;
pub mod path_resolver;
pub mod processing_queue;
pub mod quality;
pub mod rate_limiter;
pub mod text_utils;

pub use completion_detector::{CompletionDetector, DetectorConfig};
pub use content_resolver::{ContentItem, ContentResolver};
pub use download_client::{ClientRegistry, DownloadClientAdapter};
pub use events::{EventBus, PipelineEvent};
pub use extractor::ExtractorService;
pub use importer::{ImportOutcome, Importer};
pub use manager::{Service, ServicesManager, TaskService};
pub use metadata::{LoftyExtractor, MetadataService};
pub use metrics::Metrics;
pub use path_resolver::{DatabasePathMapper, PathResolver};
pub use processing_queue::{ProcessingWorker, WorkerConfig};
