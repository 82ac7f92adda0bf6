//! In-process pipeline counters

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

pub const SOURCE_MISSING: &str = "processing.source_missing";
pub const JOBS_COMPLETED: &str = "processing.completed";
pub const JOBS_FAILED: &str = "processing.failed";
pub const JOBS_RETRIED: &str = "processing.retried";
pub const FILES_ADDED: &str = "import.files_added";
pub const QUALITY_SKIPPED: &str = "import.quality_skipped";
pub const IMPORT_REFUSED: &str = "import.refused";
pub const EXTRACTION_FAILED: &str = "import.extraction_failed";
pub const POLL_FAILED: &str = "detector.poll_failed";

/// Named monotonically increasing counters, shared by cloning
#[derive(Clone, Default)]
pub struct Metrics {
    counters: Arc<RwLock<BTreeMap<String, u64>>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, name: &str) {
        self.add(name, 1);
    }

    pub fn add(&self, name: &str, value: u64) {
        let mut counters = self.counters.write();
        *counters.entry(name.to_string()).or_insert(0) += value;
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counters.read().get(name).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters.read().clone()
    }
}
