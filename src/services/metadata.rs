//! Audio metadata extraction
//!
//! [`LoftyExtractor`] reads tags and stream properties with lofty on a
//! blocking thread. [`MetadataService`] wraps any extractor with a
//! concurrency/rate limiter and a short-lived cache keyed by path and
//! modification time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use super::rate_limiter::{ConcurrencyLimiter, RateLimitConfig};

/// How long an extraction result is reused
pub const METADATA_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Stream properties and the tags the importer cares about
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AudioMetadata {
    pub duration_secs: Option<f64>,
    /// Lowercase format name ("mp3", "flac", "m4b")
    pub format: Option<String>,
    /// Container as reported by the parser ("Mpeg", "Mp4", "Flac")
    pub container: Option<String>,
    /// Kbps
    pub bitrate: Option<u32>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u8>,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub track_number: Option<u32>,
    pub disc_number: Option<u32>,
}

impl AudioMetadata {
    /// Fallback used when a file cannot be parsed: only the format, taken
    /// from the extension
    pub fn from_extension(path: &Path) -> Self {
        Self {
            format: extension_format(path),
            ..Default::default()
        }
    }
}

fn extension_format(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

#[async_trait]
pub trait MetadataExtractor: Send + Sync {
    async fn extract(&self, path: &Path) -> Result<AudioMetadata>;
}

/// Reads metadata with lofty
#[derive(Debug, Default, Clone, Copy)]
pub struct LoftyExtractor;

impl LoftyExtractor {
    fn read_blocking(path: &Path) -> Result<AudioMetadata> {
        use lofty::prelude::*;
        use lofty::probe::Probe;

        let tagged_file = Probe::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?
            .read()
            .with_context(|| format!("Failed to parse audio file {}", path.display()))?;

        let properties = tagged_file.properties();
        let duration = properties.duration();
        let tag = tagged_file
            .primary_tag()
            .or_else(|| tagged_file.first_tag());

        Ok(AudioMetadata {
            duration_secs: (!duration.is_zero()).then(|| duration.as_secs_f64()),
            format: extension_format(path),
            container: Some(format!("{:?}", tagged_file.file_type())),
            bitrate: properties
                .audio_bitrate()
                .or_else(|| properties.overall_bitrate()),
            sample_rate: properties.sample_rate(),
            channels: properties.channels(),
            title: tag.and_then(|t| t.title().map(|s| s.to_string())),
            artist: tag.and_then(|t| t.artist().map(|s| s.to_string())),
            album: tag.and_then(|t| t.album().map(|s| s.to_string())),
            track_number: tag.and_then(|t| t.track()),
            disc_number: tag.and_then(|t| t.disk()),
        })
    }
}

#[async_trait]
impl MetadataExtractor for LoftyExtractor {
    async fn extract(&self, path: &Path) -> Result<AudioMetadata> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::read_blocking(&path))
            .await
            .context("Metadata extraction task panicked")?
    }
}

type CacheKey = (PathBuf, Option<SystemTime>);

/// Rate-limited, cached metadata extraction
pub struct MetadataService {
    inner: Arc<dyn MetadataExtractor>,
    limiter: ConcurrencyLimiter,
    cache: Mutex<HashMap<CacheKey, (Instant, AudioMetadata)>>,
    ttl: Duration,
}

impl MetadataService {
    pub fn new(
        inner: Arc<dyn MetadataExtractor>,
        max_concurrent: usize,
        per_second: u32,
    ) -> Self {
        let limiter = ConcurrencyLimiter::new("metadata", max_concurrent).with_rate(RateLimitConfig {
            requests_per_second: per_second.max(1),
            burst_size: per_second.max(1),
        });

        Self {
            inner,
            limiter,
            cache: Mutex::new(HashMap::new()),
            ttl: METADATA_CACHE_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn cached(&self, key: &CacheKey) -> Option<AudioMetadata> {
        let cache = self.cache.lock();
        cache
            .get(key)
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, metadata)| metadata.clone())
    }

    fn store(&self, key: CacheKey, metadata: AudioMetadata) {
        let mut cache = self.cache.lock();
        let ttl = self.ttl;
        cache.retain(|_, (at, _)| at.elapsed() < ttl);
        cache.insert(key, (Instant::now(), metadata));
    }
}

#[async_trait]
impl MetadataExtractor for MetadataService {
    async fn extract(&self, path: &Path) -> Result<AudioMetadata> {
        let modified = tokio::fs::metadata(path)
            .await
            .ok()
            .and_then(|m| m.modified().ok());
        let key = (path.to_path_buf(), modified);

        if let Some(metadata) = self.cached(&key) {
            debug!(path = %path.display(), "Metadata cache hit");
            return Ok(metadata);
        }

        let metadata = self.limiter.run(|| self.inner.extract(path)).await??;
        self.store(key, metadata.clone());
        Ok(metadata)
    }
}
