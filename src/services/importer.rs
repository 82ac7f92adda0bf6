//! Quality-gated import of resolved audio files into the library
//!
//! An import runs as a batch per download. [`Importer::begin_batch`] settles
//! the owning library item, its directory and the best quality already on
//! disk. [`Importer::import_file`] then decides for each file whether to skip
//! it, refuse it or place it. Files this download imported, in this batch or
//! an earlier run of it, never count against later ones, so a multi-file book
//! is never gated against its own first chapter.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{EventBus, PipelineEvent};
use super::file_ops::{ReservedPaths, place_file};
use super::metadata::{AudioMetadata, MetadataExtractor};
use super::metrics::{self, Metrics};
use super::naming::{NamingContext, TemplateRenderer, sanitize_component, split_author_title};
use super::quality::Quality;
use super::text_utils::{title_similarity, titles_overlap};
use crate::config::{CompletedFileAction, PipelineSettings};
use crate::db::{
    CreateHistoryEntry, CreateLibraryFile, CreateLibraryItem, Database, DownloadRecord,
    HistoryEventType, LibraryFileRecord, LibraryItemRecord,
};

/// Provenance tag for files placed by this pipeline
pub const SOURCE_DOWNLOAD: &str = "download";

/// Minimum similarity for inferring an item from a download title
const ITEM_MATCH_THRESHOLD: f64 = 0.92;

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("source file {0} no longer exists")]
    SourceMissing(PathBuf),

    #[error("failed to place {source_path} at {destination}: {reason}")]
    Placement {
        source_path: PathBuf,
        destination: PathBuf,
        reason: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

struct ResolvedItem {
    item: LibraryItemRecord,
    created: bool,
    linked: bool,
}

/// What happened to one candidate file
#[derive(Debug, Clone)]
pub enum ImportOutcome {
    Imported(LibraryFileRecord),
    /// The item already has content of equal or better quality
    QualitySkipped { candidate: Quality, existing: Quality },
    /// The destination fell outside the item's directory
    Refused { destination: PathBuf, reason: String },
}

/// State shared by every file imported for one download
#[derive(Debug, Clone)]
pub struct ImportBatch {
    pub download_id: Uuid,
    pub item: LibraryItemRecord,
    /// Directory all of this item's files live under
    pub base_dir: PathBuf,
    /// Best quality the item had from sources other than this download
    pub existing_best: Option<Quality>,
    /// Keep source file names instead of naming each file after the title
    pub keep_source_names: bool,
    /// What this batch wrote while settling the item, undone by
    /// [`Importer::abandon_batch`]
    pub created_item: bool,
    pub linked_download: bool,
    pub assigned_base_path: bool,
}

pub struct Importer {
    db: Database,
    metadata: Arc<dyn MetadataExtractor>,
    renderer: TemplateRenderer,
    reserved: ReservedPaths,
    output_root: PathBuf,
    directory_pattern: String,
    action: CompletedFileAction,
    events: EventBus,
    metrics: Metrics,
}

impl Importer {
    pub fn new(
        db: Database,
        metadata: Arc<dyn MetadataExtractor>,
        settings: &PipelineSettings,
        events: EventBus,
        metrics: Metrics,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            db,
            metadata,
            renderer: TemplateRenderer::new()?,
            reserved: ReservedPaths::new(),
            output_root: settings.output_path.clone(),
            directory_pattern: settings.file_naming_pattern.clone(),
            action: settings.completed_file_action,
            events,
            metrics,
        })
    }

    /// Settle the item, directory and quality baseline for a download
    pub async fn begin_batch(
        &self,
        download: &DownloadRecord,
        keep_source_names: bool,
    ) -> anyhow::Result<ImportBatch> {
        let resolved = self.resolve_item(download).await?;
        let item = resolved.item;

        let (base_dir, assigned_base_path) =
            match item.base_path.as_deref().filter(|p| !p.trim().is_empty()) {
                Some(path) => (PathBuf::from(path), false),
                None => {
                    let dir = self.renderer.item_directory(
                        &self.output_root,
                        &self.directory_pattern,
                        &naming_context(&item, None),
                    );
                    self.db
                        .library_items()
                        .set_base_path_if_missing(item.id, &dir.to_string_lossy())
                        .await?;
                    (dir, true)
                }
            };

        let own = self.imported_by(download.id).await?;
        let existing = self.db.library_files().list_for_item(item.id).await?;
        let existing_best =
            Quality::best_of(existing.iter().filter(|f| !own.contains(f.path.as_str())));

        debug!(
            download_id = %download.id,
            item_id = %item.id,
            base_dir = %base_dir.display(),
            existing_files = existing.len(),
            own_files = own.len(),
            "Import batch ready"
        );

        Ok(ImportBatch {
            download_id: download.id,
            item,
            base_dir,
            existing_best,
            keep_source_names,
            created_item: resolved.created,
            linked_download: resolved.linked,
            assigned_base_path,
        })
    }

    /// Destinations of every file a download has already imported
    async fn imported_by(&self, download_id: Uuid) -> anyhow::Result<HashSet<String>> {
        let history = self.db.history().list_for_download(download_id).await?;
        Ok(history
            .iter()
            .filter(|h| h.event_type == HistoryEventType::FileAdded)
            .filter_map(|h| h.details.as_ref()?.get("destination")?.as_str())
            .map(str::to_string)
            .collect())
    }

    /// Undo what [`begin_batch`](Self::begin_batch) wrote when nothing was
    /// imported or skipped, so a failed job leaves no empty item behind
    pub async fn abandon_batch(&self, batch: &ImportBatch) -> anyhow::Result<()> {
        let items = self.db.library_items();
        if batch.linked_download {
            self.db
                .downloads()
                .clear_library_item_id(batch.download_id, batch.item.id)
                .await?;
        }
        if batch.created_item {
            if items.delete_if_empty(batch.item.id).await? {
                info!(
                    download_id = %batch.download_id,
                    item_id = %batch.item.id,
                    "Removed library item created for a failed import"
                );
            }
        } else if batch.assigned_base_path {
            items.clear_base_path_if_empty(batch.item.id).await?;
        }
        Ok(())
    }

    /// The download's explicit item, an item inferred from its title, or a
    /// new item built from the title
    async fn resolve_item(&self, download: &DownloadRecord) -> anyhow::Result<ResolvedItem> {
        let items = self.db.library_items();

        if let Some(item_id) = download.library_item_id
            && let Some(item) = items.get(item_id).await?
        {
            return Ok(ResolvedItem {
                item,
                created: false,
                linked: false,
            });
        }

        let all = items.list().await?;
        if let Some(item) = infer_item(&all, &download.title) {
            info!(
                download_id = %download.id,
                item_id = %item.id,
                item_title = %item.title,
                "Inferred library item from download title"
            );
            self.db.downloads().set_library_item_id(download.id, item.id).await?;
            return Ok(ResolvedItem {
                item: item.clone(),
                created: false,
                linked: true,
            });
        }

        let (author, title) = match split_author_title(&download.title) {
            Some((author, title)) => (Some(author), title),
            None => (None, download.title.clone()),
        };
        let item = items
            .create(CreateLibraryItem {
                title,
                author,
                ..Default::default()
            })
            .await
            .context("Failed to create library item for download")?;

        info!(
            download_id = %download.id,
            item_id = %item.id,
            title = %item.title,
            "Created library item for download"
        );
        self.db.downloads().set_library_item_id(download.id, item.id).await?;
        Ok(ResolvedItem {
            item,
            created: true,
            linked: true,
        })
    }

    /// Gate, place and record one file
    pub async fn import_file(
        &self,
        batch: &ImportBatch,
        source: &Path,
    ) -> Result<ImportOutcome, ImportError> {
        if !tokio::fs::try_exists(source).await.unwrap_or(false) {
            return Err(ImportError::SourceMissing(source.to_path_buf()));
        }

        let metadata = match self.metadata.extract(source).await {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(
                    path = %source.display(),
                    error = %e,
                    "Metadata extraction failed, using file extension only"
                );
                AudioMetadata::from_extension(source)
            }
        };
        let candidate = Quality::from_metadata(&metadata, source);

        if let Some(existing) = &batch.existing_best
            && !candidate.is_better_than(existing)
        {
            return self.skip_for_quality(batch, source, candidate, existing.clone()).await;
        }

        let desired = self.destination_for(batch, source, &candidate);
        if let Err(reason) = self.check_containment(&batch.base_dir, &desired).await {
            return self.refuse(batch, source, desired, reason).await;
        }

        let destination = self.reserved.reserve_unique(&desired).await;
        let placed = self.place_and_record(batch, source, &destination, &metadata).await;
        self.reserved.release(&destination);
        placed
    }

    async fn place_and_record(
        &self,
        batch: &ImportBatch,
        source: &Path,
        destination: &Path,
        metadata: &AudioMetadata,
    ) -> Result<ImportOutcome, ImportError> {
        place_file(source, destination, self.action)
            .await
            .map_err(|e| ImportError::Placement {
                source_path: source.to_path_buf(),
                destination: destination.to_path_buf(),
                reason: format!("{:#}", e),
            })?;

        let size_bytes = tokio::fs::metadata(destination)
            .await
            .map(|m| m.len() as i64)
            .unwrap_or(0);
        let destination_str = destination.to_string_lossy().to_string();

        let created = self
            .db
            .library_files()
            .create(CreateLibraryFile {
                item_id: batch.item.id,
                path: destination_str.clone(),
                size_bytes,
                duration_secs: metadata.duration_secs,
                format: metadata.format.clone(),
                container: metadata.container.clone(),
                codec: metadata.format.clone(),
                bitrate: metadata.bitrate.and_then(|b| i32::try_from(b).ok()),
                sample_rate: metadata.sample_rate.and_then(|s| i32::try_from(s).ok()),
                channels: metadata.channels.map(i32::from),
                source: SOURCE_DOWNLOAD.to_string(),
            })
            .await?;

        let file = match created {
            Some(file) => file,
            None => self
                .db
                .library_files()
                .list_for_item(batch.item.id)
                .await?
                .into_iter()
                .find(|f| f.path == destination_str)
                .ok_or_else(|| anyhow::anyhow!("Library file {} vanished after insert", destination_str))?,
        };

        self.db
            .history()
            .record(CreateHistoryEntry {
                event_type: HistoryEventType::FileAdded,
                item_id: Some(batch.item.id),
                download_id: Some(batch.download_id),
                message: format!("Imported {}", destination_str),
                details: Some(json!({
                    "source": source.to_string_lossy(),
                    "destination": destination_str,
                    "size_bytes": size_bytes,
                    "bitrate": metadata.bitrate,
                    "format": metadata.format,
                    "action": self.action.to_string(),
                })),
            })
            .await?;

        self.metrics.increment(metrics::FILES_ADDED);
        self.events.publish(PipelineEvent::FileImported {
            download_id: batch.download_id,
            item_id: batch.item.id,
            path: destination_str.clone(),
        });

        info!(
            download_id = %batch.download_id,
            item_id = %batch.item.id,
            source = %source.display(),
            destination = %destination_str,
            "File imported"
        );
        Ok(ImportOutcome::Imported(file))
    }

    async fn skip_for_quality(
        &self,
        batch: &ImportBatch,
        source: &Path,
        candidate: Quality,
        existing: Quality,
    ) -> Result<ImportOutcome, ImportError> {
        let message = format!(
            "Skipped {}: candidate quality '{}' is not better than existing '{}'",
            source.display(),
            candidate,
            existing
        );
        info!(
            download_id = %batch.download_id,
            item_id = %batch.item.id,
            candidate = %candidate,
            existing = %existing,
            "{}", message
        );

        self.db
            .history()
            .record(CreateHistoryEntry {
                event_type: HistoryEventType::QualitySkipped,
                item_id: Some(batch.item.id),
                download_id: Some(batch.download_id),
                message,
                details: Some(json!({
                    "source": source.to_string_lossy(),
                    "candidate": candidate,
                    "existing": existing,
                })),
            })
            .await?;
        self.metrics.increment(metrics::QUALITY_SKIPPED);

        Ok(ImportOutcome::QualitySkipped { candidate, existing })
    }

    async fn refuse(
        &self,
        batch: &ImportBatch,
        source: &Path,
        destination: PathBuf,
        reason: String,
    ) -> Result<ImportOutcome, ImportError> {
        warn!(
            download_id = %batch.download_id,
            item_id = %batch.item.id,
            destination = %destination.display(),
            reason = %reason,
            "Import refused"
        );

        self.db
            .history()
            .record(CreateHistoryEntry {
                event_type: HistoryEventType::Refused,
                item_id: Some(batch.item.id),
                download_id: Some(batch.download_id),
                message: format!("Refused {}: {}", source.display(), reason),
                details: Some(json!({
                    "source": source.to_string_lossy(),
                    "destination": destination.to_string_lossy(),
                    "base_dir": batch.base_dir.to_string_lossy(),
                    "reason": reason,
                })),
            })
            .await?;
        self.metrics.increment(metrics::IMPORT_REFUSED);
        self.events.publish(PipelineEvent::ImportRefused {
            download_id: batch.download_id,
            item_id: Some(batch.item.id),
            path: destination.to_string_lossy().to_string(),
            reason: reason.clone(),
        });

        Ok(ImportOutcome::Refused { destination, reason })
    }

    /// Where a file would land before collision handling
    pub fn destination_for(&self, batch: &ImportBatch, source: &Path, quality: &Quality) -> PathBuf {
        if batch.keep_source_names {
            let name = source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            return batch.base_dir.join(sanitize_component(&name));
        }

        let mut ctx = naming_context(&batch.item, Some(quality));
        if ctx.title.is_none() {
            ctx.title = source.file_stem().map(|s| s.to_string_lossy().into_owned());
        }
        self.renderer
            .file_destination(&batch.base_dir, "{Title}", &ctx, source)
    }

    /// The destination must stay under the item's directory, and the item's
    /// directory under the library root. Symlinks in the existing part of
    /// either path are resolved first.
    async fn check_containment(&self, base_dir: &Path, destination: &Path) -> Result<(), String> {
        let paths = [
            self.output_root.clone(),
            base_dir.to_path_buf(),
            destination.to_path_buf(),
        ];
        let [root, base, dest] = tokio::task::spawn_blocking(move || paths.map(|p| resolve_existing_prefix(&p)))
            .await
            .map_err(|e| format!("path resolution task failed: {e}"))?;

        if !base.starts_with(&root) {
            return Err(format!(
                "item directory {} is outside the library root {}",
                base.display(),
                root.display()
            ));
        }
        if !dest.starts_with(&base) || dest == base {
            return Err(format!(
                "destination {} is outside the item directory {}",
                dest.display(),
                base.display()
            ));
        }
        Ok(())
    }
}

fn naming_context(item: &LibraryItemRecord, quality: Option<&Quality>) -> NamingContext {
    NamingContext {
        author: item.author.clone(),
        series: item.series.clone(),
        series_number: item.series_number.clone(),
        title: Some(item.title.clone()).filter(|t| !t.trim().is_empty()),
        year: item.year.map(|y| y.to_string()),
        narrator: item.narrator.clone(),
        quality: quality.filter(|q| !q.is_unknown()).map(|q| q.to_string()),
        ..Default::default()
    }
}

/// Pick the library item a download title most plausibly belongs to.
///
/// Containment wins over similarity; among containing titles the longest is
/// the most specific.
pub fn infer_item<'a>(items: &'a [LibraryItemRecord], download_title: &str) -> Option<&'a LibraryItemRecord> {
    let overlapping = items
        .iter()
        .filter(|item| titles_overlap(&item.title, download_title))
        .max_by_key(|item| item.title.len());
    if overlapping.is_some() {
        return overlapping;
    }

    items
        .iter()
        .map(|item| (item, title_similarity(&item.title, download_title)))
        .filter(|(_, score)| *score >= ITEM_MATCH_THRESHOLD)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(item, _)| item)
}

/// Remove `.` and resolve `..` without touching the filesystem
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}

/// Canonicalize the longest existing ancestor of `path` and append the rest
fn resolve_existing_prefix(path: &Path) -> PathBuf {
    let normalized = lexical_normalize(path);
    let mut existing = normalized.as_path();
    let mut rest = Vec::new();

    loop {
        if let Ok(canonical) = std::fs::canonicalize(existing) {
            let mut resolved = canonical;
            for component in rest.iter().rev() {
                resolved.push(component);
            }
            return resolved;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => return normalized,
        }
    }
}
