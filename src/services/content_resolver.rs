//! Expand a finalized download source into importable audio files
//!
//! The source may be a single file, a directory tree of any depth, or an
//! archive. Archives found along the way are extracted into the work
//! directory and walked in turn. Files are produced one at a time so the
//! importer can start on the first file before the whole tree is known.
//!
//! Directory entries are visited in file-name order, so resolving the same
//! source again yields the same sequence.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};
use walkdir::WalkDir;

use super::extractor::{ArchiveExtractor, extraction_dir, is_archive, is_continuation_volume};

/// Archives inside archives are followed at most this deep
const MAX_ARCHIVE_DEPTH: usize = 3;

/// Directory entries read per blocking call
const WALK_BATCH: usize = 64;

/// One element of a resolved source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentItem {
    /// An importable audio file
    File(PathBuf),
    /// An archive that could not be extracted; siblings are unaffected
    ExtractionFailed { archive: PathBuf, error: String },
}

pub struct ContentResolver {
    extractor: Arc<dyn ArchiveExtractor>,
    allowed_extensions: Vec<String>,
    extract_archives: bool,
    work_dir: PathBuf,
}

impl ContentResolver {
    pub fn new(
        extractor: Arc<dyn ArchiveExtractor>,
        allowed_extensions: Vec<String>,
        extract_archives: bool,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            extractor,
            allowed_extensions,
            extract_archives,
            work_dir,
        }
    }

    fn is_allowed(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| {
                let e = e.to_lowercase();
                self.allowed_extensions.iter().any(|a| *a == e)
            })
            .unwrap_or(false)
    }

    /// Start a lazy walk over `source`
    pub fn resolve(&self, source: &Path) -> ContentStream<'_> {
        let mut stream = ContentStream {
            resolver: self,
            single: None,
            walkers: Vec::new(),
            extraction_dirs: Vec::new(),
        };

        if source.is_dir() {
            stream.push_walker(source, 0);
        } else {
            stream.single = Some(source.to_path_buf());
        }
        stream
    }
}

/// Lazy sequence of [`ContentItem`]s for one source
pub struct ContentStream<'a> {
    resolver: &'a ContentResolver,
    single: Option<PathBuf>,
    /// Directory walks in progress, innermost last
    walkers: Vec<Walk>,
    extraction_dirs: Vec<PathBuf>,
}

/// One directory walk and the files already read from it
struct Walk {
    /// `None` once the walk is exhausted
    iter: Option<walkdir::IntoIter>,
    /// Archive depth of the walked directory
    depth: usize,
    pending: VecDeque<PathBuf>,
}

/// Read up to [`WALK_BATCH`] entries; runs on the blocking pool
fn read_batch(mut iter: walkdir::IntoIter) -> (Option<walkdir::IntoIter>, VecDeque<PathBuf>) {
    let mut files = VecDeque::new();
    for _ in 0..WALK_BATCH {
        match iter.next() {
            None => return (None, files),
            Some(Err(e)) => {
                warn!(error = %e, "Skipping unreadable entry while resolving content");
            }
            Some(Ok(entry)) => {
                if entry.file_type().is_file() {
                    files.push_back(entry.into_path());
                }
            }
        }
    }
    (Some(iter), files)
}

impl ContentStream<'_> {
    fn push_walker(&mut self, dir: &Path, depth: usize) {
        let iter = WalkDir::new(dir)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();
        self.walkers.push(Walk {
            iter: Some(iter),
            depth,
            pending: VecDeque::new(),
        });
    }

    /// Directories created for extracted archives, for later cleanup
    pub fn extraction_dirs(&self) -> &[PathBuf] {
        &self.extraction_dirs
    }

    /// Next item, or `None` when the source is exhausted
    pub async fn next(&mut self) -> Option<ContentItem> {
        if let Some(path) = self.single.take()
            && let Some(item) = self.visit(path, 0).await
        {
            return Some(item);
        }

        loop {
            let walk = self.walkers.last_mut()?;

            if let Some(path) = walk.pending.pop_front() {
                let depth = walk.depth;
                if let Some(item) = self.visit(path, depth).await {
                    return Some(item);
                }
                continue;
            }

            let Some(iter) = walk.iter.take() else {
                self.walkers.pop();
                continue;
            };
            match tokio::task::spawn_blocking(move || read_batch(iter)).await {
                Ok((iter, files)) => {
                    walk.iter = iter;
                    walk.pending = files;
                }
                Err(e) => {
                    warn!(error = %e, "Directory walk aborted");
                    self.walkers.pop();
                }
            }
        }
    }

    /// Classify one file: yield it, extract it, or skip it
    async fn visit(&mut self, path: PathBuf, depth: usize) -> Option<ContentItem> {
        let resolver = self.resolver;

        if is_continuation_volume(&path) {
            return None;
        }

        if resolver.extract_archives && is_archive(&path) {
            if depth >= MAX_ARCHIVE_DEPTH {
                warn!(archive = %path.display(), "Archive nested too deeply, skipping");
                return None;
            }

            let dest = extraction_dir(&resolver.work_dir);
            return match resolver.extractor.extract(&path, &dest).await {
                Ok(files) => {
                    debug!(
                        archive = %path.display(),
                        file_count = files.len(),
                        "Walking extracted archive"
                    );
                    self.extraction_dirs.push(dest.clone());
                    self.push_walker(&dest, depth + 1);
                    None
                }
                Err(e) => {
                    warn!(archive = %path.display(), error = %e, "Archive extraction failed");
                    self.extraction_dirs.push(dest);
                    Some(ContentItem::ExtractionFailed {
                        archive: path,
                        error: e.to_string(),
                    })
                }
            };
        }

        resolver.is_allowed(&path).then_some(ContentItem::File(path))
    }

    /// Drain the remaining items
    pub async fn collect_all(&mut self) -> Vec<ContentItem> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item);
        }
        items
    }
}
