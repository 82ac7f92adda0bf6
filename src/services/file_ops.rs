//! Placing imported files in the library

use std::collections::HashSet;
use std::fs::FileTimes;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::CompletedFileAction;

/// `Chapter.mp3` → `Chapter (n).mp3`
pub fn numbered_path(path: &Path, n: usize) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{} ({}).{}", stem, n, ext.to_string_lossy()),
        None => format!("{} ({})", stem, n),
    };
    path.with_file_name(name)
}

/// Destinations handed out to imports that have not finished yet.
///
/// A path counts as taken if it exists on disk or is reserved here, so two
/// files of the same batch never race for the same name.
#[derive(Default)]
pub struct ReservedPaths {
    reserved: Mutex<HashSet<PathBuf>>,
}

impl ReservedPaths {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `desired`, or the first free `desired (n)` variant.
    ///
    /// The disk check runs outside the lock; a name another import reserved
    /// in the meantime is skipped.
    pub async fn reserve_unique(&self, desired: &Path) -> PathBuf {
        let mut n = 0;
        loop {
            let candidate = match n {
                0 => desired.to_path_buf(),
                n => numbered_path(desired, n),
            };
            n += 1;

            let on_disk = tokio::fs::try_exists(&candidate).await.unwrap_or(false);
            if !on_disk && self.reserved.lock().insert(candidate.clone()) {
                return candidate;
            }
        }
    }

    pub fn release(&self, path: &Path) {
        self.reserved.lock().remove(path);
    }

    pub fn len(&self) -> usize {
        self.reserved.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Move or copy `source` to `dest`, creating parent directories.
///
/// Moves try a rename first and fall back to copy and delete across
/// filesystems. Copies keep the source's access and modification times.
pub async fn place_file(source: &Path, dest: &Path, action: CompletedFileAction) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    match action {
        CompletedFileAction::Move => match tokio::fs::rename(source, dest).await {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!(
                    source = %source.display(),
                    error = %e,
                    "Rename failed, falling back to copy and delete"
                );
                copy_preserving_times(source, dest).await?;
                tokio::fs::remove_file(source)
                    .await
                    .with_context(|| format!("Failed to remove {} after copy", source.display()))
            }
        },
        CompletedFileAction::Copy => copy_preserving_times(source, dest).await,
    }
}

async fn copy_preserving_times(source: &Path, dest: &Path) -> Result<()> {
    tokio::fs::copy(source, dest)
        .await
        .with_context(|| format!("Failed to copy {} to {}", source.display(), dest.display()))?;

    let source = source.to_path_buf();
    let dest = dest.to_path_buf();
    let preserved = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let metadata = std::fs::metadata(&source)?;
        let mut times = FileTimes::new().set_modified(metadata.modified()?);
        if let Ok(accessed) = metadata.accessed() {
            times = times.set_accessed(accessed);
        }
        std::fs::File::options().write(true).open(&dest)?.set_times(times)
    })
    .await
    .context("Timestamp task panicked")?;

    if let Err(e) = preserved {
        warn!(error = %e, "Failed to preserve timestamps on copied file");
    }
    Ok(())
}
