//! Archive extraction service
//!
//! ZIP archives are extracted in-process with the `zip` crate on a blocking
//! thread. RAR, 7z and tar archives shell out to `unrar`, `7z` and `tar`.
//! Every extraction lands in its own directory under the work path so it can
//! be cleaned up as a unit.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("not a supported archive: {0}")]
    Unsupported(PathBuf),

    #[error("corrupt archive {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("archive entry '{0}' escapes the extraction directory")]
    UnsafeEntry(String),

    #[error("{tool} failed: {stderr}")]
    Tool { tool: &'static str, stderr: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Extracts one archive into a destination directory
#[async_trait]
pub trait ArchiveExtractor: Send + Sync {
    /// Extract `archive` into `dest_dir`, returning the extracted files
    async fn extract(&self, archive: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>, ExtractError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveType {
    Zip,
    Rar,
    SevenZ,
    Tar,
}

impl ArchiveType {
    fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "zip" => Some(ArchiveType::Zip),
            "rar" => Some(ArchiveType::Rar),
            "7z" => Some(ArchiveType::SevenZ),
            "tar" | "tgz" => Some(ArchiveType::Tar),
            "gz" if is_tar_gz(path) => Some(ArchiveType::Tar),
            _ => None,
        }
    }
}

/// Fresh directory name under `work_dir` for one extraction; created by
/// [`ArchiveExtractor::extract`] and swept by
/// [`ExtractorService::cleanup_old_extractions`]
pub fn extraction_dir(work_dir: &Path) -> PathBuf {
    work_dir.join(format!("extract_{}", uuid::Uuid::new_v4()))
}

fn is_tar_gz(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.to_lowercase().ends_with(".tar.gz"))
}

/// Volume number of a `name.partN.rar` multi-volume set member
fn rar_volume(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?.to_lowercase();
    let stem = name.strip_suffix(".rar")?;
    let (_, number) = stem.rsplit_once(".part")?;
    if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    number.parse().ok()
}

/// Whether `path` is the second or later volume of a multi-volume RAR set.
/// Those are read by the extractor through the first volume.
pub fn is_continuation_volume(path: &Path) -> bool {
    rar_volume(path).is_some_and(|n| n > 1)
}

/// Whether `path` should be handed to the extractor: a supported archive
/// that is not a continuation volume. A bare `.gz` is a compressed single
/// file, not an archive.
pub fn is_archive(path: &Path) -> bool {
    ArchiveType::from_path(path).is_some() && !is_continuation_volume(path)
}

/// Archive extraction service
pub struct ExtractorService {
    /// Directory extraction subdirectories are created under
    work_dir: PathBuf,
}

impl ExtractorService {
    pub fn new(work_dir: PathBuf) -> Self {
        Self { work_dir }
    }

    async fn extract_zip(&self, archive: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>, ExtractError> {
        let archive = archive.to_path_buf();
        let dest_dir = dest_dir.to_path_buf();

        tokio::task::spawn_blocking(move || extract_zip_blocking(&archive, &dest_dir))
            .await
            .map_err(|e| ExtractError::Io(io::Error::other(e)))?
    }

    async fn run_tool(
        &self,
        tool: &'static str,
        command: &mut Command,
        dest_dir: &Path,
    ) -> Result<Vec<PathBuf>, ExtractError> {
        let output = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ExtractError::Tool {
                tool,
                stderr: format!("could not run {}: {}", tool, e),
            })?;

        if !output.status.success() {
            return Err(ExtractError::Tool {
                tool,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(list_files(dest_dir))
    }

    /// Remove an extraction directory. Paths outside the work directory are
    /// left alone.
    pub async fn cleanup(&self, temp_path: &Path) -> Result<()> {
        if !temp_path.starts_with(&self.work_dir) {
            warn!(
                path = %temp_path.display(),
                work_dir = %self.work_dir.display(),
                "Refusing to cleanup path outside work directory"
            );
            return Ok(());
        }

        if tokio::fs::try_exists(temp_path).await.unwrap_or(false) {
            info!(path = %temp_path.display(), "Cleaning up extracted files");
            tokio::fs::remove_dir_all(temp_path)
                .await
                .context("Failed to cleanup extraction directory")?;
        }

        Ok(())
    }

    /// Remove extraction directories older than `max_age`
    pub async fn cleanup_old_extractions(&self, max_age: Duration) -> Result<usize> {
        let mut cleaned = 0;

        if !tokio::fs::try_exists(&self.work_dir).await.unwrap_or(false) {
            return Ok(0);
        }

        let now = SystemTime::now();
        let mut entries = tokio::fs::read_dir(&self.work_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_extraction = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("extract_"));
            if !is_extraction {
                continue;
            }

            let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) else {
                continue;
            };
            let Ok(age) = now.duration_since(modified) else {
                continue;
            };
            if age <= max_age {
                continue;
            }

            info!(
                path = %path.display(),
                age_hours = age.as_secs() / 3600,
                "Cleaning up old extraction directory"
            );
            if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to remove extraction directory");
                continue;
            }
            cleaned += 1;
        }

        Ok(cleaned)
    }
}

#[async_trait]
impl ArchiveExtractor for ExtractorService {
    async fn extract(&self, archive: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>, ExtractError> {
        let archive_type =
            ArchiveType::from_path(archive).ok_or_else(|| ExtractError::Unsupported(archive.to_path_buf()))?;

        info!(
            archive = %archive.display(),
            archive_type = ?archive_type,
            destination = %dest_dir.display(),
            "Extracting archive"
        );
        tokio::fs::create_dir_all(dest_dir).await?;

        let files = match archive_type {
            ArchiveType::Zip => self.extract_zip(archive, dest_dir).await?,
            ArchiveType::Rar => {
                let mut command = Command::new("unrar");
                command.arg("x").arg("-o+").arg("-y").arg(archive).arg(dest_dir);
                self.run_tool("unrar", &mut command, dest_dir).await?
            }
            ArchiveType::SevenZ => {
                let mut command = Command::new("7z");
                command
                    .arg("x")
                    .arg("-y")
                    .arg(format!("-o{}", dest_dir.display()))
                    .arg(archive);
                self.run_tool("7z", &mut command, dest_dir).await?
            }
            ArchiveType::Tar => {
                let mut command = Command::new("tar");
                command.arg("-xf").arg(archive).arg("-C").arg(dest_dir);
                self.run_tool("tar", &mut command, dest_dir).await?
            }
        };

        debug!(
            archive = %archive.display(),
            file_count = files.len(),
            "Archive extraction successful"
        );
        Ok(files)
    }
}

fn extract_zip_blocking(archive: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>, ExtractError> {
    let corrupt = |reason: String| ExtractError::Corrupt {
        path: archive.to_path_buf(),
        reason,
    };

    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| corrupt(e.to_string()))?;
    let mut extracted = Vec::new();

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(|e| corrupt(e.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        let Some(relative) = sanitize_entry_path(entry.name())? else {
            continue;
        };

        let output_path = dest_dir.join(relative);
        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut output = File::create(&output_path)?;
        io::copy(&mut entry, &mut output).map_err(|e| corrupt(e.to_string()))?;
        extracted.push(output_path);
    }

    Ok(extracted)
}

/// Turn an archive entry name into a safe relative path.
///
/// Rejects `..` components. Entries under hidden or `__MACOSX` directories,
/// and entries that sanitize to nothing, yield `None`.
fn sanitize_entry_path(name: &str) -> Result<Option<PathBuf>, ExtractError> {
    let normalized = name.replace('\\', "/");
    let mut result = PathBuf::new();

    for component in normalized.split('/') {
        if component.is_empty() || component == "." {
            continue;
        }
        if component == ".." || component.contains('\0') || component.ends_with(':') {
            return Err(ExtractError::UnsafeEntry(name.to_string()));
        }
        if component.starts_with('.') || component == "__MACOSX" {
            return Ok(None);
        }
        result.push(component);
    }

    Ok((!result.as_os_str().is_empty()).then_some(result))
}

fn list_files(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect()
}
