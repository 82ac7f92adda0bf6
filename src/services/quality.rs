//! Audio quality comparison for the import gate

use std::cmp::Ordering;
use std::fmt;
use std::path::Path;

use serde::Serialize;

use super::metadata::AudioMetadata;
use crate::db::LibraryFileRecord;

/// Bitrate hints recognised in file names when no metadata is available
const FILENAME_BITRATES: &[u32] = &[320, 256, 192, 128];

/// Rank of a format when bitrates tie or are unknown. Lossless formats rank
/// above lossy ones; unknown formats rank lowest.
pub fn format_rank(format: &str) -> u8 {
    match format.trim().trim_start_matches('.').to_lowercase().as_str() {
        "flac" | "alac" => 6,
        "wav" => 5,
        "m4b" => 4,
        "m4a" | "aac" => 3,
        "opus" => 3,
        "ogg" => 2,
        "mp3" => 1,
        _ => 0,
    }
}

/// What the gate knows about one file's quality
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Quality {
    /// Kbps
    pub bitrate: Option<u32>,
    pub format: Option<String>,
}

impl Quality {
    pub fn from_metadata(metadata: &AudioMetadata, path: &Path) -> Self {
        Self {
            bitrate: metadata.bitrate.filter(|b| *b > 0).or_else(|| bitrate_from_filename(path)),
            format: metadata.format.clone(),
        }
    }

    pub fn from_library_file(file: &LibraryFileRecord) -> Self {
        Self {
            bitrate: file
                .bitrate
                .and_then(|b| u32::try_from(b).ok())
                .filter(|b| *b > 0)
                .or_else(|| bitrate_from_filename(Path::new(&file.path))),
            format: file.format.clone().or_else(|| {
                Path::new(&file.path)
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.to_lowercase())
            }),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.bitrate.is_none() && self.format.is_none()
    }

    fn rank(&self) -> u8 {
        self.format.as_deref().map(format_rank).unwrap_or(0)
    }

    /// Total order: bitrate first with a missing bitrate lowest, then format
    /// rank
    pub fn compare(&self, other: &Quality) -> Ordering {
        self.bitrate
            .cmp(&other.bitrate)
            .then_with(|| self.rank().cmp(&other.rank()))
    }

    /// Whether a candidate should be imported next to `existing`.
    ///
    /// An unknown candidate never wins. A known candidate always beats an
    /// unknown existing file.
    pub fn is_better_than(&self, existing: &Quality) -> bool {
        if self.is_unknown() {
            return false;
        }
        if existing.is_unknown() {
            return true;
        }
        self.compare(existing) == Ordering::Greater
    }

    /// Best quality among `files`, or `None` when there are none
    pub fn best_of<'a>(files: impl IntoIterator<Item = &'a LibraryFileRecord>) -> Option<Quality> {
        files
            .into_iter()
            .map(Quality::from_library_file)
            .max_by(|a, b| a.compare(b))
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.format, self.bitrate) {
            (Some(format), Some(bitrate)) => write!(f, "{} {}kbps", format.to_uppercase(), bitrate),
            (Some(format), None) => write!(f, "{}", format.to_uppercase()),
            (None, Some(bitrate)) => write!(f, "{}kbps", bitrate),
            (None, None) => write!(f, "unknown"),
        }
    }
}

fn bitrate_from_filename(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    FILENAME_BITRATES
        .iter()
        .copied()
        .find(|b| name.contains(&b.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn file(path: &str, bitrate: Option<i32>, format: Option<&str>) -> LibraryFileRecord {
        LibraryFileRecord {
            id: Uuid::new_v4(),
            item_id: Uuid::new_v4(),
            path: path.to_string(),
            size_bytes: 0,
            duration_secs: None,
            format: format.map(str::to_string),
            container: None,
            codec: None,
            bitrate,
            sample_rate: None,
            channels: None,
            source: "download".to_string(),
            created_at: Utc::now(),
        }
    }

    fn quality(bitrate: Option<u32>, format: Option<&str>) -> Quality {
        Quality {
            bitrate,
            format: format.map(str::to_string),
        }
    }

    #[test]
    fn test_lower_bitrate_is_not_better() {
        let existing = Quality::from_library_file(&file("/l/Dune.mp3", Some(320), Some("mp3")));
        let candidate = quality(Some(128), Some("mp3"));
        assert!(!candidate.is_better_than(&existing));
        assert!(existing.is_better_than(&candidate));
    }

    #[test]
    fn test_equal_quality_is_not_better() {
        let q = quality(Some(128), Some("mp3"));
        assert!(!q.is_better_than(&q.clone()));
    }

    #[test]
    fn test_format_breaks_bitrate_ties() {
        let flac = quality(None, Some("flac"));
        let mp3 = quality(None, Some("mp3"));
        assert!(flac.is_better_than(&mp3));
        assert!(!mp3.is_better_than(&flac));
    }

    #[test]
    fn test_unknown_sides() {
        let unknown = Quality::default();
        let known = quality(Some(64), None);
        assert!(!unknown.is_better_than(&known));
        assert!(known.is_better_than(&unknown));
    }

    #[test]
    fn test_filename_bitrate_fallback() {
        let q = Quality::from_library_file(&file("/l/Dune [320].mp3", None, None));
        assert_eq!(q.bitrate, Some(320));
        assert_eq!(q.format.as_deref(), Some("mp3"));
    }

    #[test]
    fn test_best_of_picks_highest() {
        let files = vec![
            file("/l/a.mp3", Some(64), Some("mp3")),
            file("/l/b.mp3", Some(320), Some("mp3")),
            file("/l/c.mp3", Some(128), Some("mp3")),
        ];
        assert_eq!(Quality::best_of(&files).and_then(|q| q.bitrate), Some(320));
        assert_eq!(Quality::best_of(&[]), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(quality(Some(320), Some("mp3")).to_string(), "MP3 320kbps");
        assert_eq!(Quality::default().to_string(), "unknown");
    }

    #[test]
    fn test_best_of_ignores_file_order() {
        let files = [
            file("/l/a.mp3", Some(128), Some("mp3")),
            file("/l/b.flac", None, Some("flac")),
            file("/l/c.m4b", Some(64), Some("m4b")),
        ];
        let expected = Some(quality(Some(128), Some("mp3")));
        for order in [[0, 1, 2], [1, 2, 0], [2, 0, 1], [1, 0, 2], [2, 1, 0], [0, 2, 1]] {
            let shuffled: Vec<_> = order.iter().map(|i| files[*i].clone()).collect();
            assert_eq!(Quality::best_of(&shuffled), expected);
        }
    }
}
