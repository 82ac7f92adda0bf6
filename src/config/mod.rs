//! Application configuration management

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// What the importer does with a source file once it is placed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletedFileAction {
    Move,
    Copy,
}

impl std::str::FromStr for CompletedFileAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "move" => Ok(CompletedFileAction::Move),
            "copy" => Ok(CompletedFileAction::Copy),
            other => Err(anyhow::anyhow!("Unknown completed file action: {}", other)),
        }
    }
}

impl std::fmt::Display for CompletedFileAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompletedFileAction::Move => write!(f, "move"),
            CompletedFileAction::Copy => write!(f, "copy"),
        }
    }
}

/// Default allowed audio extensions
pub const DEFAULT_ALLOWED_EXTENSIONS: &[&str] =
    &["mp3", "flac", "m4a", "m4b", "ogg", "opus", "aac", "wav"];

/// Default naming template for imported files
pub const DEFAULT_FILE_NAMING_PATTERN: &str = "{Author}/{Series}/{Title}";

/// Settings consumed by the completion and import pipeline
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Library root new items are created under
    pub output_path: PathBuf,
    /// Working directory for archive extraction
    pub work_path: PathBuf,
    pub completed_file_action: CompletedFileAction,
    /// Lowercase extensions without the leading dot
    pub allowed_extensions: Vec<String>,
    pub file_naming_pattern: String,
    pub extract_archives: bool,
    /// How long a download must be seen complete before finalization
    pub completion_debounce: Duration,
    pub poll_interval: Duration,
    pub missing_source_retry_initial_delay: Duration,
    pub missing_source_max_retries: u32,
    pub queue_worker_interval: Duration,
    pub queue_max_concurrent: usize,
    pub metadata_max_concurrent: usize,
    pub metadata_rate_per_second: u32,
    pub job_retention_days: i64,
    /// Upper bound on tracked completion candidates
    pub candidate_capacity: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            output_path: PathBuf::from("./data/library"),
            work_path: PathBuf::from("./data/work"),
            completed_file_action: CompletedFileAction::Move,
            allowed_extensions: DEFAULT_ALLOWED_EXTENSIONS
                .iter()
                .map(|e| e.to_string())
                .collect(),
            file_naming_pattern: DEFAULT_FILE_NAMING_PATTERN.to_string(),
            extract_archives: true,
            completion_debounce: Duration::from_secs(15),
            poll_interval: Duration::from_secs(10),
            missing_source_retry_initial_delay: Duration::from_secs(30),
            missing_source_max_retries: 3,
            queue_worker_interval: Duration::from_secs(10),
            queue_max_concurrent: 2,
            metadata_max_concurrent: 2,
            metadata_rate_per_second: 4,
            job_retention_days: 7,
            candidate_capacity: 1024,
        }
    }
}

impl PipelineSettings {
    /// Whether a path has one of the allowed audio extensions
    pub fn is_allowed_extension(&self, path: &std::path::Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| {
                let e = e.to_lowercase();
                self.allowed_extensions.iter().any(|a| *a == e)
            })
            .unwrap_or(false)
    }

    /// Load pipeline settings from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            output_path: env::var("OUTPUT_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_path),

            work_path: env::var("WORK_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_path),

            completed_file_action: match env::var("COMPLETED_FILE_ACTION") {
                Ok(v) => v.parse().context("Invalid COMPLETED_FILE_ACTION")?,
                Err(_) => defaults.completed_file_action,
            },

            allowed_extensions: env::var("ALLOWED_FILE_EXTENSIONS")
                .map(|v| parse_extension_list(&v))
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.allowed_extensions),

            file_naming_pattern: env::var("FILE_NAMING_PATTERN")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.file_naming_pattern),

            extract_archives: env::var("EXTRACT_ARCHIVES")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.extract_archives),

            completion_debounce: secs_var(
                "DOWNLOAD_COMPLETION_STABILITY_SECONDS",
                defaults.completion_debounce,
            )?,

            poll_interval: secs_var("POLL_INTERVAL_SECONDS", defaults.poll_interval)?,

            missing_source_retry_initial_delay: secs_var(
                "MISSING_SOURCE_RETRY_INITIAL_DELAY_SECONDS",
                defaults.missing_source_retry_initial_delay,
            )?,

            missing_source_max_retries: parsed_var(
                "MISSING_SOURCE_MAX_RETRIES",
                defaults.missing_source_max_retries,
            )?,

            queue_worker_interval: secs_var(
                "QUEUE_WORKER_INTERVAL_SECONDS",
                defaults.queue_worker_interval,
            )?,

            queue_max_concurrent: parsed_var("QUEUE_MAX_CONCURRENT", defaults.queue_max_concurrent)?
                .max(1),

            metadata_max_concurrent: parsed_var(
                "METADATA_MAX_CONCURRENT",
                defaults.metadata_max_concurrent,
            )?
            .max(1),

            metadata_rate_per_second: parsed_var(
                "METADATA_RATE_PER_SECOND",
                defaults.metadata_rate_per_second,
            )?,

            job_retention_days: parsed_var("JOB_RETENTION_DAYS", defaults.job_retention_days)?,

            candidate_capacity: parsed_var("CANDIDATE_CAPACITY", defaults.candidate_capacity)?
                .max(1),
        })
    }
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server port
    pub port: u16,

    /// SQLite database path or `sqlite:` URL
    pub database_url: String,

    pub pipeline: PipelineSettings,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Prefer DATABASE_PATH, fall back to DATABASE_URL
        let database_url = env::var("DATABASE_PATH")
            .or_else(|_| env::var("DATABASE_URL"))
            .unwrap_or_else(|_| "./data/librarian-ingest.db".to_string());

        Ok(Self {
            port: env::var("PORT")
                .unwrap_or_else(|_| "3002".to_string())
                .parse()
                .context("Invalid PORT")?,

            database_url,

            pipeline: PipelineSettings::from_env()?,
        })
    }
}

/// Parse ".mp3, FLAC,m4b" into ["mp3", "flac", "m4b"]
pub fn parse_extension_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|e| e.trim().trim_start_matches('.').to_lowercase())
        .filter(|e| !e.is_empty())
        .collect()
}

fn parsed_var<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(v) => v
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {}: {}", name, e)),
        Err(_) => Ok(default),
    }
}

fn secs_var(name: &str, default: Duration) -> Result<Duration> {
    parsed_var(name, default.as_secs()).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_parse_extension_list() {
        assert_eq!(
            parse_extension_list(".mp3, FLAC,,m4b "),
            vec!["mp3".to_string(), "flac".to_string(), "m4b".to_string()]
        );
    }

    #[test]
    fn test_allowed_extension_is_case_insensitive() {
        let settings = PipelineSettings::default();
        assert!(settings.is_allowed_extension(Path::new("/a/Chapter 01.MP3")));
        assert!(settings.is_allowed_extension(Path::new("book.m4b")));
        assert!(!settings.is_allowed_extension(Path::new("cover.jpg")));
        assert!(!settings.is_allowed_extension(Path::new("README")));
    }

    #[test]
    fn test_completed_file_action_parsing() {
        assert_eq!("Move".parse::<CompletedFileAction>().unwrap(), CompletedFileAction::Move);
        assert_eq!(" copy".parse::<CompletedFileAction>().unwrap(), CompletedFileAction::Copy);
        assert!("hardlink".parse::<CompletedFileAction>().is_err());
    }
}
