//! Resolve a client-reported path to a local source path
//!
//! The reported path is first rewritten through the client's remote path
//! mappings. If the mapped path does not exist, each candidate generator gets
//! a chance to propose an alternative. The first candidate that exists wins;
//! if none do, the mapped path is returned so the processing queue has a
//! stable path to keep probing.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::db::{Database, PathMappingRecord};

/// Translates a client's view of a path into the local view
#[async_trait]
pub trait RemotePathMapper: Send + Sync {
    async fn translate(&self, client_id: Option<Uuid>, remote_path: &str) -> Result<String>;
}

/// Mapper backed by the `remote_path_mappings` table
pub struct DatabasePathMapper {
    db: Database,
}

impl DatabasePathMapper {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RemotePathMapper for DatabasePathMapper {
    async fn translate(&self, client_id: Option<Uuid>, remote_path: &str) -> Result<String> {
        let Some(client_id) = client_id else {
            return Ok(normalize_separators(remote_path));
        };
        let mappings = self.db.path_mappings().list_for_client(client_id).await?;
        Ok(apply_mappings(&mappings, remote_path))
    }
}

fn normalize_separators(path: &str) -> String {
    path.replace('\\', "/")
}

/// Rewrite `remote_path` using the longest matching remote prefix.
///
/// Matching is case-insensitive, works on whole path segments and treats
/// backslashes as slashes. Unmatched paths are returned normalized.
pub fn apply_mappings(mappings: &[PathMappingRecord], remote_path: &str) -> String {
    let path = normalize_separators(remote_path);

    let best = mappings
        .iter()
        .filter_map(|m| {
            let prefix = normalize_separators(&m.remote_path);
            let prefix = prefix.trim_end_matches('/').to_string();
            prefix_matches(&path, &prefix).then_some((prefix, m))
        })
        .max_by_key(|(prefix, _)| prefix.len());

    let Some((prefix, mapping)) = best else {
        return path;
    };

    let remainder = path[prefix.len()..].trim_start_matches('/');
    let local = normalize_separators(&mapping.local_path);
    let local = local.trim_end_matches('/');

    if remainder.is_empty() {
        local.to_string()
    } else {
        format!("{}/{}", local, remainder)
    }
}

fn prefix_matches(path: &str, prefix: &str) -> bool {
    if prefix.is_empty() || path.len() < prefix.len() || !path.is_char_boundary(prefix.len()) {
        return false;
    }
    let (head, rest) = path.split_at(prefix.len());
    head.to_lowercase() == prefix.to_lowercase() && (rest.is_empty() || rest.starts_with('/'))
}

/// Proposes an alternative local path when the mapped one does not exist
pub trait CandidateGenerator: Send + Sync {
    fn name(&self) -> &'static str;

    /// An alternative to `mapped`, or `None` when this heuristic does not apply
    fn candidate(&self, mapped: &Path) -> Option<PathBuf>;
}

/// Some clients rename a folder to "Name.1" on disk to avoid a collision
/// while still reporting "Name". Strips that trailing ".N" again.
pub struct StripNumericSuffix;

impl CandidateGenerator for StripNumericSuffix {
    fn name(&self) -> &'static str {
        "strip_numeric_suffix"
    }

    fn candidate(&self, mapped: &Path) -> Option<PathBuf> {
        let file_name = mapped.file_name()?.to_str()?;
        let (base, suffix) = file_name.rsplit_once('.')?;
        if base.is_empty()
            || suffix.is_empty()
            || suffix.len() > 3
            || !suffix.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }
        Some(mapped.with_file_name(base))
    }
}

/// Outcome of resolving a reported path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub path: PathBuf,
    pub exists: bool,
    /// Name of the generator that produced `path`, if any
    pub heuristic: Option<&'static str>,
}

pub struct PathResolver {
    mapper: Arc<dyn RemotePathMapper>,
    generators: Vec<Box<dyn CandidateGenerator>>,
}

impl PathResolver {
    /// Resolver with the default heuristic chain
    pub fn new(mapper: Arc<dyn RemotePathMapper>) -> Self {
        Self::with_generators(mapper, vec![Box::new(StripNumericSuffix)])
    }

    /// Generators are tried in order, after the mapped path itself
    pub fn with_generators(
        mapper: Arc<dyn RemotePathMapper>,
        generators: Vec<Box<dyn CandidateGenerator>>,
    ) -> Self {
        Self { mapper, generators }
    }

    pub async fn resolve(&self, client_id: Option<Uuid>, remote_path: &str) -> Result<ResolvedPath> {
        let mapped = PathBuf::from(self.mapper.translate(client_id, remote_path).await?);

        if path_exists(&mapped).await {
            return Ok(ResolvedPath {
                path: mapped,
                exists: true,
                heuristic: None,
            });
        }

        for generator in &self.generators {
            let Some(candidate) = generator.candidate(&mapped) else {
                continue;
            };
            if candidate == mapped {
                continue;
            }
            if path_exists(&candidate).await {
                debug!(
                    reported = %remote_path,
                    resolved = %candidate.display(),
                    heuristic = generator.name(),
                    "Resolved download path with heuristic"
                );
                return Ok(ResolvedPath {
                    path: candidate,
                    exists: true,
                    heuristic: Some(generator.name()),
                });
            }
        }

        Ok(ResolvedPath {
            path: mapped,
            exists: false,
            heuristic: None,
        })
    }
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}
