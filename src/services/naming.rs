//! Naming templates for imported files
//!
//! Templates use `{Token}` placeholders, optionally with a zero-pad format
//! (`{ChapterNumber:00}`). Tokens that render empty are removed together with
//! the separator or brackets around them, so `{Author} - {Series} - {Title}`
//! renders as `Author - Title` for a book outside a series.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;

/// Placeholder for an empty token while separators are cleaned up
const EMPTY: &str = "\u{E000}";

/// Values a template can reference
#[derive(Debug, Clone, Default)]
pub struct NamingContext {
    pub author: Option<String>,
    pub series: Option<String>,
    pub series_number: Option<String>,
    pub title: Option<String>,
    pub year: Option<String>,
    pub narrator: Option<String>,
    pub quality: Option<String>,
    pub disk_number: Option<String>,
    pub chapter_number: Option<String>,
}

impl NamingContext {
    fn value(&self, token: &str) -> Option<String> {
        let non_empty = |v: &Option<String>| v.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);

        match token.to_lowercase().as_str() {
            "author" => Some(non_empty(&self.author).unwrap_or_else(|| "Unknown Author".to_string())),
            "title" => Some(non_empty(&self.title).unwrap_or_else(|| "Unknown Title".to_string())),
            "series" => non_empty(&self.series),
            "seriesnumber" => non_empty(&self.series_number),
            "year" => non_empty(&self.year),
            "narrator" => non_empty(&self.narrator),
            "quality" => non_empty(&self.quality),
            "disknumber" => non_empty(&self.disk_number),
            "chapternumber" => non_empty(&self.chapter_number),
            _ => None,
        }
    }
}

/// Whether a template produces directories rather than a bare file name
pub fn pattern_allows_subfolders(pattern: &str) -> bool {
    let lower = pattern.to_lowercase();
    lower.contains("disknumber")
        || lower.contains("chapternumber")
        || pattern.contains('/')
        || pattern.contains('\\')
}

/// Replace characters that are invalid in a file name with `_`.
///
/// A component that is empty afterwards becomes `Unknown`.
pub fn sanitize_component(component: &str) -> String {
    let options = sanitize_filename::Options {
        windows: true,
        truncate: true,
        replacement: "_",
    };
    let sanitized = sanitize_filename::sanitize_with_options(component.trim(), options);
    let sanitized = sanitized.trim();
    if sanitized.is_empty() || sanitized.chars().all(|c| c == '_' || c == '.') {
        "Unknown".to_string()
    } else {
        sanitized.to_string()
    }
}

/// Split a release name like `Frank Herbert - Dune` into author and title.
///
/// Only the first separator counts, so `A - B - C` gives `("A", "B - C")`.
pub fn split_author_title(name: &str) -> Option<(String, String)> {
    let (author, title) = name
        .split_once(" - ")
        .or_else(|| name.split_once(": "))?;
    let (author, title) = (author.trim(), title.trim());
    if author.is_empty() || title.is_empty() {
        return None;
    }
    Some((author.to_string(), title.to_string()))
}

/// Compiled naming template renderer
pub struct TemplateRenderer {
    token: Regex,
    bracketed_empty: Regex,
    separator_before_empty: Regex,
    separator_after_empty: Regex,
    slashed_empty: Regex,
    repeated_slashes: Regex,
    repeated_spaces: Regex,
}

impl TemplateRenderer {
    pub fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).with_context(|| format!("Invalid naming regex {}", pattern))
        };

        Ok(Self {
            token: compile(r"\{(\w+)(?::([^}]+))?\}")?,
            bracketed_empty: compile(&format!(r"[\(\[\{{]\s*{EMPTY}\s*[\)\]\}}]"))?,
            separator_before_empty: compile(&format!(r"\s*[-–—:_]\s*{EMPTY}"))?,
            separator_after_empty: compile(&format!(r"{EMPTY}\s*[-–—:_]\s*"))?,
            slashed_empty: compile(&format!(r"/?{EMPTY}/?"))?,
            repeated_slashes: compile(r"[\\/]{2,}")?,
            repeated_spaces: compile(r"\s{2,}")?,
        })
    }

    /// Render `pattern` as a relative path (`treat_as_filename = false`) or as
    /// a single file name component.
    pub fn render(&self, pattern: &str, ctx: &NamingContext, treat_as_filename: bool) -> String {
        let substituted = self.token.replace_all(pattern, |caps: &regex::Captures<'_>| {
            let value = ctx.value(&caps[1]);
            match value {
                Some(value) => match caps.get(2) {
                    Some(format) => apply_format(&value, format.as_str()),
                    None => value,
                },
                None => EMPTY.to_string(),
            }
        });

        let cleaned = self.bracketed_empty.replace_all(&substituted, "");
        let cleaned = self.separator_before_empty.replace_all(&cleaned, "");
        let cleaned = self.separator_after_empty.replace_all(&cleaned, "");
        let cleaned = self.slashed_empty.replace_all(&cleaned, "/");
        let cleaned = cleaned.replace(EMPTY, "");
        let cleaned = self.repeated_slashes.replace_all(&cleaned, "/");
        let cleaned = self.repeated_spaces.replace_all(&cleaned, " ");

        let mut components: Vec<String> = Vec::new();
        for part in cleaned.split(['/', '\\']).map(str::trim).filter(|p| !p.is_empty()) {
            let component = sanitize_component(part);
            let duplicate = components
                .last()
                .is_some_and(|prev| prev.eq_ignore_ascii_case(&component));
            if !duplicate {
                components.push(component);
            }
        }

        if treat_as_filename {
            return components.pop().unwrap_or_else(|| "Unknown".to_string());
        }
        if components.is_empty() {
            return "Unknown".to_string();
        }
        components.join("/")
    }

    /// Render a file destination under `base_dir`, keeping the source's
    /// extension
    pub fn file_destination(
        &self,
        base_dir: &Path,
        pattern: &str,
        ctx: &NamingContext,
        source: &Path,
    ) -> PathBuf {
        let treat_as_filename = !pattern_allows_subfolders(pattern);
        let mut rendered = self.render(pattern, ctx, treat_as_filename);

        if let Some(ext) = source.extension().and_then(|e| e.to_str()) {
            let suffix = format!(".{}", ext);
            if !rendered.to_lowercase().ends_with(&suffix.to_lowercase()) {
                rendered.push_str(&suffix);
            }
        }

        join_relative(base_dir, &rendered)
    }

    /// Directory for an item that has no base path yet
    pub fn item_directory(&self, output_root: &Path, pattern: &str, ctx: &NamingContext) -> PathBuf {
        join_relative(output_root, &self.render(pattern, ctx, false))
    }
}

fn join_relative(base: &Path, relative: &str) -> PathBuf {
    let mut path = base.to_path_buf();
    for component in relative.split('/').filter(|c| !c.is_empty()) {
        path.push(component);
    }
    path
}

/// `{Token:00}` zero-pads numeric values to the width of the format
fn apply_format(value: &str, format: &str) -> String {
    if !format.is_empty() && format.chars().all(|c| c == '0') {
        if let Ok(number) = value.trim().parse::<u64>() {
            return format!("{:0width$}", number, width = format.len());
        }
    }
    value.to_string()
}
