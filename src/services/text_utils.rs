//! Shared text normalization and comparison utilities
//!
//! Used to match client item names against download records and download
//! titles against library items.

/// Normalize a title for matching.
///
/// Lowercases, drops apostrophes, turns other punctuation into spaces and
/// collapses whitespace, so `"Frank_Herbert - Dune (Unabridged)"` becomes
/// `"frank herbert dune unabridged"`.
pub fn normalize_title(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .filter(|c| !matches!(c, '\'' | '\u{2019}' | '`'))
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether either normalized title contains the other.
///
/// Empty titles never match.
pub fn titles_overlap(a: &str, b: &str) -> bool {
    let (a, b) = (normalize_title(a), normalize_title(b));
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a.contains(&b) || b.contains(&a)
}

/// Similarity between 0.0 and 1.0 of two normalized titles
pub fn title_similarity(a: &str, b: &str) -> f64 {
    strsim::jaro_winkler(&normalize_title(a), &normalize_title(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_title() {
        assert_eq!(
            normalize_title("Frank_Herbert - Dune  (Unabridged)"),
            "frank herbert dune unabridged"
        );
        assert_eq!(normalize_title("Ender's Game"), "enders game");
        assert_eq!(normalize_title("  ...  "), "");
    }

    #[test]
    fn test_titles_overlap() {
        assert!(titles_overlap("Dune", "Frank Herbert - DUNE [MP3]"));
        assert!(titles_overlap("Frank.Herbert.Dune.2021", "frank herbert dune"));
        assert!(!titles_overlap("Dune", "Emma"));
        assert!(!titles_overlap("", "Emma"));
    }

    #[test]
    fn test_title_similarity() {
        assert!(title_similarity("Dune Messiah", "dune messiah") > 0.99);
        assert!(title_similarity("Dune", "Emma") < 0.7);
    }
}
