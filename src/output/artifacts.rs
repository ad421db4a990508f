use std::sync::LazyLock;

use regex::Regex;

static FILE_NOTE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\(file ([^\s]+\.(?:png|svg|pdf|eps)) (?:written|saved)")
        .expect("valid graph note regex")
});

/// Paths from Stata's `(file <path> written|saved ...)` notes, in order of appearance.
pub fn extract_graph_files(text: &str) -> Vec<String> {
    FILE_NOTE_PATTERN
        .captures_iter(text)
        .filter_map(|captures| captures.get(1))
        .map(|path| path.as_str().to_string())
        .collect()
}
