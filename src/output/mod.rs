//! Turns the raw terminal text of one submission into an `ExecutionResult`.

mod artifacts;
mod cleaner;
mod errors;
pub mod presentation;

use serde::Serialize;

pub use self::artifacts::extract_graph_files;
pub use self::cleaner::{BREAK_INDICATOR, CleanedOutput, clean_output, strip_ansi_codes};
pub use self::errors::{ErrorReport, INTERRUPTED_MESSAGE, USER_BREAK_CODE, detect_error};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub output: String,
    pub is_error: bool,
    pub error_code: u32,
    pub error_message: String,
    pub graph_files: Vec<String>,
}

impl ExecutionResult {
    /// The `r(N);` line Stata prints for this result, if it is an error.
    pub fn error_signature(&self) -> Option<String> {
        self.is_error.then(|| format!("r({});", self.error_code))
    }
}

/// Runs the cleaner, error detector and artifact extractor over the text captured before the
/// boundary token.
pub fn parse_execution_output(raw: &str) -> ExecutionResult {
    let CleanedOutput { text, user_break } = clean_output(raw);
    let report = detect_error(&text, user_break);
    let graph_files = extract_graph_files(&text);
    ExecutionResult {
        output: text,
        is_error: report.is_error,
        error_code: report.code,
        error_message: report.message,
        graph_files,
    }
}
