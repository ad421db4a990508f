use std::sync::LazyLock;

use regex::Regex;

/// Error code reported when a break was seen but Stata printed no `r(N);` line.
pub const USER_BREAK_CODE: u32 = 1;
pub const INTERRUPTED_MESSAGE: &str = "execution interrupted by user";

static SIGNATURE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"r\((\d+)\);").expect("valid error signature regex"));

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorReport {
    pub is_error: bool,
    pub code: u32,
    pub message: String,
}

/// Classifies cleaned output. The first `r(N);` wins; the message is whatever precedes it.
pub fn detect_error(text: &str, user_break: bool) -> ErrorReport {
    if let Some(captures) = SIGNATURE_PATTERN.captures(text) {
        let whole = captures.get(0).map_or(0, |m| m.start());
        let code = captures
            .get(1)
            .map(|digits| digits.as_str().parse::<u32>().unwrap_or(u32::MAX))
            .unwrap_or(u32::MAX);
        return ErrorReport {
            is_error: true,
            code,
            message: text[..whole].trim_end().to_string(),
        };
    }
    if user_break {
        return ErrorReport {
            is_error: true,
            code: USER_BREAK_CODE,
            message: INTERRUPTED_MESSAGE.to_string(),
        };
    }
    ErrorReport::default()
}
