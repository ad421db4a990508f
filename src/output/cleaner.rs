use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

/// What Stata prints when a running command is interrupted.
pub const BREAK_INDICATOR: &str = "--Break--";

static ANSI_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("valid ansi regex"));
static MARKER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"__MARKER__[0-9a-f]+__").expect("valid marker regex"));

// Lines injected by the boundary command and the graph export wrapper. Matched after trailing
// whitespace has been removed from the line.
static SCAFFOLDING_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r#"^(?:"#,
        r#"""#,
        r#"|quietly (?:capture graph describe Graph|graph drop _all|graph export "[^"]+", replace)"#,
        r#"|if \(_rc == 0\) \{"#,
        r#"|\}"#,
        r#"|\s*\d+\. (?:graph export "[^"]+", replace|quietly graph export "[^"]+", replace|\})"#,
        r#")$"#,
    ))
    .expect("valid scaffolding regex")
});

const ECHO_PREFIX: &str = ". ";
const ECHO_CONTINUATION_PREFIX: &str = "> ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanedOutput {
    pub text: String,
    pub user_break: bool,
}

pub fn strip_ansi_codes(text: &str) -> Cow<'_, str> {
    ANSI_PATTERN.replace_all(text, "")
}

/// Strips terminal decoration, command echo and protocol scaffolding from raw output.
///
/// Blank lines are dropped and trailing whitespace is trimmed; leading whitespace is kept since
/// it carries column alignment. Cleaning already-clean text returns it unchanged.
pub fn clean_output(raw: &str) -> CleanedOutput {
    let text = strip_ansi_codes(raw);
    let user_break = text.contains(BREAK_INDICATOR);
    let text = MARKER_PATTERN.replace_all(&text, "");

    let mut kept: Vec<&str> = Vec::new();
    let mut after_echo = false;
    for line in text.split('\n') {
        if line.starts_with(ECHO_PREFIX) {
            after_echo = true;
            continue;
        }
        if after_echo && line.starts_with(ECHO_CONTINUATION_PREFIX) {
            continue;
        }
        after_echo = false;

        let line = line.trim_end();
        if line.trim_start().is_empty() || SCAFFOLDING_PATTERN.is_match(line) {
            continue;
        }
        kept.push(line);
    }

    CleanedOutput {
        text: kept.join("\n"),
        user_break,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_ansi_sequences() {
        assert_eq!(
            strip_ansi_codes("\x1b[1;32mok\x1b[0m \x1b[?25lhidden"),
            "ok hidden"
        );
    }

    #[test]
    fn removes_echo_marker_and_blank_lines() {
        let raw = concat!(
            ". display 1+1\r\n",
            "2\r\n",
            "\r\n",
            ". display \"__MARKER_\" \"_0123456789abcdef__\"\r\n",
        );
        let cleaned = clean_output(raw);
        assert_eq!(cleaned.text, "2");
        assert!(!cleaned.user_break);
    }

    #[test]
    fn removes_embedded_marker_tokens() {
        let cleaned = clean_output("value __MARKER__deadbeefdeadbeef__\n");
        assert_eq!(cleaned.text, "value");
    }

    #[test]
    fn removes_graph_export_wrapper() {
        let raw = concat!(
            ". twoway scatter mpg weight\n",
            ". quietly capture graph describe Graph\n",
            ". if (_rc == 0) {\n",
            "  2. graph export \"/tmp/stata/stata_graph_1.png\", replace\n",
            "  3. }\n",
            "(file /tmp/stata/stata_graph_1.png written in PNG format)\n",
            "quietly graph drop _all\n",
            "}\n",
            "\"\n",
        );
        let cleaned = clean_output(raw);
        assert_eq!(
            cleaned.text,
            "(file /tmp/stata/stata_graph_1.png written in PNG format)"
        );
    }

    #[test]
    fn keeps_list_rows_that_look_numbered() {
        let raw = "     +-------+\n  1. | 4,099 |\n  2. | 4,749 |\n     +-------+\n";
        let cleaned = clean_output(raw);
        assert_eq!(cleaned.text.lines().count(), 4);
        assert!(cleaned.text.contains("  1. | 4,099 |"));
    }

    #[test]
    fn drops_wrapped_echo_continuations_only_after_echo() {
        let raw = ". regress price mpg weight\n> length turn\nsome output\n> kept\n";
        let cleaned = clean_output(raw);
        assert_eq!(cleaned.text, "some output\n> kept");
    }

    #[test]
    fn detects_break_indicator() {
        let cleaned = clean_output(". sleep 5000\n--Break--\n");
        assert!(cleaned.user_break);
        assert_eq!(cleaned.text, "--Break--");
    }

    #[test]
    fn trims_trailing_but_not_leading_whitespace() {
        let cleaned = clean_output("   indented   \t\r\n\tTabbed \n");
        assert_eq!(cleaned.text, "   indented\n\tTabbed");
    }

    #[test]
    fn cleaning_is_idempotent() {
        let raw = concat!(
            "\x1b[1m. summarize\x1b[0m\r\n",
            "\r\n",
            "    Variable |        Obs        Mean\r\n",
            "-------------+------------------------\r\n",
            "       price |         74    6165.257  \r\n",
            "--Break--\r\n",
            "}\r\n",
        );
        let once = clean_output(raw);
        let twice = clean_output(&once.text);
        assert_eq!(once, twice);
    }
}
