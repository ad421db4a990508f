//! Rendering heuristics for cleaned output.
//!
//! None of these parse Stata's output grammar. They look for surface features (result keywords,
//! rule lines, column gaps, HTML tags) and fail open: anything unrecognized is plain text.

use std::sync::LazyLock;

use regex::Regex;

const TABLE_KEYWORDS: &[&str] = &[
    "Variable",
    "Obs",
    "Mean",
    "Std. Dev.",
    "Std. Err.",
    "Coef.",
    "P>|t|",
    "P>|z|",
    "[95% Conf. Interval]",
    "Min",
    "Max",
    "Sum",
    "Variance",
    "Skewness",
    "Kurtosis",
    "Number of obs",
    "F(",
    "Prob > F",
    "R-squared",
    "Adj R-squared",
    "Root MSE",
];

const RULE_RUNS: &[&str] = &["----", "━━━━", "────"];

static MARKUP_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<(?:table|tr|div|html|body|span)[\s>/]").expect("valid markup regex")
});

pub const TABLE_CLASS: &str = "stata-table";

const PREFORMATTED_STYLE: &str = "<style>
.stata-output {
  font-family: ui-monospace, 'Cascadia Code', 'Source Code Pro', Menlo, 'DejaVu Sans Mono', Consolas, monospace;
  font-size: 12px;
  font-variant-ligatures: none;
  background-color: #f8f8f8;
  padding: 10px;
  border: 1px solid #e0e0e0;
  border-radius: 3px;
  overflow-x: auto;
  margin: 0;
  line-height: 1.4;
}
</style>
";

const TABLE_STYLE: &str = "<style>
table.stata-table {
  border-collapse: collapse;
  border-top: 2px solid #000;
  border-bottom: 2px solid #000;
  font-variant-numeric: tabular-nums;
}
table.stata-table th,
table.stata-table td {
  border: none;
  padding: 2px 8px;
  text-align: right;
}
table.stata-table th:first-child,
table.stata-table td:first-child {
  text-align: left;
}
table.stata-table thead tr:last-child th,
table.stata-table thead tr:last-child td {
  border-bottom: 1px solid #000;
}
</style>
";

/// Whether the text reads like a Stata results table.
///
/// Requires a result keyword plus one structural hint (a rule line, two lines with `|`, or
/// three lines with column gaps), or, without a keyword, two rule lines and three gapped lines.
pub fn looks_like_table(text: &str) -> bool {
    if text.is_empty() {
        return false;
    }
    let has_keyword = TABLE_KEYWORDS.iter().any(|keyword| text.contains(keyword));

    let mut rule_lines = 0usize;
    let mut pipe_lines = 0usize;
    let mut gapped_lines = 0usize;
    for line in text.lines() {
        if RULE_RUNS.iter().any(|run| line.contains(run)) {
            rule_lines += 1;
        }
        if line.contains('|') {
            pipe_lines += 1;
        }
        if line.contains("  ") {
            gapped_lines += 1;
        }
    }

    let has_structure = rule_lines >= 1 || pipe_lines >= 2;
    let has_alignment = gapped_lines >= 3;
    (has_keyword && (has_structure || has_alignment)) || (rule_lines >= 2 && gapped_lines >= 3)
}

pub fn looks_like_raw_markup(text: &str) -> bool {
    MARKUP_PATTERN.is_match(text)
}

pub fn format_as_preformatted(text: &str) -> String {
    let escaped = text
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;");
    format!("{PREFORMATTED_STYLE}<pre class=\"stata-output\">{escaped}</pre>")
}

/// Normalizes an HTML fragment found in the output into a styled table.
pub fn format_as_embedded_markup(text: &str) -> String {
    let start = ["table", "div", "tr"]
        .iter()
        .filter_map(|tag| find_open_tag(text, tag, 0))
        .min()
        .unwrap_or(0);
    let mut fragment = text[start..].to_string();

    if contains_ignore_case(&fragment, "</thead")
        && find_open_tag(&fragment, "thead", 0).is_none()
        && let Some(row) = find_open_tag(&fragment, "tr", 0)
    {
        fragment.insert_str(row, "<thead>");
    }

    let has_rows = find_open_tag(&fragment, "tr", 0).is_some()
        || find_open_tag(&fragment, "thead", 0).is_some();
    if has_rows && find_open_tag(&fragment, "table", 0).is_none() {
        fragment = format!("<table>{fragment}</table>");
    }

    if let Some(table) = find_open_tag(&fragment, "table", 0) {
        fragment = add_table_class(&fragment, table);
    }

    format!("{TABLE_STYLE}{fragment}")
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack
        .to_ascii_lowercase()
        .contains(&needle.to_ascii_lowercase())
}

/// Byte offset of `<name` where the name is followed by whitespace, `>` or `/`.
fn find_open_tag(text: &str, name: &str, from: usize) -> Option<usize> {
    let lower = text.to_ascii_lowercase();
    let needle = format!("<{name}");
    let mut offset = from;
    while let Some(found) = lower.get(offset..)?.find(&needle) {
        let at = offset + found;
        let after = at + needle.len();
        match lower.as_bytes().get(after) {
            Some(b'>' | b'/') | None => return Some(at),
            Some(byte) if byte.is_ascii_whitespace() => return Some(at),
            _ => offset = after,
        }
    }
    None
}

fn add_table_class(fragment: &str, tag_start: usize) -> String {
    let Some(tag_len) = fragment[tag_start..].find('>') else {
        return fragment.to_string();
    };
    let tag_end = tag_start + tag_len;
    let tag = &fragment[tag_start..tag_end];
    let lower = tag.to_ascii_lowercase();

    let rewritten = match find_class_value(&lower) {
        Some((value_start, value_end)) => {
            let existing = &tag[value_start..value_end];
            if existing.split_whitespace().any(|class| class == TABLE_CLASS) {
                return fragment.to_string();
            }
            let merged = if existing.trim().is_empty() {
                TABLE_CLASS.to_string()
            } else {
                format!("{} {TABLE_CLASS}", existing.trim_end())
            };
            format!("{}{merged}{}", &tag[..value_start], &tag[value_end..])
        }
        None => {
            let name_end = "<table".len();
            format!(
                "{} class=\"{TABLE_CLASS}\"{}",
                &tag[..name_end],
                &tag[name_end..]
            )
        }
    };

    format!(
        "{}{rewritten}{}",
        &fragment[..tag_start],
        &fragment[tag_end..]
    )
}

/// Span of the quoted `class` attribute value inside a lowercased open tag.
fn find_class_value(tag: &str) -> Option<(usize, usize)> {
    let bytes = tag.as_bytes();
    let mut offset = 0;
    while let Some(found) = tag[offset..].find("class") {
        let at = offset + found;
        offset = at + "class".len();
        if at == 0 || !bytes[at - 1].is_ascii_whitespace() {
            continue;
        }
        let mut cursor = offset;
        while bytes.get(cursor).is_some_and(u8::is_ascii_whitespace) {
            cursor += 1;
        }
        if bytes.get(cursor) != Some(&b'=') {
            continue;
        }
        cursor += 1;
        while bytes.get(cursor).is_some_and(u8::is_ascii_whitespace) {
            cursor += 1;
        }
        let quote = match bytes.get(cursor) {
            Some(&q) if q == b'"' || q == b'\'' => q,
            _ => continue,
        };
        let value_start = cursor + 1;
        let value_len = tag[value_start..].find(quote as char)?;
        return Some((value_start, value_start + value_len));
    }
    None
}
