//! Boundary tokens that make the end of one submission visible in the raw terminal stream.
//!
//! Each submission gets a fresh token. The wrapped command prints the token after the user's
//! code; the REPL keeps executing lines after a non-fatal error, so the token shows up even when
//! the code itself failed. Everything from the first occurrence of the token onwards belongs to
//! the scaffolding and is discarded.

use std::fmt;

pub const MARKER_PREFIX: &str = "__MARKER__";
pub const MARKER_SUFFIX: &str = "__";
/// Hex digits of entropy per token (64 bits).
pub const MARKER_HEX_LEN: usize = 16;

#[derive(Clone, PartialEq, Eq)]
pub struct Marker {
    hex: String,
    token: String,
}

impl Marker {
    pub fn new() -> Self {
        Self::from_hex(format!("{:016x}", rand::random::<u64>()))
    }

    fn from_hex(hex: String) -> Self {
        let token = format!("{MARKER_PREFIX}{hex}{MARKER_SUFFIX}");
        Self { hex, token }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// The command that prints the token.
    ///
    /// The token is split across two adjacent string literals. `display` concatenates them on
    /// output, but the terminal's echo of the command line never contains the token itself.
    pub fn display_command(&self) -> String {
        let split = MARKER_PREFIX.len() - 1;
        let (head, tail) = MARKER_PREFIX.split_at(split);
        format!("display \"{head}\" \"{tail}{}{MARKER_SUFFIX}\"", self.hex)
    }

    /// Wraps `code` so the token is the last thing the REPL prints for this submission.
    /// `epilogue` lines run between the user's code and the token.
    pub fn wrap(&self, code: &str, epilogue: &[String]) -> String {
        let code = code.trim_end_matches(['\n', '\r']);
        let mut wrapped = String::with_capacity(code.len() + 64);
        if !code.is_empty() {
            wrapped.push_str(code);
            wrapped.push('\n');
        }
        for line in epilogue {
            wrapped.push_str(line);
            wrapped.push('\n');
        }
        wrapped.push_str(&self.display_command());
        wrapped.push('\n');
        wrapped
    }
}

impl Default for Marker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Marker").field(&self.token).finish()
    }
}

/// Splits `stream` at the first occurrence of `token`.
///
/// Returns the bytes before the token and whether the token was found. When it is missing the
/// whole stream is returned unchanged. The read loop calls this on the unsearched tail of its
/// buffer as output accumulates.
pub fn locate_boundary<'a>(stream: &'a [u8], token: &[u8]) -> (&'a [u8], bool) {
    if token.is_empty() {
        return (stream, false);
    }
    match memchr::memmem::find(stream, token) {
        Some(pos) => (&stream[..pos], true),
        None => (stream, false),
    }
}
