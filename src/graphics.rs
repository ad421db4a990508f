//! Loads graph files named in Stata's output so they can be handed to the client.

use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

pub const MIME_PNG: &str = "image/png";
pub const MIME_SVG: &str = "image/svg+xml";
pub const MIME_PDF: &str = "application/pdf";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphArtifact {
    pub path: PathBuf,
    pub mime_type: &'static str,
    /// Base64 of the file contents.
    pub data: String,
}

impl GraphArtifact {
    /// Whether clients can show this inline as image content. EPS falls back to the PNG MIME
    /// type but is not renderable, so the extension decides.
    pub fn is_image(&self) -> bool {
        is_inline_image(&self.path)
    }
}

pub fn is_inline_image(path: &Path) -> bool {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());
    matches!(extension.as_deref(), Some("png" | "svg"))
}

/// MIME type from the file extension; unknown extensions are treated as PNG.
pub fn mime_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());
    match extension.as_deref() {
        Some("svg") => MIME_SVG,
        Some("pdf") => MIME_PDF,
        _ => MIME_PNG,
    }
}

pub fn load_artifact(path: impl AsRef<Path>) -> std::io::Result<GraphArtifact> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)?;
    Ok(GraphArtifact {
        path: path.to_path_buf(),
        mime_type: mime_type_for(path),
        data: STANDARD.encode(bytes),
    })
}
