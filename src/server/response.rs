use std::path::Path;

use rmcp::model::{AnnotateAble, CallToolResult, Content, Meta, RawContent, RawImageContent};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;

use crate::error::SessionError;
use crate::graphics::{GraphArtifact, is_inline_image, load_artifact, mime_type_for};
use crate::output::ExecutionResult;
use crate::output::presentation::{
    format_as_embedded_markup, format_as_preformatted, looks_like_raw_markup, looks_like_table,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub(crate) enum OutputFormat {
    #[default]
    Text,
    Html,
}

pub(crate) fn execution_to_contents(result: &ExecutionResult, format: OutputFormat) -> Vec<Content> {
    let mut contents = Vec::new();
    let text = result_text(result);
    if !text.is_empty() {
        contents.push(Content::text(render(text, format, result.is_error)));
    }
    for path in &result.graph_files {
        contents.push(graph_content(path));
    }
    contents
}

pub(crate) fn session_error_contents(err: &SessionError) -> Vec<Content> {
    vec![Content::text(format!("session error: {err}"))]
}

pub(crate) fn finalize_batch(mut contents: Vec<Content>) -> CallToolResult {
    ensure_nonempty_contents(&mut contents);
    // Stata errors stay in the tool output; MCP errors are reserved for protocol failures.
    CallToolResult::success(contents)
}

fn ensure_nonempty_contents(contents: &mut Vec<Content>) {
    if contents.is_empty() {
        contents.push(Content::text(String::new()));
    }
}

/// Cleaned output, with the error message and `r(N);` appended when the output lacks them.
fn result_text(result: &ExecutionResult) -> String {
    let mut text = result.output.clone();
    let Some(signature) = result.error_signature() else {
        return text;
    };
    if text.contains(&signature) {
        return text;
    }
    for line in [result.error_message.as_str(), signature.as_str()] {
        if line.is_empty() || text.contains(line) {
            continue;
        }
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(line);
    }
    text
}

fn render(text: String, format: OutputFormat, is_error: bool) -> String {
    if format == OutputFormat::Text || is_error {
        return text;
    }
    if looks_like_raw_markup(&text) {
        format_as_embedded_markup(&text)
    } else if looks_like_table(&text) {
        format_as_preformatted(&text)
    } else {
        text
    }
}

fn graph_content(path: &str) -> Content {
    if !is_inline_image(Path::new(path)) {
        let mime_type = mime_type_for(Path::new(path));
        return Content::text(format!("[graph written to {path} ({mime_type})]"));
    }
    match load_artifact(path) {
        Ok(artifact) => content_image_with_meta(artifact),
        Err(err) => {
            tracing::warn!(path, error = %err, "failed to read graph file");
            Content::text(format!("[graph file {path} could not be read: {err}]"))
        }
    }
}

fn content_image_with_meta(artifact: GraphArtifact) -> Content {
    let mut meta = Meta::new();
    meta.0.insert(
        "stataRepl".to_string(),
        json!({
            "path": artifact.path.to_string_lossy(),
        }),
    );
    RawContent::Image(RawImageContent {
        data: artifact.data,
        mime_type: artifact.mime_type.to_string(),
        meta: Some(meta),
    })
    .no_annotation()
}
