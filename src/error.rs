//! Error types for the reader2pdf library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`PipelineError`] is **fatal to its scope**: a precondition is missing
//!   (abort the whole run), or a stage of one archive failed (the archive is
//!   marked `failed` and the batch moves on).
//!
//! * [`PageError`] is **non-fatal**: a single render unit failed. The unit is
//!   dropped from the merged PDF, the render pool keeps going, and the error
//!   is kept in the archive outcome for the end-of-run report.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// All fatal errors returned by the reader2pdf library.
///
/// Per-unit render failures use [`PageError`] and never surface here on
/// their own.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Precondition errors ───────────────────────────────────────────────
    /// A required external tool is not installed or not on `PATH`.
    #[error("Required tool '{tool}' is not available.\n{hint}")]
    ToolMissing { tool: String, hint: String },

    // ── Input errors ──────────────────────────────────────────────────────
    /// The input directory does not exist.
    #[error("Input directory not found: '{path}'")]
    InputDirNotFound { path: PathBuf },

    /// The archive could not be opened or one of its entries is unreadable.
    #[error("Archive '{path}' is corrupt: {detail}")]
    CorruptArchive { path: PathBuf, detail: String },

    /// The archive contained no page documents.
    #[error("Archive '{path}' contains no page documents")]
    EmptyArchive { path: PathBuf },

    // ── Render errors ─────────────────────────────────────────────────────
    /// A renderer instance could not be started for a worker.
    #[error("Renderer for worker {worker} failed to start: {detail}")]
    RendererLaunchFailed { worker: usize, detail: String },

    // ── Merge errors ──────────────────────────────────────────────────────
    /// The merge engine was handed zero page artifacts.
    #[error("Nothing to merge: no page artifacts were produced")]
    NothingToMerge,

    /// A page artifact could not be parsed or the merged PDF not written.
    #[error("PDF merge failed at '{path}': {detail}")]
    MergeFailed { path: PathBuf, detail: String },

    // ── External service errors ───────────────────────────────────────────
    /// The OCR service exited with a non-zero status.
    #[error("OCR failed for '{input}' (exit code {code:?}){}", fmt_tail(.detail))]
    OcrFailed {
        input: PathBuf,
        code: Option<i32>,
        detail: String,
    },

    /// The recompression service exited with a non-zero status.
    #[error("Recompression failed for '{input}' (exit code {code:?}){}", fmt_tail(.detail))]
    RecompressFailed {
        input: PathBuf,
        code: Option<i32>,
        detail: String,
    },

    /// A stage reported success but its output file does not exist.
    #[error("{stage} stage finished but its output is missing: '{path}'")]
    MissingOutput { stage: String, path: PathBuf },

    // ── Progress store errors ─────────────────────────────────────────────
    /// The progress file exists but is not a valid job record map.
    #[error("Progress file '{path}' is corrupt: {detail}\nFix or delete it to start over.")]
    StoreCorrupt { path: PathBuf, detail: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Generic file-system failure with the offending path attached.
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Attach a path to an [`std::io::Error`].
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

fn fmt_tail(detail: &str) -> String {
    if detail.trim().is_empty() {
        String::new()
    } else {
        format!(": {}", detail.trim())
    }
}

/// A non-fatal error for a single render unit.
///
/// Collected by the render pool; the unit is missing from the merged PDF.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// The renderer could not turn the page document into a PDF.
    #[error("Page {ordinal}: render failed: {detail}")]
    RenderFailed { ordinal: usize, detail: String },

    /// The rendered page could not be written to the archive workspace.
    #[error("Page {ordinal}: could not store artifact: {detail}")]
    ArtifactWriteFailed { ordinal: usize, detail: String },

    /// The worker holding this page lost its renderer before reaching it.
    #[error("Page {ordinal}: renderer unavailable: {detail}")]
    RendererLost { ordinal: usize, detail: String },
}

impl PageError {
    /// Ordinal of the page this error belongs to.
    pub fn ordinal(&self) -> usize {
        match self {
            PageError::RenderFailed { ordinal, .. }
            | PageError::ArtifactWriteFailed { ordinal, .. }
            | PageError::RendererLost { ordinal, .. } => *ordinal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ocr_failure_display_includes_code_and_tail() {
        let e = PipelineError::OcrFailed {
            input: PathBuf::from("out/book.pdf"),
            code: Some(2),
            detail: "  tesseract: page 3 timed out \n".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("Some(2)"), "got: {msg}");
        assert!(msg.ends_with(": tesseract: page 3 timed out"), "got: {msg}");
    }

    #[test]
    fn recompress_failure_without_detail_has_no_trailing_colon() {
        let e = PipelineError::RecompressFailed {
            input: PathBuf::from("book-ocr.pdf"),
            code: None,
            detail: String::new(),
        };
        assert!(e.to_string().ends_with("(exit code None)"));
    }

    #[test]
    fn tool_missing_display() {
        let e = PipelineError::ToolMissing {
            tool: "ocrmypdf".into(),
            hint: "Install with: pipx install ocrmypdf".into(),
        };
        assert!(e.to_string().contains("ocrmypdf"));
        assert!(e.to_string().contains("pipx"));
    }

    #[test]
    fn page_error_reports_ordinal() {
        let e = PageError::RenderFailed {
            ordinal: 7,
            detail: "net::ERR_ABORTED".into(),
        };
        assert_eq!(e.ordinal(), 7);
        assert!(e.to_string().starts_with("Page 7"));
    }
}
