//! Progress-callback trait for pipeline events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as archives move through the stages.
//!
//! Render-pool events arrive from several worker tasks at once, so
//! implementations must be `Send + Sync` and protect shared state.
//!
//! # Example
//!
//! ```rust
//! use reader2pdf::{PipelineConfig, PipelineProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct PageCounter(AtomicUsize);
//!
//! impl PipelineProgressCallback for PageCounter {
//!     fn on_page_rendered(&self, _archive: &str, _ordinal: usize, _done: usize, _total: usize) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(Arc::new(PageCounter(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use crate::output::{ArchiveOutcome, BatchSummary, CompressionStats};
use crate::pipeline::ocr::OcrEvent;
use crate::store::Stage;
use std::path::Path;
use std::sync::Arc;

/// Called by the pipeline as it processes archives.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called once with the number of archives found in the input directory.
    fn on_batch_start(&self, total_archives: usize) {
        let _ = total_archives;
    }

    /// Called when an archive enters `processing`. `index` is 1-based.
    fn on_archive_start(&self, archive: &str, index: usize, total: usize) {
        let _ = (archive, index, total);
    }

    /// Called before a stage runs.
    fn on_stage_start(&self, archive: &str, stage: Stage) {
        let _ = (archive, stage);
    }

    /// Called when a stage is skipped because its output is already on disk.
    fn on_stage_skipped(&self, archive: &str, stage: Stage) {
        let _ = (archive, stage);
    }

    /// Called when a stage finished and its flag was persisted.
    fn on_stage_complete(&self, archive: &str, stage: Stage, elapsed_ms: u64) {
        let _ = (archive, stage, elapsed_ms);
    }

    /// Called once the render pool is sized.
    fn on_render_start(&self, archive: &str, units: usize, workers: usize) {
        let _ = (archive, units, workers);
    }

    /// Called from a render worker after a page artifact is stored.
    fn on_page_rendered(&self, archive: &str, ordinal: usize, done: usize, total: usize) {
        let _ = (archive, ordinal, done, total);
    }

    /// Called from a render worker when a unit is dropped.
    fn on_page_failed(&self, archive: &str, ordinal: usize, error: &str) {
        let _ = (archive, ordinal, error);
    }

    /// Called for OCR phase changes, page progress and heartbeats.
    fn on_ocr_event(&self, archive: &str, event: &OcrEvent) {
        let _ = (archive, event);
    }

    /// Called when one file has been recompressed.
    fn on_file_compressed(&self, stats: &CompressionStats) {
        let _ = stats;
    }

    /// Called when one file failed to recompress.
    fn on_compress_failed(&self, input: &Path, error: &str) {
        let _ = (input, error);
    }

    /// Called when an archive reaches `completed` or `failed`, or is skipped.
    fn on_archive_complete(&self, outcome: &ArchiveOutcome) {
        let _ = outcome;
    }

    /// Called once after the archive loop and the compression sweep.
    fn on_batch_complete(&self, summary: &BatchSummary) {
        let _ = summary;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;

/// Returns the configured callback, or a shared no-op one.
pub(crate) fn resolve(cb: &Option<ProgressCallback>) -> ProgressCallback {
    cb.clone().unwrap_or_else(|| Arc::new(NoopProgressCallback))
}
