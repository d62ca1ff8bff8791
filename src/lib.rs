//! # reader2pdf
//!
//! Turn page archives scraped from a web e-reader into searchable PDFs.
//!
//! ## Why this crate?
//!
//! An e-reader scraper produces one small HTML document per page, each
//! wrapping a single page image. Getting from a zip of those to a usable
//! book means rendering hundreds of pages, stitching them together in the
//! right order, running OCR, and (for machine readers) shrinking the result.
//! Every step is slow, so a batch of books has to survive interruptions:
//! each archive's progress is persisted per stage and a re-run picks up
//! where the last one stopped.
//!
//! ## Pipeline Overview
//!
//! ```text
//! bookA.zip
//!  │
//!  ├─ 1. Extract   unpack page documents into a temp workspace
//!  ├─ 2. Dedup     SHA-256 per page, render each distinct page once
//!  ├─ 3. Render    W workers, one headless browser each, shared queue
//!  ├─ 4. Merge     chunked merge in page order          → bookA.pdf
//!  ├─ 5. OCR       ocrmypdf with phase + heartbeat logs  → bookA-ocr.pdf
//!  └─ 6. Compress  Ghostscript, optional                → bookA-llm.pdf
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use reader2pdf::{run_batch, ExternalTools, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder()
//!         .input_dir("zips")
//!         .output_dir("pdfs")
//!         .compress(true)
//!         .build()?;
//!     let summary = run_batch(config, &ExternalTools::default()).await?;
//!     for (archive, error) in summary.failures() {
//!         eprintln!("{archive}: {error}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Testing without external tools
//!
//! [`Orchestrator`] is generic over its store and the three external
//! capabilities ([`RendererFactory`], [`OcrService`], [`Recompressor`]), so
//! the whole batch logic runs against in-memory fakes.
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `reader2pdf` binary (clap + anyhow + tracing-subscriber + indicatif) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    compressed_counterpart, OcrSettings, PipelineConfig, PipelineConfigBuilder, RecompressSettings,
};
pub use error::{PageError, PipelineError};
pub use orchestrator::{run_batch, Orchestrator, ProductionOrchestrator};
pub use output::{
    ArchiveOutcome, BatchSummary, CompressionFailure, CompressionStats, CompressionSummary,
    OutcomeKind,
};
pub use pipeline::chrome::ChromeRendererFactory;
pub use pipeline::dimensions::PageSize;
pub use pipeline::ocr::{OcrEvent, OcrMyPdf, OcrPhase, OcrPhaseTracker, OcrService};
pub use pipeline::recompress::{Ghostscript, Recompressor};
pub use pipeline::render::{PageRenderer, RenderFailure, RendererFactory};
pub use pipeline::tools::ExternalTools;
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use store::{JobRecord, JobStatus, JobStore, JsonFileStore, MemoryStore, Stage};
