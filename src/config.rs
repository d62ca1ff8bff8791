//! Configuration types for the batch conversion pipeline.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`]. Stage-specific knobs live in the nested
//! [`OcrSettings`] and [`RecompressSettings`] so the OCR and recompression
//! drivers can be called on their own without a whole pipeline config.

use crate::error::PipelineError;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Standard page width in inches used for every rendered page.
pub const STANDARD_PAGE_WIDTH_IN: f64 = 8.5;

/// Height/width ratio used when the embedded image cannot be inspected.
pub const DEFAULT_ASPECT_RATIO: f64 = 1.5;

/// Number of page artifacts loaded at once by the merge engine.
pub const DEFAULT_MERGE_CHUNK: usize = 100;

/// Number of logical CPUs, falling back to 1 when it cannot be queried.
pub fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Configuration for a batch run.
///
/// # Example
/// ```rust
/// use reader2pdf::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .input_dir("zips")
///     .output_dir("pdfs")
///     .compress(true)
///     .render_workers(4)
///     .build()
///     .unwrap();
/// assert_eq!(config.progress_path(), std::path::PathBuf::from("pdfs/progress.json"));
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Directory scanned for `*.zip` page archives. Default: `input`.
    pub input_dir: PathBuf,

    /// Directory receiving `<name>.pdf`, `<name>-ocr.pdf`, `<name>-llm.pdf`. Default: `output`.
    pub output_dir: PathBuf,

    /// Job record file. Default: `<output_dir>/progress.json`.
    pub progress_file: Option<PathBuf>,

    /// Run the recompression stage (and the post-run sweep). Default: false.
    pub compress: bool,

    /// Render worker count. `None` = available parallelism minus one for the caller.
    pub render_workers: Option<usize>,

    /// Page artifacts loaded per merge chunk. Default: 100.
    pub merge_chunk_size: usize,

    /// Rendered page width in inches. Default: 8.5.
    pub page_width_in: f64,

    /// Height/width ratio for pages whose image size is unknown. Default: 1.5.
    pub default_aspect_ratio: f64,

    /// OCR stage settings.
    pub ocr: OcrSettings,

    /// Recompression stage settings.
    pub recompress: RecompressSettings,

    /// Optional observer for pipeline events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("input"),
            output_dir: PathBuf::from("output"),
            progress_file: None,
            compress: false,
            render_workers: None,
            merge_chunk_size: DEFAULT_MERGE_CHUNK,
            page_width_in: STANDARD_PAGE_WIDTH_IN,
            default_aspect_ratio: DEFAULT_ASPECT_RATIO,
            ocr: OcrSettings::default(),
            recompress: RecompressSettings::default(),
            progress_callback: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("input_dir", &self.input_dir)
            .field("output_dir", &self.output_dir)
            .field("progress_file", &self.progress_file)
            .field("compress", &self.compress)
            .field("render_workers", &self.render_workers)
            .field("merge_chunk_size", &self.merge_chunk_size)
            .field("page_width_in", &self.page_width_in)
            .field("default_aspect_ratio", &self.default_aspect_ratio)
            .field("ocr", &self.ocr)
            .field("recompress", &self.recompress)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn PipelineProgressCallback>"),
            )
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Resolved path of the job record file.
    pub fn progress_path(&self) -> PathBuf {
        self.progress_file
            .clone()
            .unwrap_or_else(|| self.output_dir.join("progress.json"))
    }

    /// Merged PDF path for an archive base name.
    pub fn pdf_path(&self, name: &str) -> PathBuf {
        self.output_dir.join(format!("{name}.pdf"))
    }

    /// Searchable PDF path for an archive base name.
    pub fn ocr_path(&self, name: &str) -> PathBuf {
        self.output_dir.join(format!("{name}-ocr.pdf"))
    }

    /// Compressed PDF path for an archive base name.
    pub fn llm_path(&self, name: &str) -> PathBuf {
        compressed_counterpart(&self.ocr_path(name))
    }

    /// Number of render workers for `units` render units.
    ///
    /// One execution unit stays with the caller; never more workers than units.
    pub fn render_worker_count(&self, units: usize) -> usize {
        let cap = self
            .render_workers
            .unwrap_or_else(|| available_parallelism().saturating_sub(1));
        cap.max(1).min(units.max(1))
    }
}

/// `book-ocr.pdf` → `book-llm.pdf`; any other name gets `-llm` appended to its stem.
pub fn compressed_counterpart(ocr_pdf: &Path) -> PathBuf {
    let stem = ocr_pdf
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let base = stem.strip_suffix("-ocr").unwrap_or(&stem);
    ocr_pdf.with_file_name(format!("{base}-llm.pdf"))
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn input_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.input_dir = dir.into();
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn progress_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.progress_file = Some(path.into());
        self
    }

    pub fn compress(mut self, v: bool) -> Self {
        self.config.compress = v;
        self
    }

    pub fn render_workers(mut self, n: usize) -> Self {
        self.config.render_workers = Some(n.max(1));
        self
    }

    pub fn merge_chunk_size(mut self, n: usize) -> Self {
        self.config.merge_chunk_size = n.max(1);
        self
    }

    pub fn page_width_in(mut self, inches: f64) -> Self {
        self.config.page_width_in = inches;
        self
    }

    pub fn default_aspect_ratio(mut self, ratio: f64) -> Self {
        self.config.default_aspect_ratio = ratio;
        self
    }

    pub fn ocr(mut self, settings: OcrSettings) -> Self {
        self.config.ocr = settings;
        self
    }

    pub fn recompress(mut self, settings: RecompressSettings) -> Self {
        self.config.recompress = settings;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if !(c.page_width_in > 0.0 && c.page_width_in <= 100.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "page width must be in (0, 100] inches, got {}",
                c.page_width_in
            )));
        }
        if !(c.default_aspect_ratio > 0.0 && c.default_aspect_ratio.is_finite()) {
            return Err(PipelineError::InvalidConfig(format!(
                "default aspect ratio must be positive, got {}",
                c.default_aspect_ratio
            )));
        }
        if c.ocr.jobs == 0 {
            return Err(PipelineError::InvalidConfig("OCR jobs must be ≥ 1".into()));
        }
        if c.ocr.heartbeat_secs == 0 {
            return Err(PipelineError::InvalidConfig(
                "heartbeat interval must be ≥ 1s".into(),
            ));
        }
        if c.ocr.max_pages == Some(0) {
            return Err(PipelineError::InvalidConfig(
                "OCR page cap must be ≥ 1 when set".into(),
            ));
        }
        if !(1..=100).contains(&c.recompress.jpeg_quality) {
            return Err(PipelineError::InvalidConfig(format!(
                "JPEG quality must be 1–100, got {}",
                c.recompress.jpeg_quality
            )));
        }
        if !(36..=600).contains(&c.recompress.resolution_dpi) {
            return Err(PipelineError::InvalidConfig(format!(
                "recompression resolution must be 36–600 dpi, got {}",
                c.recompress.resolution_dpi
            )));
        }
        Ok(self.config)
    }
}

// ── Stage settings ───────────────────────────────────────────────────────

/// Settings handed to the OCR service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcrSettings {
    /// Re-OCR pages even if they already carry a text layer. Default: true.
    pub force: bool,

    /// Parallel jobs inside the OCR service. Default: available parallelism.
    pub jobs: usize,

    /// Per-page OCR timeout in seconds. Default: 180.
    pub page_timeout_secs: u64,

    /// Only OCR the first N pages (partial/test runs). Default: all.
    pub max_pages: Option<usize>,

    /// Tesseract language code(s), e.g. `eng` or `eng+deu`. Default: `eng`.
    pub language: String,

    /// Favour speed over fidelity in the service's renderer. Default: true.
    pub fast: bool,

    /// Seconds without diagnostic output before a heartbeat is emitted. Default: 30.
    pub heartbeat_secs: u64,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            force: true,
            jobs: available_parallelism(),
            page_timeout_secs: 180,
            max_pages: None,
            language: "eng".to_string(),
            fast: true,
            heartbeat_secs: 30,
        }
    }
}

/// Settings handed to the recompression service.
///
/// The defaults target machine readers (text extraction, LLM ingestion),
/// not people: images are downsampled hard while the text layer is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecompressSettings {
    /// Target image resolution in dpi. Default: 100.
    pub resolution_dpi: u32,

    /// JPEG quality 1–100. Default: 50.
    pub jpeg_quality: u8,

    /// Parallel jobs. `None` = available parallelism minus two for the OS.
    pub workers: Option<usize>,
}

impl Default for RecompressSettings {
    fn default() -> Self {
        Self {
            resolution_dpi: 100,
            jpeg_quality: 50,
            workers: None,
        }
    }
}

impl RecompressSettings {
    /// Effective worker count for a batch.
    pub fn worker_count(&self) -> usize {
        self.workers
            .unwrap_or_else(|| available_parallelism().saturating_sub(2))
            .max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths_follow_output_dir() {
        let c = PipelineConfig::builder().output_dir("out").build().unwrap();
        assert_eq!(c.pdf_path("bookA"), PathBuf::from("out/bookA.pdf"));
        assert_eq!(c.ocr_path("bookA"), PathBuf::from("out/bookA-ocr.pdf"));
        assert_eq!(c.llm_path("bookA"), PathBuf::from("out/bookA-llm.pdf"));
        assert_eq!(c.progress_path(), PathBuf::from("out/progress.json"));
    }

    #[test]
    fn explicit_progress_file_wins() {
        let c = PipelineConfig::builder()
            .progress_file("/tmp/jobs.json")
            .build()
            .unwrap();
        assert_eq!(c.progress_path(), PathBuf::from("/tmp/jobs.json"));
    }

    #[test]
    fn counterpart_of_non_ocr_name() {
        assert_eq!(
            compressed_counterpart(Path::new("a/scan.pdf")),
            PathBuf::from("a/scan-llm.pdf")
        );
    }

    #[test]
    fn render_workers_never_exceed_units() {
        let c = PipelineConfig::builder().render_workers(8).build().unwrap();
        assert_eq!(c.render_worker_count(3), 3);
        assert_eq!(c.render_worker_count(20), 8);
        assert_eq!(c.render_worker_count(0), 1);
    }

    #[test]
    fn auto_render_workers_is_at_least_one() {
        let c = PipelineConfig::default();
        assert!(c.render_worker_count(100) >= 1);
    }

    #[test]
    fn invalid_quality_rejected() {
        let err = PipelineConfig::builder()
            .recompress(RecompressSettings {
                jpeg_quality: 0,
                ..Default::default()
            })
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("JPEG quality"));
    }

    #[test]
    fn zero_page_cap_rejected() {
        let err = PipelineConfig::builder()
            .ocr(OcrSettings {
                max_pages: Some(0),
                ..Default::default()
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }

    #[test]
    fn recompress_workers_reserve_for_os() {
        let s = RecompressSettings {
            workers: Some(3),
            ..Default::default()
        };
        assert_eq!(s.worker_count(), 3);
        assert!(RecompressSettings::default().worker_count() >= 1);
    }
}
