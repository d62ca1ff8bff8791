//! Result types: per-archive outcomes, compression statistics, batch summary.

use crate::error::PageError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How an archive left the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "error", rename_all = "lowercase")]
pub enum OutcomeKind {
    /// At least one stage ran and every required stage is done.
    Completed,
    /// Everything was already done on a previous run.
    Skipped,
    /// A stage failed; message recorded in the job record.
    Failed(String),
}

/// Result of one archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveOutcome {
    /// Archive file name, e.g. `bookA.zip`.
    pub archive: String,
    pub kind: OutcomeKind,
    /// Page documents found in the archive (0 if the pdf stage was skipped).
    pub pages_total: usize,
    /// Render units after deduplication.
    pub unique_pages: usize,
    /// Pages collapsed onto an earlier identical page.
    pub duplicates: usize,
    /// Units dropped by the render pool.
    pub page_errors: Vec<PageError>,
    /// Distinct page numbers the OCR service reported (0 if the stage was skipped).
    pub ocr_pages_seen: usize,
    /// Heartbeats emitted while the OCR service was quiet.
    pub ocr_heartbeats: usize,
    pub duration_ms: u64,
}

impl ArchiveOutcome {
    pub(crate) fn new(archive: impl Into<String>, kind: OutcomeKind) -> Self {
        Self {
            archive: archive.into(),
            kind,
            pages_total: 0,
            unique_pages: 0,
            duplicates: 0,
            page_errors: Vec::new(),
            ocr_pages_seen: 0,
            ocr_heartbeats: 0,
            duration_ms: 0,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.kind, OutcomeKind::Failed(_))
    }
}

/// Before/after figures for one recompressed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionStats {
    pub input: PathBuf,
    pub output: PathBuf,
    pub before_bytes: u64,
    pub after_bytes: u64,
    pub elapsed_ms: u64,
}

impl CompressionStats {
    /// `after / before`; 1.0 for an empty input.
    pub fn ratio(&self) -> f64 {
        if self.before_bytes == 0 {
            1.0
        } else {
            self.after_bytes as f64 / self.before_bytes as f64
        }
    }

    pub fn bytes_saved(&self) -> u64 {
        self.before_bytes.saturating_sub(self.after_bytes)
    }
}

/// One file that failed to recompress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionFailure {
    pub input: PathBuf,
    pub error: String,
}

/// Aggregate of a recompression run over many files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompressionSummary {
    pub compressed: Vec<CompressionStats>,
    /// Inputs whose compressed counterpart already existed.
    pub skipped: Vec<PathBuf>,
    pub failures: Vec<CompressionFailure>,
    /// Whether the parallel batch path was taken.
    pub parallel: bool,
    pub workers: usize,
    pub elapsed_ms: u64,
}

impl CompressionSummary {
    /// Mean of per-file `after / before` ratios; `None` if nothing was compressed.
    pub fn mean_ratio(&self) -> Option<f64> {
        if self.compressed.is_empty() {
            return None;
        }
        let sum: f64 = self.compressed.iter().map(CompressionStats::ratio).sum();
        Some(sum / self.compressed.len() as f64)
    }

    pub fn total_bytes_saved(&self) -> u64 {
        self.compressed.iter().map(CompressionStats::bytes_saved).sum()
    }

    pub fn total_input_bytes(&self) -> u64 {
        self.compressed.iter().map(|s| s.before_bytes).sum()
    }

    /// Input megabytes processed per wall-clock second.
    pub fn throughput_mb_per_sec(&self) -> f64 {
        if self.elapsed_ms == 0 {
            return 0.0;
        }
        let mb = self.total_input_bytes() as f64 / (1024.0 * 1024.0);
        mb / (self.elapsed_ms as f64 / 1000.0)
    }

    /// Files compressed per wall-clock minute.
    pub fn files_per_minute(&self) -> f64 {
        if self.elapsed_ms == 0 {
            return 0.0;
        }
        self.compressed.len() as f64 / (self.elapsed_ms as f64 / 60_000.0)
    }
}

/// Final report of a batch run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchSummary {
    pub outcomes: Vec<ArchiveOutcome>,
    /// Post-run sweep over OCR outputs lacking a compressed counterpart.
    pub compression: Option<CompressionSummary>,
    pub duration_ms: u64,
}

impl BatchSummary {
    pub fn succeeded(&self) -> usize {
        self.count(|k| matches!(k, OutcomeKind::Completed))
    }

    pub fn skipped(&self) -> usize {
        self.count(|k| matches!(k, OutcomeKind::Skipped))
    }

    pub fn failed(&self) -> usize {
        self.count(|k| matches!(k, OutcomeKind::Failed(_)))
    }

    /// `(archive, error)` for every failed archive, in processing order.
    pub fn failures(&self) -> Vec<(&str, &str)> {
        self.outcomes
            .iter()
            .filter_map(|o| match &o.kind {
                OutcomeKind::Failed(msg) => Some((o.archive.as_str(), msg.as_str())),
                _ => None,
            })
            .collect()
    }

    /// Render units dropped across all archives.
    pub fn dropped_pages(&self) -> usize {
        self.outcomes.iter().map(|o| o.page_errors.len()).sum()
    }

    fn count(&self, pred: impl Fn(&OutcomeKind) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.kind)).count()
    }
}
