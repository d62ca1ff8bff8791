//! Job records: persisted per-archive progress.
//!
//! The orchestrator owns exactly one [`JobStore`]. It is loaded once at
//! start-up and saved after every mutation, so a crash leaves a record that
//! shows the archive as `processing` and the next run picks it up again.
//!
//! [`JsonFileStore`] is the production store: one JSON object mapping the
//! archive file name to its [`JobRecord`], rewritten whole through a temp
//! file + rename. [`MemoryStore`] keeps everything in memory for tests and
//! dry runs.

use crate::error::PipelineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One pipeline phase with its own completion flag and output artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Dedup → render → merge; output `<name>.pdf`.
    Pdf,
    /// OCR; output `<name>-ocr.pdf`.
    Ocr,
    /// Recompression for machine readers; output `<name>-llm.pdf`.
    Llm,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Pdf, Stage::Ocr, Stage::Llm];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Pdf => "pdf",
            Stage::Ocr => "ocr",
            Stage::Llm => "llm",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall state of an archive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        })
    }
}

/// Persisted progress of one archive.
///
/// A stage flag is only ever set after the stage's output was confirmed on
/// disk; see [`crate::orchestrator`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    #[serde(default)]
    pub archive: String,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub pdf: bool,
    #[serde(default)]
    pub ocr: bool,
    #[serde(default)]
    pub llm: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobRecord {
    pub fn new(archive: impl Into<String>) -> Self {
        Self {
            archive: archive.into(),
            ..Default::default()
        }
    }

    pub fn is_done(&self, stage: Stage) -> bool {
        match stage {
            Stage::Pdf => self.pdf,
            Stage::Ocr => self.ocr,
            Stage::Llm => self.llm,
        }
    }

    pub fn completed_at(&self, stage: Stage) -> Option<DateTime<Utc>> {
        match stage {
            Stage::Pdf => self.pdf_completed_at,
            Stage::Ocr => self.ocr_completed_at,
            Stage::Llm => self.llm_completed_at,
        }
    }

    /// Set the stage flag and its timestamp.
    pub fn mark_done(&mut self, stage: Stage) {
        let now = Some(Utc::now());
        match stage {
            Stage::Pdf => (self.pdf, self.pdf_completed_at) = (true, now),
            Stage::Ocr => (self.ocr, self.ocr_completed_at) = (true, now),
            Stage::Llm => (self.llm, self.llm_completed_at) = (true, now),
        }
        self.updated_at = now;
    }

    /// Clear a flag whose output has gone missing.
    pub fn clear(&mut self, stage: Stage) {
        match stage {
            Stage::Pdf => (self.pdf, self.pdf_completed_at) = (false, None),
            Stage::Ocr => (self.ocr, self.ocr_completed_at) = (false, None),
            Stage::Llm => (self.llm, self.llm_completed_at) = (false, None),
        }
        self.updated_at = Some(Utc::now());
    }

    pub fn start(&mut self) {
        let now = Some(Utc::now());
        self.status = JobStatus::Processing;
        self.error = None;
        self.started_at = now;
        self.updated_at = now;
    }

    pub fn complete(&mut self) {
        self.status = JobStatus::Completed;
        self.error = None;
        self.updated_at = Some(Utc::now());
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error = Some(message.into());
        self.updated_at = Some(Utc::now());
    }
}

/// Persistence interface for job records.
pub trait JobStore: Send {
    /// Read persisted records, replacing whatever is held in memory.
    fn load(&mut self) -> Result<(), PipelineError>;

    fn get(&self, archive: &str) -> Option<JobRecord>;

    /// Replace the in-memory record (does not persist).
    fn set(&mut self, record: JobRecord);

    /// Persist every record.
    fn save(&mut self) -> Result<(), PipelineError>;

    /// All records, ordered by archive name.
    fn records(&self) -> Vec<JobRecord>;

    /// Get-or-create, mutate, and persist in one step.
    fn update<F>(&mut self, archive: &str, f: F) -> Result<JobRecord, PipelineError>
    where
        F: FnOnce(&mut JobRecord),
        Self: Sized,
    {
        let mut record = self.get(archive).unwrap_or_else(|| JobRecord::new(archive));
        f(&mut record);
        self.set(record.clone());
        self.save()?;
        Ok(record)
    }
}

// ── JSON file store ──────────────────────────────────────────────────────

/// Job records in a single JSON file, rewritten atomically on every save.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    records: BTreeMap<String, JobRecord>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: BTreeMap::new(),
        }
    }

    /// Create and immediately load.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let mut store = Self::new(path);
        store.load()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl JobStore for JsonFileStore {
    fn load(&mut self) -> Result<(), PipelineError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No progress file at {}, starting fresh", self.path.display());
                self.records.clear();
                return Ok(());
            }
            Err(e) => return Err(PipelineError::io(&self.path, e)),
        };

        if raw.trim().is_empty() {
            warn!("Progress file {} is empty, starting fresh", self.path.display());
            self.records.clear();
            return Ok(());
        }

        let mut records: BTreeMap<String, JobRecord> =
            serde_json::from_str(&raw).map_err(|e| PipelineError::StoreCorrupt {
                path: self.path.clone(),
                detail: e.to_string(),
            })?;
        // Keys are authoritative; older files may lack the inner name.
        for (name, record) in records.iter_mut() {
            if record.archive.is_empty() {
                record.archive = name.clone();
            }
        }
        debug!("Loaded {} job records from {}", records.len(), self.path.display());
        self.records = records;
        Ok(())
    }

    fn get(&self, archive: &str) -> Option<JobRecord> {
        self.records.get(archive).cloned()
    }

    fn set(&mut self, record: JobRecord) {
        self.records.insert(record.archive.clone(), record);
    }

    fn save(&mut self) -> Result<(), PipelineError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }
        let json = serde_json::to_string_pretty(&self.records)
            .map_err(|e| PipelineError::Internal(format!("serialise job records: {e}")))?;

        // Atomic write: write to temp, then rename
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json).map_err(|e| PipelineError::io(&tmp_path, e))?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| PipelineError::io(&self.path, e))?;
        Ok(())
    }

    fn records(&self) -> Vec<JobRecord> {
        self.records.values().cloned().collect()
    }
}

// ── In-memory store ──────────────────────────────────────────────────────

/// Job records kept in memory; counts saves so callers can check the
/// save-after-every-mutation contract.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    records: BTreeMap<String, JobRecord>,
    saves: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seeded store, as if loaded from disk.
    pub fn with_records(records: impl IntoIterator<Item = JobRecord>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|r| (r.archive.clone(), r))
                .collect(),
            saves: 0,
        }
    }

    pub fn save_count(&self) -> usize {
        self.saves
    }
}

impl JobStore for MemoryStore {
    fn load(&mut self) -> Result<(), PipelineError> {
        Ok(())
    }

    fn get(&self, archive: &str) -> Option<JobRecord> {
        self.records.get(archive).cloned()
    }

    fn set(&mut self, record: JobRecord) {
        self.records.insert(record.archive.clone(), record);
    }

    fn save(&mut self) -> Result<(), PipelineError> {
        self.saves += 1;
        Ok(())
    }

    fn records(&self) -> Vec<JobRecord> {
        self.records.values().cloned().collect()
    }
}
