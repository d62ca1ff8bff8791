//! Job orchestrator: drives every archive through the stages and keeps the
//! job records current.
//!
//! ## Why per-stage flags?
//!
//! A book of 600 pages takes minutes to render and much longer to OCR. A
//! crash or Ctrl-C half-way through a batch must not throw that work away,
//! so each archive's record carries one flag per stage (`pdf`, `ocr`, `llm`),
//! set only after the stage's output is confirmed on disk and persisted
//! immediately. A re-run skips a stage only when its flag is set *and* its
//! output still exists; a flag whose file has vanished is cleared and the
//! stage runs again.
//!
//! Archives are processed one at a time in name order. A failing archive is
//! marked `failed` and the batch moves on; only a broken progress store
//! aborts the run.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::output::{ArchiveOutcome, BatchSummary, CompressionSummary, OutcomeKind};
use crate::pipeline::chrome::ChromeRendererFactory;
use crate::pipeline::dedup::deduplicate;
use crate::pipeline::input::{
    archive_base_name, archive_key, discover_archives, extract_archive, ArchiveWorkspace,
};
use crate::pipeline::merge::merge_artifacts;
use crate::pipeline::ocr::{run_ocr, OcrMyPdf, OcrService};
use crate::pipeline::recompress::{
    compress_batch, compress_one, pending_ocr_outputs, Ghostscript, Recompressor,
};
use crate::pipeline::render::{render_units, RenderOptions, RendererFactory};
use crate::pipeline::tools::{preflight, ExternalTools};
use crate::progress::{self, ProgressCallback};
use crate::store::{JobRecord, JobStore, JobStatus, JsonFileStore, Stage};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Runs a batch with injected store and external capabilities.
pub struct Orchestrator<S, F, O, R> {
    config: PipelineConfig,
    store: S,
    renderer: Arc<F>,
    ocr: O,
    recompressor: R,
    progress: ProgressCallback,
}

impl<S, F, O, R> Orchestrator<S, F, O, R>
where
    S: JobStore,
    F: RendererFactory,
    O: OcrService,
    R: Recompressor,
{
    pub fn new(config: PipelineConfig, store: S, renderer: F, ocr: O, recompressor: R) -> Self {
        let progress = progress::resolve(&config.progress_callback);
        Self {
            config,
            store,
            renderer: Arc::new(renderer),
            ocr,
            recompressor,
            progress,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Process every archive in the input directory, then run the
    /// compression sweep when recompression is enabled.
    pub async fn run(&mut self) -> Result<BatchSummary, PipelineError> {
        let start = Instant::now();
        self.store.load()?;

        let archives = discover_archives(&self.config.input_dir)?;
        tokio::fs::create_dir_all(&self.config.output_dir)
            .await
            .map_err(|e| PipelineError::io(&self.config.output_dir, e))?;

        let total = archives.len();
        info!(
            "Found {} archives in {}",
            total,
            self.config.input_dir.display()
        );
        self.progress.on_batch_start(total);

        let mut summary = BatchSummary::default();
        let mut seen = HashSet::new();
        for (i, archive) in archives.iter().enumerate() {
            let outcome = self.process_archive(archive, i + 1, total).await?;
            self.progress.on_archive_complete(&outcome);
            summary.outcomes.push(outcome);
            seen.insert(archive_base_name(archive));
        }

        if self.config.compress {
            summary.compression = Some(self.sweep(&seen).await?);
        }

        summary.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Batch done: {} completed, {} skipped, {} failed in {:.1}s",
            summary.succeeded(),
            summary.skipped(),
            summary.failed(),
            summary.duration_ms as f64 / 1000.0
        );
        self.progress.on_batch_complete(&summary);
        Ok(summary)
    }

    /// Drive one archive to `completed` or `failed`.
    ///
    /// `Err` is reserved for failures of the progress store itself.
    pub async fn process_archive(
        &mut self,
        archive: &Path,
        index: usize,
        total: usize,
    ) -> Result<ArchiveOutcome, PipelineError> {
        let start = Instant::now();
        let key = archive_key(archive);
        let name = archive_base_name(archive);

        let mut record = self.store.get(&key).unwrap_or_else(|| JobRecord::new(&key));
        for stage in Stage::ALL {
            if record.is_done(stage) && !self.stage_output(stage, &name).exists() {
                warn!(
                    "{}: {} flag set but {} is missing, re-running",
                    key,
                    stage,
                    self.stage_output(stage, &name).display()
                );
                record.clear(stage);
            }
        }

        if self.required_stages().all(|s| record.is_done(s)) {
            info!("{}: all outputs present, skipping", key);
            if record.status != JobStatus::Completed {
                record.complete();
            }
            self.store.set(record);
            self.store.save()?;
            let mut outcome = ArchiveOutcome::new(&key, OutcomeKind::Skipped);
            outcome.duration_ms = start.elapsed().as_millis() as u64;
            return Ok(outcome);
        }

        record.start();
        self.store.set(record);
        self.store.save()?;
        info!("[{}/{}] Processing {}", index, total, key);
        self.progress.on_archive_start(&key, index, total);

        let mut outcome = ArchiveOutcome::new(&key, OutcomeKind::Completed);
        match self.run_stages(archive, &key, &name, &mut outcome).await {
            Ok(()) => {
                self.store.update(&key, |r| r.complete())?;
                info!("{}: completed", key);
            }
            Err(e) => {
                let message = e.to_string();
                error!("{}: failed: {}", key, message);
                self.store.update(&key, |r| r.fail(message.clone()))?;
                outcome.kind = OutcomeKind::Failed(message);
            }
        }
        outcome.duration_ms = start.elapsed().as_millis() as u64;
        Ok(outcome)
    }

    async fn run_stages(
        &mut self,
        archive: &Path,
        key: &str,
        name: &str,
        outcome: &mut ArchiveOutcome,
    ) -> Result<(), PipelineError> {
        let pdf = self.config.pdf_path(name);
        let ocr = self.config.ocr_path(name);
        let llm = self.config.llm_path(name);

        // ── pdf: extract → dedup → render → merge ──────────────────────────
        if self.is_done(key, Stage::Pdf) {
            self.skip(key, Stage::Pdf);
        } else {
            let t = self.begin(key, Stage::Pdf);
            let workspace = ArchiveWorkspace::create(key)?;
            let built = self.build_pdf(archive, key, &workspace, &pdf, outcome).await;
            if let Err(e) = workspace.close() {
                warn!("{}: could not remove workspace: {}", key, e);
            }
            built?;
            self.finish(key, Stage::Pdf, &pdf, t)?;
        }

        // ── ocr ────────────────────────────────────────────────────────────
        if self.is_done(key, Stage::Ocr) {
            self.skip(key, Stage::Ocr);
        } else {
            let t = self.begin(key, Stage::Ocr);
            let report =
                run_ocr(&self.ocr, &pdf, &ocr, &self.config.ocr, key, &self.progress).await?;
            outcome.ocr_pages_seen = report.pages_seen;
            outcome.ocr_heartbeats = report.heartbeats;
            self.finish(key, Stage::Ocr, &ocr, t)?;
        }

        // ── llm: optional recompression ────────────────────────────────────
        if !self.config.compress {
            return Ok(());
        }
        if self.is_done(key, Stage::Llm) {
            self.skip(key, Stage::Llm);
        } else {
            let t = self.begin(key, Stage::Llm);
            let stats =
                compress_one(&self.recompressor, &ocr, &llm, &self.config.recompress).await?;
            info!(
                "{}: compressed to {:.0}% of the OCR output",
                key,
                stats.ratio() * 100.0
            );
            self.progress.on_file_compressed(&stats);
            self.finish(key, Stage::Llm, &llm, t)?;
        }
        Ok(())
    }

    async fn build_pdf(
        &self,
        archive: &Path,
        key: &str,
        workspace: &ArchiveWorkspace,
        pdf: &Path,
        outcome: &mut ArchiveOutcome,
    ) -> Result<(), PipelineError> {
        let documents = extract_archive(archive, workspace).await?;
        outcome.pages_total = documents.len();

        let dedup = deduplicate(documents);
        outcome.unique_pages = dedup.units.len();
        outcome.duplicates = dedup.duplicates.len();
        info!(
            "{}: {} pages, {} unique, {} duplicates",
            key,
            outcome.pages_total,
            outcome.unique_pages,
            outcome.duplicates
        );

        let options = RenderOptions {
            archive: key.to_string(),
            workers: self.config.render_worker_count(dedup.units.len()),
            page_width_in: self.config.page_width_in,
            default_aspect_ratio: self.config.default_aspect_ratio,
            pages_dir: workspace.pages_dir(),
        };
        let report = render_units(
            Arc::clone(&self.renderer),
            dedup.units,
            options,
            Arc::clone(&self.progress),
        )
        .await?;
        if !report.errors.is_empty() {
            warn!(
                "{}: {} pages could not be rendered and are left out",
                key,
                report.errors.len()
            );
        }
        outcome.page_errors = report.errors;

        merge_artifacts(report.artifacts, pdf, self.config.merge_chunk_size).await?;
        Ok(())
    }

    /// Compress every OCR output lacking a compressed counterpart and flag
    /// the records of the archives they belong to.
    ///
    /// Outputs of archives already handled by this run's loop are left
    /// alone: a failed `llm` stage stays failed until the next run.
    async fn sweep(&mut self, seen: &HashSet<String>) -> Result<CompressionSummary, PipelineError> {
        let pending: Vec<PathBuf> = pending_ocr_outputs(&self.config.output_dir)?
            .into_iter()
            .filter(|p| ocr_base_name(p).map_or(true, |name| !seen.contains(&name)))
            .collect();
        if pending.is_empty() {
            debug!("Compression sweep: nothing pending");
            return Ok(CompressionSummary::default());
        }
        info!("Compression sweep: {} files pending", pending.len());

        let summary = compress_batch(
            &self.recompressor,
            &pending,
            &self.config.recompress,
            &self.progress,
        )
        .await;

        let records = self.store.records();
        for stats in &summary.compressed {
            let Some(name) = ocr_base_name(&stats.input) else {
                continue;
            };
            let known = records
                .iter()
                .find(|r| archive_base_name(Path::new(&r.archive)) == name);
            if let Some(record) = known {
                self.store.update(&record.archive, |r| r.mark_done(Stage::Llm))?;
            }
        }
        Ok(summary)
    }

    // ── helpers ──────────────────────────────────────────────────────────

    fn required_stages(&self) -> impl Iterator<Item = Stage> {
        let compress = self.config.compress;
        Stage::ALL
            .into_iter()
            .filter(move |s| compress || *s != Stage::Llm)
    }

    fn stage_output(&self, stage: Stage, name: &str) -> PathBuf {
        match stage {
            Stage::Pdf => self.config.pdf_path(name),
            Stage::Ocr => self.config.ocr_path(name),
            Stage::Llm => self.config.llm_path(name),
        }
    }

    fn is_done(&self, key: &str, stage: Stage) -> bool {
        self.store.get(key).is_some_and(|r| r.is_done(stage))
    }

    fn skip(&self, key: &str, stage: Stage) {
        info!("{}: {} stage already done", key, stage);
        self.progress.on_stage_skipped(key, stage);
    }

    fn begin(&self, key: &str, stage: Stage) -> Instant {
        info!("{}: {} stage", key, stage);
        self.progress.on_stage_start(key, stage);
        Instant::now()
    }

    /// Confirm the output, set the flag and invalidate later stages.
    fn finish(
        &mut self,
        key: &str,
        stage: Stage,
        output: &Path,
        started: Instant,
    ) -> Result<(), PipelineError> {
        if !output.exists() {
            return Err(PipelineError::MissingOutput {
                stage: stage.to_string(),
                path: output.to_path_buf(),
            });
        }
        self.store.update(key, |r| {
            r.mark_done(stage);
            for later in Stage::ALL.into_iter().filter(|s| *s > stage) {
                r.clear(later);
            }
        })?;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        debug!("{}: {} stage took {}ms", key, stage, elapsed_ms);
        self.progress.on_stage_complete(key, stage, elapsed_ms);
        Ok(())
    }
}

/// `out/bookA-ocr.pdf` → `bookA`.
fn ocr_base_name(path: &Path) -> Option<String> {
    let file = path.file_name()?.to_str()?;
    file.strip_suffix("-ocr.pdf").map(str::to_string)
}

/// The production pipeline: headless Chromium, `ocrmypdf`, Ghostscript and
/// a JSON progress file.
pub type ProductionOrchestrator =
    Orchestrator<JsonFileStore, ChromeRendererFactory, OcrMyPdf, Ghostscript>;

impl ProductionOrchestrator {
    /// Check the external tools, then wire up the production components.
    pub async fn production(
        config: PipelineConfig,
        tools: &ExternalTools,
    ) -> Result<Self, PipelineError> {
        let report = preflight(tools, config.compress).await?;
        let store = JsonFileStore::new(config.progress_path());
        let renderer = ChromeRendererFactory::new(Some(report.browser));
        let ocr = OcrMyPdf {
            program: tools.ocrmypdf.clone(),
        };
        let gs = Ghostscript {
            program: tools.ghostscript.clone(),
        };
        Ok(Orchestrator::new(config, store, renderer, ocr, gs))
    }
}

/// Check preconditions and run a whole batch with the production pipeline.
pub async fn run_batch(
    config: PipelineConfig,
    tools: &ExternalTools,
) -> Result<BatchSummary, PipelineError> {
    let mut orchestrator = ProductionOrchestrator::production(config, tools).await?;
    orchestrator.run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ocr_names_map_back_to_archives() {
        assert_eq!(ocr_base_name(Path::new("out/bookA-ocr.pdf")), Some("bookA".into()));
        assert_eq!(ocr_base_name(Path::new("out/bookA.pdf")), None);
    }
}
