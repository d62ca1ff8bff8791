//! Recompression driver: searchable PDF → small PDF for machine readers.
//!
//! Images are downsampled and re-encoded as JPEG by an external
//! recompression service (Ghostscript in production); the text layer is
//! untouched. When the service can't beat the input size, the input is
//! copied verbatim so a compressed counterpart always exists afterwards.
//!
//! Batches of three or more files run in parallel, `workers` at a time, with
//! a barrier between batches. Smaller batches run one file at a time: the
//! service is itself multi-threaded and the parallel path only pays off once
//! there are enough files to keep every worker busy.

use crate::config::{compressed_counterpart, RecompressSettings};
use crate::error::PipelineError;
use crate::output::{CompressionFailure, CompressionStats, CompressionSummary};
use crate::progress::ProgressCallback;
use futures::future::join_all;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Pending files at which the parallel batch path is taken.
pub const PARALLEL_THRESHOLD: usize = 3;

/// An external recompression service.
pub trait Recompressor: Send + Sync {
    /// Write a recompressed copy of `input` to `output`.
    fn recompress(
        &self,
        input: &Path,
        output: &Path,
        settings: &RecompressSettings,
    ) -> impl Future<Output = Result<(), PipelineError>> + Send;
}

/// Ghostscript's `pdfwrite` device invoked as a subprocess.
#[derive(Debug, Clone)]
pub struct Ghostscript {
    pub program: PathBuf,
}

impl Default for Ghostscript {
    fn default() -> Self {
        Self {
            program: PathBuf::from("gs"),
        }
    }
}

impl Ghostscript {
    pub fn args(input: &Path, output: &Path, settings: &RecompressSettings) -> Vec<String> {
        let dpi = settings.resolution_dpi;
        let mut args: Vec<String> = [
            "-sDEVICE=pdfwrite",
            "-dCompatibilityLevel=1.5",
            "-dNOPAUSE",
            "-dBATCH",
            "-dQUIET",
            "-dSAFER",
            "-dDetectDuplicateImages=true",
            "-dDownsampleColorImages=true",
            "-dDownsampleGrayImages=true",
            "-dDownsampleMonoImages=true",
            "-dColorImageDownsampleType=/Bicubic",
            "-dGrayImageDownsampleType=/Bicubic",
            "-dAutoFilterColorImages=false",
            "-dAutoFilterGrayImages=false",
            "-dColorImageFilter=/DCTEncode",
            "-dGrayImageFilter=/DCTEncode",
        ]
        .map(String::from)
        .to_vec();
        args.push(format!("-dColorImageResolution={dpi}"));
        args.push(format!("-dGrayImageResolution={dpi}"));
        args.push(format!("-dMonoImageResolution={}", dpi * 2));
        args.push(format!("-dJPEGQ={}", settings.jpeg_quality));
        args.push(format!("-sOutputFile={}", output.display()));
        args.push(input.display().to_string());
        args
    }
}

impl Recompressor for Ghostscript {
    async fn recompress(
        &self,
        input: &Path,
        output: &Path,
        settings: &RecompressSettings,
    ) -> Result<(), PipelineError> {
        let args = Self::args(input, output, settings);
        debug!("Running {} {}", self.program.display(), args.join(" "));

        let out = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    PipelineError::ToolMissing {
                        tool: self.program.display().to_string(),
                        hint: "Install Ghostscript (e.g. `apt install ghostscript`).".into(),
                    }
                } else {
                    PipelineError::io(&self.program, e)
                }
            })?;

        if !out.status.success() {
            return Err(PipelineError::RecompressFailed {
                input: input.to_path_buf(),
                code: out.status.code(),
                detail: String::from_utf8_lossy(&out.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

/// Recompress one file to `output`, keeping whichever version is smaller.
pub async fn compress_one<R: Recompressor>(
    recompressor: &R,
    input: &Path,
    output: &Path,
    settings: &RecompressSettings,
) -> Result<CompressionStats, PipelineError> {
    let start = Instant::now();
    let before_bytes = tokio::fs::metadata(input)
        .await
        .map_err(|e| PipelineError::io(input, e))?
        .len();

    let tmp = output.with_extension("pdf.tmp");
    let result = recompressor.recompress(input, &tmp, settings).await;
    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }

    let produced = match tokio::fs::metadata(&tmp).await {
        Ok(m) => m.len(),
        Err(_) => {
            return Err(PipelineError::MissingOutput {
                stage: "llm".into(),
                path: output.to_path_buf(),
            })
        }
    };

    let after_bytes = if produced < before_bytes {
        tokio::fs::rename(&tmp, output)
            .await
            .map_err(|e| PipelineError::io(output, e))?;
        produced
    } else {
        debug!(
            "{} did not shrink ({} → {} bytes), keeping original",
            input.display(),
            before_bytes,
            produced
        );
        let _ = tokio::fs::remove_file(&tmp).await;
        tokio::fs::copy(input, output)
            .await
            .map_err(|e| PipelineError::io(output, e))?;
        before_bytes
    };

    Ok(CompressionStats {
        input: input.to_path_buf(),
        output: output.to_path_buf(),
        before_bytes,
        after_bytes,
        elapsed_ms: start.elapsed().as_millis() as u64,
    })
}

/// Recompress every input lacking a compressed counterpart.
///
/// A failing file is recorded and does not stop the others.
pub async fn compress_batch<R: Recompressor>(
    recompressor: &R,
    inputs: &[PathBuf],
    settings: &RecompressSettings,
    progress: &ProgressCallback,
) -> CompressionSummary {
    let start = Instant::now();
    let mut summary = CompressionSummary::default();

    let mut pending = Vec::new();
    for input in inputs {
        let output = compressed_counterpart(input);
        if tokio::fs::try_exists(&output).await.unwrap_or(false) {
            debug!("{} already compressed", input.display());
            summary.skipped.push(input.clone());
        } else {
            pending.push((input.clone(), output));
        }
    }
    if pending.is_empty() {
        return summary;
    }

    summary.parallel = pending.len() >= PARALLEL_THRESHOLD;
    summary.workers = if summary.parallel {
        settings.worker_count()
    } else {
        1
    };
    info!(
        "Compressing {} files ({}, {} worker{})",
        pending.len(),
        if summary.parallel { "parallel" } else { "sequential" },
        summary.workers,
        if summary.workers == 1 { "" } else { "s" }
    );

    for batch in pending.chunks(summary.workers) {
        let results = join_all(
            batch
                .iter()
                .map(|(input, output)| compress_one(recompressor, input, output, settings)),
        )
        .await;

        for ((input, _), result) in batch.iter().zip(results) {
            match result {
                Ok(stats) => {
                    info!(
                        "Compressed {}: {:.1} MB → {:.1} MB ({:.0}%)",
                        input.display(),
                        mb(stats.before_bytes),
                        mb(stats.after_bytes),
                        stats.ratio() * 100.0
                    );
                    progress.on_file_compressed(&stats);
                    summary.compressed.push(stats);
                }
                Err(e) => {
                    warn!("Compression of {} failed: {}", input.display(), e);
                    progress.on_compress_failed(input, &e.to_string());
                    summary.failures.push(CompressionFailure {
                        input: input.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    summary.elapsed_ms = start.elapsed().as_millis() as u64;
    if let Some(ratio) = summary.mean_ratio() {
        info!(
            "Compression done: {} files, mean ratio {:.0}%, {:.1} MB saved, {:.1} MB/s, {:.1} files/min",
            summary.compressed.len(),
            ratio * 100.0,
            mb(summary.total_bytes_saved()),
            summary.throughput_mb_per_sec(),
            summary.files_per_minute()
        );
    }
    summary
}

/// `*-ocr.pdf` files in `dir` without a compressed counterpart, sorted.
pub fn pending_ocr_outputs(dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut found: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| PipelineError::io(dir, e))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with("-ocr.pdf"))
        })
        .filter(|p| !compressed_counterpart(p).exists())
        .collect();
    found.sort();
    Ok(found)
}

fn mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}
