//! CLI binary for reader2pdf.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig`, checks the external tools and prints a batch summary.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use reader2pdf::pipeline::input::discover_archives;
use reader2pdf::{
    run_batch, ArchiveOutcome, BatchSummary, CompressionStats, ExternalTools, JobStore,
    JsonFileStore, OcrEvent, OcrPhase, OcrSettings, OutcomeKind, PipelineConfig,
    PipelineProgressCallback, ProgressCallback, RecompressSettings, Stage,
};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// One bar reused for every archive: a spinner while a stage has no known
/// length, a page counter while the render pool runs.
struct CliProgressCallback {
    bar: ProgressBar,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.enable_steady_tick(Duration::from_millis(80));
        let cb = Self { bar };
        cb.spinner("Preparing", "scanning input…");
        Arc::new(cb)
    }

    fn spinner(&self, prefix: &str, msg: &str) {
        let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  {elapsed:.dim}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        self.bar.set_style(style);
        self.bar.set_prefix(prefix.to_string());
        self.bar.set_message(msg.to_string());
    }

    fn counter(&self, prefix: &str, total: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>4}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);
        self.bar.set_style(style);
        self.bar.set_prefix(prefix.to_string());
        self.bar.set_length(total as u64);
        self.bar.set_position(0);
        self.bar.reset_eta();
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total_archives: usize) {
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("{total_archives} archives to process"))
        ));
    }

    fn on_archive_start(&self, archive: &str, index: usize, total: usize) {
        self.bar
            .println(format!("{} [{index}/{total}] {}", cyan("▸"), bold(archive)));
        self.spinner(archive, "starting…");
    }

    fn on_stage_start(&self, archive: &str, stage: Stage) {
        let msg = match stage {
            Stage::Pdf => "extracting pages…",
            Stage::Ocr => "running OCR…",
            Stage::Llm => "compressing…",
        };
        self.spinner(archive, msg);
    }

    fn on_stage_skipped(&self, _archive: &str, stage: Stage) {
        self.bar
            .println(format!("  {} {:<3}  {}", dim("·"), stage, dim("already done")));
    }

    fn on_stage_complete(&self, _archive: &str, stage: Stage, elapsed_ms: u64) {
        self.bar.println(format!(
            "  {} {:<3}  {}",
            green("✓"),
            stage,
            dim(&format!("{:.1}s", elapsed_ms as f64 / 1000.0))
        ));
    }

    fn on_render_start(&self, archive: &str, units: usize, workers: usize) {
        self.bar.println(format!(
            "  {} rendering {units} unique pages with {workers} workers",
            dim("·")
        ));
        self.counter(archive, units);
    }

    fn on_page_rendered(&self, _archive: &str, _ordinal: usize, _done: usize, _total: usize) {
        self.bar.inc(1);
    }

    fn on_page_failed(&self, _archive: &str, ordinal: usize, error: &str) {
        let msg = if error.len() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar
            .println(format!("  {} page {:>4}  {}", yellow("⚠"), ordinal, red(&msg)));
        self.bar.inc(1);
    }

    fn on_ocr_event(&self, archive: &str, event: &OcrEvent) {
        match event {
            OcrEvent::Processing => self.spinner(archive, "OCR: recognising pages…"),
            OcrEvent::PageProgress { pages_seen } => {
                self.bar.set_message(format!("OCR: {pages_seen} pages seen"));
            }
            OcrEvent::Finalizing => self.spinner(archive, "OCR: finalizing output…"),
            OcrEvent::Heartbeat {
                phase,
                elapsed_secs,
                pages_seen,
            } => {
                let what = match phase {
                    OcrPhase::Idle => "starting".to_string(),
                    OcrPhase::Processing => format!("{pages_seen} pages seen"),
                    OcrPhase::Finalizing => "finalizing".to_string(),
                };
                self.bar
                    .set_message(format!("OCR: {what}, still working after {elapsed_secs}s"));
            }
        }
    }

    fn on_file_compressed(&self, stats: &CompressionStats) {
        self.bar.println(format!(
            "  {} {}  {} → {}  {}",
            green("✓"),
            stats.output.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
            human_bytes(stats.before_bytes),
            human_bytes(stats.after_bytes),
            dim(&format!("{:.0}%", stats.ratio() * 100.0))
        ));
    }

    fn on_compress_failed(&self, input: &Path, error: &str) {
        self.bar
            .println(format!("  {} {}  {}", red("✗"), input.display(), red(error)));
    }

    fn on_archive_complete(&self, outcome: &ArchiveOutcome) {
        let line = match &outcome.kind {
            OutcomeKind::Completed => format!(
                "  {} {}  {}",
                green("✔"),
                outcome.archive,
                dim(&format!(
                    "{:.1}s{}",
                    outcome.duration_ms as f64 / 1000.0,
                    if outcome.page_errors.is_empty() {
                        String::new()
                    } else {
                        format!(", {} pages dropped", outcome.page_errors.len())
                    }
                ))
            ),
            OutcomeKind::Skipped => format!("  {} {}  {}", dim("↷"), outcome.archive, dim("up to date")),
            OutcomeKind::Failed(msg) => format!("  {} {}  {}", red("✘"), outcome.archive, red(msg)),
        };
        self.bar.println(line);
        self.spinner("Waiting", "");
    }

    fn on_batch_complete(&self, _summary: &BatchSummary) {
        self.bar.finish_and_clear();
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert every archive in ./input into ./output
  reader2pdf

  # Custom directories, also produce compressed copies for machine readers
  reader2pdf -i ~/scrapes -o ~/books --compress

  # Quick OCR check on the first 10 pages only
  reader2pdf --ocr-pages 10

  # Show the job records and exit
  reader2pdf --status

OUTPUT (per archive <name>.zip):
  <name>.pdf       merged page PDF
  <name>-ocr.pdf   searchable PDF
  <name>-llm.pdf   compressed searchable PDF (with --compress)

  Progress is kept in <output>/progress.json. Re-running resumes: stages whose
  output exists are skipped. Delete an output file to force its stage again.

REQUIRED TOOLS:
  chromium / google-chrome   page rendering   (--browser to point at one)
  ocrmypdf                   OCR              (pip install ocrmypdf)
  gs                         recompression    (only with --compress)
"#;

/// Convert e-reader page archives into searchable PDFs.
#[derive(Parser, Debug)]
#[command(
    name = "reader2pdf",
    version,
    about = "Convert e-reader page archives (zip of HTML pages) into searchable PDFs",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Directory scanned for *.zip page archives.
    #[arg(short, long, env = "READER2PDF_INPUT", default_value = "input")]
    input: PathBuf,

    /// Directory receiving the PDFs.
    #[arg(short, long, env = "READER2PDF_OUTPUT", default_value = "output")]
    output: PathBuf,

    /// Job record file. Default: <output>/progress.json.
    #[arg(long, env = "READER2PDF_PROGRESS_FILE")]
    progress_file: Option<PathBuf>,

    /// Also produce <name>-llm.pdf and compress any OCR output lacking one.
    #[arg(long, env = "READER2PDF_COMPRESS")]
    compress: bool,

    /// Print the job records and exit.
    #[arg(long)]
    status: bool,

    /// Render workers (default: CPUs minus one).
    #[arg(short, long, env = "READER2PDF_WORKERS")]
    workers: Option<usize>,

    /// Page PDFs loaded per merge chunk.
    #[arg(long, env = "READER2PDF_MERGE_CHUNK", default_value_t = 100)]
    merge_chunk: usize,

    /// OCR jobs (default: CPUs).
    #[arg(long, env = "READER2PDF_OCR_JOBS")]
    ocr_jobs: Option<usize>,

    /// Per-page OCR timeout in seconds.
    #[arg(long, env = "READER2PDF_OCR_TIMEOUT", default_value_t = 180)]
    ocr_timeout: u64,

    /// Only OCR the first N pages.
    #[arg(long, env = "READER2PDF_OCR_PAGES")]
    ocr_pages: Option<usize>,

    /// OCR language(s), e.g. eng or eng+deu.
    #[arg(short, long, env = "READER2PDF_LANGUAGE", default_value = "eng")]
    language: String,

    /// Seconds of OCR silence before a heartbeat is logged.
    #[arg(long, env = "READER2PDF_HEARTBEAT", default_value_t = 30,
          value_parser = clap::value_parser!(u64).range(1..))]
    heartbeat: u64,

    /// Image resolution of the compressed PDF.
    #[arg(long, env = "READER2PDF_COMPRESS_DPI", default_value_t = 100,
          value_parser = clap::value_parser!(u32).range(36..=600))]
    compress_dpi: u32,

    /// JPEG quality of the compressed PDF (1–100).
    #[arg(long, env = "READER2PDF_COMPRESS_QUALITY", default_value_t = 50,
          value_parser = clap::value_parser!(u8).range(1..=100))]
    compress_quality: u8,

    /// Parallel recompression jobs (default: CPUs minus two).
    #[arg(long, env = "READER2PDF_COMPRESS_WORKERS")]
    compress_workers: Option<usize>,

    /// Browser binary used for rendering.
    #[arg(long, env = "READER2PDF_BROWSER")]
    browser: Option<PathBuf>,

    /// ocrmypdf binary.
    #[arg(long, env = "READER2PDF_OCRMYPDF", default_value = "ocrmypdf")]
    ocrmypdf: PathBuf,

    /// Ghostscript binary.
    #[arg(long, env = "READER2PDF_GS", default_value = "gs")]
    gs: PathBuf,

    /// Print the batch summary as JSON on stdout.
    #[arg(long, env = "READER2PDF_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "READER2PDF_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "READER2PDF_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "READER2PDF_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs; --verbose brings them all back.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !cli.status;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let progress_cb: Option<ProgressCallback> = if show_progress && !cli.verbose {
        Some(CliProgressCallback::new() as Arc<dyn PipelineProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb)?;

    // ── Status mode ──────────────────────────────────────────────────────
    if cli.status {
        let store = JsonFileStore::open(config.progress_path())
            .context("Failed to read progress file")?;
        print_status(&store);
        return Ok(());
    }

    // ── Nothing to do ────────────────────────────────────────────────────
    let archives = discover_archives(&config.input_dir).context("Failed to scan input")?;
    if archives.is_empty() {
        if !cli.quiet {
            eprintln!(
                "No .zip archives found in {}.\n\
                 Export pages from the reader as a zip of HTML page documents \
                 and drop it there, then run reader2pdf again.",
                bold(&config.input_dir.display().to_string())
            );
        }
        return Ok(());
    }

    // ── Run batch ────────────────────────────────────────────────────────
    let tools = ExternalTools {
        browser: cli.browser.clone(),
        ocrmypdf: cli.ocrmypdf.clone(),
        ghostscript: cli.gs.clone(),
    };
    let summary = run_batch(config, &tools)
        .await
        .context("Batch conversion failed")?;

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("Failed to serialise summary")?
        );
    } else if !cli.quiet {
        print_summary(&summary);
    }

    Ok(())
}

/// Map CLI args to `PipelineConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PipelineConfig> {
    let ocr = OcrSettings {
        page_timeout_secs: cli.ocr_timeout,
        max_pages: cli.ocr_pages,
        language: cli.language.clone(),
        heartbeat_secs: cli.heartbeat,
        ..OcrSettings::default()
    };
    let ocr = match cli.ocr_jobs {
        Some(jobs) => OcrSettings { jobs, ..ocr },
        None => ocr,
    };

    let mut builder = PipelineConfig::builder()
        .input_dir(&cli.input)
        .output_dir(&cli.output)
        .compress(cli.compress)
        .merge_chunk_size(cli.merge_chunk)
        .ocr(ocr)
        .recompress(RecompressSettings {
            resolution_dpi: cli.compress_dpi,
            jpeg_quality: cli.compress_quality,
            workers: cli.compress_workers,
        });

    if let Some(path) = &cli.progress_file {
        builder = builder.progress_file(path);
    }
    if let Some(n) = cli.workers {
        builder = builder.render_workers(n);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

fn print_status(store: &JsonFileStore) {
    let records = store.records();
    if records.is_empty() {
        println!("No job records in {}", store.path().display());
        return;
    }
    let flag = |done: bool| if done { green("✓") } else { dim("·") };
    println!(
        "{:<32} {:<11} {:^3} {:^3} {:^3}  {}",
        "ARCHIVE", "STATUS", "PDF", "OCR", "LLM", "UPDATED"
    );
    for r in &records {
        let updated = r
            .updated_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!(
            "{:<32} {:<11}  {}   {}   {}   {}",
            r.archive,
            r.status.to_string(),
            flag(r.pdf),
            flag(r.ocr),
            flag(r.llm),
            dim(&updated)
        );
        if let Some(err) = &r.error {
            println!("    {}", red(err));
        }
    }
}

fn print_summary(summary: &BatchSummary) {
    eprintln!(
        "{}  {} completed  {} skipped  {} failed  {}",
        if summary.failed() == 0 {
            green("✔")
        } else {
            yellow("⚠")
        },
        summary.succeeded(),
        summary.skipped(),
        summary.failed(),
        dim(&format!("{:.1}s", summary.duration_ms as f64 / 1000.0)),
    );
    let dropped = summary.dropped_pages();
    if dropped > 0 {
        eprintln!("   {} pages could not be rendered and were left out", yellow(&dropped.to_string()));
    }
    if let Some(c) = &summary.compression {
        if let Some(ratio) = c.mean_ratio() {
            eprintln!(
                "   compressed {} files{}: mean {:.0}%, {} saved, {:.1} MB/s, {:.1} files/min",
                c.compressed.len(),
                if c.parallel {
                    format!(" ({} workers)", c.workers)
                } else {
                    String::new()
                },
                ratio * 100.0,
                human_bytes(c.total_bytes_saved()),
                c.throughput_mb_per_sec(),
                c.files_per_minute()
            );
        }
        for f in &c.failures {
            eprintln!("   {} {}: {}", red("✗"), f.input.display(), f.error);
        }
    }
    let failures = summary.failures();
    if !failures.is_empty() {
        eprintln!("\n{}", bold("Failed archives:"));
        for (archive, error) in failures {
            eprintln!("  {} {}: {}", red("✘"), archive, error);
        }
    }
}

fn human_bytes(bytes: u64) -> String {
    const MB: f64 = 1024.0 * 1024.0;
    if bytes as f64 >= MB {
        format!("{:.1} MB", bytes as f64 / MB)
    } else {
        format!("{:.0} KB", bytes as f64 / 1024.0)
    }
}
