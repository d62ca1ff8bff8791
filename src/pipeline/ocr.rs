//! OCR driver: merged PDF → searchable PDF.
//!
//! The heavy lifting is done by an external OCR service (`ocrmypdf` in
//! production). This module runs it, turns its diagnostic stream into phase
//! and page-progress events, and emits a heartbeat whenever the service has
//! been silent for `heartbeat_secs`. Large books spend minutes in the final
//! optimisation pass without printing a thing; the heartbeat is what tells an
//! operator the run is still alive.
//!
//! The service only sees a line sink. Phase tracking and heartbeats live here,
//! so any service that writes diagnostics line by line gets them for free.

use crate::config::OcrSettings;
use crate::error::PipelineError;
use crate::progress::ProgressCallback;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

// ── Phases & events ──────────────────────────────────────────────────────

/// Coarse position of an OCR run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OcrPhase {
    /// No page has been reported yet.
    Idle,
    /// Pages are being recognised.
    Processing,
    /// Recognition is over; the service is assembling/optimising the output.
    Finalizing,
}

impl fmt::Display for OcrPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OcrPhase::Idle => "idle",
            OcrPhase::Processing => "processing",
            OcrPhase::Finalizing => "finalizing",
        })
    }
}

/// Something worth telling an observer about an OCR run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OcrEvent {
    /// First page reported.
    Processing,
    /// A page number not seen before was reported.
    PageProgress { pages_seen: usize },
    /// The service moved on to post-processing.
    Finalizing,
    /// No diagnostic output for one heartbeat interval.
    Heartbeat {
        phase: OcrPhase,
        elapsed_secs: u64,
        pages_seen: usize,
    },
}

static PAGE_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\d+)\s+\S").expect("static regex"));

const FINALIZING_MARKERS: [&str; 6] = [
    "postprocessing",
    "merging",
    "linearizing",
    "optimize",
    "image optimization",
    "output file",
];

/// Consumes diagnostic lines and tracks the phase of a run.
///
/// Phases only move forward: once finalizing, stray page lines are ignored.
#[derive(Debug)]
pub struct OcrPhaseTracker {
    phase: OcrPhase,
    pages: BTreeSet<usize>,
}

impl Default for OcrPhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl OcrPhaseTracker {
    pub fn new() -> Self {
        Self {
            phase: OcrPhase::Idle,
            pages: BTreeSet::new(),
        }
    }

    pub fn phase(&self) -> OcrPhase {
        self.phase
    }

    /// Distinct page numbers reported so far.
    pub fn pages_seen(&self) -> usize {
        self.pages.len()
    }

    /// Feed one line; returns the events it triggered, in order.
    pub fn observe(&mut self, line: &str) -> Vec<OcrEvent> {
        let mut events = Vec::new();
        if self.phase == OcrPhase::Finalizing {
            return events;
        }

        let lower = line.to_ascii_lowercase();
        if FINALIZING_MARKERS.iter().any(|m| lower.contains(m)) {
            self.phase = OcrPhase::Finalizing;
            events.push(OcrEvent::Finalizing);
            return events;
        }

        let page = PAGE_LINE
            .captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<usize>().ok());
        if let Some(page) = page {
            if self.phase == OcrPhase::Idle {
                self.phase = OcrPhase::Processing;
                events.push(OcrEvent::Processing);
            }
            if self.pages.insert(page) {
                events.push(OcrEvent::PageProgress {
                    pages_seen: self.pages.len(),
                });
            }
        }
        events
    }
}

// ── Service capability ───────────────────────────────────────────────────

/// An external OCR service.
///
/// Implementations write every diagnostic line to `lines` as it appears and
/// resolve once the service has exited.
pub trait OcrService: Send + Sync {
    fn run(
        &self,
        input: &Path,
        output: &Path,
        settings: &OcrSettings,
        lines: mpsc::UnboundedSender<String>,
    ) -> impl Future<Output = Result<(), PipelineError>> + Send;
}

/// `ocrmypdf` invoked as a subprocess.
#[derive(Debug, Clone)]
pub struct OcrMyPdf {
    pub program: PathBuf,
}

impl Default for OcrMyPdf {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ocrmypdf"),
        }
    }
}

/// Lines of diagnostic output kept for the error message of a failed run.
const ERROR_TAIL_LINES: usize = 12;

impl OcrMyPdf {
    /// Command-line arguments for one run.
    ///
    /// `-v 1` makes ocrmypdf prefix per-page log lines with the page
    /// number; at the default verbosity those lines are rare and the
    /// tracker would jump from idle straight to finalizing.
    pub fn args(input: &Path, output: &Path, settings: &OcrSettings) -> Vec<String> {
        let mut args = vec![
            if settings.force { "--force-ocr" } else { "--skip-text" }.to_string(),
            "--jobs".into(),
            settings.jobs.to_string(),
            "--tesseract-timeout".into(),
            settings.page_timeout_secs.to_string(),
            "-l".into(),
            settings.language.clone(),
            "-v".into(),
            "1".into(),
        ];
        if settings.fast {
            args.extend(
                ["--pdf-renderer", "sandwich", "--optimize", "0", "--output-type", "pdf"]
                    .map(String::from),
            );
        }
        if let Some(n) = settings.max_pages {
            args.push("--pages".into());
            args.push(format!("1-{n}"));
        }
        args.push(input.display().to_string());
        args.push(output.display().to_string());
        args
    }
}

impl OcrService for OcrMyPdf {
    async fn run(
        &self,
        input: &Path,
        output: &Path,
        settings: &OcrSettings,
        lines: mpsc::UnboundedSender<String>,
    ) -> Result<(), PipelineError> {
        let args = Self::args(input, output, settings);
        debug!("Running {} {}", self.program.display(), args.join(" "));

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    PipelineError::ToolMissing {
                        tool: self.program.display().to_string(),
                        hint: "Install OCRmyPDF (e.g. `pip install ocrmypdf`).".into(),
                    }
                } else {
                    PipelineError::io(&self.program, e)
                }
            })?;

        let mut tail: VecDeque<String> = VecDeque::with_capacity(ERROR_TAIL_LINES);
        if let Some(stderr) = child.stderr.take() {
            let mut stream = LinesStream::new(BufReader::new(stderr).lines());
            while let Some(line) = stream.next().await {
                let Ok(line) = line else { break };
                if tail.len() == ERROR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line.clone());
                // Receiver gone means nobody is listening; keep draining.
                let _ = lines.send(line);
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| PipelineError::io(&self.program, e))?;
        if !status.success() {
            return Err(PipelineError::OcrFailed {
                input: input.to_path_buf(),
                code: status.code(),
                detail: Vec::from(tail).join("\n"),
            });
        }
        Ok(())
    }
}

// ── Driver ───────────────────────────────────────────────────────────────

/// Summary of a finished OCR run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OcrReport {
    pub pages_seen: usize,
    pub final_phase: OcrPhase,
    pub heartbeats: usize,
    pub elapsed_ms: u64,
}

/// Run `service` on `input`, reporting phases and heartbeats.
///
/// Fails if the service fails or if it reports success without producing
/// `output`.
pub async fn run_ocr<O: OcrService>(
    service: &O,
    input: &Path,
    output: &Path,
    settings: &OcrSettings,
    archive: &str,
    progress: &ProgressCallback,
) -> Result<OcrReport, PipelineError> {
    let start = Instant::now();
    let heartbeat = Duration::from_secs(settings.heartbeat_secs.max(1));
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let mut tracker = OcrPhaseTracker::new();
    let mut heartbeats = 0usize;
    let mut lines_open = true;

    info!("OCR {} → {}", input.display(), output.display());

    let run = service.run(input, output, settings, tx);
    tokio::pin!(run);

    let result = loop {
        tokio::select! {
            res = &mut run => break res,
            next = tokio::time::timeout(heartbeat, rx.recv()), if lines_open => match next {
                Ok(Some(line)) => {
                    for event in tracker.observe(&line) {
                        report(archive, &event, progress);
                    }
                }
                Ok(None) => lines_open = false,
                Err(_) => {
                    heartbeats += 1;
                    report(archive, &beat(&tracker, start), progress);
                }
            },
            _ = tokio::time::sleep(heartbeat), if !lines_open => {
                heartbeats += 1;
                report(archive, &beat(&tracker, start), progress);
            }
        }
    };

    while let Ok(line) = rx.try_recv() {
        for event in tracker.observe(&line) {
            report(archive, &event, progress);
        }
    }

    result?;

    if !tokio::fs::try_exists(output).await.unwrap_or(false) {
        return Err(PipelineError::MissingOutput {
            stage: "ocr".into(),
            path: output.to_path_buf(),
        });
    }

    let elapsed_ms = start.elapsed().as_millis() as u64;
    info!(
        "OCR of {} finished in {:.1}s ({} pages reported)",
        archive,
        elapsed_ms as f64 / 1000.0,
        tracker.pages_seen()
    );
    Ok(OcrReport {
        pages_seen: tracker.pages_seen(),
        final_phase: tracker.phase(),
        heartbeats,
        elapsed_ms,
    })
}

fn beat(tracker: &OcrPhaseTracker, start: Instant) -> OcrEvent {
    OcrEvent::Heartbeat {
        phase: tracker.phase(),
        elapsed_secs: start.elapsed().as_secs(),
        pages_seen: tracker.pages_seen(),
    }
}

fn report(archive: &str, event: &OcrEvent, progress: &ProgressCallback) {
    match event {
        OcrEvent::Processing => info!("OCR {}: recognising pages", archive),
        OcrEvent::PageProgress { pages_seen } => debug!("OCR {}: page {} seen", archive, pages_seen),
        OcrEvent::Finalizing => info!("OCR {}: finalizing output", archive),
        OcrEvent::Heartbeat {
            phase,
            elapsed_secs,
            pages_seen,
        } => {
            if *phase == OcrPhase::Finalizing {
                info!(
                    "OCR {}: still finalizing after {}s ({} pages done)",
                    archive, elapsed_secs, pages_seen
                );
            } else {
                warn!(
                    "OCR {}: no output for a while, {} after {}s ({} pages seen)",
                    archive, phase, elapsed_secs, pages_seen
                );
            }
        }
    }
    progress.on_ocr_event(archive, event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::PipelineProgressCallback;
    use std::sync::{Arc, Mutex};

    #[test]
    fn tracker_walks_through_phases() {
        let mut t = OcrPhaseTracker::new();
        assert_eq!(t.phase(), OcrPhase::Idle);
        assert!(t.observe("Scanning contents: 100%").is_empty());

        assert_eq!(
            t.observe("    1 page is facing 0°, confidence 4.2"),
            vec![OcrEvent::Processing, OcrEvent::PageProgress { pages_seen: 1 }]
        );
        assert_eq!(
            t.observe("    2 [tesseract] lots of diacritics"),
            vec![OcrEvent::PageProgress { pages_seen: 2 }]
        );
        // Same page again is not progress.
        assert!(t.observe("    2 [tesseract] more noise").is_empty());
        assert_eq!(t.phase(), OcrPhase::Processing);

        assert_eq!(t.observe("Postprocessing..."), vec![OcrEvent::Finalizing]);
        assert_eq!(t.phase(), OcrPhase::Finalizing);
        assert!(t.observe("    3 late page line").is_empty());
        assert_eq!(t.pages_seen(), 2);
    }

    #[test]
    fn finalizing_can_come_straight_from_idle() {
        let mut t = OcrPhaseTracker::new();
        assert_eq!(t.observe("Output file is a PDF/A-2B"), vec![OcrEvent::Finalizing]);
    }

    #[test]
    fn args_reflect_settings() {
        let settings = OcrSettings {
            jobs: 6,
            max_pages: Some(10),
            language: "eng+deu".into(),
            ..Default::default()
        };
        let args = OcrMyPdf::args(Path::new("in.pdf"), Path::new("out.pdf"), &settings);
        let joined = args.join(" ");
        assert!(joined.starts_with("--force-ocr --jobs 6 --tesseract-timeout 180 -l eng+deu -v 1"));
        assert!(joined.contains("--pdf-renderer sandwich --optimize 0"));
        assert!(joined.ends_with("--pages 1-10 in.pdf out.pdf"));

        let slow = OcrSettings {
            force: false,
            fast: false,
            ..Default::default()
        };
        let args = OcrMyPdf::args(Path::new("a"), Path::new("b"), &slow);
        assert_eq!(args[0], "--skip-text");
        assert!(args.windows(2).any(|w| w[0] == "-v" && w[1] == "1"));
        assert!(!args.iter().any(|a| a == "sandwich"));
    }

    /// Scripted OCR service: emits lines with pauses, then writes the
    /// output (or fails).
    struct ScriptedOcr {
        script: Vec<(u64, &'static str)>,
        exit: Option<i32>,
        write_output: bool,
    }

    impl OcrService for ScriptedOcr {
        async fn run(
            &self,
            input: &Path,
            output: &Path,
            _settings: &OcrSettings,
            lines: mpsc::UnboundedSender<String>,
        ) -> Result<(), PipelineError> {
            for (pause_ms, line) in &self.script {
                tokio::time::sleep(Duration::from_millis(*pause_ms)).await;
                let _ = lines.send(line.to_string());
            }
            if let Some(code) = self.exit {
                return Err(PipelineError::OcrFailed {
                    input: input.to_path_buf(),
                    code: Some(code),
                    detail: "tesseract crashed".into(),
                });
            }
            if self.write_output {
                std::fs::write(output, b"%PDF-1.7 searchable").unwrap();
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct EventLog(Mutex<Vec<OcrEvent>>);

    impl PipelineProgressCallback for EventLog {
        fn on_ocr_event(&self, _archive: &str, event: &OcrEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    fn settings() -> OcrSettings {
        OcrSettings {
            heartbeat_secs: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn successful_run_reports_phases() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("b-ocr.pdf");
        let ocr = ScriptedOcr {
            script: vec![(0, "   1 page"), (0, "   2 page"), (0, "Postprocessing...")],
            exit: None,
            write_output: true,
        };
        let log = Arc::new(EventLog::default());
        let progress: ProgressCallback = log.clone();

        let report = run_ocr(&ocr, &dir.path().join("b.pdf"), &out, &settings(), "b.zip", &progress)
            .await
            .unwrap();

        assert_eq!(report.pages_seen, 2);
        assert_eq!(report.final_phase, OcrPhase::Finalizing);
        assert_eq!(report.heartbeats, 0);
        let events = log.0.lock().unwrap();
        assert_eq!(events.first(), Some(&OcrEvent::Processing));
        assert_eq!(events.last(), Some(&OcrEvent::Finalizing));
    }

    #[tokio::test]
    async fn silent_finalizing_emits_heartbeats() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("b-ocr.pdf");
        let ocr = ScriptedOcr {
            script: vec![(0, "   1 page"), (0, "Optimize ratio: 1.00"), (2300, "Output written")],
            exit: None,
            write_output: true,
        };
        let log = Arc::new(EventLog::default());
        let progress: ProgressCallback = log.clone();

        let report = run_ocr(&ocr, Path::new("b.pdf"), &out, &settings(), "b.zip", &progress)
            .await
            .unwrap();

        assert!(report.heartbeats >= 2, "got {} heartbeats", report.heartbeats);
        let events = log.0.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            OcrEvent::Heartbeat { phase: OcrPhase::Finalizing, pages_seen: 1, .. }
        )));
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let ocr = ScriptedOcr {
            script: vec![(0, "   1 page")],
            exit: Some(2),
            write_output: false,
        };
        let progress: ProgressCallback = Arc::new(crate::progress::NoopProgressCallback);
        let err = run_ocr(&ocr, Path::new("b.pdf"), &dir.path().join("o.pdf"), &settings(), "b.zip", &progress)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::OcrFailed { code: Some(2), .. }));
    }

    #[tokio::test]
    async fn success_without_output_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let ocr = ScriptedOcr {
            script: vec![],
            exit: None,
            write_output: false,
        };
        let progress: ProgressCallback = Arc::new(crate::progress::NoopProgressCallback);
        let err = run_ocr(&ocr, Path::new("b.pdf"), &dir.path().join("o.pdf"), &settings(), "b.zip", &progress)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::MissingOutput { .. }));
    }
}
