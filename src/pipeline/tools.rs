//! Precondition checks for the external tools a run depends on.
//!
//! Every tool is probed with `--version` before the first archive is
//! touched, so a missing binary aborts the run up front instead of failing
//! every archive one by one.

use crate::error::PipelineError;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Browser binaries tried, in order, when none is configured.
const BROWSER_CANDIDATES: [&str; 5] = [
    "chromium",
    "chromium-browser",
    "google-chrome",
    "google-chrome-stable",
    "chrome",
];

/// Locations of the external programs used by the production pipeline.
#[derive(Debug, Clone)]
pub struct ExternalTools {
    /// Headless browser; searched on `PATH` when `None`.
    pub browser: Option<PathBuf>,
    pub ocrmypdf: PathBuf,
    pub ghostscript: PathBuf,
}

impl Default for ExternalTools {
    fn default() -> Self {
        Self {
            browser: None,
            ocrmypdf: PathBuf::from("ocrmypdf"),
            ghostscript: PathBuf::from("gs"),
        }
    }
}

/// Result of a successful preflight.
#[derive(Debug, Clone)]
pub struct ToolReport {
    /// Browser binary that answered.
    pub browser: PathBuf,
    /// `(tool, first line of --version)` for every probed tool.
    pub versions: Vec<(String, String)>,
}

/// Probe one program with `--version`.
///
/// Returns the first line of its output. A binary that cannot be found
/// yields [`PipelineError::ToolMissing`] carrying `hint`.
pub async fn probe(program: &Path, hint: &str) -> Result<String, PipelineError> {
    let missing = || PipelineError::ToolMissing {
        tool: program.display().to_string(),
        hint: hint.to_string(),
    };
    let out = Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => missing(),
            _ => PipelineError::io(program, e),
        })?;
    if !out.status.success() {
        return Err(missing());
    }
    let text = if out.stdout.is_empty() {
        out.stderr
    } else {
        out.stdout
    };
    let version = String::from_utf8_lossy(&text)
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();
    debug!("{} → {}", program.display(), version);
    Ok(version)
}

/// Check every tool the run needs. Ghostscript is only required with
/// `compress`.
pub async fn preflight(tools: &ExternalTools, compress: bool) -> Result<ToolReport, PipelineError> {
    let mut versions = Vec::new();

    let browser = match &tools.browser {
        Some(path) => {
            let v = probe(path, BROWSER_HINT).await?;
            versions.push((path.display().to_string(), v));
            path.clone()
        }
        None => {
            let (path, v) = find_browser().await?;
            versions.push((path.display().to_string(), v));
            path
        }
    };

    let v = probe(&tools.ocrmypdf, "Install OCRmyPDF (e.g. `pip install ocrmypdf`).").await?;
    versions.push(("ocrmypdf".into(), v));

    if compress {
        let v = probe(
            &tools.ghostscript,
            "Install Ghostscript (e.g. `apt install ghostscript`) or run without --compress.",
        )
        .await?;
        versions.push(("ghostscript".into(), v));
    }

    for (tool, version) in &versions {
        info!("Found {}: {}", tool, version);
    }
    Ok(ToolReport { browser, versions })
}

const BROWSER_HINT: &str =
    "Install Chromium or Google Chrome, or pass its path with --browser.";

async fn find_browser() -> Result<(PathBuf, String), PipelineError> {
    for candidate in BROWSER_CANDIDATES {
        let path = PathBuf::from(candidate);
        if let Ok(version) = probe(&path, BROWSER_HINT).await {
            return Ok((path, version));
        }
    }
    Err(PipelineError::ToolMissing {
        tool: "chromium".into(),
        hint: BROWSER_HINT.into(),
    })
}
