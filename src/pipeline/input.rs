//! Input handling: find page archives and unpack them into a workspace.
//!
//! Each archive gets its own [`ArchiveWorkspace`], a temp directory that
//! holds the extracted page documents and, later, the rendered page PDFs.
//! The directory is deleted when the workspace is closed or dropped, so an
//! archive that fails half-way never leaves debris behind.

use crate::error::PipelineError;
use std::fs::File;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// One extracted page: markup embedding a single page image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageDocument {
    /// Position in extraction order (0-based); decides final page order.
    pub ordinal: usize,
    /// Chapter/label carried by the file name.
    pub label: String,
    /// Entry name inside the archive.
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Temp directory owned by one archive for the duration of its pdf stage.
pub struct ArchiveWorkspace {
    dir: TempDir,
}

impl ArchiveWorkspace {
    /// Create a fresh workspace under the system temp directory.
    pub fn create(archive_name: &str) -> Result<Self, PipelineError> {
        let prefix = format!("reader2pdf-{}-", sanitize(archive_name));
        let dir = tempfile::Builder::new()
            .prefix(&prefix)
            .tempdir()
            .map_err(|e| PipelineError::io(std::env::temp_dir(), e))?;
        debug!("Workspace for {} at {}", archive_name, dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Where the archive is unpacked.
    pub fn extracted_dir(&self) -> PathBuf {
        self.dir.path().join("extracted")
    }

    /// Where rendered page artifacts are written.
    pub fn pages_dir(&self) -> PathBuf {
        self.dir.path().join("pages")
    }

    /// Delete the workspace, reporting failures instead of ignoring them.
    pub fn close(self) -> Result<(), PipelineError> {
        let path = self.dir.path().to_path_buf();
        self.dir.close().map_err(|e| PipelineError::io(path, e))
    }
}

/// List `*.zip` files in `input_dir`, sorted by file name.
pub fn discover_archives(input_dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    if !input_dir.is_dir() {
        return Err(PipelineError::InputDirNotFound {
            path: input_dir.to_path_buf(),
        });
    }

    let mut archives: Vec<PathBuf> = std::fs::read_dir(input_dir)
        .map_err(|e| PipelineError::io(input_dir, e))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && has_extension(p, &["zip"]))
        .collect();
    archives.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    debug!("Found {} archives in {}", archives.len(), input_dir.display());
    Ok(archives)
}

/// `input/bookA.zip` → `bookA`.
pub fn archive_base_name(archive: &Path) -> String {
    archive
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string())
}

/// Archive file name used as the job record key: `input/bookA.zip` → `bookA.zip`.
pub fn archive_key(archive: &Path) -> String {
    archive
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| archive.display().to_string())
}

/// Unpack `archive` into the workspace and load its page documents in
/// name order.
///
/// Runs the zip work on the blocking pool.
pub async fn extract_archive(
    archive: &Path,
    workspace: &ArchiveWorkspace,
) -> Result<Vec<PageDocument>, PipelineError> {
    let archive = archive.to_path_buf();
    let target = workspace.extracted_dir();
    tokio::task::spawn_blocking(move || extract_archive_blocking(&archive, &target))
        .await
        .map_err(|e| PipelineError::Internal(format!("Extraction task panicked: {e}")))?
}

/// Blocking implementation of archive extraction.
pub fn extract_archive_blocking(
    archive: &Path,
    target: &Path,
) -> Result<Vec<PageDocument>, PipelineError> {
    let corrupt = |detail: String| PipelineError::CorruptArchive {
        path: archive.to_path_buf(),
        detail,
    };

    let file = File::open(archive).map_err(|e| PipelineError::io(archive, e))?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| corrupt(e.to_string()))?;
    std::fs::create_dir_all(target).map_err(|e| PipelineError::io(target, e))?;
    zip.extract(target).map_err(|e| corrupt(e.to_string()))?;

    let mut names = Vec::new();
    collect_page_files(target, target, &mut names)?;
    names.sort();

    if names.is_empty() {
        return Err(PipelineError::EmptyArchive {
            path: archive.to_path_buf(),
        });
    }

    let mut documents = Vec::with_capacity(names.len());
    for (ordinal, name) in names.into_iter().enumerate() {
        let path = target.join(&name);
        let bytes = std::fs::read(&path).map_err(|e| PipelineError::io(&path, e))?;
        if bytes.is_empty() {
            warn!("Page document {} in {} is empty", name, archive.display());
        }
        documents.push(PageDocument {
            ordinal,
            label: page_label(&name),
            name,
            bytes,
        });
    }

    info!(
        "Extracted {} page documents from {}",
        documents.len(),
        archive.display()
    );
    Ok(documents)
}

/// Recursively collect `.html`/`.htm` files as `/`-joined paths relative to `root`.
fn collect_page_files(
    root: &Path,
    dir: &Path,
    out: &mut Vec<String>,
) -> Result<(), PipelineError> {
    for entry in std::fs::read_dir(dir).map_err(|e| PipelineError::io(dir, e))? {
        let path = entry.map_err(|e| PipelineError::io(dir, e))?.path();
        let hidden = path
            .file_name()
            .map(|n| n.to_string_lossy().starts_with('.') || n == "__MACOSX")
            .unwrap_or(true);
        if hidden {
            continue;
        }
        if path.is_dir() {
            collect_page_files(root, &path, out)?;
        } else if has_extension(&path, &["html", "htm", "xhtml"]) {
            if let Ok(rel) = path.strip_prefix(root) {
                let rel: Vec<String> = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                out.push(rel.join("/"));
            }
        }
    }
    Ok(())
}

/// `0007_chapter-2.html` → `chapter-2`; `p12.html` → `p12`.
pub fn page_label(name: &str) -> String {
    let file = name.rsplit('/').next().unwrap_or(name);
    let stem = file.rsplit_once('.').map(|(s, _)| s).unwrap_or(file);
    let trimmed = stem.trim_start_matches(|c: char| c.is_ascii_digit());
    if trimmed.len() == stem.len() {
        return stem.to_string();
    }
    trimmed
        .trim_start_matches(['_', '-', ' ', '.'])
        .to_string()
}

fn has_extension(path: &Path, exts: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| exts.iter().any(|x| e.eq_ignore_ascii_case(x)))
        .unwrap_or(false)
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(40)
        .collect()
}
