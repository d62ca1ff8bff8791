//! Merge engine: single-page PDFs → one document, in ordinal order.
//!
//! Artifacts are loaded `chunk_size` at a time and folded into the output
//! document, so only one chunk of parsed sources is alive at once. Each
//! source gets its object ids shifted past everything merged so far; its
//! page objects are re-parented under one new page tree and its own
//! catalog/page-tree nodes are dropped.
//!
//! Attributes a page inherits from its old tree (`MediaBox`, `Resources`,
//! ...) are copied onto the page before the old tree is discarded.
//! Chromium puts `MediaBox` on the page itself, but other producers don't.

use crate::error::PipelineError;
use crate::pipeline::render::PageArtifact;
use lopdf::{dictionary, Document, Object, ObjectId};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const INHERITABLE: [&[u8]; 4] = [b"MediaBox", b"CropBox", b"Resources", b"Rotate"];

/// Structural node types of a source document that are not carried over.
const DROPPED_TYPES: [&[u8]; 4] = [b"Catalog", b"Pages", b"Outlines", b"Outline"];

/// Merge `artifacts` (already in ordinal order) into `output`.
///
/// Returns the number of pages written. Runs on the blocking pool.
pub async fn merge_artifacts(
    artifacts: Vec<PageArtifact>,
    output: &Path,
    chunk_size: usize,
) -> Result<usize, PipelineError> {
    let paths: Vec<PathBuf> = artifacts.into_iter().map(|a| a.path).collect();
    let output = output.to_path_buf();
    tokio::task::spawn_blocking(move || merge_files(&paths, &output, chunk_size))
        .await
        .map_err(|e| PipelineError::Internal(format!("Merge task panicked: {e}")))?
}

/// Blocking merge of single- or multi-page PDFs, in the given order.
pub fn merge_files(
    inputs: &[PathBuf],
    output: &Path,
    chunk_size: usize,
) -> Result<usize, PipelineError> {
    if inputs.is_empty() {
        return Err(PipelineError::NothingToMerge);
    }
    let chunk_size = chunk_size.max(1);

    let mut merged = Document::with_version("1.7");
    let pages_id = merged.new_object_id();
    let mut kids: Vec<ObjectId> = Vec::with_capacity(inputs.len());

    for (n, chunk) in inputs.chunks(chunk_size).enumerate() {
        let mut loaded = Vec::with_capacity(chunk.len());
        for path in chunk {
            let doc = Document::load(path).map_err(|e| PipelineError::MergeFailed {
                path: path.clone(),
                detail: e.to_string(),
            })?;
            loaded.push((path, doc));
        }
        for (path, doc) in loaded {
            absorb(&mut merged, &mut kids, pages_id, doc, path)?;
        }
        debug!(
            "Merged chunk {} ({} files, {} pages so far)",
            n + 1,
            chunk.len(),
            kids.len()
        );
    }

    let count = kids.len();
    merged.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids.into_iter().map(Object::Reference).collect::<Vec<_>>(),
            "Count" => count as i64,
        }),
    );
    let catalog_id = merged.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    merged.trailer.set("Root", catalog_id);
    merged.compress();

    save_atomic(&mut merged, output)?;
    info!("Merged {} pages into {}", count, output.display());
    Ok(count)
}

/// Fold one source document into `merged`, appending its pages to `kids`.
fn absorb(
    merged: &mut Document,
    kids: &mut Vec<ObjectId>,
    pages_id: ObjectId,
    mut doc: Document,
    path: &Path,
) -> Result<(), PipelineError> {
    doc.renumber_objects_with(merged.max_id + 1);
    merged.max_id = merged.max_id.max(doc.max_id);

    let pages: Vec<ObjectId> = doc.get_pages().into_values().collect();
    if pages.is_empty() {
        return Err(PipelineError::MergeFailed {
            path: path.to_path_buf(),
            detail: "document has no pages".into(),
        });
    }
    let inherited: Vec<(ObjectId, Vec<(&'static [u8], Object)>)> = pages
        .iter()
        .map(|&id| (id, inherited_attributes(&doc, id)))
        .collect();

    for (id, object) in std::mem::take(&mut doc.objects) {
        let dropped = type_name(&object).is_some_and(|t| DROPPED_TYPES.iter().any(|d| *d == t));
        if !dropped {
            merged.objects.insert(id, object);
        }
    }

    for (id, attrs) in inherited {
        let page = merged
            .get_object_mut(id)
            .and_then(Object::as_dict_mut)
            .map_err(|e| PipelineError::MergeFailed {
                path: path.to_path_buf(),
                detail: format!("page object {id:?}: {e}"),
            })?;
        for (key, value) in attrs {
            page.set(key, value);
        }
        page.set("Parent", pages_id);
        kids.push(id);
    }
    Ok(())
}

/// Values the page would inherit from its ancestors and doesn't set itself.
fn inherited_attributes(doc: &Document, page_id: ObjectId) -> Vec<(&'static [u8], Object)> {
    let Ok(page) = doc.get_dictionary(page_id) else {
        return Vec::new();
    };
    let mut found = Vec::new();
    for key in INHERITABLE {
        if page.has(key) {
            continue;
        }
        let mut parent = page.get(b"Parent").and_then(Object::as_reference).ok();
        // Page trees are shallow; the bound only guards against cycles.
        for _ in 0..32 {
            let Some(node) = parent.and_then(|id| doc.get_dictionary(id).ok()) else {
                break;
            };
            if let Ok(value) = node.get(key) {
                found.push((key, value.clone()));
                break;
            }
            parent = node.get(b"Parent").and_then(Object::as_reference).ok();
        }
    }
    found
}

fn type_name(object: &Object) -> Option<&[u8]> {
    object
        .as_dict()
        .ok()?
        .get(b"Type")
        .and_then(Object::as_name)
        .ok()
}

fn save_atomic(doc: &mut Document, output: &Path) -> Result<(), PipelineError> {
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
    }
    let tmp = output.with_extension("pdf.tmp");
    doc.save(&tmp).map_err(|e| PipelineError::MergeFailed {
        path: output.to_path_buf(),
        detail: e.to_string(),
    })?;
    std::fs::rename(&tmp, output).map_err(|e| PipelineError::io(output, e))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use lopdf::Stream;

    /// Write a one-page PDF whose content stream shows `marker`. `MediaBox`
    /// and `Resources` sit on the page tree node, not on the page.
    pub(crate) fn write_marker_pdf(path: &Path, marker: &str) {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });
        let content = format!("BT /F1 24 Tf 72 720 Td ({marker}) Tj ET");
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![page_id.into()],
                "Count" => 1,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 918.into()],
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        doc.save(path).unwrap();
    }

    /// Page markers of a merged PDF, in page order.
    pub(crate) fn page_markers(path: &Path) -> Vec<String> {
        let doc = Document::load(path).unwrap();
        doc.get_pages()
            .values()
            .map(|&id| {
                let content = String::from_utf8_lossy(&doc.get_page_content(id).unwrap()).into_owned();
                let start = content.find('(').unwrap() + 1;
                let end = content.find(')').unwrap();
                content[start..end].to_string()
            })
            .collect()
    }

    fn artifacts(dir: &Path, markers: &[&str]) -> Vec<PathBuf> {
        markers
            .iter()
            .enumerate()
            .map(|(i, m)| {
                let p = dir.join(format!("{i:06}.pdf"));
                write_marker_pdf(&p, m);
                p
            })
            .collect()
    }

    #[test]
    fn seven_pages_keep_their_order_across_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let markers = ["p0", "p1", "p2", "p3", "p5", "p6", "p8"];
        let inputs = artifacts(dir.path(), &markers);
        let out = dir.path().join("out/book.pdf");

        let n = merge_files(&inputs, &out, 3).unwrap();

        assert_eq!(n, 7);
        assert_eq!(page_markers(&out), markers);
        assert!(!out.with_extension("pdf.tmp").exists());
    }

    #[test]
    fn inherited_attributes_survive_the_merge() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = artifacts(dir.path(), &["a", "b"]);
        let out = dir.path().join("book.pdf");
        merge_files(&inputs, &out, 100).unwrap();

        let doc = Document::load(&out).unwrap();
        for (_, id) in doc.get_pages() {
            let page = doc.get_dictionary(id).unwrap();
            assert!(page.has(b"MediaBox"));
            assert!(page.has(b"Resources"));
        }
    }

    #[test]
    fn empty_input_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = merge_files(&[], &dir.path().join("x.pdf"), 10).unwrap_err();
        assert!(matches!(err, PipelineError::NothingToMerge));
    }

    #[test]
    fn unreadable_artifact_fails_the_merge() {
        let dir = tempfile::tempdir().unwrap();
        let mut inputs = artifacts(dir.path(), &["a"]);
        let bad = dir.path().join("bad.pdf");
        std::fs::write(&bad, b"not a pdf").unwrap();
        inputs.push(bad.clone());

        let out = dir.path().join("x.pdf");
        let err = merge_files(&inputs, &out, 10).unwrap_err();
        assert!(matches!(err, PipelineError::MergeFailed { path, .. } if path == bad));
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn async_merge_takes_artifacts_in_given_order() {
        use crate::pipeline::dimensions::PageSize;

        let dir = tempfile::tempdir().unwrap();
        let paths = artifacts(dir.path(), &["first", "second"]);
        let arts = paths
            .into_iter()
            .enumerate()
            .map(|(ordinal, path)| PageArtifact {
                ordinal,
                path,
                size: PageSize::from_aspect(8.5, 1.5),
            })
            .collect();
        let out = dir.path().join("m.pdf");
        assert_eq!(merge_artifacts(arts, &out, 1).await.unwrap(), 2);
        assert_eq!(page_markers(&out), vec!["first", "second"]);
    }
}
