//! Render worker pool: page documents → single-page PDFs.
//!
//! ## Why one renderer per worker?
//!
//! Starting a headless browser costs far more than printing one page, so
//! each worker launches its renderer once and keeps it for every unit it
//! handles. Workers never share a renderer, which also makes them separate
//! failure domains: a browser that won't start or dies mid-run takes down
//! only its own worker.
//!
//! ## Why a shared queue?
//!
//! Page cost varies a lot (a text-only page versus a 4 MB photo spread).
//! Instead of slicing the units into W fixed batches, workers pull the next
//! unit from one queue until it is empty, so a slow page never leaves the
//! other workers idle. Units abandoned by a dead worker stay in the queue for
//! the survivors.
//!
//! Artifacts are written to disk as soon as they are produced and the bytes
//! dropped, keeping peak memory at roughly one page per worker. The report
//! lists artifacts by ordinal, never by completion order.

use crate::error::{PageError, PipelineError};
use crate::pipeline::dedup::RenderUnit;
use crate::pipeline::dimensions::{page_size_for, PageSize};
use crate::progress::ProgressCallback;
use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Failure reported by a renderer for one page.
#[derive(Debug, Clone, Error)]
#[error("{detail}")]
pub struct RenderFailure {
    pub detail: String,
    /// The renderer instance itself is unusable; its worker stops.
    pub fatal: bool,
}

impl RenderFailure {
    /// The page could not be rendered; the renderer is still fine.
    pub fn page(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
            fatal: false,
        }
    }

    /// The renderer is gone (crashed browser, closed connection).
    pub fn fatal(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
            fatal: true,
        }
    }
}

/// One live renderer instance, owned by exactly one worker.
pub trait PageRenderer: Send {
    /// Render one page document to PDF bytes at the given page size.
    fn render(
        &mut self,
        document: &[u8],
        size: PageSize,
    ) -> impl Future<Output = Result<Vec<u8>, RenderFailure>> + Send;

    /// Shut the instance down.
    fn close(self) -> impl Future<Output = ()> + Send
    where
        Self: Sized;
}

/// Launches renderer instances for workers.
pub trait RendererFactory: Send + Sync + 'static {
    type Renderer: PageRenderer + 'static;

    /// Start the renderer for worker `worker` (0-based).
    fn launch(
        &self,
        worker: usize,
    ) -> impl Future<Output = Result<Self::Renderer, PipelineError>> + Send;
}

/// A rendered page on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct PageArtifact {
    pub ordinal: usize,
    pub path: PathBuf,
    pub size: PageSize,
}

/// Everything a pool run needs besides the units and the factory.
#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// Archive name, for logging and progress events.
    pub archive: String,
    pub workers: usize,
    pub page_width_in: f64,
    pub default_aspect_ratio: f64,
    /// Directory receiving `<ordinal>.pdf` artifacts.
    pub pages_dir: PathBuf,
}

/// Result of a pool run.
#[derive(Debug, Default)]
pub struct RenderReport {
    /// Successful artifacts in ordinal order.
    pub artifacts: Vec<PageArtifact>,
    /// Dropped units in ordinal order.
    pub errors: Vec<PageError>,
    /// Workers that actually ran.
    pub workers: usize,
}

type UnitQueue = Arc<Mutex<VecDeque<RenderUnit>>>;

#[derive(Default)]
struct WorkerOutput {
    artifacts: Vec<PageArtifact>,
    errors: Vec<PageError>,
    launch_error: Option<PipelineError>,
}

/// Render every unit with `options.workers` workers.
///
/// Per-unit failures are collected, not propagated. Returns `Err` only when
/// no worker could start a renderer at all.
pub async fn render_units<F: RendererFactory>(
    factory: Arc<F>,
    units: Vec<RenderUnit>,
    options: RenderOptions,
    progress: ProgressCallback,
) -> Result<RenderReport, PipelineError> {
    let total = units.len();
    if total == 0 {
        return Ok(RenderReport::default());
    }
    tokio::fs::create_dir_all(&options.pages_dir)
        .await
        .map_err(|e| PipelineError::io(&options.pages_dir, e))?;

    let workers = options.workers.clamp(1, total);
    info!(
        "Rendering {} pages of {} with {} workers",
        total, options.archive, workers
    );
    progress.on_render_start(&options.archive, total, workers);

    let queue: UnitQueue = Arc::new(Mutex::new(units.into_iter().collect()));
    let done = Arc::new(AtomicUsize::new(0));
    let options = Arc::new(options);

    let mut set = JoinSet::new();
    for worker in 0..workers {
        set.spawn(run_worker(
            worker,
            Arc::clone(&factory),
            Arc::clone(&queue),
            Arc::clone(&options),
            Arc::clone(&done),
            total,
            Arc::clone(&progress),
        ));
    }

    let mut report = RenderReport::default();
    let mut launch_errors = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(out) => {
                report.artifacts.extend(out.artifacts);
                report.errors.extend(out.errors);
                match out.launch_error {
                    Some(e) => launch_errors.push(e),
                    None => report.workers += 1,
                }
            }
            Err(e) => warn!("Render worker of {} panicked: {}", options.archive, e),
        }
    }

    // Units nobody could take: every worker died before the queue drained.
    let leftovers: Vec<RenderUnit> = lock(&queue).drain(..).collect();
    if !leftovers.is_empty() {
        if report.artifacts.is_empty() && report.workers == 0 {
            if let Some(first) = launch_errors.into_iter().next() {
                return Err(first);
            }
        }
        warn!(
            "{} pages of {} left unrendered: no renderer available",
            leftovers.len(),
            options.archive
        );
        for unit in leftovers {
            let err = PageError::RendererLost {
                ordinal: unit.ordinal,
                detail: "all render workers stopped".into(),
            };
            progress.on_page_failed(&options.archive, unit.ordinal, &err.to_string());
            report.errors.push(err);
        }
    }

    report.artifacts.sort_by_key(|a| a.ordinal);
    report.errors.sort_by_key(PageError::ordinal);
    info!(
        "Rendered {}/{} pages of {} ({} dropped)",
        report.artifacts.len(),
        total,
        options.archive,
        report.errors.len()
    );
    Ok(report)
}

async fn run_worker<F: RendererFactory>(
    worker: usize,
    factory: Arc<F>,
    queue: UnitQueue,
    options: Arc<RenderOptions>,
    done: Arc<AtomicUsize>,
    total: usize,
    progress: ProgressCallback,
) -> WorkerOutput {
    let mut out = WorkerOutput::default();
    let mut renderer = match factory.launch(worker).await {
        Ok(r) => r,
        Err(e) => {
            warn!("Worker {} of {}: {}", worker, options.archive, e);
            out.launch_error = Some(e);
            return out;
        }
    };
    debug!("Worker {} of {} ready", worker, options.archive);

    while let Some(unit) = next_unit(&queue) {
        let ordinal = unit.ordinal;
        let size = page_size_for(
            &unit.bytes,
            options.page_width_in,
            options.default_aspect_ratio,
        );

        let result = match renderer.render(&unit.bytes, size).await {
            Ok(pdf) => {
                let path = options.pages_dir.join(format!("{ordinal:06}.pdf"));
                match tokio::fs::write(&path, &pdf).await {
                    Ok(()) => Ok(PageArtifact {
                        ordinal,
                        path,
                        size,
                    }),
                    Err(e) => Err((
                        PageError::ArtifactWriteFailed {
                            ordinal,
                            detail: e.to_string(),
                        },
                        false,
                    )),
                }
            }
            Err(failure) => Err((
                PageError::RenderFailed {
                    ordinal,
                    detail: failure.detail,
                },
                failure.fatal,
            )),
        };
        drop(unit);

        match result {
            Ok(artifact) => {
                let n = done.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(
                    "Worker {} rendered page {} ({:.2}x{:.2} in)",
                    worker, ordinal, size.width_in, size.height_in
                );
                progress.on_page_rendered(&options.archive, ordinal, n, total);
                out.artifacts.push(artifact);
            }
            Err((err, fatal)) => {
                warn!("Worker {} of {}: {}", worker, options.archive, err);
                progress.on_page_failed(&options.archive, ordinal, &err.to_string());
                out.errors.push(err);
                if fatal {
                    warn!(
                        "Worker {} of {} lost its renderer, stopping",
                        worker, options.archive
                    );
                    renderer.close().await;
                    return out;
                }
            }
        }
    }

    renderer.close().await;
    out
}

fn lock(queue: &UnitQueue) -> std::sync::MutexGuard<'_, VecDeque<RenderUnit>> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

fn next_unit(queue: &UnitQueue) -> Option<RenderUnit> {
    lock(queue).pop_front()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::dedup::ContentHash;
    use crate::progress::NoopProgressCallback;
    use std::collections::HashSet;
    use std::time::Duration;

    /// Echoes the document back as the "PDF"; pages whose body contains
    /// `FAIL` fail, `CRASH` kills the renderer.
    struct EchoFactory {
        launches: AtomicUsize,
        closes: Arc<AtomicUsize>,
        broken_workers: HashSet<usize>,
    }

    struct EchoRenderer {
        closes: Arc<AtomicUsize>,
    }

    impl PageRenderer for EchoRenderer {
        async fn render(&mut self, document: &[u8], _size: PageSize) -> Result<Vec<u8>, RenderFailure> {
            let text = String::from_utf8_lossy(document).into_owned();
            // Scramble completion order.
            let delay = text.bytes().map(u64::from).sum::<u64>() % 7;
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if text.contains("CRASH") {
                return Err(RenderFailure::fatal("browser closed"));
            }
            if text.contains("FAIL") {
                return Err(RenderFailure::page("could not parse document"));
            }
            Ok(document.to_vec())
        }

        async fn close(self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl RendererFactory for EchoFactory {
        type Renderer = EchoRenderer;

        async fn launch(&self, worker: usize) -> Result<EchoRenderer, PipelineError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            if self.broken_workers.contains(&worker) {
                return Err(PipelineError::RendererLaunchFailed {
                    worker,
                    detail: "no chrome".into(),
                });
            }
            Ok(EchoRenderer {
                closes: Arc::clone(&self.closes),
            })
        }
    }

    fn factory(broken: &[usize]) -> Arc<EchoFactory> {
        Arc::new(EchoFactory {
            launches: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
            broken_workers: broken.iter().copied().collect(),
        })
    }

    fn units(bodies: &[&str]) -> Vec<RenderUnit> {
        bodies
            .iter()
            .enumerate()
            .map(|(i, b)| RenderUnit {
                ordinal: i * 2,
                label: String::new(),
                hash: ContentHash::of(b.as_bytes()),
                bytes: b.as_bytes().to_vec(),
            })
            .collect()
    }

    fn options(dir: &std::path::Path, workers: usize) -> RenderOptions {
        RenderOptions {
            archive: "test.zip".into(),
            workers,
            page_width_in: 8.5,
            default_aspect_ratio: 1.5,
            pages_dir: dir.join("pages"),
        }
    }

    #[tokio::test]
    async fn artifacts_come_back_in_ordinal_order() {
        let dir = tempfile::tempdir().unwrap();
        let bodies: Vec<String> = (0..25).map(|i| format!("page-{i}-{}", "x".repeat(i % 5))).collect();
        let refs: Vec<&str> = bodies.iter().map(String::as_str).collect();
        let f = factory(&[]);

        let report = render_units(
            Arc::clone(&f),
            units(&refs),
            options(dir.path(), 4),
            Arc::new(NoopProgressCallback),
        )
        .await
        .unwrap();

        assert_eq!(report.workers, 4);
        assert_eq!(f.launches.load(Ordering::SeqCst), 4);
        let ordinals: Vec<usize> = report.artifacts.iter().map(|a| a.ordinal).collect();
        assert_eq!(ordinals, (0..25).map(|i| i * 2).collect::<Vec<_>>());
        for (i, artifact) in report.artifacts.iter().enumerate() {
            assert_eq!(std::fs::read(&artifact.path).unwrap(), bodies[i].as_bytes());
        }
    }

    #[tokio::test]
    async fn failing_unit_is_dropped_and_pool_continues() {
        let dir = tempfile::tempdir().unwrap();
        let report = render_units(
            factory(&[]),
            units(&["a", "FAIL", "c", "d"]),
            options(dir.path(), 2),
            Arc::new(NoopProgressCallback),
        )
        .await
        .unwrap();

        let ordinals: Vec<usize> = report.artifacts.iter().map(|a| a.ordinal).collect();
        assert_eq!(ordinals, vec![0, 4, 6]);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].ordinal(), 2);
    }

    #[tokio::test]
    async fn broken_worker_does_not_affect_others() {
        let dir = tempfile::tempdir().unwrap();
        let report = render_units(
            factory(&[0]),
            units(&["a", "b", "c", "d", "e"]),
            options(dir.path(), 3),
            Arc::new(NoopProgressCallback),
        )
        .await
        .unwrap();

        assert_eq!(report.workers, 2);
        assert_eq!(report.artifacts.len(), 5);
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn crashed_renderer_leaves_remaining_units_to_survivors() {
        let dir = tempfile::tempdir().unwrap();
        let f = factory(&[]);
        let report = render_units(
            Arc::clone(&f),
            units(&["CRASH", "b", "c", "d", "e", "f"]),
            options(dir.path(), 2),
            Arc::new(NoopProgressCallback),
        )
        .await
        .unwrap();

        assert_eq!(report.artifacts.len(), 5);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].ordinal(), 0);
        // The crashed worker shuts its renderer down too.
        assert_eq!(f.closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn no_renderer_at_all_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = render_units(
            factory(&[0, 1]),
            units(&["a", "b"]),
            options(dir.path(), 2),
            Arc::new(NoopProgressCallback),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PipelineError::RendererLaunchFailed { .. }));
    }

    #[tokio::test]
    async fn workers_capped_by_unit_count() {
        let dir = tempfile::tempdir().unwrap();
        let f = factory(&[]);
        let report = render_units(
            Arc::clone(&f),
            units(&["only"]),
            options(dir.path(), 8),
            Arc::new(NoopProgressCallback),
        )
        .await
        .unwrap();
        assert_eq!(report.workers, 1);
        assert_eq!(f.launches.load(Ordering::SeqCst), 1);
    }
}
