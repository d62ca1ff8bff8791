//! Headless Chromium renderer for the worker pool.
//!
//! Every worker gets its own browser process with a private profile
//! directory; two browsers sharing a profile fight over its lock file. A page
//! document is loaded into a fresh tab with `set_content`, printed at the
//! computed paper size with zero margins, and the tab is closed again.

use crate::error::PipelineError;
use crate::pipeline::dimensions::PageSize;
use crate::pipeline::render::{PageRenderer, RenderFailure, RendererFactory};
use chromiumoxide::cdp::browser_protocol::page::PrintToPdfParams;
use chromiumoxide::{Browser, BrowserConfig};
use futures::StreamExt;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Launches one headless browser per render worker.
#[derive(Debug, Clone)]
pub struct ChromeRendererFactory {
    /// Explicit browser binary; auto-detected when `None`.
    pub executable: Option<PathBuf>,
    /// Upper bound for loading and printing a single page.
    pub page_timeout: Duration,
}

impl Default for ChromeRendererFactory {
    fn default() -> Self {
        Self {
            executable: None,
            page_timeout: Duration::from_secs(120),
        }
    }
}

impl ChromeRendererFactory {
    pub fn new(executable: Option<PathBuf>) -> Self {
        Self {
            executable,
            ..Default::default()
        }
    }
}

impl RendererFactory for ChromeRendererFactory {
    type Renderer = ChromeRenderer;

    async fn launch(&self, worker: usize) -> Result<ChromeRenderer, PipelineError> {
        let failed = |detail: String| PipelineError::RendererLaunchFailed { worker, detail };

        let profile = tempfile::Builder::new()
            .prefix(&format!("reader2pdf-chrome-{worker}-"))
            .tempdir()
            .map_err(|e| failed(format!("cannot create profile dir: {e}")))?;

        let mut builder = BrowserConfig::builder()
            .new_headless_mode()
            .user_data_dir(profile.path())
            .args(vec![
                "--disable-gpu",
                "--no-sandbox",
                "--disable-dev-shm-usage",
                "--hide-scrollbars",
            ]);
        if let Some(exe) = &self.executable {
            builder = builder.chrome_executable(exe);
        }
        let config = builder.build().map_err(failed)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| failed(e.to_string()))?;

        let events = tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if h.is_err() {
                    break;
                }
            }
        });

        debug!("Worker {} launched headless browser", worker);
        Ok(ChromeRenderer {
            browser,
            events,
            page_timeout: self.page_timeout,
            _profile: profile,
        })
    }
}

/// One headless browser owned by one worker.
pub struct ChromeRenderer {
    browser: Browser,
    events: JoinHandle<()>,
    page_timeout: Duration,
    _profile: TempDir,
}

impl ChromeRenderer {
    async fn print(&self, html: String, size: PageSize) -> Result<Vec<u8>, RenderFailure> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| self.classify(format!("cannot open tab: {e}")))?;

        let printed = async {
            page.set_content(html)
                .await
                .map_err(|e| RenderFailure::page(format!("cannot load document: {e}")))?;
            page.pdf(print_params(size))
                .await
                .map_err(|e| RenderFailure::page(format!("print to PDF failed: {e}")))
        }
        .await;

        if let Err(e) = page.close().await {
            debug!("Closing tab failed: {}", e);
        }
        printed.map_err(|e| self.classify(e.detail))
    }

    /// A failure after the event loop has ended means the browser is gone.
    fn classify(&self, detail: String) -> RenderFailure {
        if self.events.is_finished() {
            RenderFailure::fatal(detail)
        } else {
            RenderFailure::page(detail)
        }
    }
}

fn print_params(size: PageSize) -> PrintToPdfParams {
    PrintToPdfParams {
        paper_width: Some(size.width_in),
        paper_height: Some(size.height_in),
        margin_top: Some(0.0),
        margin_bottom: Some(0.0),
        margin_left: Some(0.0),
        margin_right: Some(0.0),
        print_background: Some(true),
        prefer_css_page_size: Some(false),
        ..Default::default()
    }
}

impl PageRenderer for ChromeRenderer {
    async fn render(&mut self, document: &[u8], size: PageSize) -> Result<Vec<u8>, RenderFailure> {
        let html = String::from_utf8_lossy(document).into_owned();
        match tokio::time::timeout(self.page_timeout, self.print(html, size)).await {
            Ok(result) => result,
            Err(_) => Err(self.classify(format!(
                "timed out after {}s",
                self.page_timeout.as_secs()
            ))),
        }
    }

    async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            warn!("Closing browser failed: {}", e);
        }
        let _ = self.browser.wait().await;
        self.events.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn print_params_use_page_size_without_margins() {
        let p = print_params(PageSize::from_aspect(8.5, 1.5));
        assert_eq!(p.paper_width, Some(8.5));
        assert_eq!(p.paper_height, Some(12.75));
        assert_eq!(p.margin_left, Some(0.0));
        assert_eq!(p.print_background, Some(true));
        assert_eq!(p.prefer_css_page_size, Some(false));
    }

    #[test]
    fn default_factory_autodetects_browser() {
        let f = ChromeRendererFactory::default();
        assert!(f.executable.is_none());
        assert_eq!(f.page_timeout, Duration::from_secs(120));
    }
}
