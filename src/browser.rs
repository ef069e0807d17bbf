//! Headless rendering backend.
//!
//! The gateway consumes rendering through the [`Renderer`] trait; the
//! browser itself is an opaque collaborator. [`ChromiumRenderer`] is the
//! production implementation: one shared headless Chromium process, one
//! page per render, bounded by a semaphore so a site's pool size caps
//! concurrent pages.

use crate::error::RenderError;
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::Page;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

/// Per-render options derived from site configuration
#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// Hard cap for the whole navigation + settle + capture sequence
    pub timeout: Duration,
}

/// A completed render
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub html: String,
    /// Wall-clock render time
    pub elapsed: Duration,
}

/// Rendering backend contract: fetch a URL in a real browser and return
/// the settled DOM as HTML
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, url: &str, options: &RenderOptions) -> Result<RenderedPage, RenderError>;
}

/// Renderer backed by a shared headless Chromium instance
pub struct ChromiumRenderer {
    browser: Browser,
    _handler: JoinHandle<()>,
    permits: Arc<Semaphore>,
}

impl ChromiumRenderer {
    /// Launch the browser. `max_pages` bounds concurrent renders across
    /// all sites sharing this renderer.
    pub async fn launch(max_pages: usize) -> Result<Self, RenderError> {
        let user_data_dir =
            std::env::temp_dir().join(format!("rendergate_chrome_{}", std::process::id()));
        std::fs::create_dir_all(&user_data_dir)
            .map_err(|e| RenderError::Browser(format!("user data dir: {}", e)))?;

        let config = browser_config(user_data_dir)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| RenderError::Browser(format!("launch failed: {}", e)))?;

        // The handler stream must be polled for the browser to make
        // progress; CDP serialization noise is not actionable
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    let msg = e.to_string();
                    if msg.contains("data did not match any variant") {
                        trace!(error = %msg, "Ignored CDP deserialization noise");
                    } else {
                        error!(error = %msg, "Browser handler error");
                    }
                }
            }
            debug!("Browser handler task finished");
        });

        info!(max_pages, "Headless browser launched");

        Ok(Self {
            browser,
            _handler: handler_task,
            permits: Arc::new(Semaphore::new(max_pages.max(1))),
        })
    }

    async fn render_page(&self, url: &str) -> Result<String, RenderError> {
        let page: Page = self
            .browser
            .new_page(url)
            .await
            .map_err(|e| RenderError::Browser(format!("new page: {}", e)))?;

        // Wait until the network goes idle so client-side rendering has
        // settled before the DOM is captured
        let result = async {
            page.wait_for_navigation()
                .await
                .map_err(|e| RenderError::Browser(format!("navigation: {}", e)))?;
            page.content()
                .await
                .map_err(|e| RenderError::Browser(format!("content: {}", e)))
        }
        .await;

        if let Err(e) = page.close().await {
            debug!(url, error = %e, "Failed to close render page");
        }

        result
    }
}

#[async_trait]
impl Renderer for ChromiumRenderer {
    async fn render(&self, url: &str, options: &RenderOptions) -> Result<RenderedPage, RenderError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| RenderError::Browser("renderer shut down".to_string()))?;

        let start = Instant::now();
        let html = tokio::time::timeout(options.timeout, self.render_page(url))
            .await
            .map_err(|_| RenderError::Timeout(options.timeout.as_secs()))??;

        Ok(RenderedPage {
            html,
            elapsed: start.elapsed(),
        })
    }
}

fn browser_config(user_data_dir: PathBuf) -> Result<BrowserConfig, RenderError> {
    BrowserConfig::builder()
        .user_data_dir(user_data_dir)
        .window_size(1920, 1080)
        .request_timeout(Duration::from_secs(30))
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--disable-extensions")
        .arg("--disable-background-networking")
        .arg("--disable-notifications")
        .arg("--hide-scrollbars")
        .arg("--mute-audio")
        .build()
        .map_err(|e| RenderError::Browser(format!("browser config: {}", e)))
}

/// Renderer that launches the browser on first use.
///
/// Keeps startup fast and lets the gateway run without a browser until
/// crawler traffic (or a preheat run) actually needs one.
pub struct LazyChromiumRenderer {
    max_pages: usize,
    cell: tokio::sync::OnceCell<ChromiumRenderer>,
}

impl LazyChromiumRenderer {
    pub fn new(max_pages: usize) -> Self {
        Self {
            max_pages,
            cell: tokio::sync::OnceCell::new(),
        }
    }
}

#[async_trait]
impl Renderer for LazyChromiumRenderer {
    async fn render(&self, url: &str, options: &RenderOptions) -> Result<RenderedPage, RenderError> {
        let renderer = self
            .cell
            .get_or_try_init(|| ChromiumRenderer::launch(self.max_pages))
            .await?;
        renderer.render(url, options).await
    }
}

/// Round a render duration to two-decimal seconds for log records
pub fn render_seconds(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_seconds_two_decimals() {
        assert_eq!(render_seconds(Duration::from_millis(1234)), 1.23);
        assert_eq!(render_seconds(Duration::from_millis(1235)), 1.24);
        assert_eq!(render_seconds(Duration::from_millis(40)), 0.04);
        assert_eq!(render_seconds(Duration::ZERO), 0.0);
    }
}
