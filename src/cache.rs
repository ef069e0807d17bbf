//! Render Cache Engine: serves crawler requests from prerendered HTML.
//!
//! Cache hits never touch the rendering backend. Misses render with the
//! site's timeout, persist the outcome (HTML + status hash) and register
//! the URL in the site's known-URL set. A failed render is recorded as
//! `failed`, never `cached`, so the next request retries.

use crate::access_log::{LogQueue, LogRecord};
use crate::browser::{render_seconds, RenderOptions, RenderedPage, Renderer};
use crate::config::{SiteConfig, SiteDefaults};
use crate::error::{RenderError, StoreError};
use crate::metrics::Metrics;
use crate::store::{CacheEntry, CacheStatus, Store};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Render(#[from] RenderError),
}

/// Request context for crawler access logging
#[derive(Debug, Clone)]
pub struct CrawlerRequest {
    pub ip: String,
    pub path: String,
    pub user_agent: String,
}

/// Crawler-facing render cache
pub struct RenderCacheEngine {
    store: Arc<dyn Store>,
    renderer: Arc<dyn Renderer>,
    metrics: Arc<Metrics>,
    log: LogQueue,
}

impl RenderCacheEngine {
    pub fn new(
        store: Arc<dyn Store>,
        renderer: Arc<dyn Renderer>,
        metrics: Arc<Metrics>,
        log: LogQueue,
    ) -> Self {
        Self {
            store,
            renderer,
            metrics,
            log,
        }
    }

    /// Serve a crawler request: cached HTML when available, a fresh
    /// render otherwise. Returns the HTML and whether it was a cache hit.
    pub async fn handle_crawler_request(
        &self,
        site: &SiteConfig,
        defaults: &SiteDefaults,
        url: &str,
        request: &CrawlerRequest,
    ) -> Result<(String, bool), CacheError> {
        self.metrics.record_crawler_request(&site.id);
        let cache_ttl = site.cache_ttl(defaults);

        let entry = self.store.cache_entry(&site.id, url).await?;
        if matches!(entry, Some(CacheEntry { status: CacheStatus::Cached, .. })) {
            if let Some(html) = self.store.cached_html(&site.id, url).await? {
                self.metrics.record_cache_hit(&site.id);
                self.log.record(LogRecord::Crawler {
                    site: site.id.clone(),
                    ip: request.ip.clone(),
                    path: request.path.clone(),
                    user_agent: request.user_agent.clone(),
                    status: 200,
                    hit_cache: true,
                    cache_ttl_secs: cache_ttl.as_secs(),
                    render_time: 0.0,
                    timestamp: LogRecord::now_ts(),
                });
                return Ok((html, true));
            }
            // Status says cached but the HTML has expired; fall through
            // to a fresh render
            debug!(site = %site.id, url, "Cache entry without HTML, re-rendering");
        }

        self.metrics.record_cache_miss(&site.id);
        match self.refresh(site, defaults, url).await {
            Ok(page) => {
                self.log.record(LogRecord::Crawler {
                    site: site.id.clone(),
                    ip: request.ip.clone(),
                    path: request.path.clone(),
                    user_agent: request.user_agent.clone(),
                    status: 200,
                    hit_cache: false,
                    cache_ttl_secs: cache_ttl.as_secs(),
                    render_time: render_seconds(page.elapsed),
                    timestamp: LogRecord::now_ts(),
                });
                Ok((page.html, false))
            }
            Err(e) => {
                self.log.record(LogRecord::Crawler {
                    site: site.id.clone(),
                    ip: request.ip.clone(),
                    path: request.path.clone(),
                    user_agent: request.user_agent.clone(),
                    status: 500,
                    hit_cache: false,
                    cache_ttl_secs: cache_ttl.as_secs(),
                    render_time: 0.0,
                    timestamp: LogRecord::now_ts(),
                });
                Err(e)
            }
        }
    }

    /// Render a URL and persist the outcome, bypassing the cache-hit
    /// check. This is the preheat path: preheat intends to refresh.
    pub async fn refresh(
        &self,
        site: &SiteConfig,
        defaults: &SiteDefaults,
        url: &str,
    ) -> Result<RenderedPage, CacheError> {
        let options = RenderOptions {
            timeout: site.render_timeout(defaults),
        };

        match self.renderer.render(url, &options).await {
            Ok(page) => {
                self.store
                    .store_html(&site.id, url, &page.html, site.cache_ttl(defaults))
                    .await?;
                self.store
                    .set_cache_entry(
                        &site.id,
                        url,
                        &CacheEntry {
                            status: CacheStatus::Cached,
                            cache_size: page.html.len() as u64,
                            updated_at: Utc::now().timestamp(),
                        },
                    )
                    .await?;
                self.store.add_urls(&site.id, &[url.to_string()]).await?;
                debug!(site = %site.id, url, bytes = page.html.len(), "Rendered and cached");
                Ok(page)
            }
            Err(e) => {
                self.metrics.record_render_error(&site.id);
                warn!(site = %site.id, url, error = %e, "Render failed");
                // Record the failure but never overwrite toward `cached`
                self.store
                    .set_cache_entry(
                        &site.id,
                        url,
                        &CacheEntry {
                            status: CacheStatus::Failed,
                            cache_size: 0,
                            updated_at: Utc::now().timestamp(),
                        },
                    )
                    .await?;
                Err(e.into())
            }
        }
    }
}
