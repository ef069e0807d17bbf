//! Preheat worker: background cache warming for a site.
//!
//! A preheat run discovers a site's URLs (sitemap first, then a
//! same-host BFS crawl up to the configured depth) and renders each one
//! through the cache engine's refresh path with bounded concurrency.
//! Runs are serialized per site by a store-level flag; a second trigger
//! while one is running fails with a conflict instead of overlapping.

use crate::cache::RenderCacheEngine;
use crate::config::{SiteConfig, SiteDefaults};
use crate::error::PreheatError;
use crate::store::{Store, TaskRecord, TaskStatus};
use chrono::Utc;
use scraper::{Html, Selector};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// Upper bound on URLs processed in one run
const MAX_PREHEAT_URLS: usize = 500;

/// Timeout for discovery fetches (sitemap, crawl pages)
const DISCOVERY_TIMEOUT_SECS: u64 = 15;

/// Triggers and executes preheat tasks
pub struct PreheatRunner {
    store: Arc<dyn Store>,
    cache: Arc<RenderCacheEngine>,
    client: reqwest::Client,
    defaults: SiteDefaults,
}

impl PreheatRunner {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<RenderCacheEngine>,
        defaults: SiteDefaults,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            cache,
            client: reqwest::Client::new(),
            defaults,
        })
    }

    /// Start a preheat task for the site. Fails fast with
    /// [`PreheatError::AlreadyRunning`] when a task is active; otherwise
    /// returns the new task ID while the run continues in the background.
    pub async fn trigger(self: &Arc<Self>, site: Arc<SiteConfig>) -> Result<String, PreheatError> {
        if !self.store.try_acquire_preheat(&site.id).await? {
            return Err(PreheatError::AlreadyRunning(site.id.clone()));
        }

        let task_id = Uuid::new_v4().to_string();
        let record = TaskRecord::new(0, Utc::now().timestamp());
        self.store.put_task(&site.id, &task_id, &record).await?;
        self.store.set_current_task(&site.id, &task_id).await?;

        info!(site = %site.id, task = %task_id, "Preheat started");

        let runner = Arc::clone(self);
        let spawned_task_id = task_id.clone();
        tokio::spawn(async move {
            runner.run(site, spawned_task_id).await;
        });

        Ok(task_id)
    }

    /// Render and cache a single URL without task bookkeeping
    pub async fn trigger_for_url(&self, site: &SiteConfig, url: &str) -> Result<(), PreheatError> {
        self.cache
            .refresh(site, &self.defaults, url)
            .await
            .map_err(|e| match e {
                crate::cache::CacheError::Store(e) => PreheatError::Store(e),
                crate::cache::CacheError::Render(e) => PreheatError::Render(e),
            })?;
        Ok(())
    }

    async fn run(self: Arc<Self>, site: Arc<SiteConfig>, task_id: String) {
        let result = self.run_inner(&site, &task_id).await;

        let final_status = match result {
            Ok(()) => TaskStatus::Completed,
            Err(ref e) => {
                warn!(site = %site.id, task = %task_id, error = %e, "Preheat run failed");
                TaskStatus::Failed
            }
        };

        if let Ok(Some(mut record)) = self.store.get_task(&site.id, &task_id).await {
            record.status = final_status;
            record.updated_at = Utc::now().timestamp();
            if let Err(e) = self.store.put_task(&site.id, &task_id, &record).await {
                warn!(site = %site.id, error = %e, "Failed to persist final task state");
            }
        }

        if let Err(e) = self.store.release_preheat(&site.id).await {
            warn!(site = %site.id, error = %e, "Failed to release preheat flag");
        }

        info!(site = %site.id, task = %task_id, status = final_status.as_str(), "Preheat finished");
    }

    async fn run_inner(&self, site: &SiteConfig, task_id: &str) -> Result<(), PreheatError> {
        let urls = self.discover_urls(site).await?;
        if urls.is_empty() {
            debug!(site = %site.id, "No URLs discovered");
            return Ok(());
        }

        self.store.add_urls(&site.id, &urls).await?;

        let mut record = self
            .store
            .get_task(&site.id, task_id)
            .await?
            .unwrap_or_else(|| TaskRecord::new(0, Utc::now().timestamp()));
        record.total_urls = urls.len() as u64;
        record.updated_at = Utc::now().timestamp();
        self.store.put_task(&site.id, task_id, &record).await?;

        self.process_urls(site, task_id, urls, record).await;
        Ok(())
    }

    /// Render every URL with bounded concurrency, persisting progress
    /// after each completion
    pub(crate) async fn process_urls(
        &self,
        site: &SiteConfig,
        task_id: &str,
        urls: Vec<String>,
        record: TaskRecord,
    ) {
        let site = Arc::new(site.clone());
        let semaphore = Arc::new(Semaphore::new(site.render.preheat.concurrency.max(1)));
        let progress = Arc::new(Mutex::new(record));
        let mut workers = JoinSet::new();

        for url in urls {
            let semaphore = Arc::clone(&semaphore);
            let cache = Arc::clone(&self.cache);
            let store = Arc::clone(&self.store);
            let progress = Arc::clone(&progress);
            let site = Arc::clone(&site);
            let defaults = self.defaults.clone();
            let task_id = task_id.to_string();

            workers.spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                let ok = cache.refresh(&site, &defaults, &url).await.is_ok();

                let snapshot = {
                    let mut record = progress.lock().await;
                    record.processed += 1;
                    if ok {
                        record.success += 1;
                    } else {
                        record.failed += 1;
                    }
                    record.updated_at = Utc::now().timestamp();
                    record.clone()
                };
                if let Err(e) = store.put_task(&site.id, &task_id, &snapshot).await {
                    warn!(site = %site.id, error = %e, "Failed to persist preheat progress");
                }
            });
        }

        while workers.join_next().await.is_some() {}
    }

    /// Discover candidate URLs: sitemap entries plus a BFS crawl of
    /// same-host links up to the configured depth
    async fn discover_urls(&self, site: &SiteConfig) -> Result<Vec<String>, PreheatError> {
        let Some(domain) = site.domains.first() else {
            return Ok(Vec::new());
        };
        let base = format!("http://{}/", domain);
        let Ok(base_url) = Url::parse(&base) else {
            return Ok(Vec::new());
        };

        let mut discovered: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        // Sitemap first: cheap and authoritative when present
        let sitemap_url = format!("http://{}/sitemap.xml", domain);
        if let Some(body) = self.fetch(&sitemap_url).await {
            for loc in parse_sitemap(&body) {
                if seen.insert(loc.clone()) {
                    discovered.push(loc);
                }
                if discovered.len() >= MAX_PREHEAT_URLS {
                    return Ok(discovered);
                }
            }
        }

        // BFS crawl fills in what the sitemap missed
        let mut queue: VecDeque<(String, u32)> = VecDeque::new();
        queue.push_back((base.clone(), 0));
        if seen.insert(base.clone()) {
            discovered.push(base);
        }

        while let Some((url, depth)) = queue.pop_front() {
            if depth >= site.render.preheat.max_depth || discovered.len() >= MAX_PREHEAT_URLS {
                continue;
            }
            let Some(body) = self.fetch(&url).await else {
                continue;
            };
            for link in extract_links(&body, &base_url) {
                if discovered.len() >= MAX_PREHEAT_URLS {
                    break;
                }
                if seen.insert(link.clone()) {
                    discovered.push(link.clone());
                    queue.push_back((link, depth + 1));
                }
            }
        }

        debug!(site = %site.id, count = discovered.len(), "URLs discovered");
        Ok(discovered)
    }

    async fn fetch(&self, url: &str) -> Option<String> {
        let response = self
            .client
            .get(url)
            .timeout(std::time::Duration::from_secs(DISCOVERY_TIMEOUT_SECS))
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.text().await.ok()
    }
}

/// Pull `<loc>` entries out of a sitemap document
pub fn parse_sitemap(xml: &str) -> Vec<String> {
    let mut urls = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find("<loc>") {
        rest = &rest[start + 5..];
        let Some(end) = rest.find("</loc>") else {
            break;
        };
        let loc = rest[..end].trim();
        if !loc.is_empty() {
            urls.push(loc.to_string());
        }
        rest = &rest[end + 6..];
    }
    urls
}

/// Extract same-host links from a page, resolved against `base` and
/// stripped of fragments
pub fn extract_links(html: &str, base: &Url) -> Vec<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("a[href]").expect("static selector");

    let mut links = Vec::new();
    for element in document.select(&selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let Ok(mut resolved) = base.join(href) else {
            continue;
        };
        resolved.set_fragment(None);
        if resolved.host_str() != base.host_str() {
            continue;
        }
        if !matches!(resolved.scheme(), "http" | "https") {
            continue;
        }
        links.push(resolved.to_string());
    }
    links
}
