//! Push worker: submits site URLs to search-engine indexing APIs.
//!
//! URLs come from the site's known-URL set starting at the stored
//! offset; one worker per configured engine submits batches capped by
//! that engine's remaining daily quota. Quota exhaustion is a normal
//! early stop, not an error, and re-invoking resumes from the stored
//! offset.

use crate::config::{PushEngineConfig, SiteConfig};
use crate::error::StoreError;
use crate::store::Store;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// URLs submitted per request to a push endpoint
const PUSH_BATCH_SIZE: usize = 100;

/// Timeout for one submission request
const PUSH_TIMEOUT_SECS: u64 = 30;

/// One per-URL submission outcome, persisted to the capped push log
#[derive(Debug, Clone, Serialize)]
pub struct PushLogEntry {
    pub engine: String,
    pub url: String,
    pub success: bool,
    pub message: String,
    pub timestamp: i64,
}

/// Result of one push run
#[derive(Debug, Default, Clone, Serialize)]
pub struct PushRunSummary {
    pub submitted: Vec<EngineSubmission>,
    /// How far the site's offset advanced
    pub offset_advanced: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineSubmission {
    pub engine: String,
    pub submitted: u64,
    pub quota_exhausted: bool,
}

/// Point-in-time push statistics for the admin surface
#[derive(Debug, Clone, Serialize)]
pub struct PushStats {
    pub last_push_date: String,
    pub push_offset: u64,
    pub total_urls: u64,
    pub today: Vec<EngineDailyCount>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineDailyCount {
    pub engine: String,
    pub submitted: u64,
    pub daily_limit: u64,
}

/// Executes push runs
pub struct PushRunner {
    store: Arc<dyn Store>,
    client: reqwest::Client,
}

impl PushRunner {
    pub fn new(store: Arc<dyn Store>) -> Arc<Self> {
        Arc::new(Self {
            store,
            client: reqwest::Client::new(),
        })
    }

    /// Start a push run in the background; returns its task ID
    pub async fn trigger(self: &Arc<Self>, site: Arc<SiteConfig>) -> Result<String, StoreError> {
        let task_id = Uuid::new_v4().to_string();
        let runner = Arc::clone(self);
        let spawned_task_id = task_id.clone();
        tokio::spawn(async move {
            match runner.run(&site).await {
                Ok(summary) => {
                    info!(
                        site = %site.id,
                        task = %spawned_task_id,
                        advanced = summary.offset_advanced,
                        "Push run finished"
                    );
                }
                Err(e) => {
                    warn!(site = %site.id, task = %spawned_task_id, error = %e, "Push run failed");
                }
            }
        });
        Ok(task_id)
    }

    /// Execute one push run to completion
    pub async fn run(&self, site: &SiteConfig) -> Result<PushRunSummary, StoreError> {
        let engines = &site.render.push.engines;
        if engines.is_empty() {
            return Ok(PushRunSummary::default());
        }

        let urls = self.store.urls(&site.id).await?;
        let mut meta = self.store.push_meta(&site.id).await?;
        let today = Utc::now().format("%Y-%m-%d").to_string();

        let pending: Vec<String> = urls
            .into_iter()
            .skip(meta.push_offset as usize)
            .collect();
        if pending.is_empty() {
            debug!(site = %site.id, "No unsent URLs");
            return Ok(PushRunSummary::default());
        }

        // One worker per engine; each is capped by its own remaining
        // daily quota
        let mut workers = JoinSet::new();
        for engine in engines.clone() {
            let store = Arc::clone(&self.store);
            let client = self.client.clone();
            let site_id = site.id.clone();
            let date = today.clone();
            let pending = pending.clone();

            workers.spawn(async move {
                push_to_engine(&*store, &client, &site_id, &date, &engine, &pending).await
            });
        }

        let mut summary = PushRunSummary::default();
        while let Some(result) = workers.join_next().await {
            match result {
                Ok(Ok(submission)) => {
                    summary.offset_advanced = summary.offset_advanced.max(submission.submitted);
                    summary.submitted.push(submission);
                }
                Ok(Err(e)) => warn!(site = %site.id, error = %e, "Push engine worker failed"),
                Err(e) => warn!(site = %site.id, error = %e, "Push engine worker panicked"),
            }
        }

        // URLs count as sent once any engine accepted them
        if summary.offset_advanced > 0 {
            meta.push_offset += summary.offset_advanced;
        }
        meta.last_push_date = today;
        self.store.set_push_meta(&site.id, &meta).await?;

        Ok(summary)
    }

    /// Push statistics for the admin surface
    pub async fn stats(&self, site: &SiteConfig) -> Result<PushStats, StoreError> {
        let meta = self.store.push_meta(&site.id).await?;
        let today = Utc::now().format("%Y-%m-%d").to_string();

        let mut daily = Vec::new();
        for engine in &site.render.push.engines {
            daily.push(EngineDailyCount {
                engine: engine.name.clone(),
                submitted: self
                    .store
                    .daily_count(&site.id, &today, &engine.name)
                    .await?,
                daily_limit: engine.daily_limit,
            });
        }

        Ok(PushStats {
            last_push_date: meta.last_push_date,
            push_offset: meta.push_offset,
            total_urls: self.store.url_count(&site.id).await?,
            today: daily,
        })
    }
}

/// How many URLs an engine may still submit today
pub fn remaining_quota(daily_limit: u64, submitted_today: u64) -> u64 {
    daily_limit.saturating_sub(submitted_today)
}

async fn push_to_engine(
    store: &dyn Store,
    client: &reqwest::Client,
    site_id: &str,
    date: &str,
    engine: &PushEngineConfig,
    pending: &[String],
) -> Result<EngineSubmission, StoreError> {
    let submitted_today = store.daily_count(site_id, date, &engine.name).await?;
    let quota = remaining_quota(engine.daily_limit, submitted_today);
    if quota == 0 {
        debug!(site = site_id, engine = %engine.name, "Daily quota exhausted before run");
        return Ok(EngineSubmission {
            engine: engine.name.clone(),
            submitted: 0,
            quota_exhausted: true,
        });
    }

    let take = (quota as usize).min(pending.len());
    let mut submitted = 0u64;
    let endpoint = format!(
        "{}{}token={}",
        engine.api,
        if engine.api.contains('?') { "&" } else { "?" },
        urlencoding::encode(&engine.token)
    );

    for batch in pending[..take].chunks(PUSH_BATCH_SIZE) {
        let body = batch.join("\n");
        let result = client
            .post(&endpoint)
            .header("Content-Type", "text/plain")
            .body(body)
            .timeout(std::time::Duration::from_secs(PUSH_TIMEOUT_SECS))
            .send()
            .await;

        let (success, message) = match result {
            Ok(response) if response.status().is_success() => {
                (true, format!("accepted ({})", response.status()))
            }
            Ok(response) => (false, format!("rejected ({})", response.status())),
            Err(e) => (false, e.to_string()),
        };

        let now = Utc::now().timestamp();
        for url in batch {
            let entry = PushLogEntry {
                engine: engine.name.clone(),
                url: url.clone(),
                success,
                message: message.clone(),
                timestamp: now,
            };
            if let Ok(json) = serde_json::to_string(&entry) {
                store.append_push_log(site_id, &json).await?;
            }
        }

        if !success {
            // Submission failures stop this engine's run; the offset
            // only advances past accepted URLs
            warn!(site = site_id, engine = %engine.name, message, "Push batch rejected");
            break;
        }

        submitted += batch.len() as u64;
        store
            .incr_daily_count(site_id, date, &engine.name, batch.len() as u64)
            .await?;
    }

    Ok(EngineSubmission {
        engine: engine.name.clone(),
        submitted,
        quota_exhausted: submitted == quota,
    })
}
