//! In-process request and render metrics.
//!
//! Typed atomic counters with per-site breakdowns and a fixed-bucket
//! render-duration histogram, snapshotted into serializable structs for
//! the admin surface. Static-asset requests are excluded from request
//! counters by the dispatcher.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Upper bounds (seconds) for the render-duration histogram
const RENDER_BUCKETS: &[f64] = &[0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

#[derive(Default)]
struct SiteCounters {
    requests: AtomicU64,
    crawler_requests: AtomicU64,
    blocked: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    render_errors: AtomicU64,
}

/// Shared metrics sink
#[derive(Default)]
pub struct Metrics {
    requests: AtomicU64,
    crawler_requests: AtomicU64,
    blocked: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    render_errors: AtomicU64,
    dropped_logs: AtomicU64,
    render_bucket_counts: [AtomicU64; 7],
    render_duration_sum_ms: AtomicU64,
    per_site: DashMap<String, Arc<SiteCounters>>,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn site(&self, site: &str) -> Arc<SiteCounters> {
        self.per_site
            .entry(site.to_string())
            .or_default()
            .clone()
    }

    pub fn record_request(&self, site: &str) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.site(site).requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_crawler_request(&self, site: &str) {
        self.crawler_requests.fetch_add(1, Ordering::Relaxed);
        self.site(site).crawler_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blocked(&self, site: &str) {
        self.blocked.fetch_add(1, Ordering::Relaxed);
        self.site(site).blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self, site: &str) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        self.site(site).cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self, site: &str) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        self.site(site).cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_render_error(&self, site: &str) {
        self.render_errors.fetch_add(1, Ordering::Relaxed);
        self.site(site).render_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_log(&self) {
        self.dropped_logs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_render_duration(&self, seconds: f64) {
        let bucket = RENDER_BUCKETS
            .iter()
            .position(|&upper| seconds <= upper)
            .unwrap_or(RENDER_BUCKETS.len());
        self.render_bucket_counts[bucket].fetch_add(1, Ordering::Relaxed);
        self.render_duration_sum_ms
            .fetch_add((seconds * 1000.0) as u64, Ordering::Relaxed);
    }

    /// Remove a site's counters (on site delete)
    pub fn forget_site(&self, site: &str) {
        self.per_site.remove(site);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let render_total: u64 = self
            .render_bucket_counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum();

        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            crawler_requests: self.crawler_requests.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            render_errors: self.render_errors.load(Ordering::Relaxed),
            dropped_logs: self.dropped_logs.load(Ordering::Relaxed),
            render: RenderHistogram {
                count: render_total,
                sum_ms: self.render_duration_sum_ms.load(Ordering::Relaxed),
                buckets: RENDER_BUCKETS
                    .iter()
                    .enumerate()
                    .map(|(i, &upper)| HistogramBucket {
                        le: upper,
                        count: self.render_bucket_counts[i].load(Ordering::Relaxed),
                    })
                    .collect(),
                overflow: self.render_bucket_counts[RENDER_BUCKETS.len()]
                    .load(Ordering::Relaxed),
            },
            sites: self
                .per_site
                .iter()
                .map(|entry| SiteMetricsSnapshot {
                    site: entry.key().clone(),
                    requests: entry.requests.load(Ordering::Relaxed),
                    crawler_requests: entry.crawler_requests.load(Ordering::Relaxed),
                    blocked: entry.blocked.load(Ordering::Relaxed),
                    cache_hits: entry.cache_hits.load(Ordering::Relaxed),
                    cache_misses: entry.cache_misses.load(Ordering::Relaxed),
                    render_errors: entry.render_errors.load(Ordering::Relaxed),
                })
                .collect(),
        }
    }
}

/// Point-in-time metrics view returned by the admin API
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub crawler_requests: u64,
    pub blocked: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub render_errors: u64,
    pub dropped_logs: u64,
    pub render: RenderHistogram,
    pub sites: Vec<SiteMetricsSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RenderHistogram {
    pub count: u64,
    pub sum_ms: u64,
    pub buckets: Vec<HistogramBucket>,
    /// Renders slower than the largest bucket bound
    pub overflow: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramBucket {
    pub le: f64,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SiteMetricsSnapshot {
    pub site: String,
    pub requests: u64,
    pub crawler_requests: u64,
    pub blocked: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub render_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate_per_site() {
        let metrics = Metrics::new();
        metrics.record_request("s1");
        metrics.record_request("s1");
        metrics.record_request("s2");
        metrics.record_blocked("s2");

        let snap = metrics.snapshot();
        assert_eq!(snap.requests, 3);
        assert_eq!(snap.blocked, 1);

        let s1 = snap.sites.iter().find(|s| s.site == "s1").unwrap();
        assert_eq!(s1.requests, 2);
        let s2 = snap.sites.iter().find(|s| s.site == "s2").unwrap();
        assert_eq!(s2.blocked, 1);
    }

    #[test]
    fn test_render_histogram_buckets() {
        let metrics = Metrics::new();
        metrics.record_render_duration(0.3);
        metrics.record_render_duration(1.7);
        metrics.record_render_duration(45.0);

        let snap = metrics.snapshot();
        assert_eq!(snap.render.count, 3);
        assert_eq!(snap.render.buckets[0].count, 1); // <= 0.5
        assert_eq!(snap.render.buckets[2].count, 1); // <= 2.5
        assert_eq!(snap.render.overflow, 1);
        assert_eq!(snap.render.sum_ms, 300 + 1700 + 45_000);
    }

    #[test]
    fn test_forget_site() {
        let metrics = Metrics::new();
        metrics.record_request("s1");
        metrics.forget_site("s1");
        assert!(metrics.snapshot().sites.is_empty());
    }
}
