//! Asynchronous access logging with a bounded queue.
//!
//! Request paths never wait on log persistence: records go through a
//! bounded channel with `try_send`, and overflow drops the record while
//! counting the drop. A background writer task drains the queue into the
//! store's capped per-site log lists. Best-effort, no retry.

use crate::metrics::Metrics;
use crate::store::Store;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One persisted access-log record
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogRecord {
    /// A firewall block decision
    Block {
        site: String,
        request_id: String,
        ip: String,
        path: String,
        method: String,
        user_agent: String,
        status: u16,
        rule_id: String,
        reason: String,
        timestamp: i64,
    },
    /// A crawler request served by the render cache engine
    Crawler {
        site: String,
        ip: String,
        path: String,
        user_agent: String,
        status: u16,
        hit_cache: bool,
        cache_ttl_secs: u64,
        /// Render time in seconds, two decimals
        render_time: f64,
        timestamp: i64,
    },
    /// A normal (non-crawler) visit
    Visit {
        site: String,
        ip: String,
        method: String,
        url: String,
        status: u16,
        user_agent: String,
        duration_ms: u64,
        referer: String,
        timestamp: i64,
    },
}

impl LogRecord {
    pub fn site(&self) -> &str {
        match self {
            LogRecord::Block { site, .. } => site,
            LogRecord::Crawler { site, .. } => site,
            LogRecord::Visit { site, .. } => site,
        }
    }

    pub fn now_ts() -> i64 {
        Utc::now().timestamp()
    }
}

/// Non-blocking handle to the log writer
#[derive(Clone)]
pub struct LogQueue {
    tx: mpsc::Sender<LogRecord>,
    metrics: Arc<Metrics>,
}

impl LogQueue {
    /// Create the queue and spawn its writer task. The writer drains
    /// buffered records when shutdown is signaled, then exits.
    pub fn start(
        capacity: usize,
        store: Arc<dyn Store>,
        metrics: Arc<Metrics>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity);
        let writer_metrics = Arc::clone(&metrics);
        let handle = tokio::spawn(async move {
            writer_loop(rx, store, writer_metrics, shutdown_rx).await;
        });
        (Self { tx, metrics }, handle)
    }

    /// Enqueue a record without blocking. On overflow the record is
    /// dropped and counted.
    pub fn record(&self, record: LogRecord) {
        if self.tx.try_send(record).is_err() {
            self.metrics.record_dropped_log();
            debug!("Access log queue full, record dropped");
        }
    }
}

async fn writer_loop(
    mut rx: mpsc::Receiver<LogRecord>,
    store: Arc<dyn Store>,
    metrics: Arc<Metrics>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            record = rx.recv() => {
                match record {
                    Some(record) => write_record(&*store, &record).await,
                    None => break,
                }
            }
            changed = shutdown_rx.changed() => {
                // A dropped sender means shutdown will never be signaled;
                // treat it the same as a shutdown
                if changed.is_err() || *shutdown_rx.borrow() {
                    // Drain whatever is already buffered, then stop
                    while let Ok(record) = rx.try_recv() {
                        write_record(&*store, &record).await;
                    }
                    break;
                }
            }
        }
    }
    let dropped = metrics.snapshot().dropped_logs;
    info!(dropped, "Access log writer stopped");
}

async fn write_record(store: &dyn Store, record: &LogRecord) {
    match record {
        LogRecord::Block { site, ip, path, rule_id, reason, .. } => {
            info!(site, ip, path, rule_id, reason, "Request blocked");
        }
        LogRecord::Crawler { site, ip, path, hit_cache, render_time, .. } => {
            info!(site, ip, path, hit_cache, render_time, "Crawler request");
        }
        LogRecord::Visit { site, method, url, status, duration_ms, .. } => {
            debug!(site, method, url, status, duration_ms, "Visit");
        }
    }

    let json = match serde_json::to_string(record) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "Failed to serialize log record");
            return;
        }
    };

    // Best-effort: a failed store write is logged and forgotten
    if let Err(e) = store.append_access_log(record.site(), &json).await {
        warn!(site = record.site(), error = %e, "Failed to persist log record");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn visit(site: &str, url: &str) -> LogRecord {
        LogRecord::Visit {
            site: site.to_string(),
            ip: "127.0.0.1".to_string(),
            method: "GET".to_string(),
            url: url.to_string(),
            status: 200,
            user_agent: "test".to_string(),
            duration_ms: 3,
            referer: String::new(),
            timestamp: LogRecord::now_ts(),
        }
    }

    #[tokio::test]
    async fn test_records_reach_the_store() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let metrics = Metrics::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (queue, handle) =
            LogQueue::start(16, Arc::clone(&store), Arc::clone(&metrics), shutdown_rx);
        queue.record(visit("s1", "/a"));
        queue.record(visit("s1", "/b"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let logs = store.access_logs("s1", 10).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().any(|l| l.contains("\"/a\"")));

        let _ = shutdown_tx.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    }

    #[tokio::test]
    async fn test_overflow_drops_and_counts() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let metrics = Metrics::new();
        // Never signaled: the writer may be slow to start, which is the
        // overflow case we want
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let (queue, _handle) =
            LogQueue::start(1, Arc::clone(&store), Arc::clone(&metrics), shutdown_rx);
        for i in 0..50 {
            queue.record(visit("s1", &format!("/{}", i)));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        let snap = metrics.snapshot();
        let persisted = store.access_logs("s1", 100).await.unwrap().len() as u64;
        assert_eq!(snap.dropped_logs + persisted, 50);
        assert!(snap.dropped_logs > 0);
    }

    #[test]
    fn test_record_serializes_with_kind_tag() {
        let json = serde_json::to_string(&visit("s1", "/a")).unwrap();
        assert!(json.contains("\"kind\":\"visit\""));
        assert!(json.contains("\"site\":\"s1\""));
    }
}
