//! Key-value store access for per-site gateway state.
//!
//! All cross-component state (URL sets, cache status, task records, push
//! cursors, rate-limit counters, sessions) lives in a Redis-compatible
//! store and is mutated through atomic operations (INCR, SET NX, EXPIRE)
//! so correctness does not depend on single-process deployment. The
//! [`Store`] trait fronts the schema; [`RedisStore`] is the production
//! implementation and [`MemoryStore`] backs tests.

use crate::error::StoreError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Capped length for push and access log lists
pub const LOG_LIST_CAP: isize = 1000;

/// TTL for push and access log lists (30 days)
pub const LOG_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// TTL for preheat task records (24 hours)
pub const TASK_TTL_SECS: u64 = 24 * 60 * 60;

/// TTL for the preheat running flag; a crashed run re-arms after this
pub const PREHEAT_FLAG_TTL_SECS: u64 = 2 * 60 * 60;

// Key schema, namespaced by site ID and URL
pub fn url_set_key(site: &str) -> String {
    format!("prerender:{}:urls", site)
}

pub fn url_meta_key(site: &str, url: &str) -> String {
    format!("prerender:{}:url:{}", site, url)
}

pub fn html_key(site: &str, url: &str) -> String {
    format!("prerender:{}:html:{}", site, url)
}

pub fn preheat_flag_key(site: &str) -> String {
    format!("prerender:{}:status", site)
}

pub fn task_key(site: &str, task_id: &str) -> String {
    format!("prerender:{}:task:{}", site, task_id)
}

pub fn current_task_key(site: &str) -> String {
    format!("prerender:{}:current_task", site)
}

pub fn push_logs_key(site: &str) -> String {
    format!("prerender:{}:push:logs", site)
}

pub fn push_daily_key(site: &str, date: &str) -> String {
    format!("prerender:{}:push:daily:{}", site, date)
}

pub fn push_meta_key(site: &str) -> String {
    format!("prerender:{}:push:meta", site)
}

pub fn access_log_key(site: &str) -> String {
    format!("prerender:{}:access_log", site)
}

pub fn ratelimit_key(site: &str, ip: &str) -> String {
    format!("ratelimit:{}:{}", site, ip)
}

pub fn session_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

/// Render outcome recorded for a URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Cached,
    Failed,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Cached => "cached",
            CacheStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cached" => Some(CacheStatus::Cached),
            "failed" => Some(CacheStatus::Failed),
            _ => None,
        }
    }
}

/// Cache state for one (site, URL) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub status: CacheStatus,
    pub cache_size: u64,
    pub updated_at: i64,
}

/// Aggregate cache statistics for a site. `total_bytes` sums the
/// persisted `cache_size` fields of `cached` entries.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub cached: u64,
    pub failed: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

/// Progress record for a preheat task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRecord {
    pub status: TaskStatus,
    pub total_urls: u64,
    pub processed: u64,
    pub success: u64,
    pub failed: u64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TaskRecord {
    pub fn new(total_urls: u64, now: i64) -> Self {
        Self {
            status: TaskStatus::Running,
            total_urls,
            processed: 0,
            success: 0,
            failed: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Push cursor state for a site
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PushMeta {
    pub last_push_date: String,
    pub push_offset: u64,
}

/// Server-side session record; deleting it revokes the token
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    pub user_id: String,
    pub created_at: i64,
    pub expires_at: i64,
}

/// Store operations used across the gateway. Implementations must make
/// counter and flag mutations atomic.
#[async_trait]
pub trait Store: Send + Sync {
    /// Add URLs to the site's known-URL set; returns how many were new
    async fn add_urls(&self, site: &str, urls: &[String]) -> Result<u64, StoreError>;

    /// All known URLs for a site, in set-iteration order
    async fn urls(&self, site: &str) -> Result<Vec<String>, StoreError>;

    async fn url_count(&self, site: &str) -> Result<u64, StoreError>;

    async fn cache_entry(&self, site: &str, url: &str) -> Result<Option<CacheEntry>, StoreError>;

    async fn set_cache_entry(
        &self,
        site: &str,
        url: &str,
        entry: &CacheEntry,
    ) -> Result<(), StoreError>;

    async fn cached_html(&self, site: &str, url: &str) -> Result<Option<String>, StoreError>;

    async fn store_html(
        &self,
        site: &str,
        url: &str,
        html: &str,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    async fn cache_stats(&self, site: &str) -> Result<CacheStats, StoreError>;

    /// Atomically acquire the per-site preheat flag (SET NX). Returns
    /// false when a preheat is already running.
    async fn try_acquire_preheat(&self, site: &str) -> Result<bool, StoreError>;

    async fn release_preheat(&self, site: &str) -> Result<(), StoreError>;

    async fn put_task(
        &self,
        site: &str,
        task_id: &str,
        record: &TaskRecord,
    ) -> Result<(), StoreError>;

    async fn get_task(&self, site: &str, task_id: &str) -> Result<Option<TaskRecord>, StoreError>;

    async fn set_current_task(&self, site: &str, task_id: &str) -> Result<(), StoreError>;

    async fn current_task(&self, site: &str) -> Result<Option<String>, StoreError>;

    async fn push_meta(&self, site: &str) -> Result<PushMeta, StoreError>;

    async fn set_push_meta(&self, site: &str, meta: &PushMeta) -> Result<(), StoreError>;

    /// Atomically add to the per-engine submitted count for a calendar
    /// day; returns the new count
    async fn incr_daily_count(
        &self,
        site: &str,
        date: &str,
        engine: &str,
        by: u64,
    ) -> Result<u64, StoreError>;

    async fn daily_count(&self, site: &str, date: &str, engine: &str) -> Result<u64, StoreError>;

    /// Append to the capped push log list
    async fn append_push_log(&self, site: &str, entry: &str) -> Result<(), StoreError>;

    async fn push_logs(&self, site: &str, limit: isize) -> Result<Vec<String>, StoreError>;

    /// Append to the capped access log list
    async fn append_access_log(&self, site: &str, entry: &str) -> Result<(), StoreError>;

    async fn access_logs(&self, site: &str, limit: isize) -> Result<Vec<String>, StoreError>;

    /// Increment the per-(site, IP) request counter. The first increment
    /// of a window arms the key's expiry to the window length. Returns
    /// the post-increment value.
    async fn incr_rate(
        &self,
        site: &str,
        ip: &str,
        window: Duration,
    ) -> Result<u64, StoreError>;

    /// Extend the counter's life after a block so the IP stays over the
    /// limit for the configured ban time
    async fn extend_rate_ban(
        &self,
        site: &str,
        ip: &str,
        ban: Duration,
    ) -> Result<(), StoreError>;

    async fn put_session(
        &self,
        session_id: &str,
        record: &SessionRecord,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError>;

    async fn delete_session(&self, session_id: &str) -> Result<(), StoreError>;

    /// Remove every store-resident key for a site
    async fn purge_site(&self, site: &str) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// Redis implementation
// ---------------------------------------------------------------------------

/// Production store over a Redis-compatible server
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    async fn scan_delete(&self, pattern: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let keys: Vec<String> = {
            let mut iter = conn.scan_match::<_, String>(pattern).await?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };
        if !keys.is_empty() {
            conn.del::<_, ()>(keys).await?;
        }
        Ok(())
    }
}

fn entry_from_hash(key: &str, map: HashMap<String, String>) -> Result<Option<CacheEntry>, StoreError> {
    if map.is_empty() {
        return Ok(None);
    }
    let status = map
        .get("status")
        .and_then(|s| CacheStatus::parse(s))
        .ok_or_else(|| StoreError::Malformed {
            key: key.to_string(),
            detail: "missing or unknown status".to_string(),
        })?;
    let cache_size = map
        .get("cache_size")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let updated_at = map
        .get("updated_at")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    Ok(Some(CacheEntry {
        status,
        cache_size,
        updated_at,
    }))
}

fn task_from_hash(map: HashMap<String, String>) -> Option<TaskRecord> {
    let status = TaskStatus::parse(map.get("status")?)?;
    fn field<T: std::str::FromStr + Default>(map: &HashMap<String, String>, name: &str) -> T {
        map.get(name).and_then(|s| s.parse().ok()).unwrap_or_default()
    }
    Some(TaskRecord {
        status,
        total_urls: field(&map, "total_urls"),
        processed: field(&map, "processed"),
        success: field(&map, "success"),
        failed: field(&map, "failed"),
        created_at: field(&map, "created_at"),
        updated_at: field(&map, "updated_at"),
    })
}

#[async_trait]
impl Store for RedisStore {
    async fn add_urls(&self, site: &str, urls: &[String]) -> Result<u64, StoreError> {
        if urls.is_empty() {
            return Ok(0);
        }
        let added: u64 = self.conn().sadd(url_set_key(site), urls).await?;
        Ok(added)
    }

    async fn urls(&self, site: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.conn().smembers(url_set_key(site)).await?)
    }

    async fn url_count(&self, site: &str) -> Result<u64, StoreError> {
        Ok(self.conn().scard(url_set_key(site)).await?)
    }

    async fn cache_entry(&self, site: &str, url: &str) -> Result<Option<CacheEntry>, StoreError> {
        let key = url_meta_key(site, url);
        let map: HashMap<String, String> = self.conn().hgetall(&key).await?;
        entry_from_hash(&key, map)
    }

    async fn set_cache_entry(
        &self,
        site: &str,
        url: &str,
        entry: &CacheEntry,
    ) -> Result<(), StoreError> {
        let key = url_meta_key(site, url);
        self.conn()
            .hset_multiple::<_, _, _, ()>(
                &key,
                &[
                    ("status", entry.status.as_str().to_string()),
                    ("cache_size", entry.cache_size.to_string()),
                    ("updated_at", entry.updated_at.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn cached_html(&self, site: &str, url: &str) -> Result<Option<String>, StoreError> {
        Ok(self.conn().get(html_key(site, url)).await?)
    }

    async fn store_html(
        &self,
        site: &str,
        url: &str,
        html: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.conn()
            .set_ex::<_, _, ()>(html_key(site, url), html, ttl.as_secs())
            .await?;
        Ok(())
    }

    async fn cache_stats(&self, site: &str) -> Result<CacheStats, StoreError> {
        let mut stats = CacheStats::default();
        for url in self.urls(site).await? {
            if let Some(entry) = self.cache_entry(site, &url).await? {
                match entry.status {
                    CacheStatus::Cached => {
                        stats.cached += 1;
                        stats.total_bytes += entry.cache_size;
                    }
                    CacheStatus::Failed => stats.failed += 1,
                }
            }
        }
        Ok(stats)
    }

    async fn try_acquire_preheat(&self, site: &str) -> Result<bool, StoreError> {
        // SET NX EX: the flag both serializes tasks and self-heals if a
        // run dies without releasing it
        let acquired: bool = redis::cmd("SET")
            .arg(preheat_flag_key(site))
            .arg("running")
            .arg("NX")
            .arg("EX")
            .arg(PREHEAT_FLAG_TTL_SECS)
            .query_async(&mut self.conn())
            .await?;
        Ok(acquired)
    }

    async fn release_preheat(&self, site: &str) -> Result<(), StoreError> {
        self.conn().del::<_, ()>(preheat_flag_key(site)).await?;
        Ok(())
    }

    async fn put_task(
        &self,
        site: &str,
        task_id: &str,
        record: &TaskRecord,
    ) -> Result<(), StoreError> {
        let key = task_key(site, task_id);
        let mut conn = self.conn();
        conn.hset_multiple::<_, _, _, ()>(
            &key,
            &[
                ("status", record.status.as_str().to_string()),
                ("total_urls", record.total_urls.to_string()),
                ("processed", record.processed.to_string()),
                ("success", record.success.to_string()),
                ("failed", record.failed.to_string()),
                ("created_at", record.created_at.to_string()),
                ("updated_at", record.updated_at.to_string()),
            ],
        )
        .await?;
        conn.expire::<_, ()>(&key, TASK_TTL_SECS as i64).await?;
        Ok(())
    }

    async fn get_task(&self, site: &str, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let map: HashMap<String, String> = self.conn().hgetall(task_key(site, task_id)).await?;
        Ok(task_from_hash(map))
    }

    async fn set_current_task(&self, site: &str, task_id: &str) -> Result<(), StoreError> {
        self.conn()
            .set::<_, _, ()>(current_task_key(site), task_id)
            .await?;
        Ok(())
    }

    async fn current_task(&self, site: &str) -> Result<Option<String>, StoreError> {
        Ok(self.conn().get(current_task_key(site)).await?)
    }

    async fn push_meta(&self, site: &str) -> Result<PushMeta, StoreError> {
        let map: HashMap<String, String> = self.conn().hgetall(push_meta_key(site)).await?;
        Ok(PushMeta {
            last_push_date: map.get("last_push_date").cloned().unwrap_or_default(),
            push_offset: map
                .get("push_offset")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
        })
    }

    async fn set_push_meta(&self, site: &str, meta: &PushMeta) -> Result<(), StoreError> {
        self.conn()
            .hset_multiple::<_, _, _, ()>(
                push_meta_key(site),
                &[
                    ("last_push_date", meta.last_push_date.clone()),
                    ("push_offset", meta.push_offset.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn incr_daily_count(
        &self,
        site: &str,
        date: &str,
        engine: &str,
        by: u64,
    ) -> Result<u64, StoreError> {
        let key = push_daily_key(site, date);
        let mut conn = self.conn();
        let count: u64 = conn.hincr(&key, engine, by).await?;
        // Daily keys only matter for ~a day; keep them two to be safe
        conn.expire::<_, ()>(&key, 2 * 24 * 60 * 60).await?;
        Ok(count)
    }

    async fn daily_count(&self, site: &str, date: &str, engine: &str) -> Result<u64, StoreError> {
        let count: Option<u64> = self.conn().hget(push_daily_key(site, date), engine).await?;
        Ok(count.unwrap_or(0))
    }

    async fn append_push_log(&self, site: &str, entry: &str) -> Result<(), StoreError> {
        let key = push_logs_key(site);
        let mut conn = self.conn();
        conn.lpush::<_, _, ()>(&key, entry).await?;
        conn.ltrim::<_, ()>(&key, 0, LOG_LIST_CAP - 1).await?;
        conn.expire::<_, ()>(&key, LOG_TTL_SECS as i64).await?;
        Ok(())
    }

    async fn push_logs(&self, site: &str, limit: isize) -> Result<Vec<String>, StoreError> {
        Ok(self.conn().lrange(push_logs_key(site), 0, limit - 1).await?)
    }

    async fn append_access_log(&self, site: &str, entry: &str) -> Result<(), StoreError> {
        let key = access_log_key(site);
        let mut conn = self.conn();
        conn.lpush::<_, _, ()>(&key, entry).await?;
        conn.ltrim::<_, ()>(&key, 0, LOG_LIST_CAP - 1).await?;
        conn.expire::<_, ()>(&key, LOG_TTL_SECS as i64).await?;
        Ok(())
    }

    async fn access_logs(&self, site: &str, limit: isize) -> Result<Vec<String>, StoreError> {
        Ok(self
            .conn()
            .lrange(access_log_key(site), 0, limit - 1)
            .await?)
    }

    async fn incr_rate(
        &self,
        site: &str,
        ip: &str,
        window: Duration,
    ) -> Result<u64, StoreError> {
        let key = ratelimit_key(site, ip);
        let mut conn = self.conn();
        let count: u64 = conn.incr(&key, 1u64).await?;
        if count == 1 {
            conn.expire::<_, ()>(&key, window.as_secs() as i64).await?;
        }
        Ok(count)
    }

    async fn extend_rate_ban(
        &self,
        site: &str,
        ip: &str,
        ban: Duration,
    ) -> Result<(), StoreError> {
        self.conn()
            .expire::<_, ()>(ratelimit_key(site, ip), ban.as_secs() as i64)
            .await?;
        Ok(())
    }

    async fn put_session(
        &self,
        session_id: &str,
        record: &SessionRecord,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let key = session_key(session_id);
        let mut conn = self.conn();
        conn.hset_multiple::<_, _, _, ()>(
            &key,
            &[
                ("user_id", record.user_id.clone()),
                ("created_at", record.created_at.to_string()),
                ("expires_at", record.expires_at.to_string()),
            ],
        )
        .await?;
        conn.expire::<_, ()>(&key, ttl.as_secs() as i64).await?;
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let map: HashMap<String, String> = self.conn().hgetall(session_key(session_id)).await?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(SessionRecord {
            user_id: map.get("user_id").cloned().unwrap_or_default(),
            created_at: map
                .get("created_at")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            expires_at: map
                .get("expires_at")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
        }))
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        self.conn().del::<_, ()>(session_key(session_id)).await?;
        Ok(())
    }

    async fn purge_site(&self, site: &str) -> Result<(), StoreError> {
        self.scan_delete(&format!("prerender:{}:*", site)).await?;
        self.scan_delete(&format!("ratelimit:{}:*", site)).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation (tests, single-process development)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    url_sets: HashMap<String, Vec<String>>,
    cache_entries: HashMap<(String, String), CacheEntry>,
    html: HashMap<(String, String), (String, Instant)>,
    preheat_flags: HashMap<String, Instant>,
    tasks: HashMap<(String, String), TaskRecord>,
    current_tasks: HashMap<String, String>,
    push_meta: HashMap<String, PushMeta>,
    daily_counts: HashMap<(String, String, String), u64>,
    push_logs: HashMap<String, Vec<String>>,
    access_logs: HashMap<String, Vec<String>>,
    rate_counters: HashMap<(String, String), (u64, Instant)>,
    sessions: HashMap<String, (SessionRecord, Instant)>,
}

/// Store kept entirely in process memory. Counter and flag semantics
/// mirror the Redis implementation, including window expiry.
#[derive(Default)]
pub struct MemoryStore {
    inner: parking_lot::Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn add_urls(&self, site: &str, urls: &[String]) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        let set = inner.url_sets.entry(site.to_string()).or_default();
        let mut added = 0;
        for url in urls {
            if !set.contains(url) {
                set.push(url.clone());
                added += 1;
            }
        }
        Ok(added)
    }

    async fn urls(&self, site: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .inner
            .lock()
            .url_sets
            .get(site)
            .cloned()
            .unwrap_or_default())
    }

    async fn url_count(&self, site: &str) -> Result<u64, StoreError> {
        Ok(self
            .inner
            .lock()
            .url_sets
            .get(site)
            .map(|s| s.len() as u64)
            .unwrap_or(0))
    }

    async fn cache_entry(&self, site: &str, url: &str) -> Result<Option<CacheEntry>, StoreError> {
        Ok(self
            .inner
            .lock()
            .cache_entries
            .get(&(site.to_string(), url.to_string()))
            .cloned())
    }

    async fn set_cache_entry(
        &self,
        site: &str,
        url: &str,
        entry: &CacheEntry,
    ) -> Result<(), StoreError> {
        self.inner
            .lock()
            .cache_entries
            .insert((site.to_string(), url.to_string()), entry.clone());
        Ok(())
    }

    async fn cached_html(&self, site: &str, url: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.inner.lock();
        let key = (site.to_string(), url.to_string());
        let expired = match inner.html.get(&key) {
            Some((html, expires)) if *expires > Instant::now() => return Ok(Some(html.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.html.remove(&key);
        }
        Ok(None)
    }

    async fn store_html(
        &self,
        site: &str,
        url: &str,
        html: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.inner.lock().html.insert(
            (site.to_string(), url.to_string()),
            (html.to_string(), Instant::now() + ttl),
        );
        Ok(())
    }

    async fn cache_stats(&self, site: &str) -> Result<CacheStats, StoreError> {
        let inner = self.inner.lock();
        let mut stats = CacheStats::default();
        for ((s, _), entry) in inner.cache_entries.iter() {
            if s == site {
                match entry.status {
                    CacheStatus::Cached => {
                        stats.cached += 1;
                        stats.total_bytes += entry.cache_size;
                    }
                    CacheStatus::Failed => stats.failed += 1,
                }
            }
        }
        Ok(stats)
    }

    async fn try_acquire_preheat(&self, site: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if let Some(expires) = inner.preheat_flags.get(site) {
            if *expires > now {
                return Ok(false);
            }
        }
        inner.preheat_flags.insert(
            site.to_string(),
            now + Duration::from_secs(PREHEAT_FLAG_TTL_SECS),
        );
        Ok(true)
    }

    async fn release_preheat(&self, site: &str) -> Result<(), StoreError> {
        self.inner.lock().preheat_flags.remove(site);
        Ok(())
    }

    async fn put_task(
        &self,
        site: &str,
        task_id: &str,
        record: &TaskRecord,
    ) -> Result<(), StoreError> {
        self.inner
            .lock()
            .tasks
            .insert((site.to_string(), task_id.to_string()), record.clone());
        Ok(())
    }

    async fn get_task(&self, site: &str, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self
            .inner
            .lock()
            .tasks
            .get(&(site.to_string(), task_id.to_string()))
            .cloned())
    }

    async fn set_current_task(&self, site: &str, task_id: &str) -> Result<(), StoreError> {
        self.inner
            .lock()
            .current_tasks
            .insert(site.to_string(), task_id.to_string());
        Ok(())
    }

    async fn current_task(&self, site: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().current_tasks.get(site).cloned())
    }

    async fn push_meta(&self, site: &str) -> Result<PushMeta, StoreError> {
        Ok(self
            .inner
            .lock()
            .push_meta
            .get(site)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_push_meta(&self, site: &str, meta: &PushMeta) -> Result<(), StoreError> {
        self.inner
            .lock()
            .push_meta
            .insert(site.to_string(), meta.clone());
        Ok(())
    }

    async fn incr_daily_count(
        &self,
        site: &str,
        date: &str,
        engine: &str,
        by: u64,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        let count = inner
            .daily_counts
            .entry((site.to_string(), date.to_string(), engine.to_string()))
            .or_insert(0);
        *count += by;
        Ok(*count)
    }

    async fn daily_count(&self, site: &str, date: &str, engine: &str) -> Result<u64, StoreError> {
        Ok(self
            .inner
            .lock()
            .daily_counts
            .get(&(site.to_string(), date.to_string(), engine.to_string()))
            .copied()
            .unwrap_or(0))
    }

    async fn append_push_log(&self, site: &str, entry: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let logs = inner.push_logs.entry(site.to_string()).or_default();
        logs.insert(0, entry.to_string());
        logs.truncate(LOG_LIST_CAP as usize);
        Ok(())
    }

    async fn push_logs(&self, site: &str, limit: isize) -> Result<Vec<String>, StoreError> {
        Ok(self
            .inner
            .lock()
            .push_logs
            .get(site)
            .map(|logs| logs.iter().take(limit as usize).cloned().collect())
            .unwrap_or_default())
    }

    async fn append_access_log(&self, site: &str, entry: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let logs = inner.access_logs.entry(site.to_string()).or_default();
        logs.insert(0, entry.to_string());
        logs.truncate(LOG_LIST_CAP as usize);
        Ok(())
    }

    async fn access_logs(&self, site: &str, limit: isize) -> Result<Vec<String>, StoreError> {
        Ok(self
            .inner
            .lock()
            .access_logs
            .get(site)
            .map(|logs| logs.iter().take(limit as usize).cloned().collect())
            .unwrap_or_default())
    }

    async fn incr_rate(
        &self,
        site: &str,
        ip: &str,
        window: Duration,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let key = (site.to_string(), ip.to_string());
        let entry = inner.rate_counters.entry(key).or_insert((0, now + window));
        if entry.1 <= now {
            // Window elapsed: re-arm on this first increment
            *entry = (0, now + window);
        }
        entry.0 += 1;
        Ok(entry.0)
    }

    async fn extend_rate_ban(
        &self,
        site: &str,
        ip: &str,
        ban: Duration,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some((_, expires)) = inner
            .rate_counters
            .get_mut(&(site.to_string(), ip.to_string()))
        {
            *expires = Instant::now() + ban;
        }
        Ok(())
    }

    async fn put_session(
        &self,
        session_id: &str,
        record: &SessionRecord,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.inner.lock().sessions.insert(
            session_id.to_string(),
            (record.clone(), Instant::now() + ttl),
        );
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let mut inner = self.inner.lock();
        let expired = match inner.sessions.get(session_id) {
            Some((record, expires)) if *expires > Instant::now() => {
                return Ok(Some(record.clone()))
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.sessions.remove(session_id);
        }
        Ok(None)
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        self.inner.lock().sessions.remove(session_id);
        Ok(())
    }

    async fn purge_site(&self, site: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.url_sets.remove(site);
        inner.cache_entries.retain(|(s, _), _| s != site);
        inner.html.retain(|(s, _), _| s != site);
        inner.preheat_flags.remove(site);
        inner.tasks.retain(|(s, _), _| s != site);
        inner.current_tasks.remove(site);
        inner.push_meta.remove(site);
        inner.daily_counts.retain(|(s, _, _), _| s != site);
        inner.push_logs.remove(site);
        inner.access_logs.remove(site);
        inner.rate_counters.retain(|(s, _), _| s != site);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_schema() {
        assert_eq!(url_set_key("s1"), "prerender:s1:urls");
        assert_eq!(
            url_meta_key("s1", "https://a.example/x"),
            "prerender:s1:url:https://a.example/x"
        );
        assert_eq!(preheat_flag_key("s1"), "prerender:s1:status");
        assert_eq!(task_key("s1", "t9"), "prerender:s1:task:t9");
        assert_eq!(current_task_key("s1"), "prerender:s1:current_task");
        assert_eq!(push_daily_key("s1", "2026-08-07"), "prerender:s1:push:daily:2026-08-07");
        assert_eq!(ratelimit_key("s1", "10.0.0.1"), "ratelimit:s1:10.0.0.1");
        assert_eq!(session_key("abc"), "session:abc");
    }

    #[tokio::test]
    async fn test_memory_url_set_dedupes() {
        let store = MemoryStore::new();
        let urls = vec!["https://a/1".to_string(), "https://a/2".to_string()];
        assert_eq!(store.add_urls("s1", &urls).await.unwrap(), 2);
        assert_eq!(store.add_urls("s1", &urls).await.unwrap(), 0);
        assert_eq!(store.url_count("s1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_memory_cache_entry_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.cache_entry("s1", "https://a/1").await.unwrap().is_none());

        let entry = CacheEntry {
            status: CacheStatus::Cached,
            cache_size: 2048,
            updated_at: 1_700_000_000,
        };
        store.set_cache_entry("s1", "https://a/1", &entry).await.unwrap();
        assert_eq!(
            store.cache_entry("s1", "https://a/1").await.unwrap().unwrap(),
            entry
        );
    }

    #[tokio::test]
    async fn test_memory_preheat_flag_is_exclusive() {
        let store = MemoryStore::new();
        assert!(store.try_acquire_preheat("s1").await.unwrap());
        assert!(!store.try_acquire_preheat("s1").await.unwrap());
        // Other sites are unaffected
        assert!(store.try_acquire_preheat("s2").await.unwrap());

        store.release_preheat("s1").await.unwrap();
        assert!(store.try_acquire_preheat("s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_rate_counter_window() {
        let store = MemoryStore::new();
        let window = Duration::from_millis(50);
        assert_eq!(store.incr_rate("s1", "1.2.3.4", window).await.unwrap(), 1);
        assert_eq!(store.incr_rate("s1", "1.2.3.4", window).await.unwrap(), 2);
        // Different IP gets its own counter
        assert_eq!(store.incr_rate("s1", "5.6.7.8", window).await.unwrap(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.incr_rate("s1", "1.2.3.4", window).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_memory_cache_stats_sums_bytes() {
        let store = MemoryStore::new();
        store
            .set_cache_entry(
                "s1",
                "https://a/1",
                &CacheEntry { status: CacheStatus::Cached, cache_size: 100, updated_at: 0 },
            )
            .await
            .unwrap();
        store
            .set_cache_entry(
                "s1",
                "https://a/2",
                &CacheEntry { status: CacheStatus::Cached, cache_size: 250, updated_at: 0 },
            )
            .await
            .unwrap();
        store
            .set_cache_entry(
                "s1",
                "https://a/3",
                &CacheEntry { status: CacheStatus::Failed, cache_size: 0, updated_at: 0 },
            )
            .await
            .unwrap();

        let stats = store.cache_stats("s1").await.unwrap();
        assert_eq!(stats.cached, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total_bytes, 350);
    }

    #[tokio::test]
    async fn test_memory_push_log_capped() {
        let store = MemoryStore::new();
        for i in 0..(LOG_LIST_CAP as usize + 10) {
            store
                .append_push_log("s1", &format!("entry-{}", i))
                .await
                .unwrap();
        }
        let logs = store.push_logs("s1", LOG_LIST_CAP + 100).await.unwrap();
        assert_eq!(logs.len(), LOG_LIST_CAP as usize);
        // Newest first
        assert_eq!(logs[0], format!("entry-{}", LOG_LIST_CAP as usize + 9));
    }

    #[tokio::test]
    async fn test_memory_purge_site() {
        let store = MemoryStore::new();
        store.add_urls("s1", &["https://a/1".to_string()]).await.unwrap();
        store.add_urls("s2", &["https://b/1".to_string()]).await.unwrap();
        store
            .store_html("s1", "https://a/1", "<html/>", Duration::from_secs(60))
            .await
            .unwrap();
        store.set_current_task("s1", "t1").await.unwrap();

        store.purge_site("s1").await.unwrap();

        assert_eq!(store.url_count("s1").await.unwrap(), 0);
        assert!(store.cached_html("s1", "https://a/1").await.unwrap().is_none());
        assert!(store.current_task("s1").await.unwrap().is_none());
        // Other sites untouched
        assert_eq!(store.url_count("s2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_memory_session_expiry_and_revocation() {
        let store = MemoryStore::new();
        let record = SessionRecord {
            user_id: "admin".to_string(),
            created_at: 0,
            expires_at: i64::MAX,
        };

        store
            .put_session("sid-1", &record, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(store.get_session("sid-1").await.unwrap().is_some());

        store.delete_session("sid-1").await.unwrap();
        assert!(store.get_session("sid-1").await.unwrap().is_none());

        store
            .put_session("sid-2", &record, Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.get_session("sid-2").await.unwrap().is_none());
    }
}
