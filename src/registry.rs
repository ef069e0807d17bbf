//! Site registry: owns the lifecycle of one engine per site.
//!
//! Reads (`get_engine`) are the hot path and take a read lock only long
//! enough to clone an `Arc`; writes (add/update/remove) briefly exclude
//! readers. Lock guards are never held across an await. Config reloads
//! diff the new site list against the running engines and apply through
//! the same add/update/remove operations.

use crate::config::{Config, SiteConfig};
use crate::engine::{GatewayContext, SiteEngine};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Manages all site engines
pub struct EngineManager {
    engines: RwLock<HashMap<String, Arc<SiteEngine>>>,
    ctx: GatewayContext,
}

/// Outcome of applying a configuration reload
#[derive(Debug, Default)]
pub struct ReloadResult {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
}

impl EngineManager {
    pub fn new(ctx: GatewayContext) -> Arc<Self> {
        Arc::new(Self {
            engines: RwLock::new(HashMap::new()),
            ctx,
        })
    }

    /// Start engines for the initial site list. A site that fails to
    /// start is skipped with an error log; the rest keep running.
    pub async fn start_all(&self, sites: Vec<SiteConfig>) {
        for site in sites {
            let id = site.id.clone();
            if let Err(e) = self.add_site(site).await {
                warn!(site = %id, error = %e, "Failed to start site engine");
            }
        }
    }

    /// Add a site and start its engine. Generates an ID when the config
    /// carries none. Returns the site ID.
    pub async fn add_site(&self, mut config: SiteConfig) -> anyhow::Result<String> {
        if config.id.is_empty() {
            config.id = Uuid::new_v4().to_string();
        }
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid site configuration: {}", e))?;

        let id = config.id.clone();
        if self.engines.read().contains_key(&id) {
            anyhow::bail!("site '{}' already exists", id);
        }

        let engine = SiteEngine::start(config, self.ctx.clone()).await?;
        self.engines.write().insert(id.clone(), engine);
        info!(site = %id, "Site added");
        Ok(id)
    }

    /// Replace a site's configuration: stop the old listener, then start
    /// a new engine. No request is ever served by a half-updated engine;
    /// during the brief swap the port is simply closed.
    pub async fn update_site(&self, config: SiteConfig) -> anyhow::Result<()> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid site configuration: {}", e))?;

        let id = config.id.clone();
        let old = self
            .engines
            .write()
            .remove(&id)
            .ok_or_else(|| anyhow::anyhow!("site '{}' not found", id))?;

        // The old listener must release the port before the new engine
        // can bind it
        old.stop().await;

        match SiteEngine::start(config, self.ctx.clone()).await {
            Ok(engine) => {
                self.engines.write().insert(id.clone(), engine);
                info!(site = %id, "Site updated");
                Ok(())
            }
            Err(e) => {
                // The old engine is already stopped; restart it so the
                // site is not left dark after a bad update
                let old_config = (*old.config()).clone();
                match SiteEngine::start(old_config, self.ctx.clone()).await {
                    Ok(engine) => {
                        self.engines.write().insert(id.clone(), engine);
                        warn!(site = %id, error = %e, "Update failed, previous configuration restored");
                    }
                    Err(restore_err) => {
                        warn!(site = %id, error = %restore_err, "Update failed and restore failed, site is down");
                    }
                }
                Err(e)
            }
        }
    }

    /// Stop a site's engine and purge all its store-resident state
    pub async fn remove_site(&self, id: &str) -> anyhow::Result<bool> {
        let engine = self.engines.write().remove(id);
        let Some(engine) = engine else {
            return Ok(false);
        };

        engine.stop().await;
        if let Err(e) = self.ctx.store.purge_site(id).await {
            warn!(site = %id, error = %e, "Failed to purge site state");
        }
        self.ctx.metrics.forget_site(id);
        info!(site = %id, "Site removed");
        Ok(true)
    }

    /// Look up a running engine. Safe for concurrent use while another
    /// task performs add/update/remove.
    pub fn get_engine(&self, id: &str) -> Option<Arc<SiteEngine>> {
        self.engines.read().get(id).cloned()
    }

    pub fn list_sites(&self) -> Vec<Arc<SiteConfig>> {
        let mut sites: Vec<_> = self
            .engines
            .read()
            .values()
            .map(|engine| engine.config())
            .collect();
        sites.sort_by(|a, b| a.id.cmp(&b.id));
        sites
    }

    pub fn site_ids(&self) -> Vec<String> {
        self.engines.read().keys().cloned().collect()
    }

    /// Apply a reloaded configuration: diff against running engines and
    /// add/update/remove as needed
    pub async fn apply_config(&self, config: &Config) -> anyhow::Result<ReloadResult> {
        config.validate()?;

        let mut result = ReloadResult::default();
        let current: HashMap<String, Arc<SiteConfig>> = self
            .engines
            .read()
            .iter()
            .map(|(id, engine)| (id.clone(), engine.config()))
            .collect();

        let new_ids: std::collections::HashSet<&str> =
            config.sites.iter().map(|s| s.id.as_str()).collect();

        for site in &config.sites {
            match current.get(&site.id) {
                None => {
                    self.add_site(site.clone()).await?;
                    result.added.push(site.id.clone());
                }
                Some(running) if !same_config(running, site) => {
                    self.update_site(site.clone()).await?;
                    result.updated.push(site.id.clone());
                }
                Some(_) => {}
            }
        }

        for id in current.keys() {
            if !new_ids.contains(id.as_str()) {
                self.remove_site(id).await?;
                result.removed.push(id.clone());
            }
        }

        Ok(result)
    }

    /// Stop every engine (process shutdown)
    pub async fn stop_all(&self) {
        let engines: Vec<Arc<SiteEngine>> = self.engines.write().drain().map(|(_, e)| e).collect();
        for engine in engines {
            engine.stop().await;
        }
    }
}

fn same_config(a: &SiteConfig, b: &SiteConfig) -> bool {
    // SiteConfig derives Serialize; comparing the serialized forms keeps
    // this in sync with the fields automatically
    serde_json::to_value(a).ok() == serde_json::to_value(b).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access_log::LogQueue;
    use crate::browser::{RenderOptions, RenderedPage, Renderer};
    use crate::cache::RenderCacheEngine;
    use crate::config::{FirewallConfig, RenderConfig, SiteDefaults, SiteMode};
    use crate::dispatch::ModeDispatcher;
    use crate::error::RenderError;
    use crate::geoip::GeoIpResolver;
    use crate::metrics::Metrics;
    use crate::store::{MemoryStore, Store};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use tokio::sync::watch;

    struct NullRenderer;

    #[async_trait]
    impl Renderer for NullRenderer {
        async fn render(
            &self,
            _url: &str,
            _options: &RenderOptions,
        ) -> Result<RenderedPage, RenderError> {
            Ok(RenderedPage {
                html: "<html/>".to_string(),
                elapsed: std::time::Duration::ZERO,
            })
        }
    }

    fn context(store: Arc<dyn Store>, sites_root: PathBuf) -> GatewayContext {
        let metrics = Metrics::new();
        let (_tx, shutdown_rx) = watch::channel(false);
        let (log, _) = LogQueue::start(64, Arc::clone(&store), Arc::clone(&metrics), shutdown_rx);
        let renderer: Arc<dyn Renderer> = Arc::new(NullRenderer);
        let cache = Arc::new(RenderCacheEngine::new(
            Arc::clone(&store),
            renderer,
            Arc::clone(&metrics),
            log.clone(),
        ));
        let dispatcher = Arc::new(ModeDispatcher::new(
            Arc::clone(&metrics),
            log.clone(),
            sites_root.clone(),
        ));
        GatewayContext {
            store,
            geoip: Arc::new(GeoIpResolver::new(None, "US")),
            metrics,
            log,
            cache,
            dispatcher,
            defaults: SiteDefaults {
                shutdown_grace_period_secs: 1,
                ..SiteDefaults::default()
            },
            sites_root,
            bind: "127.0.0.1".to_string(),
        }
    }

    fn site(id: &str, port: u16) -> SiteConfig {
        SiteConfig {
            id: id.to_string(),
            name: id.to_string(),
            domains: vec![format!("{}.test", id)],
            port,
            mode: SiteMode::Static,
            proxy_target: None,
            redirect_target: None,
            redirect_status: 301,
            firewall: FirewallConfig::default(),
            render: RenderConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_add_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let manager = EngineManager::new(context(Arc::clone(&store), dir.path().to_path_buf()));

        let id = manager.add_site(site("alpha", 42811)).await.unwrap();
        assert_eq!(id, "alpha");
        assert!(manager.get_engine("alpha").is_some());
        assert!(manager.get_engine("missing").is_none());

        // State purged on remove
        store
            .add_urls("alpha", &["http://alpha.test/".to_string()])
            .await
            .unwrap();
        assert!(manager.remove_site("alpha").await.unwrap());
        assert!(manager.get_engine("alpha").is_none());
        assert_eq!(store.url_count("alpha").await.unwrap(), 0);

        // Removing twice is a no-op
        assert!(!manager.remove_site("alpha").await.unwrap());
    }

    #[tokio::test]
    async fn test_add_generates_id() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let manager = EngineManager::new(context(store, dir.path().to_path_buf()));

        let mut config = site("", 42812);
        config.id = String::new();
        let id = manager.add_site(config).await.unwrap();
        assert!(!id.is_empty());
        assert!(manager.get_engine(&id).is_some());
    }

    #[tokio::test]
    async fn test_add_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let manager = EngineManager::new(context(store, dir.path().to_path_buf()));

        let mut config = site("bad", 42813);
        config.mode = SiteMode::Proxy; // proxy without a target
        assert!(manager.add_site(config).await.is_err());
        assert!(manager.get_engine("bad").is_none());
    }

    #[tokio::test]
    async fn test_update_swaps_config_on_same_port() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let manager = EngineManager::new(context(store, dir.path().to_path_buf()));

        manager.add_site(site("alpha", 42814)).await.unwrap();

        let mut updated = site("alpha", 42814);
        updated.name = "renamed".to_string();
        manager.update_site(updated).await.unwrap();

        let engine = manager.get_engine("alpha").unwrap();
        assert_eq!(engine.config().name, "renamed");
    }

    #[tokio::test]
    async fn test_apply_config_diffs() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let manager = EngineManager::new(context(store, dir.path().to_path_buf()));

        manager.add_site(site("keep", 42815)).await.unwrap();
        manager.add_site(site("drop", 42816)).await.unwrap();

        let mut changed = site("keep", 42815);
        changed.name = "changed".to_string();
        let config = Config {
            server: Default::default(),
            defaults: SiteDefaults::default(),
            sites: vec![changed, site("fresh", 42817)],
        };

        let result = manager.apply_config(&config).await.unwrap();
        assert_eq!(result.added, vec!["fresh".to_string()]);
        assert_eq!(result.removed, vec!["drop".to_string()]);
        assert_eq!(result.updated, vec!["keep".to_string()]);

        assert!(manager.get_engine("fresh").is_some());
        assert!(manager.get_engine("drop").is_none());
        assert_eq!(manager.get_engine("keep").unwrap().config().name, "changed");
    }
}
