use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Global default settings for sites
    #[serde(default)]
    pub defaults: SiteDefaults,

    /// Hosted site configurations
    #[serde(default)]
    pub sites: Vec<SiteConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for site listeners (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the internal admin API
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Authentication token for admin API (required for write operations)
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Root directory under which each static site's files live
    /// (a site's static root is `{sites_root}/{site_id}`)
    #[serde(default = "default_sites_root")]
    pub sites_root: PathBuf,

    /// Path to a GeoLite2-Country database file (GeoIP disabled if unset)
    pub geoip_db: Option<PathBuf>,

    /// ISO country code reported for private/loopback client addresses
    #[serde(default = "default_server_country")]
    pub server_country: String,

    /// Secret for signing session tokens
    /// If not set, a random secret is generated at startup (sessions do
    /// not survive restarts in that case)
    pub session_secret: Option<String>,

    /// Capacity of the bounded access-log queue; records beyond this are
    /// dropped and counted
    #[serde(default = "default_log_queue_capacity")]
    pub log_queue_capacity: usize,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
            redis_url: default_redis_url(),
            sites_root: default_sites_root(),
            geoip_db: None,
            server_country: default_server_country(),
            session_secret: None,
            log_queue_capacity: default_log_queue_capacity(),
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SiteDefaults {
    /// Default render timeout in seconds
    #[serde(default = "default_render_timeout")]
    pub render_timeout_secs: u64,

    /// Default render cache TTL in seconds
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Default maximum concurrent render pages
    #[serde(default = "default_render_pool_size")]
    pub render_pool_size: usize,

    /// Default grace period in seconds for in-flight requests when a
    /// site listener stops
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Default upstream request timeout in seconds for proxy mode
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for SiteDefaults {
    fn default() -> Self {
        Self {
            render_timeout_secs: default_render_timeout(),
            cache_ttl_secs: default_cache_ttl(),
            render_pool_size: default_render_pool_size(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Dispatch behavior for non-crawler traffic
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SiteMode {
    /// Forward to an upstream origin
    Proxy,
    /// Serve files from the site's static root with SPA fallback
    Static,
    /// Redirect every request to a configured target
    Redirect,
}

impl SiteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SiteMode::Proxy => "proxy",
            SiteMode::Static => "static",
            SiteMode::Redirect => "redirect",
        }
    }
}

/// Configuration for a single hosted site
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SiteConfig {
    /// Unique site ID (generated when the site is added via the admin
    /// API without one)
    #[serde(default)]
    pub id: String,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Domains bound to this site
    #[serde(default)]
    pub domains: Vec<String>,

    /// Port this site's listener binds
    pub port: u16,

    /// Dispatch mode for non-crawler traffic
    pub mode: SiteMode,

    /// Upstream origin URL (required for proxy mode)
    pub proxy_target: Option<String>,

    /// Redirect target URL (required for redirect mode)
    pub redirect_target: Option<String>,

    /// Redirect status code (default: 301)
    #[serde(default = "default_redirect_status")]
    pub redirect_status: u16,

    /// Firewall settings
    #[serde(default)]
    pub firewall: FirewallConfig,

    /// Render and cache-warming settings
    #[serde(default)]
    pub render: RenderConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct FirewallConfig {
    /// Master switch for all firewall checks
    #[serde(default)]
    pub enabled: bool,

    /// IPs that bypass every other check, including the blacklist
    #[serde(default)]
    pub whitelist: Vec<String>,

    /// IPs blocked outright
    #[serde(default)]
    pub blacklist: Vec<String>,

    /// ISO country codes blocked when GeoIP is available
    #[serde(default)]
    pub geoip_block: Vec<String>,

    /// If non-empty, only these ISO country codes are allowed
    #[serde(default)]
    pub geoip_allow: Vec<String>,

    /// Per-IP rate limit (disabled if unset)
    pub rate_limit: Option<RateLimitConfig>,

    /// Message shown on the default block page
    #[serde(default = "default_block_message")]
    pub block_message: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RateLimitConfig {
    /// Requests allowed per window
    pub requests: u64,

    /// Window length in seconds
    pub window_secs: u64,

    /// How long a counter key lives after the window ends
    #[serde(default = "default_ban_time")]
    pub ban_time_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RenderConfig {
    /// Maximum concurrent render pages (overrides default)
    pub pool_size: Option<usize>,

    /// Render timeout in seconds (overrides default)
    pub timeout_secs: Option<u64>,

    /// Cache TTL in seconds (overrides default)
    pub cache_ttl_secs: Option<u64>,

    /// Site-specific crawler User-Agent signatures (case-sensitive
    /// substring match). Ignored when `use_default_crawlers` is set or
    /// the list is empty.
    #[serde(default)]
    pub crawler_user_agents: Vec<String>,

    /// Match against the built-in crawler signature set instead of
    /// `crawler_user_agents`
    #[serde(default = "default_true")]
    pub use_default_crawlers: bool,

    /// Cache-warming settings
    #[serde(default)]
    pub preheat: PreheatConfig,

    /// Search-engine URL submission settings
    #[serde(default)]
    pub push: PushConfig,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            pool_size: None,
            timeout_secs: None,
            cache_ttl_secs: None,
            crawler_user_agents: Vec::new(),
            use_default_crawlers: true,
            preheat: PreheatConfig::default(),
            push: PushConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PreheatConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Seconds between scheduled preheat runs
    #[serde(default = "default_preheat_interval")]
    pub interval_secs: u64,

    /// Maximum crawl depth when discovering URLs
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// Concurrent render workers for a preheat run
    #[serde(default = "default_preheat_concurrency")]
    pub concurrency: usize,
}

impl Default for PreheatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_preheat_interval(),
            max_depth: default_max_depth(),
            concurrency: default_preheat_concurrency(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct PushConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Search-engine submission endpoints
    #[serde(default)]
    pub engines: Vec<PushEngineConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PushEngineConfig {
    /// Engine name used in stats and logs (e.g. "bing", "baidu")
    pub name: String,

    /// Submission API endpoint
    pub api: String,

    /// API token appended to the request
    pub token: String,

    /// Maximum URLs submitted per calendar day
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u64,
}

impl SiteConfig {
    pub fn render_timeout(&self, defaults: &SiteDefaults) -> Duration {
        Duration::from_secs(
            self.render
                .timeout_secs
                .unwrap_or(defaults.render_timeout_secs),
        )
    }

    pub fn cache_ttl(&self, defaults: &SiteDefaults) -> Duration {
        Duration::from_secs(
            self.render
                .cache_ttl_secs
                .unwrap_or(defaults.cache_ttl_secs),
        )
    }

    pub fn render_pool_size(&self, defaults: &SiteDefaults) -> usize {
        self.render
            .pool_size
            .unwrap_or(defaults.render_pool_size)
    }

    /// The directory this site's static files live in
    pub fn static_root(&self, sites_root: &Path) -> PathBuf {
        sites_root.join(&self.id)
    }

    /// Validate the site configuration. Invalid configuration is fatal at
    /// add/update time and must never reach a running engine.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("site id must not be empty".to_string());
        }
        if self.id.contains(['/', '\\', '.']) {
            return Err(format!(
                "site '{}': id must not contain path separators or dots",
                self.id
            ));
        }
        if self.port == 0 {
            return Err(format!("site '{}': 'port' must be greater than 0", self.id));
        }
        if self.domains.is_empty() {
            return Err(format!("site '{}': at least one domain is required", self.id));
        }

        match self.mode {
            SiteMode::Proxy => {
                let target = self
                    .proxy_target
                    .as_deref()
                    .ok_or_else(|| format!("site '{}': proxy mode requires 'proxy_target'", self.id))?;
                url::Url::parse(target).map_err(|e| {
                    format!("site '{}': invalid proxy target '{}': {}", self.id, target, e)
                })?;
            }
            SiteMode::Redirect => {
                if self.redirect_target.is_none() {
                    return Err(format!(
                        "site '{}': redirect mode requires 'redirect_target'",
                        self.id
                    ));
                }
                if !(300..400).contains(&self.redirect_status) {
                    return Err(format!(
                        "site '{}': redirect status {} is not a 3xx code",
                        self.id, self.redirect_status
                    ));
                }
            }
            SiteMode::Static => {}
        }

        if let Some(ref rl) = self.firewall.rate_limit {
            if rl.requests == 0 || rl.window_secs == 0 {
                return Err(format!(
                    "site '{}': rate limit requires non-zero 'requests' and 'window_secs'",
                    self.id
                ));
            }
        }

        for engine in &self.render.push.engines {
            if engine.api.is_empty() {
                return Err(format!(
                    "site '{}': push engine '{}' has an empty api endpoint",
                    self.id, engine.name
                ));
            }
        }

        Ok(())
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    9999
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_sites_root() -> PathBuf {
    PathBuf::from("./sites")
}

fn default_server_country() -> String {
    "US".to_string()
}

fn default_log_queue_capacity() -> usize {
    1024 // Records beyond this are dropped, not queued
}

fn default_render_timeout() -> u64 {
    30 // 30 seconds for the headless browser to settle
}

fn default_cache_ttl() -> u64 {
    86400 // 24 hours
}

fn default_render_pool_size() -> usize {
    4
}

fn default_shutdown_grace_period() -> u64 {
    5 // 5 seconds for in-flight requests when a listener stops
}

fn default_request_timeout() -> u64 {
    30
}

fn default_redirect_status() -> u16 {
    301
}

fn default_block_message() -> String {
    "Access denied".to_string()
}

fn default_ban_time() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_preheat_interval() -> u64 {
    21600 // 6 hours
}

fn default_max_depth() -> u32 {
    3
}

fn default_preheat_concurrency() -> usize {
    4
}

fn default_daily_limit() -> u64 {
    100
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();
        let mut seen_ids = std::collections::HashSet::new();
        let mut seen_ports = std::collections::HashSet::new();

        for site in &self.sites {
            if let Err(e) = site.validate() {
                errors.push(e);
            }
            if !seen_ids.insert(site.id.clone()) {
                errors.push(format!("duplicate site id '{}'", site.id));
            }
            if !seen_ports.insert(site.port) {
                errors.push(format!("site '{}': port {} is already in use", site.id, site.port));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn static_site(id: &str, port: u16) -> SiteConfig {
        SiteConfig {
            id: id.to_string(),
            name: id.to_string(),
            domains: vec![format!("{}.example.com", id)],
            port,
            mode: SiteMode::Static,
            proxy_target: None,
            redirect_target: None,
            redirect_status: 301,
            firewall: FirewallConfig::default(),
            render: RenderConfig::default(),
        }
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
bind = "127.0.0.1"
admin_port = 9000
redis_url = "redis://localhost:6379"

[defaults]
render_timeout_secs = 20
cache_ttl_secs = 3600

[[sites]]
id = "blog"
name = "Blog"
domains = ["blog.example.com"]
port = 8081
mode = "proxy"
proxy_target = "http://127.0.0.1:3000"

[sites.firewall]
enabled = true
blacklist = ["203.0.113.7"]

[sites.firewall.rate_limit]
requests = 60
window_secs = 60

[[sites]]
id = "landing"
domains = ["example.com"]
port = 8082
mode = "static"

[sites.render.preheat]
enabled = true
interval_secs = 3600
max_depth = 2
concurrency = 8
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.admin_port, 9000);
        assert_eq!(config.defaults.render_timeout_secs, 20);
        assert_eq!(config.sites.len(), 2);
        assert_eq!(config.sites[0].mode, SiteMode::Proxy);
        assert_eq!(
            config.sites[0].firewall.rate_limit.as_ref().unwrap().requests,
            60
        );
        assert!(config.sites[1].render.preheat.enabled);
        assert_eq!(config.sites[1].render.preheat.concurrency, 8);
    }

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.admin_port, 9999);
        assert_eq!(config.redis_url, "redis://127.0.0.1:6379");
        assert_eq!(config.log_queue_capacity, 1024);
    }

    #[test]
    fn test_site_uses_defaults() {
        let defaults = SiteDefaults::default();
        let site = static_site("s1", 8080);

        assert_eq!(site.render_timeout(&defaults), Duration::from_secs(30));
        assert_eq!(site.cache_ttl(&defaults), Duration::from_secs(86400));
        assert_eq!(site.render_pool_size(&defaults), 4);
    }

    #[test]
    fn test_site_overrides_defaults() {
        let defaults = SiteDefaults::default();
        let mut site = static_site("s1", 8080);
        site.render.timeout_secs = Some(10);
        site.render.cache_ttl_secs = Some(60);
        site.render.pool_size = Some(2);

        assert_eq!(site.render_timeout(&defaults), Duration::from_secs(10));
        assert_eq!(site.cache_ttl(&defaults), Duration::from_secs(60));
        assert_eq!(site.render_pool_size(&defaults), 2);
    }

    #[test]
    fn test_static_root_derived_from_id() {
        let site = static_site("landing", 8080);
        assert_eq!(
            site.static_root(Path::new("/var/sites")),
            PathBuf::from("/var/sites/landing")
        );
    }

    #[test]
    fn test_proxy_mode_requires_valid_target() {
        let mut site = static_site("s1", 8080);
        site.mode = SiteMode::Proxy;
        assert!(site.validate().is_err());

        site.proxy_target = Some("not a url".to_string());
        assert!(site.validate().is_err());

        site.proxy_target = Some("http://origin.internal:3000".to_string());
        assert!(site.validate().is_ok());
    }

    #[test]
    fn test_redirect_mode_requires_3xx_status() {
        let mut site = static_site("s1", 8080);
        site.mode = SiteMode::Redirect;
        site.redirect_target = Some("https://example.org".to_string());
        site.redirect_status = 200;
        assert!(site.validate().is_err());

        site.redirect_status = 302;
        assert!(site.validate().is_ok());
    }

    #[test]
    fn test_duplicate_ports_rejected() {
        let config = Config {
            server: ServerConfig::default(),
            defaults: SiteDefaults::default(),
            sites: vec![static_site("a", 8080), static_site("b", 8080)],
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_site_id_must_be_path_safe() {
        let mut site = static_site("ok", 8080);
        site.id = "../etc".to_string();
        assert!(site.validate().is_err());
    }

    #[test]
    fn test_invalid_mode_string_fails_to_parse() {
        let err = toml::from_str::<SiteConfig>(
            r#"
id = "s1"
domains = ["example.com"]
port = 8080
mode = "carrier-pigeon"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown variant"));
    }
}
