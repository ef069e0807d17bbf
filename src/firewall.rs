//! Firewall stage: ordered allow/block checks for every inbound request.
//!
//! Check order, first match wins: whitelist (overrides everything,
//! including the blacklist), blacklist, GeoIP block list, GeoIP allow
//! list, rate limit. Rate-limit counters live in the store so limits
//! hold across processes.

use crate::config::FirewallConfig;
use crate::error::StoreError;
use crate::store::Store;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Which rule produced a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRule {
    IpBlacklist,
    GeoipBlock,
    GeoipAllow,
    RateLimit,
}

impl BlockRule {
    pub fn id(&self) -> &'static str {
        match self {
            BlockRule::IpBlacklist => "ip_blacklist",
            BlockRule::GeoipBlock => "geoip_block",
            BlockRule::GeoipAllow => "geoip_allow",
            BlockRule::RateLimit => "rate_limit",
        }
    }
}

/// Outcome of the firewall stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Block { rule: BlockRule, reason: String },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Evaluate the firewall checks for one request.
///
/// `country` is the client's resolved ISO country code. Only the
/// rate-limit check touches the store; a store failure there surfaces as
/// an error and the request fails rather than slipping through.
pub async fn evaluate(
    config: &FirewallConfig,
    site_id: &str,
    client_ip: IpAddr,
    country: &str,
    store: &dyn Store,
) -> Result<Decision, StoreError> {
    if !config.enabled {
        return Ok(Decision::Allow);
    }

    let ip_str = client_ip.to_string();

    // Whitelist wins over everything, including the blacklist
    if config.whitelist.iter().any(|ip| ip == &ip_str) {
        return Ok(Decision::Allow);
    }

    if config.blacklist.iter().any(|ip| ip == &ip_str) {
        return Ok(Decision::Block {
            rule: BlockRule::IpBlacklist,
            reason: format!("IP {} is blacklisted", ip_str),
        });
    }

    if config
        .geoip_block
        .iter()
        .any(|code| code.eq_ignore_ascii_case(country))
    {
        return Ok(Decision::Block {
            rule: BlockRule::GeoipBlock,
            reason: format!("country {} is blocked", country),
        });
    }

    if !config.geoip_allow.is_empty()
        && !config
            .geoip_allow
            .iter()
            .any(|code| code.eq_ignore_ascii_case(country))
    {
        return Ok(Decision::Block {
            rule: BlockRule::GeoipAllow,
            reason: format!("country {} is not in the allow list", country),
        });
    }

    if let Some(ref limit) = config.rate_limit {
        let window = Duration::from_secs(limit.window_secs);
        let count = store.incr_rate(site_id, &ip_str, window).await?;
        if count > limit.requests {
            // Keep the counter alive for the ban time so the IP stays
            // over the limit until it expires
            store
                .extend_rate_ban(site_id, &ip_str, Duration::from_secs(limit.ban_time_secs))
                .await?;
            return Ok(Decision::Block {
                rule: BlockRule::RateLimit,
                reason: format!(
                    "rate limit exceeded: {} requests in {}s window (limit {})",
                    count, limit.window_secs, limit.requests
                ),
            });
        }
    }

    Ok(Decision::Allow)
}

/// Default 403 page template; `{message}` is replaced with the site's
/// configured block message
const DEFAULT_BLOCK_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>403 Forbidden</title></head>
<body>
<h1>403 Forbidden</h1>
<p>{message}</p>
</body>
</html>
"#;

/// Build the 403 body: a site-specific `403.html` from the static root
/// when present, else the templated default page
pub async fn block_page(static_root: &Path, block_message: &str) -> String {
    let custom = static_root.join("403.html");
    match tokio::fs::read_to_string(&custom).await {
        Ok(html) => html,
        Err(_) => DEFAULT_BLOCK_PAGE.replace("{message}", block_message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::store::MemoryStore;

    fn fw() -> FirewallConfig {
        FirewallConfig {
            enabled: true,
            ..FirewallConfig::default()
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_disabled_firewall_allows_everything() {
        let store = MemoryStore::new();
        let config = FirewallConfig {
            enabled: false,
            blacklist: vec!["1.2.3.4".to_string()],
            ..FirewallConfig::default()
        };
        let decision = evaluate(&config, "s1", ip("1.2.3.4"), "US", &store)
            .await
            .unwrap();
        assert_eq!(decision, Decision::Allow);
    }

    #[tokio::test]
    async fn test_whitelist_overrides_blacklist() {
        let store = MemoryStore::new();
        let config = FirewallConfig {
            whitelist: vec!["1.2.3.4".to_string()],
            blacklist: vec!["1.2.3.4".to_string()],
            ..fw()
        };
        let decision = evaluate(&config, "s1", ip("1.2.3.4"), "US", &store)
            .await
            .unwrap();
        assert_eq!(decision, Decision::Allow);
    }

    #[tokio::test]
    async fn test_whitelist_skips_rate_limit() {
        let store = MemoryStore::new();
        let config = FirewallConfig {
            whitelist: vec!["1.2.3.4".to_string()],
            rate_limit: Some(RateLimitConfig {
                requests: 1,
                window_secs: 60,
                ban_time_secs: 60,
            }),
            ..fw()
        };
        for _ in 0..5 {
            let decision = evaluate(&config, "s1", ip("1.2.3.4"), "US", &store)
                .await
                .unwrap();
            assert_eq!(decision, Decision::Allow);
        }
    }

    #[tokio::test]
    async fn test_blacklist_blocks() {
        let store = MemoryStore::new();
        let config = FirewallConfig {
            blacklist: vec!["1.2.3.4".to_string()],
            ..fw()
        };
        match evaluate(&config, "s1", ip("1.2.3.4"), "US", &store)
            .await
            .unwrap()
        {
            Decision::Block { rule, .. } => assert_eq!(rule.id(), "ip_blacklist"),
            Decision::Allow => panic!("expected block"),
        }
    }

    #[tokio::test]
    async fn test_geoip_block_list() {
        let store = MemoryStore::new();
        let config = FirewallConfig {
            geoip_block: vec!["RU".to_string()],
            ..fw()
        };
        match evaluate(&config, "s1", ip("1.2.3.4"), "ru", &store)
            .await
            .unwrap()
        {
            Decision::Block { rule, .. } => assert_eq!(rule, BlockRule::GeoipBlock),
            Decision::Allow => panic!("expected block"),
        }
        assert!(evaluate(&config, "s1", ip("1.2.3.4"), "US", &store)
            .await
            .unwrap()
            .is_allowed());
    }

    #[tokio::test]
    async fn test_geoip_allow_list() {
        let store = MemoryStore::new();
        let config = FirewallConfig {
            geoip_allow: vec!["US".to_string(), "CA".to_string()],
            ..fw()
        };
        assert!(evaluate(&config, "s1", ip("1.2.3.4"), "US", &store)
            .await
            .unwrap()
            .is_allowed());
        match evaluate(&config, "s1", ip("1.2.3.4"), "DE", &store)
            .await
            .unwrap()
        {
            Decision::Block { rule, .. } => assert_eq!(rule, BlockRule::GeoipAllow),
            Decision::Allow => panic!("expected block"),
        }
    }

    #[tokio::test]
    async fn test_rate_limit_boundary() {
        let store = MemoryStore::new();
        let config = FirewallConfig {
            rate_limit: Some(RateLimitConfig {
                requests: 3,
                window_secs: 60,
                ban_time_secs: 60,
            }),
            ..fw()
        };

        // Exactly N requests pass
        for _ in 0..3 {
            assert!(evaluate(&config, "s1", ip("1.2.3.4"), "US", &store)
                .await
                .unwrap()
                .is_allowed());
        }
        // The (N+1)th is blocked with the rate_limit rule
        match evaluate(&config, "s1", ip("1.2.3.4"), "US", &store)
            .await
            .unwrap()
        {
            Decision::Block { rule, .. } => assert_eq!(rule.id(), "rate_limit"),
            Decision::Allow => panic!("expected block"),
        }
        // A different IP has its own counter
        assert!(evaluate(&config, "s1", ip("9.9.9.9"), "US", &store)
            .await
            .unwrap()
            .is_allowed());
    }

    #[tokio::test]
    async fn test_rate_limit_window_resets() {
        let store = MemoryStore::new();
        let config = FirewallConfig {
            rate_limit: Some(RateLimitConfig {
                requests: 1,
                window_secs: 0, // window ends immediately in MemoryStore terms
                ban_time_secs: 0,
            }),
            ..fw()
        };

        assert!(evaluate(&config, "s1", ip("1.2.3.4"), "US", &store)
            .await
            .unwrap()
            .is_allowed());
        // Window elapsed: counter re-arms instead of accumulating
        assert!(evaluate(&config, "s1", ip("1.2.3.4"), "US", &store)
            .await
            .unwrap()
            .is_allowed());
    }

    #[tokio::test]
    async fn test_default_block_page_carries_message() {
        let page = block_page(Path::new("/nonexistent"), "Access denied by policy").await;
        assert!(page.contains("403 Forbidden"));
        assert!(page.contains("Access denied by policy"));
    }

    #[tokio::test]
    async fn test_custom_block_page_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("403.html"), "<h1>custom</h1>")
            .await
            .unwrap();
        let page = block_page(dir.path(), "ignored").await;
        assert_eq!(page, "<h1>custom</h1>");
    }
}
