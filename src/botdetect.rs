//! Crawler classification by User-Agent.
//!
//! Runs only for requests the firewall already allowed. A site may carry
//! its own signature list (matched case-sensitively); otherwise the
//! built-in set of well-known search and social crawlers applies,
//! matched case-insensitively.

use crate::config::RenderConfig;

/// Well-known search and social crawler tokens
pub const DEFAULT_CRAWLER_TOKENS: &[&str] = &[
    "googlebot",
    "bingbot",
    "baiduspider",
    "yandexbot",
    "duckduckbot",
    "slurp",
    "sogou",
    "exabot",
    "360spider",
    "bytespider",
    "petalbot",
    "applebot",
    "facebookexternalhit",
    "twitterbot",
    "linkedinbot",
    "telegrambot",
    "whatsapp",
    "discordbot",
    "slackbot",
];

/// Decide whether a User-Agent belongs to a known crawler
pub fn is_crawler(user_agent: &str, render: &RenderConfig) -> bool {
    if !render.use_default_crawlers && !render.crawler_user_agents.is_empty() {
        return render
            .crawler_user_agents
            .iter()
            .any(|sig| user_agent.contains(sig.as_str()));
    }

    let ua_lower = user_agent.to_lowercase();
    DEFAULT_CRAWLER_TOKENS
        .iter()
        .any(|token| ua_lower.contains(token))
}

/// The built-in signature list, for the admin surface
pub fn default_crawler_tokens() -> Vec<String> {
    DEFAULT_CRAWLER_TOKENS.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenderConfig;

    const GOOGLEBOT: &str =
        "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)";
    const CHROME: &str =
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

    #[test]
    fn test_default_set_matches_known_crawlers() {
        let render = RenderConfig::default();
        assert!(is_crawler(GOOGLEBOT, &render));
        assert!(is_crawler("Mozilla/5.0 (compatible; bingbot/2.0)", &render));
        assert!(is_crawler("facebookexternalhit/1.1", &render));
    }

    #[test]
    fn test_default_set_is_case_insensitive() {
        let render = RenderConfig::default();
        assert!(is_crawler("GOOGLEBOT/2.1", &render));
        assert!(is_crawler("GoogleBot/2.1", &render));
    }

    #[test]
    fn test_browser_ua_is_not_a_crawler() {
        let render = RenderConfig::default();
        assert!(!is_crawler(CHROME, &render));
        assert!(!is_crawler("", &render));
    }

    #[test]
    fn test_site_list_is_case_sensitive() {
        let render = RenderConfig {
            crawler_user_agents: vec!["MyBot".to_string()],
            use_default_crawlers: false,
            ..RenderConfig::default()
        };
        assert!(is_crawler("MyBot/1.0", &render));
        assert!(!is_crawler("mybot/1.0", &render));
        // Site list replaces the default set entirely
        assert!(!is_crawler(GOOGLEBOT, &render));
    }

    #[test]
    fn test_empty_site_list_falls_back_to_defaults() {
        let render = RenderConfig {
            crawler_user_agents: vec![],
            use_default_crawlers: false,
            ..RenderConfig::default()
        };
        assert!(is_crawler(GOOGLEBOT, &render));
    }
}
