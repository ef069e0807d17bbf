//! Mode dispatcher for non-crawler traffic.
//!
//! Pure dispatch on the site's configured mode: transparent reverse
//! proxy, static files with SPA fallback, or redirect. Every branch
//! records a visit log entry and request metrics; static-asset paths are
//! excluded from metrics.

use crate::access_log::{LogQueue, LogRecord};
use crate::config::{SiteConfig, SiteDefaults, SiteMode};
use crate::error::{json_error_response, GatewayErrorCode};
use crate::metrics::Metrics;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::HeaderValue;
use hyper::{Request, Response, StatusCode};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, warn};

/// File extensions served directly from the static root, bypassing the
/// SPA fallback and request metrics
const STATIC_ASSET_EXTENSIONS: &[&str] = &[
    "html", "htm", "css", "js", "mjs", "map", "json", "xml", "txt", "ico", "png", "jpg", "jpeg",
    "gif", "svg", "webp", "avif", "woff", "woff2", "ttf", "eot", "otf", "mp3", "mp4", "webm",
    "pdf", "wasm",
];

/// Hop-by-hop headers that must not be forwarded either direction
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Client-side request context carried into logging
#[derive(Debug, Clone)]
pub struct VisitContext {
    pub ip: String,
    pub user_agent: String,
    pub referer: String,
}

/// Dispatches firewall-allowed, non-crawler requests per site mode
pub struct ModeDispatcher {
    client: reqwest::Client,
    metrics: Arc<Metrics>,
    log: LogQueue,
    sites_root: PathBuf,
}

impl ModeDispatcher {
    pub fn new(metrics: Arc<Metrics>, log: LogQueue, sites_root: PathBuf) -> Self {
        Self {
            client: reqwest::Client::new(),
            metrics,
            log,
            sites_root,
        }
    }

    pub async fn dispatch<B>(
        &self,
        site: &SiteConfig,
        defaults: &SiteDefaults,
        req: Request<B>,
        ctx: &VisitContext,
    ) -> Response<BoxBody<Bytes, hyper::Error>>
    where
        B: hyper::body::Body + Send,
        B::Data: Send,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let start = Instant::now();
        let method = req.method().to_string();
        let url = req.uri().to_string();
        let path = req.uri().path().to_string();
        let is_asset = is_static_asset(&path);

        let response = match site.mode {
            SiteMode::Proxy => self.proxy(site, defaults, req).await,
            SiteMode::Static => self.serve_static(site, &path).await,
            SiteMode::Redirect => redirect_response(site),
        };

        if !is_asset {
            self.metrics.record_request(&site.id);
        }
        self.log.record(LogRecord::Visit {
            site: site.id.clone(),
            ip: ctx.ip.clone(),
            method,
            url,
            status: response.status().as_u16(),
            user_agent: ctx.user_agent.clone(),
            duration_ms: start.elapsed().as_millis() as u64,
            referer: ctx.referer.clone(),
            timestamp: LogRecord::now_ts(),
        });

        response
    }

    /// Forward the request to the configured upstream origin
    async fn proxy<B>(
        &self,
        site: &SiteConfig,
        defaults: &SiteDefaults,
        req: Request<B>,
    ) -> Response<BoxBody<Bytes, hyper::Error>>
    where
        B: hyper::body::Body + Send,
        B::Data: Send,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let target = match site.proxy_target.as_deref() {
            Some(target) => target,
            None => {
                error!(site = %site.id, "Proxy mode without a target URL");
                return json_error_response(GatewayErrorCode::InvalidSiteConfig, "Internal error");
            }
        };

        let base = match url::Url::parse(target) {
            Ok(base) => base,
            Err(e) => {
                error!(site = %site.id, target, error = %e, "Invalid proxy target");
                return json_error_response(GatewayErrorCode::InvalidSiteConfig, "Internal error");
            }
        };

        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let upstream_url = match base.join(path_and_query) {
            Ok(url) => url,
            Err(e) => {
                error!(site = %site.id, path_and_query, error = %e, "Failed to build upstream URL");
                return json_error_response(GatewayErrorCode::InvalidSiteConfig, "Internal error");
            }
        };

        let method = match reqwest::Method::from_bytes(req.method().as_str().as_bytes()) {
            Ok(method) => method,
            Err(_) => {
                return json_error_response(GatewayErrorCode::InternalError, "Internal error");
            }
        };

        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in req.headers() {
            let lower = name.as_str().to_lowercase();
            if lower == "host" || HOP_BY_HOP_HEADERS.contains(&lower.as_str()) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
                reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.insert(name, value);
            }
        }

        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(site = %site.id, error = %e, "Failed to read request body");
                return json_error_response(GatewayErrorCode::InternalError, "Internal error");
            }
        };

        let timeout = Duration::from_secs(defaults.request_timeout_secs);
        let result = self
            .client
            .request(method, upstream_url)
            .headers(headers)
            .body(body.to_vec())
            .timeout(timeout)
            .send()
            .await;

        match result {
            Ok(upstream) => {
                let status = StatusCode::from_u16(upstream.status().as_u16())
                    .unwrap_or(StatusCode::BAD_GATEWAY);
                let mut builder = Response::builder().status(status);
                for (name, value) in upstream.headers() {
                    let lower = name.as_str().to_lowercase();
                    if HOP_BY_HOP_HEADERS.contains(&lower.as_str()) || lower == "content-length" {
                        continue;
                    }
                    if let Ok(value) = HeaderValue::from_bytes(value.as_bytes()) {
                        builder = builder.header(name.as_str(), value);
                    }
                }
                let bytes = upstream.bytes().await.unwrap_or_default();
                builder
                    .body(Full::new(bytes).map_err(|e| match e {}).boxed())
                    .unwrap_or_else(|_| {
                        json_error_response(GatewayErrorCode::UpstreamFailed, "Bad gateway")
                    })
            }
            Err(e) if e.is_timeout() => {
                warn!(site = %site.id, error = %e, "Upstream request timed out");
                json_error_response(GatewayErrorCode::UpstreamTimeout, "Upstream timed out")
            }
            Err(e) => {
                error!(site = %site.id, error = %e, "Failed to reach upstream");
                json_error_response(GatewayErrorCode::UpstreamFailed, "Bad gateway")
            }
        }
    }

    /// Serve a file from the static root, with SPA fallback to index.html
    async fn serve_static(
        &self,
        site: &SiteConfig,
        raw_path: &str,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let root = site.static_root(&self.sites_root);
        if let Err(e) = tokio::fs::create_dir_all(&root).await {
            error!(site = %site.id, root = %root.display(), error = %e, "Failed to create static root");
            return json_error_response(GatewayErrorCode::InternalError, "Internal error");
        }

        // Strip any fragment and query remnants, then sanitize
        let path = raw_path.split(['#', '?']).next().unwrap_or("/");
        let Some(relative) = sanitize_path(path) else {
            return not_found_response(&site.id, raw_path);
        };

        if is_static_asset(path) {
            let file = root.join(&relative);
            if let Ok(bytes) = tokio::fs::read(&file).await {
                return file_response(&file, bytes);
            }
        }

        // SPA fallback: any unresolved route gets the app shell
        let index = root.join("index.html");
        match tokio::fs::read(&index).await {
            Ok(bytes) => file_response(&index, bytes),
            Err(_) => not_found_response(&site.id, raw_path),
        }
    }
}

fn redirect_response(site: &SiteConfig) -> Response<BoxBody<Bytes, hyper::Error>> {
    let target = match site.redirect_target.as_deref() {
        Some(target) => target,
        None => {
            error!(site = %site.id, "Redirect mode without a target URL");
            return json_error_response(GatewayErrorCode::InvalidSiteConfig, "Internal error");
        }
    };
    let status =
        StatusCode::from_u16(site.redirect_status).unwrap_or(StatusCode::MOVED_PERMANENTLY);

    Response::builder()
        .status(status)
        .header(hyper::header::LOCATION, target)
        .body(
            Full::new(Bytes::from("Redirecting"))
                .map_err(|e| match e {})
                .boxed(),
        )
        .unwrap_or_else(|_| json_error_response(GatewayErrorCode::InternalError, "Internal error"))
}

fn file_response(path: &Path, bytes: Vec<u8>) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, content_type_for(path))
        .body(Full::new(Bytes::from(bytes)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

fn not_found_response(site_id: &str, path: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = serde_json::json!({
        "error": "not found",
        "site": site_id,
        "path": path,
    })
    .to_string();

    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Normalize a request path into a safe relative path under the static
/// root. Rejects traversal segments.
fn sanitize_path(path: &str) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => return None,
            segment => clean.push(segment),
        }
    }
    Some(clean)
}

/// Whether the path names a known static-asset extension
pub fn is_static_asset(path: &str) -> bool {
    let path = path.split(['#', '?']).next().unwrap_or(path);
    path.rsplit('/')
        .next()
        .and_then(|file| file.rsplit_once('.'))
        .map(|(_, ext)| {
            let ext = ext.to_lowercase();
            STATIC_ASSET_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .as_deref()
    {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") | Some("mjs") => "application/javascript",
        Some("json") | Some("map") => "application/json",
        Some("xml") => "application/xml",
        Some("txt") => "text/plain; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("avif") => "image/avif",
        Some("ico") => "image/x-icon",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("ttf") => "font/ttf",
        Some("otf") => "font/otf",
        Some("mp3") => "audio/mpeg",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("pdf") => "application/pdf",
        Some("wasm") => "application/wasm",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FirewallConfig, RenderConfig};
    use crate::store::{MemoryStore, Store};
    use tokio::sync::watch;

    fn dispatcher(sites_root: PathBuf) -> ModeDispatcher {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let metrics = Metrics::new();
        let (_tx, shutdown_rx) = watch::channel(false);
        let (log, _) = LogQueue::start(64, store, Arc::clone(&metrics), shutdown_rx);
        ModeDispatcher::new(metrics, log, sites_root)
    }

    fn site(id: &str, mode: SiteMode) -> SiteConfig {
        SiteConfig {
            id: id.to_string(),
            name: id.to_string(),
            domains: vec!["example.com".to_string()],
            port: 8080,
            mode,
            proxy_target: None,
            redirect_target: None,
            redirect_status: 301,
            firewall: FirewallConfig::default(),
            render: RenderConfig::default(),
        }
    }

    fn ctx() -> VisitContext {
        VisitContext {
            ip: "127.0.0.1".to_string(),
            user_agent: "test".to_string(),
            referer: String::new(),
        }
    }

    fn get(path: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method("GET")
            .uri(path)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    async fn body_string(response: Response<BoxBody<Bytes, hyper::Error>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_is_static_asset() {
        assert!(is_static_asset("/logo.png"));
        assert!(is_static_asset("/a.html"));
        assert!(is_static_asset("/deep/path/app.js?v=2"));
        assert!(!is_static_asset("/app/123"));
        assert!(!is_static_asset("/"));
        assert!(!is_static_asset("/file.unknownext"));
    }

    #[test]
    fn test_sanitize_path_rejects_traversal() {
        assert_eq!(sanitize_path("/a/b.html"), Some(PathBuf::from("a/b.html")));
        assert_eq!(sanitize_path("/"), Some(PathBuf::new()));
        assert!(sanitize_path("/../etc/passwd").is_none());
        assert!(sanitize_path("/a/../../etc").is_none());
    }

    #[tokio::test]
    async fn test_static_serves_existing_asset() {
        let dir = tempfile::tempdir().unwrap();
        let site = site("s1", SiteMode::Static);
        tokio::fs::create_dir_all(dir.path().join("s1")).await.unwrap();
        tokio::fs::write(dir.path().join("s1/logo.png"), b"PNGDATA")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("s1/index.html"), "<html>app</html>")
            .await
            .unwrap();

        let dispatcher = dispatcher(dir.path().to_path_buf());
        let defaults = SiteDefaults::default();

        // Existing asset served directly, no fallback
        let response = dispatcher
            .dispatch(&site, &defaults, get("/logo.png"), &ctx())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "image/png"
        );
        assert_eq!(body_string(response).await, "PNGDATA");
    }

    #[tokio::test]
    async fn test_static_spa_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let site = site("s1", SiteMode::Static);
        tokio::fs::create_dir_all(dir.path().join("s1")).await.unwrap();
        tokio::fs::write(dir.path().join("s1/index.html"), "<html>app</html>")
            .await
            .unwrap();

        let dispatcher = dispatcher(dir.path().to_path_buf());
        let defaults = SiteDefaults::default();

        // App route with no file falls back to index.html
        let response = dispatcher
            .dispatch(&site, &defaults, get("/app/123"), &ctx())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "<html>app</html>");
    }

    #[tokio::test]
    async fn test_static_404_names_site_and_path() {
        let dir = tempfile::tempdir().unwrap();
        let site = site("s1", SiteMode::Static);

        let dispatcher = dispatcher(dir.path().to_path_buf());
        let defaults = SiteDefaults::default();

        let response = dispatcher
            .dispatch(&site, &defaults, get("/missing"), &ctx())
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_string(response).await;
        assert!(body.contains("\"site\":\"s1\""));
        assert!(body.contains("\"path\":\"/missing\""));

        // The static root was created on first access
        assert!(dir.path().join("s1").is_dir());
    }

    #[tokio::test]
    async fn test_redirect_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mut site = site("s1", SiteMode::Redirect);
        site.redirect_target = Some("https://new.example.com".to_string());
        site.redirect_status = 302;

        let dispatcher = dispatcher(dir.path().to_path_buf());
        let defaults = SiteDefaults::default();

        let response = dispatcher
            .dispatch(&site, &defaults, get("/old"), &ctx())
            .await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get("location").unwrap(),
            "https://new.example.com"
        );
    }

    #[tokio::test]
    async fn test_proxy_without_target_is_500() {
        let dir = tempfile::tempdir().unwrap();
        let site = site("s1", SiteMode::Proxy);

        let dispatcher = dispatcher(dir.path().to_path_buf());
        let defaults = SiteDefaults::default();

        let response = dispatcher
            .dispatch(&site, &defaults, get("/"), &ctx())
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get("X-Gateway-Error").unwrap(),
            "INVALID_SITE_CONFIG"
        );
        // The body carries the generic message, not internal detail
        assert!(body_string(response).await.contains("Internal error"));
    }

    #[tokio::test]
    async fn test_proxy_with_unparsable_target_is_500() {
        let dir = tempfile::tempdir().unwrap();
        let mut site = site("s1", SiteMode::Proxy);
        site.proxy_target = Some("not a url".to_string());

        let dispatcher = dispatcher(dir.path().to_path_buf());
        let defaults = SiteDefaults::default();

        let response = dispatcher
            .dispatch(&site, &defaults, get("/"), &ctx())
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_metrics_exclude_static_assets() {
        let dir = tempfile::tempdir().unwrap();
        let site = site("s1", SiteMode::Static);
        tokio::fs::create_dir_all(dir.path().join("s1")).await.unwrap();
        tokio::fs::write(dir.path().join("s1/a.css"), "body{}")
            .await
            .unwrap();

        let dispatcher = dispatcher(dir.path().to_path_buf());
        let defaults = SiteDefaults::default();

        dispatcher
            .dispatch(&site, &defaults, get("/a.css"), &ctx())
            .await;
        dispatcher
            .dispatch(&site, &defaults, get("/app/route"), &ctx())
            .await;

        assert_eq!(dispatcher.metrics.snapshot().requests, 1);
    }
}
