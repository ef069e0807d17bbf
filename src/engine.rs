//! Per-site gateway engine: one bound listener plus the request pipeline.
//!
//! Every inbound request runs firewall -> bot classification -> either
//! the render cache (crawlers) or the mode dispatcher (everyone else).
//! The listener is owned by the engine; stopping the engine stops the
//! accept loop and waits a bounded grace period for in-flight requests.

use crate::access_log::{LogQueue, LogRecord};
use crate::botdetect;
use crate::cache::{CacheError, CrawlerRequest, RenderCacheEngine};
use crate::config::{SiteConfig, SiteDefaults};
use crate::dispatch::{ModeDispatcher, VisitContext};
use crate::error::{json_error_response, GatewayErrorCode, RenderError};
use crate::firewall::{self, Decision};
use crate::geoip::GeoIpResolver;
use crate::metrics::Metrics;
use crate::store::Store;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Interval for polling the in-flight counter while draining
const DRAIN_POLL_INTERVAL_MS: u64 = 50;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// Shared collaborators handed to every engine
#[derive(Clone)]
pub struct GatewayContext {
    pub store: Arc<dyn Store>,
    pub geoip: Arc<GeoIpResolver>,
    pub metrics: Arc<Metrics>,
    pub log: LogQueue,
    pub cache: Arc<RenderCacheEngine>,
    pub dispatcher: Arc<ModeDispatcher>,
    pub defaults: SiteDefaults,
    pub sites_root: PathBuf,
    pub bind: String,
}

/// A running gateway instance for one site
pub struct SiteEngine {
    config: Arc<SiteConfig>,
    ctx: GatewayContext,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    /// Flips to true when the accept loop has dropped the listener
    closed_rx: watch::Receiver<bool>,
    in_flight: Arc<AtomicUsize>,
}

impl SiteEngine {
    /// Bind the site's listener and start serving. Binding happens
    /// before this returns, so a port conflict fails the add/update
    /// instead of a half-started engine.
    pub async fn start(config: SiteConfig, ctx: GatewayContext) -> anyhow::Result<Arc<Self>> {
        let addr: SocketAddr = format!("{}:{}", ctx.bind, config.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid bind address for site '{}': {}", config.id, e))?;
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            anyhow::anyhow!("failed to bind port {} for site '{}': {}", config.port, config.id, e)
        })?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = watch::channel(false);

        let engine = Arc::new(Self {
            config: Arc::new(config),
            ctx,
            local_addr,
            shutdown_tx,
            closed_rx,
            in_flight: Arc::new(AtomicUsize::new(0)),
        });

        let accept_engine = Arc::clone(&engine);
        tokio::spawn(async move {
            accept_engine.accept_loop(listener, shutdown_rx).await;
            let _ = closed_tx.send(true);
        });

        info!(
            site = %engine.config.id,
            addr = %local_addr,
            mode = engine.config.mode.as_str(),
            "Site engine listening"
        );

        Ok(engine)
    }

    pub fn config(&self) -> Arc<SiteConfig> {
        Arc::clone(&self.config)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Stop accepting and wait for in-flight requests, bounded by the
    /// configured grace period
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);

        // Wait for the accept loop to drop the listener; a replacement
        // engine may need to bind the same port immediately
        let mut closed_rx = self.closed_rx.clone();
        let _ = tokio::time::timeout(Duration::from_secs(2), async {
            while !*closed_rx.borrow() {
                if closed_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;

        let grace = Duration::from_secs(self.ctx.defaults.shutdown_grace_period_secs);
        let deadline = tokio::time::Instant::now() + grace;
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    site = %self.config.id,
                    in_flight = self.in_flight.load(Ordering::SeqCst),
                    "Grace period elapsed with requests still in flight"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(DRAIN_POLL_INTERVAL_MS)).await;
        }

        info!(site = %self.config.id, "Site engine stopped");
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let engine = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = engine.handle_connection(stream, addr).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(site = %self.config.id, error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!(site = %self.config.id, "Accept loop shutting down");
                        break;
                    }
                }
            }
        }
        // Listener drops here, freeing the port for a replacement engine
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: tokio::net::TcpStream,
        addr: SocketAddr,
    ) -> anyhow::Result<()> {
        let io = TokioIo::new(stream);
        let engine = Arc::clone(&self);

        let service = service_fn(move |req: Request<Incoming>| {
            let engine = Arc::clone(&engine);
            async move { engine.handle_request(req, addr).await }
        });

        AutoBuilder::new(TokioExecutor::new())
            .serve_connection(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("connection error: {}", e))?;

        Ok(())
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let response = self.process_request(req, client_addr).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(response)
    }

    async fn process_request(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let site = &self.config;
        let client_ip = client_addr.ip();

        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let user_agent = header_string(&req, hyper::header::USER_AGENT);
        let referer = header_string(&req, hyper::header::REFERER);
        let path = req.uri().path().to_string();
        let method = req.method().to_string();

        debug!(
            site = %site.id,
            %method,
            path,
            ip = %client_ip,
            request_id,
            "Incoming request"
        );

        // Firewall stage
        let country = self.ctx.geoip.lookup_country_iso(client_ip);
        let decision = match firewall::evaluate(
            &site.firewall,
            &site.id,
            client_ip,
            &country,
            &*self.ctx.store,
        )
        .await
        {
            Ok(decision) => decision,
            Err(e) => {
                error!(site = %site.id, error = %e, "Firewall store round-trip failed");
                return json_error_response(GatewayErrorCode::StoreUnavailable, "Internal error");
            }
        };

        if let Decision::Block { rule, reason } = decision {
            self.ctx.metrics.record_blocked(&site.id);
            self.ctx.log.record(LogRecord::Block {
                site: site.id.clone(),
                request_id,
                ip: client_ip.to_string(),
                path: path.clone(),
                method,
                user_agent,
                status: 403,
                rule_id: rule.id().to_string(),
                reason,
                timestamp: LogRecord::now_ts(),
            });

            let static_root = site.static_root(&self.ctx.sites_root);
            let body = firewall::block_page(&static_root, &site.firewall.block_message).await;
            return Response::builder()
                .status(StatusCode::FORBIDDEN)
                .header(hyper::header::CONTENT_TYPE, "text/html; charset=utf-8")
                .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
                .expect("valid response with StatusCode enum and static headers");
        }

        // Bot classification only happens for allowed requests
        if botdetect::is_crawler(&user_agent, &site.render) {
            let full_url = self.full_url(&req);
            let request = CrawlerRequest {
                ip: client_ip.to_string(),
                path,
                user_agent,
            };
            return match self
                .ctx
                .cache
                .handle_crawler_request(site, &self.ctx.defaults, &full_url, &request)
                .await
            {
                Ok((html, _hit)) => Response::builder()
                    .status(StatusCode::OK)
                    .header(hyper::header::CONTENT_TYPE, "text/html; charset=utf-8")
                    .body(Full::new(Bytes::from(html)).map_err(|e| match e {}).boxed())
                    .expect("valid response with StatusCode enum and static headers"),
                Err(CacheError::Render(RenderError::Timeout(_))) => {
                    json_error_response(GatewayErrorCode::RenderTimeout, "Internal error")
                }
                Err(CacheError::Render(_)) => {
                    json_error_response(GatewayErrorCode::RenderFailed, "Internal error")
                }
                Err(CacheError::Store(e)) => {
                    error!(site = %site.id, error = %e, "Store unavailable during render");
                    json_error_response(GatewayErrorCode::StoreUnavailable, "Internal error")
                }
            };
        }

        // Normal traffic goes through the mode dispatcher
        let ctx = VisitContext {
            ip: client_ip.to_string(),
            user_agent,
            referer,
        };
        self.ctx
            .dispatcher
            .dispatch(site, &self.ctx.defaults, req, &ctx)
            .await
    }

    /// Reconstruct the full URL a crawler asked for, keyed into the cache
    fn full_url(&self, req: &Request<Incoming>) -> String {
        let host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| {
                self.config
                    .domains
                    .first()
                    .cloned()
                    .unwrap_or_else(|| format!("localhost:{}", self.config.port))
            });
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        format!("http://{}{}", host, path_and_query)
    }
}

fn header_string(req: &Request<Incoming>, name: hyper::header::HeaderName) -> String {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}
