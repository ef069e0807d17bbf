//! Admin API server: site CRUD, preheat/push triggers, stats.
//!
//! Hand-routed over hyper on a localhost port. Write operations require
//! either the static admin token or a live session token issued by
//! `POST /login`; health and version are open.

use crate::botdetect;
use crate::config::SiteConfig;
use crate::error::PreheatError;
use crate::metrics::Metrics;
use crate::preheat::PreheatRunner;
use crate::push::PushRunner;
use crate::registry::EngineManager;
use crate::session::SessionManager;
use crate::store::Store;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn json_error(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(
        status,
        serde_json::json!({ "error": message }).to_string(),
    )
}

/// Collaborators the admin surface operates on
#[derive(Clone)]
pub struct AdminContext {
    pub registry: Arc<EngineManager>,
    pub preheat: Arc<PreheatRunner>,
    pub push: Arc<PushRunner>,
    pub sessions: Arc<SessionManager>,
    pub metrics: Arc<Metrics>,
    pub store: Arc<dyn Store>,
}

/// Admin API server
pub struct AdminServer {
    bind_addr: SocketAddr,
    ctx: AdminContext,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    token: String,
}

#[derive(Debug, Deserialize)]
struct PreheatUrlRequest {
    url: String,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        ctx: AdminContext,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            ctx,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Admin API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let ctx = self.ctx.clone();
                            let auth_token = Arc::clone(&self.auth_token);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, addr, ctx, auth_token).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection<S>(
    stream: S,
    _addr: SocketAddr,
    ctx: AdminContext,
    auth_token: Arc<String>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let ctx = ctx.clone();
        let token = Arc::clone(&auth_token);
        async move { handle_admin_request(req, ctx, token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("admin connection error: {}", e))?;

    Ok(())
}

/// A request authorizes with the static admin token or a live session
async fn check_auth(
    req: &Request<Incoming>,
    expected_token: &str,
    sessions: &SessionManager,
) -> bool {
    let Some(token) = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth))
    else {
        return false;
    };

    if token == expected_token {
        return true;
    }
    sessions.validate(token).await.is_ok()
}

async fn read_body(req: Request<Incoming>) -> Result<Bytes, hyper::Error> {
    Ok(req.into_body().collect().await?.to_bytes())
}

async fn handle_admin_request(
    req: Request<Incoming>,
    ctx: AdminContext,
    auth_token: Arc<String>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Admin API request");

    // Open endpoints
    match (&method, path.as_str()) {
        (&Method::GET, "/health") => return Ok(response(StatusCode::OK, "ok")),
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            return Ok(json_response(StatusCode::OK, version_info.to_string()));
        }
        (&Method::POST, "/login") => {
            let body = read_body(req).await?;
            let Ok(login) = serde_json::from_slice::<LoginRequest>(&body) else {
                return Ok(json_error(StatusCode::BAD_REQUEST, "invalid login body"));
            };
            if login.token != *auth_token {
                warn!("Admin login with wrong token");
                return Ok(json_error(StatusCode::UNAUTHORIZED, "unauthorized"));
            }
            return Ok(match ctx.sessions.create("admin").await {
                Ok((token, session_id)) => json_response(
                    StatusCode::OK,
                    serde_json::json!({ "token": token, "session_id": session_id }).to_string(),
                ),
                Err(e) => {
                    error!(error = %e, "Failed to create session");
                    json_error(StatusCode::INTERNAL_SERVER_ERROR, "session store error")
                }
            });
        }
        _ => {}
    }

    // Everything else requires auth
    if !check_auth(&req, &auth_token, &ctx.sessions).await {
        warn!(%path, "Unauthorized admin API request");
        return Ok(json_error(StatusCode::UNAUTHORIZED, "unauthorized"));
    }

    let segments: Vec<String> = path
        .trim_matches('/')
        .split('/')
        .map(String::from)
        .collect();
    let segments: Vec<&str> = segments.iter().map(|s| s.as_str()).collect();

    let response = match (&method, segments.as_slice()) {
        (&Method::POST, ["logout"]) => {
            let token = req
                .headers()
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|auth| auth.strip_prefix("Bearer "))
                .unwrap_or("");
            match ctx.sessions.revoke_token(token).await {
                Ok(()) => json_response(StatusCode::OK, "{\"status\":\"logged out\"}"),
                Err(_) => json_error(StatusCode::BAD_REQUEST, "not a session token"),
            }
        }

        (&Method::GET, ["sites"]) => {
            let sites = ctx.registry.list_sites();
            let list: Vec<&SiteConfig> = sites.iter().map(|s| s.as_ref()).collect();
            match serde_json::to_string(&list) {
                Ok(body) => json_response(StatusCode::OK, body),
                Err(_) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "serialization failed"),
            }
        }

        (&Method::POST, ["sites"]) => {
            let body = read_body(req).await?;
            match serde_json::from_slice::<SiteConfig>(&body) {
                Ok(config) => match ctx.registry.add_site(config).await {
                    Ok(id) => json_response(
                        StatusCode::CREATED,
                        serde_json::json!({ "id": id }).to_string(),
                    ),
                    Err(e) => json_error(StatusCode::BAD_REQUEST, &e.to_string()),
                },
                Err(e) => json_error(StatusCode::BAD_REQUEST, &format!("invalid site body: {}", e)),
            }
        }

        (&Method::GET, ["sites", id]) => match ctx.registry.get_engine(id) {
            Some(engine) => match serde_json::to_string(engine.config().as_ref()) {
                Ok(body) => json_response(StatusCode::OK, body),
                Err(_) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "serialization failed"),
            },
            None => json_error(StatusCode::NOT_FOUND, "site not found"),
        },

        (&Method::PUT, ["sites", id]) => {
            let id = id.to_string();
            let body = read_body(req).await?;
            match serde_json::from_slice::<SiteConfig>(&body) {
                Ok(mut config) => {
                    config.id = id;
                    match ctx.registry.update_site(config).await {
                        Ok(()) => json_response(StatusCode::OK, "{\"status\":\"updated\"}"),
                        Err(e) => json_error(StatusCode::BAD_REQUEST, &e.to_string()),
                    }
                }
                Err(e) => json_error(StatusCode::BAD_REQUEST, &format!("invalid site body: {}", e)),
            }
        }

        (&Method::DELETE, ["sites", id]) => match ctx.registry.remove_site(id).await {
            Ok(true) => json_response(StatusCode::OK, "{\"status\":\"removed\"}"),
            Ok(false) => json_error(StatusCode::NOT_FOUND, "site not found"),
            Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        },

        (&Method::POST, ["sites", id, "preheat"]) => match ctx.registry.get_engine(id) {
            Some(engine) => match ctx.preheat.trigger(engine.config()).await {
                Ok(task_id) => json_response(
                    StatusCode::ACCEPTED,
                    serde_json::json!({ "task_id": task_id }).to_string(),
                ),
                Err(PreheatError::AlreadyRunning(_)) => {
                    json_error(StatusCode::CONFLICT, "preheat already running")
                }
                Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
            },
            None => json_error(StatusCode::NOT_FOUND, "site not found"),
        },

        (&Method::POST, ["sites", id, "preheat", "url"]) => {
            let id = id.to_string();
            let Some(engine) = ctx.registry.get_engine(&id) else {
                return Ok(json_error(StatusCode::NOT_FOUND, "site not found"));
            };
            let body = read_body(req).await?;
            let Ok(preheat_req) = serde_json::from_slice::<PreheatUrlRequest>(&body) else {
                return Ok(json_error(StatusCode::BAD_REQUEST, "invalid body, expected {\"url\": ...}"));
            };
            match ctx
                .preheat
                .trigger_for_url(&engine.config(), &preheat_req.url)
                .await
            {
                Ok(()) => json_response(StatusCode::OK, "{\"status\":\"cached\"}"),
                Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
            }
        }

        (&Method::GET, ["sites", id, "preheat", task_id]) => {
            match ctx.store.get_task(id, task_id).await {
                Ok(Some(task)) => match serde_json::to_string(&task) {
                    Ok(body) => json_response(StatusCode::OK, body),
                    Err(_) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "serialization failed"),
                },
                Ok(None) => json_error(StatusCode::NOT_FOUND, "task not found"),
                Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
            }
        }

        (&Method::POST, ["sites", id, "push"]) => match ctx.registry.get_engine(id) {
            Some(engine) => match ctx.push.trigger(engine.config()).await {
                Ok(task_id) => json_response(
                    StatusCode::ACCEPTED,
                    serde_json::json!({ "task_id": task_id }).to_string(),
                ),
                Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
            },
            None => json_error(StatusCode::NOT_FOUND, "site not found"),
        },

        (&Method::GET, ["sites", id, "push", "stats"]) => match ctx.registry.get_engine(id) {
            Some(engine) => match ctx.push.stats(&engine.config()).await {
                Ok(stats) => match serde_json::to_string(&stats) {
                    Ok(body) => json_response(StatusCode::OK, body),
                    Err(_) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "serialization failed"),
                },
                Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
            },
            None => json_error(StatusCode::NOT_FOUND, "site not found"),
        },

        (&Method::GET, ["sites", id, "push", "logs"]) => {
            match ctx.store.push_logs(id, 100).await {
                Ok(logs) => {
                    let entries: Vec<serde_json::Value> = logs
                        .iter()
                        .filter_map(|l| serde_json::from_str(l).ok())
                        .collect();
                    json_response(
                        StatusCode::OK,
                        serde_json::json!({ "logs": entries }).to_string(),
                    )
                }
                Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
            }
        }

        (&Method::GET, ["sites", id, "cache", "stats"]) => {
            match ctx.store.cache_stats(id).await {
                Ok(stats) => match serde_json::to_string(&stats) {
                    Ok(body) => json_response(StatusCode::OK, body),
                    Err(_) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "serialization failed"),
                },
                Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
            }
        }

        (&Method::GET, ["crawlers"]) => json_response(
            StatusCode::OK,
            serde_json::json!({ "crawlers": botdetect::default_crawler_tokens() }).to_string(),
        ),

        (&Method::GET, ["stats"]) => {
            let snapshot = ctx.metrics.snapshot();
            match serde_json::to_string(&snapshot) {
                Ok(body) => json_response(StatusCode::OK, body),
                Err(_) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "serialization failed"),
            }
        }

        _ => json_error(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}
