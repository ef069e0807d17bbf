//! Error handling and JSON error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Error codes for request-visible gateway failures
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// Site mode configuration is invalid (e.g. unparsable proxy target)
    InvalidSiteConfig,
    /// The rendering backend failed to produce HTML
    RenderFailed,
    /// The rendering backend exceeded the site's timeout
    RenderTimeout,
    /// Forwarding to the upstream origin failed
    UpstreamFailed,
    /// Upstream did not respond within the request timeout
    UpstreamTimeout,
    /// Key-value store round-trip failed
    StoreUnavailable,
    /// Internal gateway error
    InternalError,
}

impl GatewayErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::InvalidSiteConfig => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::RenderFailed => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::RenderTimeout => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::UpstreamFailed => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayErrorCode::StoreUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::InvalidSiteConfig => "INVALID_SITE_CONFIG",
            GatewayErrorCode::RenderFailed => "RENDER_FAILED",
            GatewayErrorCode::RenderTimeout => "RENDER_TIMEOUT",
            GatewayErrorCode::UpstreamFailed => "UPSTREAM_FAILED",
            GatewayErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            GatewayErrorCode::StoreUnavailable => "STORE_UNAVAILABLE",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: GatewayErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Gateway-Error header.
///
/// Internal error detail stays in the logs; the body carries only the
/// generic message passed here.
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Gateway-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Errors from the key-value store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(#[from] redis::RedisError),

    #[error("malformed record at {key}: {detail}")]
    Malformed { key: String, detail: String },
}

/// Errors from preheat task management
#[derive(Debug, Error)]
pub enum PreheatError {
    /// A preheat task is already running for the site. Callers must treat
    /// this as a conflict and not retry automatically.
    #[error("preheat already running for site {0}")]
    AlreadyRunning(String),

    #[error("site {0} not found")]
    SiteNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Render(#[from] RenderError),
}

/// Errors from the rendering backend
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("render timed out after {0} seconds")]
    Timeout(u64),

    #[error("browser error: {0}")]
    Browser(String),
}

/// Errors from session validation
#[derive(Debug, Error)]
pub enum SessionError {
    /// The token signature is invalid or the claims are malformed
    #[error("invalid session token")]
    InvalidToken,

    /// The session record is absent or past its expiry. A deleted record
    /// makes a cryptographically valid token expire immediately.
    #[error("session expired")]
    Expired,

    #[error(transparent)]
    Store(#[from] StoreError),
}
