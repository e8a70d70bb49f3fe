//! Error handling and JSON error responses for the gate

use crate::pool::PoolError;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

/// Failures while gating a single inbound request
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// Neither target names nor a target group resolved to a value
    #[error("you must specify sablier_names or sablier_group")]
    MissingTarget,
    /// The route has no internal redirect target for this request
    #[error("sablier_internal_redirect is not set")]
    MissingRedirect,
    /// The control service URL and query do not form a valid URI
    #[error("invalid readiness check uri '{uri}': {source}")]
    InvalidCheckUri {
        uri: String,
        #[source]
        source: hyper::http::uri::InvalidUri,
    },
    /// The control service URL is not a plain `http://` URL with a host
    #[error("control service url '{0}' must be an http:// URL")]
    UnsupportedControlUrl(String),
    /// The check parameters could not be form encoded
    #[error("failed to encode readiness check query: {0}")]
    QueryEncoding(#[from] serde_urlencoded::ser::Error),
    /// The readiness sub-request failed at the transport level
    #[error("readiness check failed: {0}")]
    Upstream(#[from] PoolError),
    /// The control service reply body could not be read or exceeded the size limit
    #[error("failed to read readiness check reply: {0}")]
    UpstreamBody(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The host transport gave up waiting for the control service
    #[error("readiness check timed out after {0:?}")]
    Timeout(Duration),
}

impl GateError {
    /// Error code reported to the client for this failure
    pub fn error_code(&self) -> ProxyErrorCode {
        match self {
            GateError::MissingTarget
            | GateError::MissingRedirect
            | GateError::InvalidCheckUri { .. }
            | GateError::UnsupportedControlUrl(_)
            | GateError::QueryEncoding(_) => ProxyErrorCode::GateConfigError,
            GateError::Upstream(_) | GateError::UpstreamBody(_) => {
                ProxyErrorCode::ControlServiceUnavailable
            }
            GateError::Timeout(_) => ProxyErrorCode::RequestTimeout,
        }
    }
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// No route configured for the host
    UnknownHost,
    /// Route variables do not describe a valid readiness check
    GateConfigError,
    /// The control service could not be reached
    ControlServiceUnavailable,
    /// Internal redirect target does not name a known upstream
    UnknownRedirectTarget,
    /// Request timed out
    RequestTimeout,
    /// Failed to connect to the upstream after the gate opened
    ConnectionFailed,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::UnknownHost => StatusCode::NOT_FOUND,
            ProxyErrorCode::GateConfigError => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::ControlServiceUnavailable => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::UnknownRedirectTarget => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::UnknownHost => "UNKNOWN_HOST",
            ProxyErrorCode::GateConfigError => "GATE_CONFIG_ERROR",
            ProxyErrorCode::ControlServiceUnavailable => "CONTROL_SERVICE_UNAVAILABLE",
            ProxyErrorCode::UnknownRedirectTarget => "UNKNOWN_REDIRECT_TARGET",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
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

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
