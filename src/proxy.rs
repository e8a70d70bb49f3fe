use crate::error::{json_error_response, GateError, ProxyErrorCode};
use crate::extractor::GateConfig;
use crate::gate::{Action, ReadinessGate};
use crate::pool::ConnectionPool;
use crate::routes::SharedRoutes;
use crate::variables::{RequestVariables, VariableScope};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Per-connection state shared by every request on it
#[derive(Clone)]
struct Handler {
    routes: SharedRoutes,
    gate: ReadinessGate,
    pool: Arc<ConnectionPool>,
    request_timeout: Duration,
}

/// The gating reverse proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    shutdown_rx: watch::Receiver<bool>,
    handler: Handler,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        routes: SharedRoutes,
        pool: Arc<ConnectionPool>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            shutdown_rx,
            handler: Handler {
                routes,
                gate: ReadinessGate::new(Arc::clone(&pool)),
                pool,
                request_timeout: Duration::from_secs(30),
            },
        }
    }

    /// Max time to wait for an upstream once the gate is open
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.handler.request_timeout = timeout;
        self
    }

    /// Transport-level bound on readiness checks (`None` to let the control service decide)
    pub fn with_control_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler.gate = self.handler.gate.with_timeout(timeout);
        self
    }

    /// Largest control service reply buffered per check
    pub fn with_max_reply_bytes(mut self, max_reply_bytes: usize) -> Self {
        self.handler.gate = self.handler.gate.with_max_reply_bytes(max_reply_bytes);
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let handler = self.handler.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, handler).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, handler: Handler) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let handler = handler.clone();
        async move { handle_request(req, handler, addr).await }
    });

    // Use auto::Builder to support both HTTP/1.1 and HTTP/2 (h2c)
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    handler: Handler,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let hostname = match extract_hostname(&req) {
        Some(h) => h,
        None => {
            return Ok(json_error_response(
                ProxyErrorCode::MissingHostHeader,
                "Missing or invalid Host header",
            ));
        }
    };

    let (route, control_url) = {
        let routes = handler.routes.read();
        (routes.lookup(&hostname), routes.control_url().to_string())
    };

    let route = match route {
        Some(route) => route,
        None => {
            return Ok(json_error_response(
                ProxyErrorCode::UnknownHost,
                "Unknown or unconfigured host",
            ));
        }
    };

    // Variables see the request as the client sent it
    let variables = RequestVariables::capture(&req, client_addr, false);

    // We overwrite X-Forwarded-* headers rather than appending: this proxy is
    // assumed to be the first trusted hop.
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(
        hostname,
        route = %route.host,
        method = %req.method(),
        uri = %req.uri(),
        request_id,
        "Incoming request"
    );

    let scope = VariableScope::new(&route.templates, &variables);
    let action = match GateConfig::from_scope(&scope, &control_url) {
        Ok(config) => handler.gate.handle(&config).await,
        Err(e) => Err(e),
    };

    match action {
        Ok(Action::ForwardInternally { target }) => {
            forward(req, &handler, &hostname, &target, &request_id).await
        }
        Ok(Action::RespondWith {
            status,
            body,
            content_type,
            content_length,
        }) => Ok(passthrough_response(status, body, content_type, content_length)),
        Err(e) => Ok(gate_error_response(&hostname, &request_id, e)),
    }
}

/// Serve the original request from the redirect target
async fn forward(
    req: Request<Incoming>,
    handler: &Handler,
    hostname: &str,
    target: &str,
    request_id: &str,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let authority = match handler.routes.read().resolve_redirect(target) {
        Ok(authority) => authority,
        Err(e) => {
            error!(hostname, target, request_id, error = %e, "Cannot resolve internal redirect");
            return Ok(json_error_response(
                ProxyErrorCode::UnknownRedirectTarget,
                "Internal redirect target is not configured",
            ));
        }
    };

    debug!(hostname, target, authority = %authority, request_id, "Forwarding to upstream");

    let timeout = handler.request_timeout;
    match tokio::time::timeout(timeout, handler.pool.send_request(req, &authority)).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            // Log detailed error internally, return generic message externally
            error!(
                hostname,
                authority = %authority,
                error = %e,
                "Failed to forward request via pool"
            );
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to upstream",
            ))
        }
        Err(_) => {
            warn!(
                hostname,
                authority = %authority,
                timeout_secs = timeout.as_secs(),
                "Request timed out"
            );
            Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!("Request timed out after {} seconds", timeout.as_secs()),
            ))
        }
    }
}

/// The control service reply, as the client will see it
fn passthrough_response(
    status: StatusCode,
    body: Bytes,
    content_type: Option<HeaderValue>,
    content_length: u64,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut builder = Response::builder()
        .status(status)
        .header(CONTENT_LENGTH, content_length);

    if let Some(content_type) = content_type {
        builder = builder.header(CONTENT_TYPE, content_type);
    }

    builder
        .body(Full::new(body).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

fn gate_error_response(
    hostname: &str,
    request_id: &str,
    e: GateError,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let code = e.error_code();
    match code {
        ProxyErrorCode::GateConfigError => {
            error!(hostname, request_id, error = %e, "Invalid gate configuration for request");
            json_error_response(code, e.to_string())
        }
        ProxyErrorCode::RequestTimeout => {
            warn!(hostname, request_id, error = %e, "Readiness check timed out");
            json_error_response(code, "Timed out waiting for the control service")
        }
        _ => {
            error!(hostname, request_id, error = %e, "Readiness check failed");
            json_error_response(code, "Control service unavailable")
        }
    }
}

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())
        .and_then(|h| {
            // Strip port if present
            let hostname = h.split(':').next()?;

            if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
                return None;
            }

            // Alphanumeric, hyphen and dot only, which also keeps logs clean
            if !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
                return None;
            }

            Some(hostname.to_lowercase())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_host(host: &str) -> Request<()> {
        Request::builder().uri("/").header("Host", host).body(()).unwrap()
    }

    #[test]
    fn test_extract_hostname() {
        assert_eq!(
            extract_hostname(&request_with_host("App.Example.com:8080")).as_deref(),
            Some("app.example.com")
        );
        assert_eq!(
            extract_hostname(&request_with_host("localhost")).as_deref(),
            Some("localhost")
        );
        assert_eq!(extract_hostname(&request_with_host("bad host")), None);
        assert_eq!(extract_hostname(&request_with_host(&"a".repeat(254))), None);

        let absolute = Request::builder()
            .uri("http://h2.example.com/path")
            .body(())
            .unwrap();
        assert_eq!(extract_hostname(&absolute).as_deref(), Some("h2.example.com"));

        let missing = Request::builder().uri("/").body(()).unwrap();
        assert_eq!(extract_hostname(&missing), None);
    }

    #[tokio::test]
    async fn test_passthrough_response_copies_reply_headers() {
        let response = passthrough_response(
            StatusCode::OK,
            Bytes::from_static(b"<html>starting</html>"),
            Some(HeaderValue::from_static("text/html")),
            21,
        );

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "text/html");
        assert_eq!(response.headers().get(CONTENT_LENGTH).unwrap(), "21");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"<html>starting</html>");
    }

    #[test]
    fn test_passthrough_response_without_content_type() {
        let response = passthrough_response(StatusCode::OK, Bytes::new(), None, 0);
        assert!(response.headers().get(CONTENT_TYPE).is_none());
        assert_eq!(response.headers().get(CONTENT_LENGTH).unwrap(), "0");
    }

    #[test]
    fn test_gate_error_response_codes() {
        let response = gate_error_response("app.local", "id", GateError::MissingTarget);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "GATE_CONFIG_ERROR"
        );

        let response = gate_error_response(
            "app.local",
            "id",
            GateError::Timeout(Duration::from_secs(5)),
        );
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
