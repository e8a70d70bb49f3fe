use crate::extractor::{VAR_GROUP, VAR_INTERNAL_REDIRECT, VAR_NAMES};
use crate::pool::ConnectionPool;
use crate::routes::SharedRoutes;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the gate
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

/// Admin API server: liveness, version and route inspection
pub struct AdminServer {
    bind_addr: SocketAddr,
    routes: SharedRoutes,
    pool: Arc<ConnectionPool>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        routes: SharedRoutes,
        pool: Arc<ConnectionPool>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            routes,
            pool,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
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
                            let routes = Arc::clone(&self.routes);
                            let pool = Arc::clone(&self.pool);
                            let auth_token = Arc::clone(&self.auth_token);

                            tokio::spawn(async move {
                                if let Err(e) =
                                    serve_admin_connection(stream, routes, pool, auth_token).await
                                {
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
    routes: SharedRoutes,
    pool: Arc<ConnectionPool>,
    auth_token: Arc<String>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
        let routes = Arc::clone(&routes);
        let pool = Arc::clone(&pool);
        let token = Arc::clone(&auth_token);
        async move { handle_admin_request(req, routes, pool, token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

fn routes_body(routes: &SharedRoutes, pool: &ConnectionPool) -> serde_json::Value {
    let table = routes.read();
    let route_list: Vec<serde_json::Value> = table
        .routes()
        .iter()
        .map(|r| {
            serde_json::json!({
                "host": r.host,
                "names": r.templates.get(VAR_NAMES),
                "group": r.templates.get(VAR_GROUP),
                "internal_redirect": r.templates.get(VAR_INTERNAL_REDIRECT),
            })
        })
        .collect();

    let stats = pool.stats();
    serde_json::json!({
        "control_url": table.control_url(),
        "count": route_list.len(),
        "routes": route_list,
        "stats": {
            "readiness_checks": stats.get_readiness_checks(),
            "forwarded_requests": stats.get_forwarded_requests(),
        }
    })
}

async fn handle_admin_request<B>(
    req: Request<B>,
    routes: SharedRoutes,
    pool: Arc<ConnectionPool>,
    auth_token: Arc<String>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Admin API request");

    let response = match (method, path) {
        // Health check for the admin API itself (no auth required)
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        // Routes and pool counters: GET /routes (auth required)
        (&Method::GET, "/routes") => {
            if !check_auth(&req, &auth_token) {
                warn!(path, "Unauthorized admin API request");
                response(StatusCode::UNAUTHORIZED, "unauthorized")
            } else {
                json_response(StatusCode::OK, routes_body(&routes, &pool).to_string())
            }
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}
