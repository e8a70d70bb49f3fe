//! Connection pool for upstream and control service HTTP connections
//!
//! One pooled client forwards gated requests to their upstreams, a second one
//! issues readiness checks to the control service.

use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Error type for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Error from the HTTP client
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// Error building a request
    #[error("request build error: {0}")]
    RequestBuild(String),
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Requests forwarded to upstreams
    pub forwarded_requests: AtomicU64,
    /// Readiness checks sent to the control service
    pub readiness_checks: AtomicU64,
}

impl PoolStats {
    pub fn record_forward(&self) {
        self.forwarded_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_check(&self) {
        self.readiness_checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_forwarded_requests(&self) -> u64 {
        self.forwarded_requests.load(Ordering::Relaxed)
    }

    pub fn get_readiness_checks(&self) -> u64 {
        self.readiness_checks.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// A connection pool for HTTP connections
pub struct ConnectionPool {
    /// Client for forwarding inbound requests
    client: Client<HttpConnector, Incoming>,
    /// Client for readiness checks (empty request bodies)
    check_client: Client<HttpConnector, Empty<Bytes>>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    /// Create a new connection pool with the given configuration
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector.clone());

        let check_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            check_client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Forward a request to `authority` (host:port), keeping method, path, headers and body
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        authority: &str,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let uri = format!(
            "http://{}{}",
            authority,
            req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
        );

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder()
            .method(parts.method)
            .uri(&uri);

        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let upstream_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.record_forward();

        let response = self.client.request(upstream_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// Send a readiness check (GET, empty body) to the control service
    pub async fn check(&self, uri: Uri) -> Result<Response<Incoming>, PoolError> {
        let req = Request::builder()
            .method("GET")
            .uri(uri)
            .header("Connection", "keep-alive")
            .body(Empty::<Bytes>::new())
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.record_check();

        Ok(self.check_client.request(req).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_pool_stats() {
        let stats = PoolStats::default();
        assert_eq!(stats.get_forwarded_requests(), 0);
        assert_eq!(stats.get_readiness_checks(), 0);

        stats.record_check();
        stats.record_check();
        stats.record_forward();
        assert_eq!(stats.get_readiness_checks(), 2);
        assert_eq!(stats.get_forwarded_requests(), 1);
    }

    #[tokio::test]
    async fn test_pool_creation() {
        let pool = ConnectionPool::new(PoolConfig {
            max_idle_per_host: 5,
            idle_timeout: Duration::from_secs(30),
        });
        assert_eq!(pool.config().max_idle_per_host, 5);
        assert_eq!(pool.stats().get_readiness_checks(), 0);
    }

    #[tokio::test]
    async fn test_check_unreachable_control_service() {
        let pool = ConnectionPool::new(PoolConfig::default());
        // Port 1 on localhost is never listening in test environments
        let uri: Uri = "http://127.0.0.1:1/api/strategies/dynamic?group=web".parse().unwrap();

        let result = pool.check(uri).await;
        assert!(matches!(result, Err(PoolError::Client(_))));
        assert_eq!(pool.stats().get_readiness_checks(), 1);
    }
}
