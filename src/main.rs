use sablier_gate::admin::{AdminServer, PKG_NAME, VERSION};
use sablier_gate::config::Config;
use sablier_gate::pool::{ConnectionPool, PoolConfig};
use sablier_gate::proxy::ProxyServer;
use sablier_gate::routes::{self, RouteTable};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sablier_gate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let route_table = RouteTable::from_config(&config);
    if route_table.is_empty() {
        warn!("No routes configured, every request will be answered with UNKNOWN_HOST");
    }
    let shared_routes = route_table.shared();

    let pool = Arc::new(ConnectionPool::new(PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    }));

    let proxy_handle = if config.server.port > 0 {
        let http_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
            .parse()
            .map_err(|e| {
                error!(
                    bind = %config.server.bind,
                    port = config.server.port,
                    error = %e,
                    "Invalid HTTP bind address"
                );
                anyhow::anyhow!("Invalid HTTP bind address: {}", e)
            })?;

        let proxy = ProxyServer::new(
            http_addr,
            Arc::clone(&shared_routes),
            Arc::clone(&pool),
            shutdown_rx.clone(),
        )
        .with_request_timeout(config.server.request_timeout())
        .with_control_timeout(config.server.control_timeout())
        .with_max_reply_bytes(config.server.control_max_reply_bytes);

        Some(tokio::spawn(async move {
            if let Err(e) = proxy.run().await {
                error!(error = %e, "Proxy server error");
            }
        }))
    } else {
        None
    };

    let admin_addr: SocketAddr = format!("127.0.0.1:{}", config.server.admin_port)
        .parse()
        .map_err(|e| {
            error!(admin_port = config.server.admin_port, error = %e, "Invalid admin bind address");
            anyhow::anyhow!("Invalid admin bind address: {}", e)
        })?;

    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(
            token = %token,
            "Generated admin API token (configure admin_token to set a fixed value)"
        );
        token
    });

    let admin_server = AdminServer::new(
        admin_addr,
        Arc::clone(&shared_routes),
        Arc::clone(&pool),
        shutdown_rx.clone(),
        admin_token,
    );

    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or route reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "Received SIGHUP, reloading routes...");
                    match routes::reload(&shared_routes, &config_path) {
                        Ok(result) => {
                            if !result.added.is_empty() {
                                info!(routes = ?result.added, "New routes available");
                            }
                            if !result.removed.is_empty() {
                                info!(routes = ?result.removed, "Routes removed");
                            }
                        }
                        Err(e) => {
                            error!(
                                error = %e,
                                "Failed to reload configuration, keeping current routes"
                            );
                        }
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        if let Some(handle) = proxy_handle {
            let _ = handle.await;
        }
        let _ = admin_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting readiness gate");
    info!(
        bind = %config.server.bind,
        http_port = if config.server.port > 0 { Some(config.server.port) } else { None },
        admin_port = config.server.admin_port,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        control_url = %config.control.url,
        request_timeout_secs = config.server.request_timeout_secs,
        control_timeout_secs = config.server.control_timeout_secs,
        "Gate settings"
    );
    info!(
        route_count = config.routes.len(),
        routes = ?config.routes.keys().collect::<Vec<_>>(),
        upstreams = ?config.upstreams.keys().collect::<Vec<_>>(),
        "Configured routes"
    );
}
