//! rsrest server binary
//!
//! Serves the record resource and the batch endpoint over HTTP.
//!
//! # Usage
//!
//! ```bash
//! # With config file
//! rsrest --config config.yaml
//!
//! # With environment variables only
//! RSREST_BATCH__CONCURRENCY=4 rsrest
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};

use rsrest_api::http::{create_router_with_body_limit, AppState};
use rsrest_api::middleware::cors_layer;
use rsrest_api::observability::{init_logging, LoggingConfig};
use rsrest_api::resources::{record_executor, record_routes, record_sessions, RecordStore};
use rsrest_server::handlers::batch::register_batch_route;
use rsrest_server::{RouteTable, ServerConfig};

/// rsrest - REST resources with phase-synchronized batching
#[derive(Parser, Debug)]
#[command(name = "rsrest")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = if let Some(config_path) = args.config {
        ServerConfig::load(&config_path)?
    } else {
        ServerConfig::from_env()?
    };

    init_logging(LoggingConfig::from_settings(&config.logging));

    info!(version = env!("CARGO_PKG_VERSION"), "Starting rsrest server");

    let store = Arc::new(RecordStore::new());

    let mut routes = RouteTable::new();
    record_routes(&mut routes, "")?;
    register_batch_route(&mut routes, &config.batch.path)?;
    info!(
        routes = routes.len(),
        batch_path = %config.batch.path,
        concurrency = config.batch.concurrency,
        "Routes registered"
    );

    let executor = record_executor(routes, config.batch.clone(), &store);
    let mut state = AppState::new(executor, record_sessions(store));
    if config.server.request_timeout_secs > 0 {
        state = state.with_request_timeout(Duration::from_secs(config.server.request_timeout_secs));
    }

    let router = create_router_with_body_limit(state, config.server.body_limit_bytes).layer(cors_layer());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    run_http_server(router, addr).await
}

/// Run the HTTP server with graceful shutdown.
async fn run_http_server(router: axum::Router, addr: SocketAddr) -> anyhow::Result<()> {
    info!(%addr, "HTTP server listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
