//! identify-server - Main entry point
//!
//! Serves POST /identify over HTTP, reconciling email / phone number
//! observations into contact groups stored in SQLite.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use identify_common::db::{init_database, DatabaseOptions};
use identify_server::cli::Args;
use identify_server::reconcile::Reconciler;
use identify_server::store::{IdentityStore, SqliteStore};
use identify_server::{build_router, AppState};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "identify_server=info,identify_common=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting identify-server v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let args = Args::parse();
    let config = args
        .resolve_config()
        .context("Failed to load configuration")?;

    info!("Database path: {}", config.database_path.display());
    info!("Merge strategy: {}", config.merge_strategy);

    let pool = init_database(
        &config.database_path,
        DatabaseOptions {
            max_connections: config.max_connections,
            busy_timeout_ms: config.busy_timeout_ms,
        },
    )
    .await
    .context("Failed to initialize database")?;

    let store = Arc::new(SqliteStore::new(pool.clone()));
    info!("Identity store: {}", store.name());
    let reconciler = Reconciler::new(store, config.merge_strategy)
        .with_lock_retry_max_wait_ms(config.lock_retry_max_wait_ms);
    let app = build_router(AppState::new(reconciler));

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("identify-server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    pool.close().await;
    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
