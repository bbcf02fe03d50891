use anyhow::Result;
use axum::http::Request;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use wpp_webhooks::config::Config;
use wpp_webhooks::handlers::{router, AppState};
use wpp_webhooks::{db, worker};

#[derive(Debug, Parser)]
#[command(author, version, about = "Gupshup webhook ingress and projection worker")]
struct Args {
    /// Path to .env file (optional).
    #[arg(long, env = "DOTENV_PATH", default_value = ".env")]
    dotenv: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if std::path::Path::new(&args.dotenv).exists() {
        dotenvy::from_path(&args.dotenv)?;
    }

    let config = Config::from_env()?;

    // Structured JSON lines; RUST_LOG overrides the configured level.
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    info!(
        port = config.port,
        batch_size = config.batch_size,
        interval_ms = config.interval_ms,
        "configuration loaded"
    );

    let pool = db::init_pool(&config.database_url, config.pool_size).await?;
    db::run_migrations(&pool).await?;

    let config = Arc::new(config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // The projection worker runs beside the HTTP server; replicas of this
    // process coordinate through the skip-lock batch claim only.
    let worker_handle = tokio::spawn(worker::run(
        pool.clone(),
        config.clone(),
        shutdown_rx.clone(),
    ));

    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let state = AppState {
        pool: pool.clone(),
        config: config.clone(),
    };
    let app = router(state).layer(
        TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
            tracing::span!(
                Level::INFO,
                "http_request",
                method = %request.method(),
                path = %request.uri().path(),
            )
        }),
    );

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "starting webhook server");

    let mut http_shutdown = shutdown_rx;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = http_shutdown.changed().await;
        })
        .await?;

    // Let the in-flight tick commit before the pool closes.
    let _ = worker_handle.await;
    pool.close().await;
    info!("shutdown complete");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
