//! Application entry point for the `codemetal-agrowatch` alerting service.
//!
//! This binary orchestrates the full startup sequence, including:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Connecting to PostgreSQL (stores and queues) with bounded retry
//! - Creating the database schema if it does not exist
//! - Starting the alert and/or projection consumers
//! - Serving health and readiness probes via the `routes` gateway (EMBP)
//! - Draining in-flight messages on SIGINT/SIGTERM before exit
//!
//! # Environment Variables
//! - `DATABASE_URL` (**required**) – PostgreSQL connection string
//! - `AGROWATCH_WORKERS` (optional) – `alert`, `projection` or `all`
//! - `AGROWATCH_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `AGROWATCH_SPAN_EVENTS` (optional) – span event mode for tracing
//!
//! See `config.rs` for the remaining knobs.
use std::{env, net::SocketAddr, sync::Arc};

use anyhow::Result;
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use tokio::sync::watch;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use agrowatch::{
    alerts::{AlertConsumer, PgAlertStore},
    config,
    property::{PgPropertyStore, ProjectionConsumer},
    routes::{self, AppState},
    schema,
    transport::{connect_with_retry, EventBus, PgBroker},
};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    init_tracing();
    dotenv().ok();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    tracing::info!("Attempting to connect to database: {}", cfg.masked_db_url());

    // Without the broker there is nothing to do; retries exhausted is fatal.
    let pool = connect_with_retry(&cfg.db_url, cfg.db_pool_max, cfg.retry_policy()).await?;

    tracing::info!("Successfully connected to database");

    schema::create_schema(&pool).await?;

    let broker = Arc::new(PgBroker::new(pool.clone(), cfg.visibility()));
    let bus = EventBus::new(broker, cfg.poll_interval());

    let mut alerts = None;
    if cfg.workers.runs_alerts() {
        let consumer = Arc::new(AlertConsumer::new(
            Arc::new(PgAlertStore::new(pool.clone())),
            bus.clone(),
        ));
        consumer.start().await?;
        alerts = Some(consumer);
    }
    if cfg.workers.runs_projection() {
        let projection = Arc::new(ProjectionConsumer::new(Arc::new(PgPropertyStore::new(
            pool.clone(),
        ))));
        projection.start(&bus).await?;
    }

    // Probe endpoints, stopped after the workers have drained
    let app = routes::router(AppState {
        bus: bus.clone(),
        role: cfg.workers,
        alerts,
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.health_port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stop_rx.changed().await;
            })
            .await
    });

    shutdown_signal().await;
    tracing::info!("Shutdown requested, draining subscriptions");

    bus.shutdown();
    bus.join().await;
    stop_tx.send_replace(true);
    server.await??;

    pool.close().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

// ---

/// Resolve on SIGINT (Ctrl-C) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    // ---
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `AGROWATCH_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by the `AGROWATCH_LOG_LEVEL` env var
///
/// This should be called once at application startup before any logging
/// or tracing macros are invoked.
fn init_tracing() {
    // ---
    let span_events = match env::var("AGROWATCH_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to AGROWATCH_LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("AGROWATCH_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
