//! Footfall Binary Entry Point
//!
//! Runs one tracking worker. Any number of workers may be started against the
//! same database file. Core functionality is provided by the `footfall`
//! library crate.

use clap::Parser;
use footfall::{
    StorageHandles,
    config::{AppConfig, parse_duration},
    server::{AppState, create_router},
    storage::StorageBuilder,
};
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Footfall - Visitor Tracking Service
#[derive(Parser, Debug)]
#[command(name = "footfall", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (defaults apply when omitted)
    #[arg(short, long, env = "FOOTFALL_CONFIG")]
    config: Option<String>,

    /// Server bind address (overrides config file)
    #[arg(long, env = "FOOTFALL_BIND")]
    bind: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, env = "FOOTFALL_PORT")]
    port: Option<u16>,

    /// Database file path (overrides config file)
    #[arg(long, env = "FOOTFALL_DATABASE_FILE")]
    database_file: Option<String>,

    /// Bounded wait for the database file lock, e.g. `5s`
    #[arg(long, env = "FOOTFALL_BUSY_TIMEOUT", value_parser = parse_duration)]
    busy_timeout: Option<Duration>,

    /// Retries of a contended transaction before giving up
    #[arg(long, env = "FOOTFALL_MAX_RETRIES")]
    max_retries: Option<u32>,

    /// First backoff delay between retries, e.g. `10ms`
    #[arg(long, env = "FOOTFALL_INITIAL_BACKOFF", value_parser = parse_duration)]
    initial_backoff: Option<Duration>,

    /// Backoff ceiling, e.g. `500ms`
    #[arg(long, env = "FOOTFALL_MAX_BACKOFF", value_parser = parse_duration)]
    max_backoff: Option<Duration>,

    /// Gap after which an event starts a new session, e.g. `30m`
    #[arg(long, env = "FOOTFALL_SESSION_IDLE_TIMEOUT", value_parser = parse_duration)]
    session_idle_timeout: Option<Duration>,

    /// Cap on serialized event attributes in bytes
    #[arg(long, env = "FOOTFALL_MAX_ATTRIBUTES_BYTES")]
    max_attributes_bytes: Option<usize>,
}

impl Cli {
    /// Apply CLI/env overrides (CLI > ENV > config file).
    fn apply(self, config: &mut AppConfig) {
        if let Some(bind) = self.bind {
            config.server.bind = bind;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(path) = self.database_file {
            config.database.path = path;
        }
        if let Some(timeout) = self.busy_timeout {
            config.database.busy_timeout = timeout;
        }
        if let Some(retries) = self.max_retries {
            config.database.retry.max_retries = retries;
        }
        if let Some(backoff) = self.initial_backoff {
            config.database.retry.initial_backoff = backoff;
        }
        if let Some(backoff) = self.max_backoff {
            config.database.retry.max_backoff = backoff;
        }
        if let Some(idle) = self.session_idle_timeout {
            config.tracking.session_idle_timeout = idle;
        }
        if let Some(bytes) = self.max_attributes_bytes {
            config.tracking.max_attributes_bytes = bytes;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,footfall=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Footfall - Visitor Tracking Service");

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => {
            tracing::info!("Loading configuration from: {}", path);
            AppConfig::load(path)?
        }
        None => {
            tracing::info!("No configuration file given, using defaults");
            AppConfig::default()
        }
    };
    cli.apply(&mut config);
    config.validate()?;

    tracing::info!(
        "Server: {}:{}, Database: {}",
        config.server.bind,
        config.server.port,
        config.database.path,
    );

    let handles = StorageBuilder::new(&config.database.path)
        .options(config.database.store_options())
        .ingest_policy(config.tracking.ingest_policy())
        .max_history_limit(config.tracking.max_history_limit)
        .sweep_interval(config.tracking.sweep_interval)
        .checkpoint_interval(config.database.checkpoint_interval)
        .build()?;

    tracing::info!(pid = std::process::id(), "Storage initialized");

    let app_state = AppState {
        ingestor: handles.ingestor.clone(),
        reader: handles.reader.clone(),
        subscribers: handles.subscribers.clone(),
    };
    let app = create_router(app_state, &config.server.cors_origins);

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;

    tracing::info!("Web server listening on: http://{}", addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(handles))
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM, then checkpoint and release the database.
async fn shutdown_signal(handles: StorageHandles) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }

    tracing::info!("Shutting down storage...");
    let result = tokio::task::spawn_blocking(move || handles.shutdown()).await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("Failed to shutdown storage: {}", e),
        Err(e) => tracing::error!("Storage shutdown task failed: {}", e),
    }
}
