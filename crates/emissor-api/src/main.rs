//! emissor-api - the intake HTTP service.
//!
//! Accepts issuance requests, applies idempotency, persists the request and
//! enqueues the emission job. Everything else happens in the worker.

mod routes;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use emissor_core::archive::Archiver;
use emissor_core::config::StorageKind;
use emissor_core::intake::IntakeService;
use emissor_core::queue::RabbitQueue;
use emissor_core::storage::{LocalStorage, ObjectStore, S3Storage};
use emissor_core::store::PgStore;
use emissor_core::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::routes::AppState;

/// emissor intake API
#[derive(Parser, Debug)]
#[command(name = "emissor-api")]
#[command(version, about, long_about = None)]
struct Args {
    /// Log filter override (defaults to LOG_LEVEL).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_env().context("configuration")?;

    let filter = args.log_level.clone().unwrap_or_else(|| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "emissor api starting");

    let store = Arc::new(
        PgStore::connect(&config.database_url)
            .await
            .context("database")?,
    );
    store.migrate().await.context("schema migration")?;

    let queue = Arc::new(
        RabbitQueue::connect(&config.queue_url)
            .await
            .context("broker")?,
    );

    let storage: Arc<dyn ObjectStore> = match config.storage.kind {
        StorageKind::Local => Arc::new(LocalStorage::new(
            config.storage.base_path.clone(),
            config.storage.public_url.clone(),
        )),
        StorageKind::S3 => Arc::new(S3Storage::new(&config.storage).await),
    };

    let state = Arc::new(AppState {
        intake: IntakeService::new(store.clone(), queue.clone()),
        requests: store,
        publisher: queue,
        archiver: Archiver::new(storage),
    });

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("bind port {}", config.port))?;
    info!(port = config.port, "listening");

    axum::serve(listener, routes::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    info!("emissor api stopped");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {},
        _ = sigint.recv() => {},
    }
    info!("shutdown signal received");
}
