//! emissor-worker - consumes emission jobs and drives the pipeline.
//!
//! Two cooperative loops run until shutdown: the broker consumer and the
//! retry poller. Graceful shutdown stops new deliveries, waits for
//! in-flight work up to a bounded deadline, and lets unacked messages
//! return to the broker.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use emissor_core::archive::Archiver;
use emissor_core::config::StorageKind;
use emissor_core::fiscal::validator::{
    refresh_schemas, DocumentValidator, StructuralValidator, XsdValidator,
};
use emissor_core::machine::RetryPolicy;
use emissor_core::pipeline::{EmissionPipeline, PipelineDeps};
use emissor_core::queue::RabbitQueue;
use emissor_core::scheduler::RetryScheduler;
use emissor_core::sefaz::{HttpTransport, SefazClient};
use emissor_core::storage::{LocalStorage, ObjectStore, S3Storage};
use emissor_core::store::PgStore;
use emissor_core::Config;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// emissor worker - NFC-e emission pipeline
#[derive(Parser, Debug)]
#[command(name = "emissor-worker")]
#[command(version, about, long_about = None)]
struct Args {
    /// Log filter override (defaults to LOG_LEVEL).
    #[arg(long)]
    log_level: Option<String>,

    /// Download the official XSD set into the schema directory at startup.
    #[arg(long)]
    refresh_schemas: bool,

    /// Run with the structural validator only (development without the
    /// official XSD set on disk).
    #[arg(long)]
    structural_validation: bool,
}

/// How long in-flight jobs may run after a shutdown signal.
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_env().context("configuration")?;

    let filter = args.log_level.clone().unwrap_or_else(|| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "emissor worker starting");

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

    if args.refresh_schemas {
        let client = reqwest::Client::new();
        let count = refresh_schemas(&client, &config.schema_dir)
            .await
            .context("schema refresh")?;
        info!(count, dir = %config.schema_dir.display(), "schema set refreshed");
    }

    let validator: Arc<dyn DocumentValidator> = if args.structural_validation {
        warn!("running with structural validation only; XSD checks disabled");
        Arc::new(StructuralValidator)
    } else {
        Arc::new(XsdValidator::new(&config.schema_dir).context(
            "XSD set not found; run with --refresh-schemas once or point SCHEMA_DIR at it",
        )?)
    };

    let storage: Arc<dyn ObjectStore> = match config.storage.kind {
        StorageKind::Local => Arc::new(LocalStorage::new(
            config.storage.base_path.clone(),
            config.storage.public_url.clone(),
        )),
        StorageKind::S3 => Arc::new(S3Storage::new(&config.storage).await),
    };

    let transport = HttpTransport::new(config.sefaz_timeout).context("sefaz transport")?;
    let pipeline = Arc::new(EmissionPipeline::new(PipelineDeps {
        requests: store.clone(),
        companies: store.clone(),
        sequences: store.clone(),
        validator,
        sefaz: SefazClient::new(Arc::new(transport)),
        archiver: Archiver::new(storage),
        policy: RetryPolicy::with_max_retries(config.max_retries),
    }));

    let scheduler = RetryScheduler::new(store.clone(), queue.clone(), config.retry_poll_interval);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let scheduler_rx = shutdown_rx.clone();
    let scheduler_task = tokio::spawn(async move { scheduler.run(scheduler_rx).await });

    let consumer_pipeline = pipeline.clone();
    let consumer_result = queue
        .run_emit_consumer(config.worker_prefetch, shutdown_rx, move |job| {
            let pipeline = consumer_pipeline.clone();
            async move { pipeline.process(job.request_id).await }
        })
        .await;

    if let Err(err) = consumer_result {
        error!(error = %err, "emit consumer stopped with an error");
    }

    match tokio::time::timeout(DRAIN_DEADLINE, scheduler_task).await {
        Ok(Ok(())) => {},
        Ok(Err(err)) => warn!(error = %err, "scheduler task panicked"),
        Err(_) => warn!("scheduler did not stop within the drain deadline"),
    }

    info!("emissor worker stopped");
    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            error!(error = %err, "cannot install SIGTERM handler");
            return std::future::pending::<()>().await;
        },
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(err) => {
            error!(error = %err, "cannot install SIGINT handler");
            return std::future::pending::<()>().await;
        },
    };

    tokio::select! {
        _ = sigterm.recv() => {},
        _ = sigint.recv() => {},
    }
}
