use anyhow::Result;
use axum::Router;
use chrono::Utc;
use std::{fs, io::ErrorKind, path::Path, sync::Arc, time::Duration};
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod db;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;
mod worker;

use services::{
    blob_gateway::ObjectReader,
    local_blob_store::{LocalBlobStore, UrlSigner},
    message_bus::BroadcastBus,
    outbox::OutboxPublisher,
    scheduler::spawn_periodic,
    state_machine::MediaStateMachine,
    upload_sessions::{SessionLimits, UploadSessionManager},
    validation::{ClamdScanner, DeclaredContentType, ScanningDisabled, ValidationService, VirusScanner},
};
use worker::{
    CommandTranscoder, TranscodeWorker,
    probe::{ProbeChain, ffprobe::FfprobeRunner, strategies::default_strategies},
};

const BUS_CAPACITY: usize = 1024;
const SCAN_TIMEOUT: Duration = Duration::from_secs(120);
const TRANSCODE_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);
const WORKER_CONCURRENCY: usize = 2;
const VALIDATION_BATCH: i64 = 50;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;
    let pipeline = cfg.pipeline.clone();

    tracing::info!(
        addr = %cfg.addr(),
        storage_dir = %cfg.storage_dir,
        bucket = %cfg.bucket,
        clamd = ?cfg.clamd_addr,
        "starting media-ingest"
    );
    tracing::debug!(?pipeline, "pipeline settings");

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Database ---
    let db = db::connect(&cfg.database_url).await?;
    db::run_migrations(&db).await?;
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Pipeline wiring ---
    let blobs = Arc::new(LocalBlobStore::new(
        &cfg.storage_dir,
        &cfg.bucket,
        &cfg.public_base_url,
        UrlSigner::new(&cfg.signing_secret),
        pipeline.presign_ttl,
    ));
    let objects: Arc<dyn ObjectReader> = blobs.clone();

    let bus = BroadcastBus::new(BUS_CAPACITY);
    let worker_rx = bus.subscribe();
    let outbox = OutboxPublisher::new(db.clone(), Arc::new(bus.clone()), pipeline.outbox.clone());
    let state_machine = MediaStateMachine::new(db.clone()).with_outbox_notifier(outbox.notifier());

    let scanner: Arc<dyn VirusScanner> = match &cfg.clamd_addr {
        Some(addr) => Arc::new(ClamdScanner::new(addr.clone(), objects.clone(), SCAN_TIMEOUT)),
        None => {
            tracing::warn!("MEDIA_INGEST_CLAMD_ADDR not set; uploads are not virus scanned");
            Arc::new(ScanningDisabled)
        }
    };
    let validation = ValidationService::new(state_machine.clone(), scanner, Arc::new(DeclaredContentType));
    let sessions = UploadSessionManager::new(
        db.clone(),
        state_machine.clone(),
        blobs.clone(),
        SessionLimits::from(&pipeline),
    );

    let runner = FfprobeRunner::new(&cfg.ffprobe_path, pipeline.probe_timeout);
    let probes = Arc::new(ProbeChain::new(default_strategies(
        objects.clone(),
        runner,
        pipeline.probe_partial_bytes,
    )));
    let transcoder = Arc::new(CommandTranscoder::new(&cfg.transcode_command, objects, TRANSCODE_TIMEOUT));
    let worker = TranscodeWorker::new(state_machine.clone(), probes, transcoder, WORKER_CONCURRENCY);

    // --- Background jobs ---
    let cancel = CancellationToken::new();
    let mut jobs = vec![
        outbox
            .clone()
            .spawn(pipeline.outbox_publish_interval, cancel.child_token()),
        tokio::spawn(worker.run(worker_rx, cancel.child_token())),
    ];

    let cleaner = outbox.clone();
    jobs.push(spawn_periodic(
        "outbox-clean",
        pipeline.outbox_clean_interval,
        cancel.child_token(),
        move || {
            let cleaner = cleaner.clone();
            async move { cleaner.clean_sent().await }
        },
    ));

    let sweeper = sessions.clone();
    let batch = pipeline.session_sweep_batch;
    jobs.push(spawn_periodic(
        "session-sweep",
        pipeline.session_sweep_interval,
        cancel.child_token(),
        move || {
            let sweeper = sweeper.clone();
            async move { sweeper.sweep_expired(Utc::now(), batch).await }
        },
    ));

    let recovery = validation.clone();
    jobs.push(spawn_periodic(
        "validation-recovery",
        pipeline.validation_sweep_interval,
        cancel.child_token(),
        move || {
            let recovery = recovery.clone();
            async move { recovery.validate_pending(VALIDATION_BATCH).await }
        },
    ));

    let expirer = state_machine.clone();
    let stale_ttl = chrono::Duration::from_std(pipeline.stale_media_ttl)?;
    jobs.push(spawn_periodic(
        "stale-media",
        pipeline.session_sweep_interval,
        cancel.child_token(),
        move || {
            let expirer = expirer.clone();
            async move { expirer.expire_stale(Utc::now() - stale_ttl).await }
        },
    ));

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(state::AppState {
        db,
        sessions,
        state_machine,
        validation,
        outbox,
        blobs,
    });

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // --- Drain background jobs ---
    cancel.cancel();
    for job in jobs {
        if let Err(err) = job.await {
            tracing::warn!(error = %err, "background job ended abnormally");
        }
    }
    tracing::info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
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
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
