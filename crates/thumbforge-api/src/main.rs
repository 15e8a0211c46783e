//! thumbforge-api - HTTP API server.
//!
//! Serves the upload and job routes and, unless `JOB_WORKER_ENABLED=false`,
//! runs a thumbnail worker in the same process.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use thumbforge_api::{router, AppState};
use thumbforge_core::{logging, MessageQueue, ServiceConfig};
use thumbforge_db::{Database, FilesystemBackend};
use thumbforge_jobs::{ImageCrateProcessor, JobProducer, JobWorker, ThumbnailHandler, WorkerConfig};
use thumbforge_queue::{RedisQueueConfig, RedisStreamQueue};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = logging::init(
        "thumbforge_api=info,thumbforge_jobs=info,thumbforge_queue=info,tower_http=info",
        "thumbforge-api.log",
    );

    let config = ServiceConfig::from_env()?;
    let worker_config = WorkerConfig::from_env().with_queue_name(config.queue_name.clone());
    if worker_config.enabled {
        worker_config.check_pending_timeout(Duration::from_millis(config.queue_pending_timeout_ms))?;
    }

    info!("Connecting to database...");
    let db = Database::connect(&config.database_url).await?;
    db.migrate().await?;
    info!("Database connected");

    let queue = Arc::new(RedisStreamQueue::new(RedisQueueConfig::from_service(&config))?);
    if let Err(e) = queue.connect().await {
        // Uploads answer 503 until the broker is reachable.
        warn!(subsystem = "api", error = %e, "Message broker not reachable at startup");
    }

    let uploads = Arc::new(FilesystemBackend::new(&config.uploads_dir));
    let thumbnails = Arc::new(FilesystemBackend::new(&config.thumbnails_dir));
    uploads.ensure_dir().await?;
    thumbnails.ensure_dir().await?;

    let jobs = Arc::new(db.jobs.clone());
    let producer = JobProducer::new(jobs.clone(), queue.clone(), config.queue_name.clone());

    let worker_handle = if worker_config.enabled {
        let handler = ThumbnailHandler::new(
            uploads.clone(),
            thumbnails.clone(),
            Arc::new(ImageCrateProcessor::new()),
        );
        let worker = JobWorker::new(jobs.clone(), queue.clone(), Arc::new(handler), worker_config);
        info!("Starting embedded thumbnail worker");
        Some(worker.start())
    } else {
        info!("Embedded worker disabled (JOB_WORKER_ENABLED=false)");
        None
    };

    let state = AppState {
        jobs,
        producer,
        uploads,
        thumbnails,
    };
    let app = router(state, &config.public_dir);

    let addr = config.bind_addr();
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(handle) = worker_handle {
        info!("Draining embedded worker");
        handle.shutdown().await?;
        handle.join().await?;
    }
    db.pool.close().await;
    Ok(())
}

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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
