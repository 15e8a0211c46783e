//! thumbforge-worker - standalone thumbnail worker process.
//!
//! Consumes the job queue until SIGINT/SIGTERM. Run as many copies as needed;
//! they share one consumer group and each needs its own `WORKER_CONSUMER_NAME`
//! (a random one is generated when unset).

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use thumbforge_core::{logging, ServiceConfig};
use thumbforge_db::{Database, FilesystemBackend, PoolConfig};
use thumbforge_jobs::{ImageCrateProcessor, JobWorker, ThumbnailHandler, WorkerConfig};
use thumbforge_queue::{RedisQueueConfig, RedisStreamQueue};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = logging::init("thumbforge_jobs=info,thumbforge_queue=info", "thumbforge-worker.log");

    let config = ServiceConfig::from_env()?;
    let worker_config = WorkerConfig::from_env().with_queue_name(config.queue_name.clone());
    worker_config.check_pending_timeout(Duration::from_millis(config.queue_pending_timeout_ms))?;

    info!("Connecting to database...");
    let pool_config = PoolConfig::for_worker(worker_config.max_concurrent_jobs);
    let db = Database::connect_with_config(&config.database_url, pool_config).await?;
    db.migrate().await?;
    info!("Database connected");

    let queue = RedisStreamQueue::new(RedisQueueConfig::from_service(&config))?;

    let uploads = FilesystemBackend::new(&config.uploads_dir);
    let thumbnails = FilesystemBackend::new(&config.thumbnails_dir);
    thumbnails.ensure_dir().await?;
    let handler = ThumbnailHandler::new(
        Arc::new(uploads),
        Arc::new(thumbnails),
        Arc::new(ImageCrateProcessor::new()),
    );

    let worker = JobWorker::new(
        Arc::new(db.jobs.clone()),
        Arc::new(queue),
        Arc::new(handler),
        // JOB_WORKER_ENABLED only governs the worker embedded in the API.
        worker_config.with_enabled(true),
    );
    let handle = worker.start();
    info!("Thumbnail worker running");

    shutdown_signal().await;
    info!("Shutdown signal received, draining in-flight jobs");
    handle.shutdown().await?;
    handle.join().await?;
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
}
