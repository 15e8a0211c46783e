//! # thumbforge-jobs
//!
//! Thumbnail job pipeline: submission and queue-driven processing.
//!
//! This crate provides:
//! - [`JobProducer`]: records a job, then publishes its work ticket
//! - [`JobWorker`]: per-message state machine driven by the queue pump
//! - [`ThumbnailHandler`]: reads the staged upload and writes `<jobId>.jpg`
//! - [`ImageCrateProcessor`]: exact-size JPEG thumbnails on the blocking pool
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use thumbforge_jobs::{ImageCrateProcessor, JobWorker, ThumbnailHandler, WorkerConfig};
//! use thumbforge_db::{Database, FilesystemBackend};
//! use thumbforge_queue::{RedisQueueConfig, RedisStreamQueue};
//!
//! let db = Database::connect("postgres://...").await?;
//! let queue = Arc::new(RedisStreamQueue::new(RedisQueueConfig::default())?);
//! let handler = ThumbnailHandler::new(
//!     Arc::new(FilesystemBackend::new("public/uploads")),
//!     Arc::new(FilesystemBackend::new("public/thumbnails")),
//!     Arc::new(ImageCrateProcessor::new()),
//! );
//!
//! let worker = JobWorker::new(Arc::new(db.jobs), queue, Arc::new(handler), WorkerConfig::from_env());
//! let handle = worker.start();
//!
//! // Listen for events
//! let mut events = handle.events();
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         println!("Event: {:?}", event);
//!     }
//! });
//!
//! // Graceful shutdown: settle the current round, then stop
//! handle.shutdown().await?;
//! handle.join().await?;
//! ```

pub mod handler;
pub mod processor;
pub mod producer;
pub mod worker;

// Re-export core types
pub use thumbforge_core::*;

pub use handler::{JobHandler, JobResult, ThumbnailHandler};
pub use processor::ImageCrateProcessor;
pub use producer::JobProducer;
pub use worker::{JobWorker, WorkerConfig, WorkerEvent, WorkerHandle};
