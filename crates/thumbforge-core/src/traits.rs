//! Trait seams between the pipeline and its backing capabilities.
//!
//! The producer and worker only ever see these traits; PostgreSQL, Redis, the
//! filesystem, and the image library sit behind them.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Delivery, Job, JobStatus};

// =============================================================================
// JOB RECORD STORE
// =============================================================================

/// Durable store of job records. Every operation is atomic for a single job.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a new `processing` job and return its store-assigned id.
    async fn create(&self, image_filename: &str) -> Result<Uuid>;

    /// Get job by ID.
    async fn get(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// Move a `processing` job to a terminal status.
    ///
    /// Returns `true` iff exactly one record matched and changed. A job that is
    /// missing or already terminal yields `false`. A non-terminal target is
    /// rejected with `Error::InvalidInput`.
    async fn update_status(&self, job_id: Uuid, status: JobStatus) -> Result<bool>;

    /// Move a `processing` job to `failed`, recording the reason.
    ///
    /// Same matching rules as [`JobRepository::update_status`].
    async fn fail(&self, job_id: Uuid, error: &str) -> Result<bool>;

    /// All jobs, oldest first.
    async fn list_all(&self) -> Result<Vec<Job>>;

    /// Remove a job, returning the removed record.
    async fn delete(&self, job_id: Uuid) -> Result<Option<Job>>;
}

// =============================================================================
// QUEUE BROKER
// =============================================================================

/// Durable, at-least-once message queue with manual acknowledgment.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Establish the shared connection if it does not exist yet.
    ///
    /// Safe to call concurrently; only the first caller connects.
    async fn connect(&self) -> Result<()>;

    /// Persist a message body on the named durable queue.
    async fn publish(&self, queue: &str, body: &[u8]) -> Result<()>;

    /// Fetch up to `max` deliveries for `consumer`, waiting at most `wait` when
    /// the queue is empty. Deliveries stay pending until acked or rejected.
    async fn fetch(
        &self,
        queue: &str,
        consumer: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>>;

    /// Permanently remove a delivered message.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Remove a delivered message from the work queue and dead-letter it.
    async fn reject(&self, delivery: &Delivery) -> Result<()>;
}

// =============================================================================
// FILE STORAGE
// =============================================================================

/// Storage backend for source images and generated thumbnails.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Write data to the specified path.
    async fn write(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Read data from the specified path.
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Delete data at the specified path. Missing files are not an error.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if data exists at the specified path.
    async fn exists(&self, path: &str) -> Result<bool>;
}

// =============================================================================
// IMAGE PROCESSING
// =============================================================================

/// Image-processing capability used by the worker.
#[async_trait]
pub trait ImageProcessor: Send + Sync {
    /// Resize `source` to exactly `width` x `height` and return encoded JPEG bytes.
    async fn thumbnail(&self, source: Vec<u8>, width: u32, height: u32) -> Result<Vec<u8>>;
}
