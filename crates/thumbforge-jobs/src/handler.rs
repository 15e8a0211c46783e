//! Job execution: what the worker does for a job that is still `processing`.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use thumbforge_core::defaults;
use thumbforge_core::{ImageProcessor, Job, StorageBackend};

/// Result of job execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// Job completed; carries the name of the produced artifact.
    Success(String),
    /// Job failed with an error message.
    Failed(String),
}

/// Trait for job handlers.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute the job. Must not touch the job record; the worker owns status writes.
    async fn execute(&self, job: &Job) -> JobResult;
}

/// Reads the staged upload, resizes it, and writes `<jobId>.jpg`.
pub struct ThumbnailHandler {
    uploads: Arc<dyn StorageBackend>,
    thumbnails: Arc<dyn StorageBackend>,
    processor: Arc<dyn ImageProcessor>,
    width: u32,
    height: u32,
}

impl ThumbnailHandler {
    /// Create a handler producing thumbnails of the default size.
    pub fn new(
        uploads: Arc<dyn StorageBackend>,
        thumbnails: Arc<dyn StorageBackend>,
        processor: Arc<dyn ImageProcessor>,
    ) -> Self {
        Self {
            uploads,
            thumbnails,
            processor,
            width: defaults::THUMBNAIL_WIDTH,
            height: defaults::THUMBNAIL_HEIGHT,
        }
    }

    /// Override the thumbnail dimensions.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }
}

#[async_trait]
impl JobHandler for ThumbnailHandler {
    async fn execute(&self, job: &Job) -> JobResult {
        let source = match self.uploads.read(&job.image_filename).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return JobResult::Failed(format!(
                    "failed to read source image {}: {e}",
                    job.image_filename
                ))
            }
        };

        let thumbnail = match self.processor.thumbnail(source, self.width, self.height).await {
            Ok(bytes) => bytes,
            Err(e) => return JobResult::Failed(e.to_string()),
        };

        let output = job.thumbnail_filename();
        if let Err(e) = self.thumbnails.write(&output, &thumbnail).await {
            return JobResult::Failed(format!("failed to write thumbnail {output}: {e}"));
        }

        debug!(
            subsystem = "jobs",
            component = "handler",
            job_id = %job.id,
            output = %output,
            size = thumbnail.len(),
            "Thumbnail written"
        );
        JobResult::Success(output)
    }
}
