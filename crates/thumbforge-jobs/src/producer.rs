//! Job submission: record first, then publish.

use std::sync::Arc;

use tracing::{error, info};
use uuid::Uuid;

use thumbforge_core::{Error, JobMessage, JobRepository, MessageQueue, Result};

/// Creates job records and publishes their work tickets.
#[derive(Clone)]
pub struct JobProducer {
    jobs: Arc<dyn JobRepository>,
    queue: Arc<dyn MessageQueue>,
    queue_name: String,
}

impl JobProducer {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        queue: Arc<dyn MessageQueue>,
        queue_name: impl Into<String>,
    ) -> Self {
        Self {
            jobs,
            queue,
            queue_name: queue_name.into(),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Submit a thumbnail job for an already staged upload.
    ///
    /// The record is written before the message is published, so a worker
    /// never sees a message for a job that does not exist yet. If creation
    /// fails nothing is published. If publishing fails the record is left in
    /// `processing` and the failure is returned as [`Error::Queue`].
    pub async fn submit(&self, image_filename: &str) -> Result<Uuid> {
        let job_id = self.jobs.create(image_filename).await?;
        let body = JobMessage::new(job_id, image_filename).to_bytes()?;

        if let Err(e) = self.queue.publish(&self.queue_name, &body).await {
            error!(
                subsystem = "jobs",
                component = "producer",
                op = "publish",
                job_id = %job_id,
                queue = %self.queue_name,
                error = %e,
                "Job recorded but not enqueued; it will stay processing"
            );
            return Err(match e {
                Error::Queue(msg) => Error::Queue(msg),
                other => Error::Queue(other.to_string()),
            });
        }

        info!(
            subsystem = "jobs",
            component = "producer",
            op = "submit",
            job_id = %job_id,
            image_filename,
            queue = %self.queue_name,
            "Job submitted"
        );
        Ok(job_id)
    }
}
