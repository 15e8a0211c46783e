//! Data model for thumbnail jobs and the queue messages that reference them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// =============================================================================
// JOB
// =============================================================================

/// Status of a thumbnail job.
///
/// A job starts as `Processing` and moves at most once to one of the terminal
/// states. Nothing moves a job out of a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Processing,
    Succeeded,
    Failed,
}

impl JobStatus {
    /// Database/wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Processing => "processing",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    /// True for `Succeeded` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Processing)
    }

    /// Whether a job currently in `self` may be moved to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(self, JobStatus::Processing) && next.is_terminal()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "processing" => Ok(JobStatus::Processing),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            other => Err(Error::InvalidInput(format!("unknown job status: {other}"))),
        }
    }
}

/// A thumbnail job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    /// Name of the staged source image inside the uploads directory.
    pub image_filename: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Job {
    /// A freshly submitted job.
    pub fn new(id: Uuid, image_filename: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            image_filename: image_filename.into(),
            status: JobStatus::Processing,
            created_at,
            completed_at: None,
            error_message: None,
        }
    }

    /// File name of this job's thumbnail inside the thumbnails directory.
    pub fn thumbnail_filename(&self) -> String {
        thumbnail_filename(self.id)
    }
}

/// Deterministic thumbnail file name for a job: `<jobId>.jpg`.
pub fn thumbnail_filename(job_id: Uuid) -> String {
    format!("{}.{}", job_id, crate::defaults::THUMBNAIL_EXTENSION)
}

// =============================================================================
// QUEUE
// =============================================================================

/// Work ticket published for every submitted job.
///
/// Wire format: `{"jobId": "<uuid>", "imageFilename": "<name>"}` (UTF-8 JSON).
/// The store remains authoritative; the filename is carried only so the worker
/// does not need the record to locate the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMessage {
    pub job_id: Uuid,
    pub image_filename: String,
}

impl JobMessage {
    pub fn new(job_id: Uuid, image_filename: impl Into<String>) -> Self {
        Self {
            job_id,
            image_filename: image_filename.into(),
        }
    }

    /// Encode as the JSON message body.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a message body. Fails on anything that is not a well-formed job reference.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        let message: JobMessage = serde_json::from_slice(body)?;
        if message.image_filename.trim().is_empty() {
            return Err(Error::InvalidInput("imageFilename is empty".into()));
        }
        Ok(message)
    }
}

/// One handing of a queue message to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Queue the message was fetched from.
    pub queue: String,
    /// Broker-assigned identifier used to ack or reject this delivery.
    pub id: String,
    /// Raw message body.
    pub body: Vec<u8>,
    /// How many times the broker has handed this message out (1 on first delivery).
    pub delivery_count: u64,
}

/// What the consumer does with a delivery once it has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Remove the message from the queue permanently.
    Ack,
    /// Remove the message from the work queue and dead-letter it.
    Reject,
    /// Leave the delivery pending; the broker hands it out again after the
    /// pending timeout.
    Retry,
}
