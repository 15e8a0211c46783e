//! Job HTTP handlers.
//!
//! Upload intake stages the file and hands it to the producer; the query
//! routes only read the job store and the thumbnails directory.

use axum::extract::{Multipart, Path, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use thumbforge_core::defaults;
use thumbforge_core::{detect_content_type, is_image_mime, staged_filename, Error, Job, JobStatus};

use crate::{ApiError, AppState};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub job_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub status: JobStatus,
}

#[derive(Debug, Serialize)]
pub struct ListJobsResponse {
    pub jobs: Vec<Job>,
}

#[derive(Debug, Serialize)]
pub struct DeleteJobResponse {
    pub job: Job,
}

/// Unparseable ids cannot name a job, so they read as not found.
fn parse_job_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::NotFound("Job not found".into()))
}

/// Accept one image and submit a thumbnail job for it.
///
/// # Multipart Fields
/// - `image`: image file (required, `image/*`)
///
/// # Returns
/// - 200 OK with `{"jobId": "..."}`
/// - 400 Bad Request if the file is missing, empty, or not an image
/// - 503 Service Unavailable if the store or the broker is unreachable
pub async fn upload_image(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut upload: Option<(String, String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Multipart error: {}", e)))?
    {
        if field.name() != Some(defaults::UPLOAD_FIELD) {
            continue;
        }
        let original = field.file_name().unwrap_or("upload").to_string();
        let claimed = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("Read error: {}", e)))?;
        upload = Some((original, claimed, data.to_vec()));
        break;
    }

    let (original, claimed, data) =
        upload.ok_or_else(|| ApiError::BadRequest("No image file uploaded".into()))?;

    if data.is_empty() {
        return Err(ApiError::BadRequest("Image file is empty".into()));
    }
    if !is_image_mime(&claimed) {
        return Err(ApiError::BadRequest(
            "Invalid file type. Only image files are allowed.".into(),
        ));
    }
    let detected = detect_content_type(&data, &claimed);
    if !is_image_mime(&detected) {
        return Err(ApiError::BadRequest(format!(
            "File content does not match an image type (detected {detected})"
        )));
    }

    let filename = staged_filename(&original);
    state.uploads.write(&filename, &data).await?;
    info!(
        subsystem = "api",
        op = "upload",
        image_filename = %filename,
        content_type = %detected,
        size = data.len(),
        "Staged upload"
    );

    let job_id = match state.producer.submit(&filename).await {
        Ok(job_id) => job_id,
        // A queue error means the record exists and still names the file.
        Err(e @ Error::Queue(_)) => return Err(e.into()),
        Err(e) => {
            if let Err(cleanup) = state.uploads.delete(&filename).await {
                warn!(
                    subsystem = "api",
                    op = "upload",
                    image_filename = %filename,
                    error = %cleanup,
                    "Failed to remove orphaned upload"
                );
            }
            return Err(e.into());
        }
    };
    Ok(Json(UploadResponse { job_id }))
}

/// Current status of one job.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job_id = parse_job_id(&id)?;
    let job = state
        .jobs
        .get(job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Job not found".into()))?;
    Ok(Json(JobStatusResponse { status: job.status }))
}

/// The finished thumbnail of a succeeded job, as `image/jpeg`.
///
/// A job that is unknown or not `succeeded` is a 400; a succeeded job whose
/// file has gone missing is a 404.
pub async fn get_thumbnail(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let not_ready =
        || ApiError::BadRequest("Job not found or thumbnail generation has not completed".into());

    let job_id = Uuid::parse_str(&id).map_err(|_| not_ready())?;
    let job = state.jobs.get(job_id).await?.ok_or_else(not_ready)?;
    if job.status != JobStatus::Succeeded {
        return Err(not_ready());
    }

    let filename = job.thumbnail_filename();
    if !state.thumbnails.exists(&filename).await? {
        warn!(subsystem = "api", job_id = %job_id, "Succeeded job has no thumbnail file");
        return Err(ApiError::NotFound("Thumbnail file not found".into()));
    }
    let bytes = state.thumbnails.read(&filename).await?;

    Ok(([(header::CONTENT_TYPE, "image/jpeg")], bytes))
}

/// Every job, oldest first.
pub async fn list_jobs(State(state): State<AppState>) -> Result<Json<ListJobsResponse>, ApiError> {
    let jobs = state.jobs.list_all().await?;
    Ok(Json(ListJobsResponse { jobs }))
}

/// Remove a job record together with its staged upload and thumbnail.
///
/// A worker still holding the job's message will find it gone and ack it.
pub async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteJobResponse>, ApiError> {
    let job_id = parse_job_id(&id)?;
    let job = state
        .jobs
        .delete(job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Job not found".into()))?;

    if let Err(e) = state.thumbnails.delete(&job.thumbnail_filename()).await {
        warn!(subsystem = "api", job_id = %job_id, error = %e, "Failed to remove thumbnail");
    }
    if let Err(e) = state.uploads.delete(&job.image_filename).await {
        warn!(subsystem = "api", job_id = %job_id, error = %e, "Failed to remove staged upload");
    }

    info!(subsystem = "api", op = "delete", job_id = %job_id, "Job deleted");
    Ok(Json(DeleteJobResponse { job }))
}
