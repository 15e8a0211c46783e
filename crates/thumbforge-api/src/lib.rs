//! # thumbforge-api
//!
//! HTTP surface for the thumbnail pipeline: upload intake, job status and
//! thumbnail retrieval, job listing and deletion, plus static files from the
//! public directory.

pub mod error;
pub mod handlers;

use std::path::Path;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use uuid::Uuid;

use thumbforge_core::defaults;
use thumbforge_core::{JobRepository, StorageBackend};
use thumbforge_jobs::JobProducer;

pub use error::ApiError;

/// Slack on top of the file limit for multipart boundaries and headers.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<dyn JobRepository>,
    pub producer: JobProducer,
    pub uploads: Arc<dyn StorageBackend>,
    pub thumbnails: Arc<dyn StorageBackend>,
}

/// Time-ordered request correlation ids, so `x-request-id` sorts with the logs.
#[derive(Clone, Default)]
struct MakeRequestUuidV7;

impl MakeRequestId for MakeRequestUuidV7 {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        let id = Uuid::now_v7().to_string().parse().ok()?;
        Some(RequestId::new(id))
    }
}

/// Build the application router.
///
/// Anything that is not an API route is served from `public_dir`.
pub fn router(state: AppState, public_dir: impl AsRef<Path>) -> Router {
    use handlers::{health, jobs};

    Router::new()
        .route("/health", get(health::health_check))
        .route(
            "/api/upload",
            post(jobs::upload_image).layer(DefaultBodyLimit::max(
                defaults::MAX_UPLOAD_BYTES + MULTIPART_OVERHEAD_BYTES,
            )),
        )
        .route("/api/jobs", get(jobs::list_jobs))
        .route(
            "/api/job/:id",
            get(jobs::get_job_status).delete(jobs::delete_job),
        )
        .route("/api/job/:id/thumbnail", get(jobs::get_thumbnail))
        .fallback_service(ServeDir::new(public_dir.as_ref()))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuidV7))
        .layer(RequestBodyLimitLayer::new(
            defaults::MAX_UPLOAD_BYTES + MULTIPART_OVERHEAD_BYTES,
        ))
        .with_state(state)
}
