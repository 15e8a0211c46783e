//! End-to-end pipeline tests on the in-memory store and queue.
//!
//! Producer -> queue -> worker -> store, with real image processing on a
//! temporary directory.

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use tempfile::TempDir;
use tokio::sync::broadcast;
use uuid::Uuid;

use thumbforge_db::{FilesystemBackend, InMemoryJobRepository};
use thumbforge_jobs::{
    Error, ImageCrateProcessor, ImageProcessor, Job, JobHandler, JobMessage, JobProducer,
    JobRepository, JobResult, JobStatus, JobWorker, MessageQueue, Outcome, Result,
    StorageBackend, ThumbnailHandler, WorkerConfig, WorkerEvent,
};
use thumbforge_queue::InMemoryQueue;

const QUEUE: &str = "test:thumbnails";

struct Pipeline {
    _dir: TempDir,
    jobs: Arc<InMemoryJobRepository>,
    queue: Arc<InMemoryQueue>,
    uploads: Arc<FilesystemBackend>,
    thumbnails: Arc<FilesystemBackend>,
    producer: JobProducer,
}

impl Pipeline {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let jobs = Arc::new(InMemoryJobRepository::new());
        let queue = Arc::new(InMemoryQueue::new());
        let uploads = Arc::new(FilesystemBackend::new(dir.path().join("uploads")));
        let thumbnails = Arc::new(FilesystemBackend::new(dir.path().join("thumbnails")));
        let producer = JobProducer::new(jobs.clone(), queue.clone(), QUEUE);
        Self {
            _dir: dir,
            jobs,
            queue,
            uploads,
            thumbnails,
            producer,
        }
    }

    fn handler(&self) -> Arc<dyn JobHandler> {
        Arc::new(ThumbnailHandler::new(
            self.uploads.clone(),
            self.thumbnails.clone(),
            Arc::new(ImageCrateProcessor::new()),
        ))
    }

    fn worker(&self) -> JobWorker {
        self.worker_with(self.jobs.clone(), self.handler(), test_config())
    }

    fn worker_with(
        &self,
        jobs: Arc<dyn JobRepository>,
        handler: Arc<dyn JobHandler>,
        config: WorkerConfig,
    ) -> JobWorker {
        JobWorker::new(jobs, self.queue.clone(), handler, config)
    }

    async fn stage(&self, name: &str, bytes: &[u8]) {
        self.uploads.write(name, bytes).await.unwrap();
    }

    async fn status(&self, id: Uuid) -> JobStatus {
        self.jobs.get(id).await.unwrap().unwrap().status
    }

    /// Fetch the next delivery and let the worker decide it, applying the outcome.
    async fn process_next(&self, worker: &JobWorker) -> Outcome {
        let delivery = self
            .queue
            .fetch(QUEUE, "test-worker", 1, Duration::ZERO)
            .await
            .unwrap()
            .pop()
            .expect("a delivery is ready");
        let outcome = worker.handle_delivery(&delivery.body).await;
        match outcome {
            Outcome::Ack => self.queue.ack(&delivery).await.unwrap(),
            Outcome::Reject => self.queue.reject(&delivery).await.unwrap(),
            Outcome::Retry => {}
        }
        outcome
    }
}

fn test_config() -> WorkerConfig {
    WorkerConfig::default()
        .with_queue_name(QUEUE)
        .with_consumer_name("test-worker")
        .with_fetch_wait(20)
        .with_poll_interval(20)
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb([250, 180, 20]));
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}

async fn wait_for(
    events: &mut broadcast::Receiver<WorkerEvent>,
    mut pred: impl FnMut(&WorkerEvent) -> bool,
) -> WorkerEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.expect("worker event channel open");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected worker event")
}

// =============================================================================
// Scenario A: happy path
// =============================================================================

#[tokio::test]
async fn test_valid_upload_produces_thumbnail() {
    let p = Pipeline::new();
    p.stage("a1-cat.png", &png(800, 600)).await;

    let job_id = p.producer.submit("a1-cat.png").await.unwrap();
    assert_eq!(p.status(job_id).await, JobStatus::Processing);

    let worker = p.worker();
    assert_eq!(p.process_next(&worker).await, Outcome::Ack);

    let job = p.jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert!(job.completed_at.is_some());

    let bytes = p.thumbnails.read(&format!("{job_id}.jpg")).await.unwrap();
    let thumb = image::load_from_memory(&bytes).unwrap();
    assert_eq!((thumb.width(), thumb.height()), (100, 100));

    assert_eq!(p.queue.acked_count(QUEUE).await, 1);
    assert!(p.queue.dead_letters(QUEUE).await.is_empty());
}

// =============================================================================
// Scenario B: corrupt image
// =============================================================================

#[tokio::test]
async fn test_corrupt_image_fails_and_dead_letters() {
    let p = Pipeline::new();
    p.stage("b1-broken.jpg", b"\xff\xd8\xff not really a jpeg").await;

    let job_id = p.producer.submit("b1-broken.jpg").await.unwrap();
    let worker = p.worker();
    assert_eq!(p.process_next(&worker).await, Outcome::Reject);

    let job = p.jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.is_some());
    assert!(!p.thumbnails.exists(&format!("{job_id}.jpg")).await.unwrap());
    assert_eq!(p.queue.dead_letters(QUEUE).await.len(), 1);
    assert_eq!(p.queue.ready_len(QUEUE).await, 0);
}

#[tokio::test]
async fn test_missing_upload_fails() {
    let p = Pipeline::new();
    let job_id = p.producer.submit("never-staged.png").await.unwrap();

    let worker = p.worker();
    assert_eq!(p.process_next(&worker).await, Outcome::Reject);
    assert_eq!(p.status(job_id).await, JobStatus::Failed);
}

// =============================================================================
// Scenario C: duplicate delivery
// =============================================================================

#[tokio::test]
async fn test_duplicate_delivery_after_success_is_noop() {
    let p = Pipeline::new();
    p.stage("c1-dog.png", &png(64, 64)).await;
    let job_id = p.producer.submit("c1-dog.png").await.unwrap();

    let worker = p.worker();
    assert_eq!(p.process_next(&worker).await, Outcome::Ack);
    let finished = p.jobs.get(job_id).await.unwrap().unwrap();
    let writes_before = p.jobs.write_count();

    // Same ticket delivered again.
    let body = JobMessage::new(job_id, "c1-dog.png").to_bytes().unwrap();
    assert_eq!(worker.handle_delivery(&body).await, Outcome::Ack);

    assert_eq!(p.jobs.write_count(), writes_before);
    assert_eq!(p.jobs.get(job_id).await.unwrap().unwrap(), finished);
}

#[tokio::test]
async fn test_duplicate_delivery_after_failure_is_noop() {
    let p = Pipeline::new();
    let job_id = p.producer.submit("missing.png").await.unwrap();
    let worker = p.worker();
    assert_eq!(p.process_next(&worker).await, Outcome::Reject);
    let writes_before = p.jobs.write_count();

    let body = JobMessage::new(job_id, "missing.png").to_bytes().unwrap();
    assert_eq!(worker.handle_delivery(&body).await, Outcome::Ack);
    assert_eq!(p.jobs.write_count(), writes_before);
    assert_eq!(p.status(job_id).await, JobStatus::Failed);
}

#[tokio::test]
async fn test_redelivery_after_consumer_crash_processes_once() {
    let p = Pipeline::new();
    p.stage("c2-bird.png", &png(120, 90)).await;
    let job_id = p.producer.submit("c2-bird.png").await.unwrap();

    // First consumer takes the message and dies without settling it.
    let lost = p.queue.fetch(QUEUE, "crashed", 1, Duration::ZERO).await.unwrap();
    assert_eq!(lost.len(), 1);
    assert_eq!(p.queue.redeliver_unacked(QUEUE).await, 1);

    let worker = p.worker();
    assert_eq!(p.process_next(&worker).await, Outcome::Ack);
    assert_eq!(p.status(job_id).await, JobStatus::Succeeded);
    assert_eq!(p.queue.in_flight_len(QUEUE).await, 0);
}

#[tokio::test]
async fn test_message_for_missing_job_acked_without_writes() {
    let p = Pipeline::new();
    let worker = p.worker();
    let mut events = worker.events();

    let body = JobMessage::new(Uuid::now_v7(), "ghost.png").to_bytes().unwrap();
    assert_eq!(worker.handle_delivery(&body).await, Outcome::Ack);
    assert_eq!(p.jobs.write_count(), 0);

    let event = events.try_recv().unwrap();
    assert!(matches!(event, WorkerEvent::MessageSkipped { .. }));
}

#[tokio::test]
async fn test_message_for_deleted_job_acked() {
    let p = Pipeline::new();
    p.stage("gone.png", &png(10, 10)).await;
    let job_id = p.producer.submit("gone.png").await.unwrap();
    p.jobs.delete(job_id).await.unwrap();

    let worker = p.worker();
    assert_eq!(p.process_next(&worker).await, Outcome::Ack);
    assert!(!p.thumbnails.exists(&format!("{job_id}.jpg")).await.unwrap());
}

// =============================================================================
// Scenario D: malformed message
// =============================================================================

#[tokio::test]
async fn test_malformed_messages_rejected() {
    let p = Pipeline::new();
    let worker = p.worker();
    let mut events = worker.events();

    for body in [
        b"not json".as_slice(),
        br#"{"jobId": 42}"#.as_slice(),
        br#"{"imageFilename": "a.png"}"#.as_slice(),
        br#"{"jobId": "not-a-uuid", "imageFilename": "a.png"}"#.as_slice(),
    ] {
        assert_eq!(worker.handle_delivery(body).await, Outcome::Reject);
        assert!(matches!(
            events.try_recv().unwrap(),
            WorkerEvent::MessageRejected { .. }
        ));
    }
    assert_eq!(p.jobs.write_count(), 0);
}

#[tokio::test]
async fn test_running_worker_survives_malformed_message() {
    let p = Pipeline::new();
    p.stage("d1-fish.png", &png(200, 100)).await;

    let handle = p.worker().start();
    let mut events = handle.events();

    p.queue.publish(QUEUE, b"{{{ garbage").await.unwrap();
    wait_for(&mut events, |e| matches!(e, WorkerEvent::MessageRejected { .. })).await;

    let job_id = p.producer.submit("d1-fish.png").await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, WorkerEvent::JobSucceeded { job_id: id, .. } if *id == job_id)
    })
    .await;

    handle.shutdown().await.unwrap();
    wait_for(&mut events, |e| *e == WorkerEvent::WorkerStopped).await;

    assert_eq!(p.status(job_id).await, JobStatus::Succeeded);
    assert_eq!(p.queue.dead_letters(QUEUE).await, vec![b"{{{ garbage".to_vec()]);
    assert_eq!(p.queue.acked_count(QUEUE).await, 1);
}

// =============================================================================
// Worker lifecycle and concurrency
// =============================================================================

#[tokio::test]
async fn test_running_worker_drains_many_jobs() {
    let p = Pipeline::new();
    let mut ids = Vec::new();
    for i in 0..10 {
        let name = format!("{i}-batch.png");
        p.stage(&name, &png(50 + i, 40)).await;
        ids.push(p.producer.submit(&name).await.unwrap());
    }

    let worker = p.worker_with(
        p.jobs.clone(),
        p.handler(),
        test_config().with_max_concurrent(3),
    );
    let handle = worker.start();
    let mut events = handle.events();

    let mut succeeded = 0;
    while succeeded < ids.len() {
        wait_for(&mut events, |e| matches!(e, WorkerEvent::JobSucceeded { .. })).await;
        succeeded += 1;
    }
    handle.shutdown().await.unwrap();

    for id in ids {
        assert_eq!(p.status(id).await, JobStatus::Succeeded);
        assert!(p.thumbnails.exists(&format!("{id}.jpg")).await.unwrap());
    }
}

#[tokio::test]
async fn test_join_after_event_backlog() {
    let p = Pipeline::new();
    let handle = p.worker().start();
    // Subscribed early and never read, so this receiver falls behind.
    let _events = handle.events();

    let total = 300;
    for i in 0..total {
        p.queue.publish(QUEUE, format!("garbage {i}").as_bytes()).await.unwrap();
    }
    for _ in 0..500 {
        if p.queue.dead_letters(QUEUE).await.len() == total {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(p.queue.dead_letters(QUEUE).await.len(), total);

    handle.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .expect("worker stops after shutdown")
        .unwrap();
    assert_eq!(p.queue.in_flight_len(QUEUE).await, 0);
}

/// Delegates to the real processor after a pause, so a job is still running
/// when shutdown is requested.
struct DelayedProcessor;

#[async_trait]
impl ImageProcessor for DelayedProcessor {
    async fn thumbnail(&self, source: Vec<u8>, width: u32, height: u32) -> Result<Vec<u8>> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        ImageCrateProcessor::new().thumbnail(source, width, height).await
    }
}

#[tokio::test]
async fn test_join_waits_for_in_flight_job() {
    let p = Pipeline::new();
    p.stage("drain.png", &png(40, 40)).await;
    let handler = Arc::new(ThumbnailHandler::new(
        p.uploads.clone(),
        p.thumbnails.clone(),
        Arc::new(DelayedProcessor),
    ));
    let handle = p.worker_with(p.jobs.clone(), handler, test_config()).start();
    let mut events = handle.events();

    let job_id = p.producer.submit("drain.png").await.unwrap();
    wait_for(&mut events, |e| matches!(e, WorkerEvent::JobStarted { .. })).await;

    handle.shutdown().await.unwrap();
    handle.join().await.unwrap();

    assert_eq!(p.status(job_id).await, JobStatus::Succeeded);
    assert_eq!(p.queue.acked_count(QUEUE).await, 1);
    assert_eq!(p.queue.in_flight_len(QUEUE).await, 0);
}

#[tokio::test]
async fn test_disabled_worker_does_not_consume() {
    let p = Pipeline::new();
    p.stage("idle.png", &png(10, 10)).await;
    let job_id = p.producer.submit("idle.png").await.unwrap();

    let handle = p
        .worker_with(p.jobs.clone(), p.handler(), test_config().with_enabled(false))
        .start();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(p.status(job_id).await, JobStatus::Processing);
    assert_eq!(p.queue.ready_len(QUEUE).await, 1);
    // The worker task already returned, so the shutdown channel is closed.
    assert!(handle.shutdown().await.is_err());
}

// =============================================================================
// Failure paths around execution
// =============================================================================

struct SlowProcessor;

#[async_trait]
impl ImageProcessor for SlowProcessor {
    async fn thumbnail(&self, _source: Vec<u8>, _w: u32, _h: u32) -> Result<Vec<u8>> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_execution_timeout_fails_job() {
    let p = Pipeline::new();
    p.stage("slow.png", &png(10, 10)).await;
    let job_id = p.producer.submit("slow.png").await.unwrap();

    let handler = Arc::new(ThumbnailHandler::new(
        p.uploads.clone(),
        p.thumbnails.clone(),
        Arc::new(SlowProcessor),
    ));
    let worker = p.worker_with(
        p.jobs.clone(),
        handler,
        test_config().with_job_timeout(Duration::from_millis(50)),
    );

    assert_eq!(p.process_next(&worker).await, Outcome::Reject);
    let job = p.jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("timeout"));
}

/// Store whose success write fails. Failure writes go through only when
/// `record_failures` is set.
struct BrokenWrites {
    inner: Arc<InMemoryJobRepository>,
    record_failures: bool,
}

#[async_trait]
impl JobRepository for BrokenWrites {
    async fn create(&self, image_filename: &str) -> Result<Uuid> {
        self.inner.create(image_filename).await
    }
    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        self.inner.get(job_id).await
    }
    async fn update_status(&self, _job_id: Uuid, _status: JobStatus) -> Result<bool> {
        Err(Error::Internal("store offline".into()))
    }
    async fn fail(&self, job_id: Uuid, error: &str) -> Result<bool> {
        if !self.record_failures {
            return Err(Error::Internal("store offline".into()));
        }
        self.inner.fail(job_id, error).await
    }
    async fn list_all(&self) -> Result<Vec<Job>> {
        self.inner.list_all().await
    }
    async fn delete(&self, job_id: Uuid) -> Result<Option<Job>> {
        self.inner.delete(job_id).await
    }
}

#[tokio::test]
async fn test_store_error_on_success_write_fails_job() {
    let p = Pipeline::new();
    p.stage("flaky.png", &png(10, 10)).await;
    let job_id = p.producer.submit("flaky.png").await.unwrap();

    let jobs = Arc::new(BrokenWrites {
        inner: p.jobs.clone(),
        record_failures: true,
    });
    let worker = p.worker_with(jobs, p.handler(), test_config());

    assert_eq!(p.process_next(&worker).await, Outcome::Reject);
    let job = p.jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("failed to record success"));
}

#[tokio::test]
async fn test_unrecordable_failure_leaves_delivery_pending() {
    let p = Pipeline::new();
    p.stage("broken.png", b"\x89PNG not really").await;
    let job_id = p.producer.submit("broken.png").await.unwrap();

    let jobs = Arc::new(BrokenWrites {
        inner: p.jobs.clone(),
        record_failures: false,
    });
    let worker = p.worker_with(jobs, p.handler(), test_config());

    assert_eq!(p.process_next(&worker).await, Outcome::Retry);
    assert!(p.queue.dead_letters(QUEUE).await.is_empty());
    assert_eq!(p.queue.in_flight_len(QUEUE).await, 1);
    assert_eq!(p.status(job_id).await, JobStatus::Processing);

    // Once the store takes writes again the redelivery records the failure.
    assert_eq!(p.queue.redeliver_unacked(QUEUE).await, 1);
    assert_eq!(p.process_next(&p.worker()).await, Outcome::Reject);
    assert_eq!(p.status(job_id).await, JobStatus::Failed);
}

#[tokio::test]
async fn test_store_outage_leaves_deliveries_pending() {
    let p = Pipeline::new();
    p.stage("a-one.png", &png(30, 30)).await;
    p.stage("b-two.png", &png(30, 30)).await;
    let first = p.producer.submit("a-one.png").await.unwrap();
    let second = p.producer.submit("b-two.png").await.unwrap();
    let worker = p.worker();

    p.jobs.set_unavailable(true);
    assert_eq!(p.process_next(&worker).await, Outcome::Retry);
    assert_eq!(p.process_next(&worker).await, Outcome::Retry);
    assert!(p.queue.dead_letters(QUEUE).await.is_empty());
    assert_eq!(p.queue.in_flight_len(QUEUE).await, 2);

    // The broker hands both out again after the store recovers.
    p.jobs.set_unavailable(false);
    assert_eq!(p.queue.redeliver_unacked(QUEUE).await, 2);
    assert_eq!(p.process_next(&worker).await, Outcome::Ack);
    assert_eq!(p.process_next(&worker).await, Outcome::Ack);
    assert_eq!(p.status(first).await, JobStatus::Succeeded);
    assert_eq!(p.status(second).await, JobStatus::Succeeded);
    assert_eq!(p.queue.in_flight_len(QUEUE).await, 0);
}

/// Handler that finishes the job out from under the worker, as a concurrent
/// duplicate delivery would.
struct RacingHandler {
    jobs: Arc<InMemoryJobRepository>,
    calls: AtomicUsize,
}

#[async_trait]
impl JobHandler for RacingHandler {
    async fn execute(&self, job: &Job) -> JobResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.jobs
            .update_status(job.id, JobStatus::Succeeded)
            .await
            .unwrap();
        JobResult::Success(job.thumbnail_filename())
    }
}

#[tokio::test]
async fn test_lost_race_on_success_write_still_acks() {
    let p = Pipeline::new();
    let job_id = p.producer.submit("race.png").await.unwrap();
    let handler = Arc::new(RacingHandler {
        jobs: p.jobs.clone(),
        calls: AtomicUsize::new(0),
    });
    let worker = p.worker_with(p.jobs.clone(), handler.clone(), test_config());

    assert_eq!(p.process_next(&worker).await, Outcome::Ack);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert_eq!(p.status(job_id).await, JobStatus::Succeeded);
}
