//! Queue worker: turns job messages into thumbnails and terminal job states.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use thumbforge_core::defaults;
use thumbforge_core::{
    Delivery, Error, JobMessage, JobRepository, JobStatus, MessageQueue, Outcome, Result,
};
use thumbforge_queue::{consume_with_options, DeliveryHandler, PumpOptions};

use crate::handler::{JobHandler, JobResult};

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Back-off after a broker error, in milliseconds.
    pub poll_interval_ms: u64,
    /// Maximum number of deliveries handled concurrently.
    pub max_concurrent_jobs: usize,
    /// Whether to enable job processing.
    pub enabled: bool,
    /// Queue to consume.
    pub queue_name: String,
    /// Consumer name within the consumer group; unique per worker process.
    pub consumer_name: String,
    /// How long one fetch waits on an empty queue, in milliseconds.
    pub fetch_wait_ms: u64,
    /// Execution time limit per job.
    pub job_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: defaults::JOB_POLL_INTERVAL_MS,
            max_concurrent_jobs: defaults::JOB_MAX_CONCURRENT,
            enabled: true,
            queue_name: defaults::QUEUE_NAME.to_string(),
            consumer_name: default_consumer_name(),
            fetch_wait_ms: defaults::QUEUE_BLOCK_MS,
            job_timeout: Duration::from_secs(defaults::JOB_TIMEOUT_SECS),
        }
    }
}

fn default_consumer_name() -> String {
    format!("worker-{}", Uuid::new_v4().simple())
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `JOB_MAX_CONCURRENT` | `4` | Max concurrent deliveries |
    /// | `JOB_POLL_INTERVAL_MS` | `1000` | Back-off after a broker error |
    /// | `JOB_TIMEOUT_SECS` | `120` | Per-job execution limit |
    /// | `QUEUE_NAME` | `thumbforge:jobs` | Queue to consume |
    /// | `WORKER_CONSUMER_NAME` | `worker-<random>` | Consumer name in the group |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let base = Self::default();

        let enabled = lookup("JOB_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(base.enabled);

        let max_concurrent_jobs = lookup("JOB_MAX_CONCURRENT")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(base.max_concurrent_jobs)
            .max(1);

        let poll_interval_ms = lookup("JOB_POLL_INTERVAL_MS")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(base.poll_interval_ms);

        let job_timeout = lookup("JOB_TIMEOUT_SECS")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(base.job_timeout);

        let queue_name = lookup("QUEUE_NAME")
            .filter(|v| !v.is_empty())
            .unwrap_or(base.queue_name);

        let consumer_name = lookup("WORKER_CONSUMER_NAME")
            .filter(|v| !v.is_empty())
            .unwrap_or(base.consumer_name);

        Self {
            poll_interval_ms,
            max_concurrent_jobs,
            enabled,
            queue_name,
            consumer_name,
            fetch_wait_ms: base.fetch_wait_ms,
            job_timeout,
        }
    }

    /// Set the broker error back-off.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set maximum concurrent jobs.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    /// Enable or disable job processing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the queue to consume.
    pub fn with_queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = queue_name.into();
        self
    }

    /// Set the consumer name.
    pub fn with_consumer_name(mut self, consumer_name: impl Into<String>) -> Self {
        self.consumer_name = consumer_name.into();
        self
    }

    /// Set how long a fetch waits on an empty queue.
    pub fn with_fetch_wait(mut self, ms: u64) -> Self {
        self.fetch_wait_ms = ms;
        self
    }

    /// Set the per-job execution limit.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Check that the broker's pending timeout outlasts a job.
    ///
    /// A delivery still executing when the timeout passes is reclaimed by
    /// another consumer and the job runs twice, so the pending timeout must
    /// exceed the job timeout by at least `PENDING_TIMEOUT_MARGIN_SECS`.
    pub fn check_pending_timeout(&self, pending_timeout: Duration) -> Result<()> {
        let required = self.job_timeout + Duration::from_secs(defaults::PENDING_TIMEOUT_MARGIN_SECS);
        if pending_timeout < required {
            return Err(Error::Config(format!(
                "QUEUE_PENDING_TIMEOUT_MS ({}ms) must be at least JOB_TIMEOUT_SECS plus {}s ({}ms)",
                pending_timeout.as_millis(),
                defaults::PENDING_TIMEOUT_MARGIN_SECS,
                required.as_millis()
            )));
        }
        Ok(())
    }

    fn pump_options(&self) -> PumpOptions {
        PumpOptions {
            batch_size: self.max_concurrent_jobs.max(1),
            fetch_wait: Duration::from_millis(self.fetch_wait_ms),
            error_backoff: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

/// Event emitted by the job worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// Worker started.
    WorkerStarted,
    /// Execution of a job began.
    JobStarted { job_id: Uuid },
    /// A job's thumbnail was written and the job marked succeeded.
    JobSucceeded { job_id: Uuid, duration_ms: u64 },
    /// A job failed and its message was dead-lettered.
    JobFailed { job_id: Uuid, error: String },
    /// A message referenced a missing or already finished job and was acked unprocessed.
    MessageSkipped { job_id: Uuid, reason: String },
    /// A message body was not a valid job reference and was dead-lettered.
    MessageRejected { reason: String },
    /// Worker stopped.
    WorkerStopped,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker to shut down gracefully.
    ///
    /// Deliveries already being handled are finished and settled first.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    /// Wait for the worker task to finish.
    ///
    /// After [`shutdown`](Self::shutdown) this returns once every delivery in
    /// the current round has been settled.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| Error::Internal(format!("worker task failed: {e}")))
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }
}

/// Job worker that consumes job messages from the queue.
pub struct JobWorker {
    jobs: Arc<dyn JobRepository>,
    queue: Arc<dyn MessageQueue>,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl JobWorker {
    /// Create a new job worker.
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        queue: Arc<dyn MessageQueue>,
        handler: Arc<dyn JobHandler>,
        config: WorkerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        Self {
            jobs,
            queue,
            handler,
            config,
            event_tx,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        let worker = Arc::new(self);
        let task = tokio::spawn(async move {
            worker.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
            task,
        }
    }

    async fn run(self: Arc<Self>, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!(subsystem = "jobs", component = "worker", "Job worker is disabled, not starting");
            return;
        }

        info!(
            subsystem = "jobs",
            component = "worker",
            queue = %self.config.queue_name,
            consumer = %self.config.consumer_name,
            max_concurrent = self.config.max_concurrent_jobs,
            "Job worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        if let Err(e) = self.queue.connect().await {
            // Not fatal: the pump retries on every fetch.
            warn!(subsystem = "jobs", component = "worker", error = %e, "Initial queue connect failed");
        }

        let queue = self.queue.clone();
        let queue_name = self.config.queue_name.clone();
        let consumer = self.config.consumer_name.clone();
        let options = self.config.pump_options();
        let stats =
            consume_with_options(queue, &queue_name, &consumer, self.clone(), options, shutdown_rx)
                .await;

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!(
            subsystem = "jobs",
            component = "worker",
            acked = stats.acked,
            rejected = stats.rejected,
            deferred = stats.deferred,
            "Job worker stopped"
        );
    }

    /// Decide the fate of one message body.
    ///
    /// Never fails. Execution errors end in a `failed` job and a reject. When
    /// the store cannot be read, or a failure cannot be recorded, the delivery
    /// is left pending so the broker redelivers it once the store is back.
    /// Only a job still `processing` is executed, so a redelivered message for
    /// a finished job is acked without side effects.
    pub async fn handle_delivery(&self, body: &[u8]) -> Outcome {
        let message = match JobMessage::from_slice(body) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    subsystem = "jobs",
                    component = "worker",
                    error = %e,
                    "Rejecting malformed job message"
                );
                let _ = self.event_tx.send(WorkerEvent::MessageRejected {
                    reason: e.to_string(),
                });
                return Outcome::Reject;
            }
        };
        let job_id = message.job_id;

        let job = match self.jobs.get(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return self.skip(job_id, "job not found".to_string()),
            Err(e) => {
                error!(
                    subsystem = "jobs",
                    component = "worker",
                    job_id = %job_id,
                    error = %e,
                    "Failed to load job, leaving delivery pending"
                );
                return Outcome::Retry;
            }
        };

        if job.status != JobStatus::Processing {
            return self.skip(job_id, format!("job already {}", job.status));
        }
        if job.image_filename != message.image_filename {
            warn!(
                subsystem = "jobs",
                component = "worker",
                job_id = %job_id,
                record = %job.image_filename,
                queued = %message.image_filename,
                "Message filename differs from job record, using the record"
            );
        }

        let start = Instant::now();
        info!(subsystem = "jobs", component = "worker", job_id = %job_id, "Processing job");
        let _ = self.event_tx.send(WorkerEvent::JobStarted { job_id });

        let execution = self.handler.execute(&job);
        let result = match tokio::time::timeout(self.config.job_timeout, execution).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    subsystem = "jobs",
                    component = "worker",
                    job_id = %job_id,
                    "Job exceeded timeout of {}s",
                    self.config.job_timeout.as_secs()
                );
                JobResult::Failed(format!(
                    "job exceeded timeout of {}s",
                    self.config.job_timeout.as_secs()
                ))
            }
        };

        match result {
            JobResult::Success(output) => match self.jobs.update_status(job_id, JobStatus::Succeeded).await {
                Ok(true) => {
                    let duration_ms = start.elapsed().as_millis() as u64;
                    info!(
                        subsystem = "jobs",
                        component = "worker",
                        job_id = %job_id,
                        output = %output,
                        duration_ms,
                        "Job completed successfully"
                    );
                    let _ = self.event_tx.send(WorkerEvent::JobSucceeded { job_id, duration_ms });
                    Outcome::Ack
                }
                Ok(false) => {
                    // Deleted or finished by another delivery while we worked.
                    warn!(
                        subsystem = "jobs",
                        component = "worker",
                        job_id = %job_id,
                        "Job no longer processing after execution, acking without status change"
                    );
                    Outcome::Ack
                }
                Err(e) => {
                    self.mark_failed(job_id, format!("failed to record success: {e}"))
                        .await
                }
            },
            JobResult::Failed(reason) => self.mark_failed(job_id, reason).await,
        }
    }

    fn skip(&self, job_id: Uuid, reason: String) -> Outcome {
        debug!(
            subsystem = "jobs",
            component = "worker",
            job_id = %job_id,
            reason = %reason,
            "Skipping message"
        );
        let _ = self.event_tx.send(WorkerEvent::MessageSkipped { job_id, reason });
        Outcome::Ack
    }

    async fn mark_failed(&self, job_id: Uuid, reason: String) -> Outcome {
        if let Err(e) = self.jobs.fail(job_id, &reason).await {
            error!(
                subsystem = "jobs",
                component = "worker",
                job_id = %job_id,
                error = %e,
                reason = %reason,
                "Failed to mark job as failed, leaving delivery pending"
            );
            return Outcome::Retry;
        }
        warn!(
            subsystem = "jobs",
            component = "worker",
            job_id = %job_id,
            error = %reason,
            "Job failed"
        );
        let _ = self.event_tx.send(WorkerEvent::JobFailed {
            job_id,
            error: reason,
        });
        Outcome::Reject
    }
}

#[async_trait]
impl DeliveryHandler for JobWorker {
    async fn handle(&self, delivery: &Delivery) -> Outcome {
        debug!(
            subsystem = "jobs",
            component = "worker",
            delivery_id = %delivery.id,
            delivery_count = delivery.delivery_count,
            "Handling delivery"
        );
        self.handle_delivery(&delivery.body).await
    }
}
