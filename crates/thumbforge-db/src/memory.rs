//! In-process job repository.
//!
//! Same transition rules as [`crate::PgJobRepository`] behind a single lock,
//! plus a write counter and an outage switch for pipeline tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use thumbforge_core::{new_v7, Error, Job, JobRepository, JobStatus, Result};

/// Job repository held entirely in memory.
///
/// Keys are UUIDv7, so map order is submission order.
#[derive(Default)]
pub struct InMemoryJobRepository {
    jobs: RwLock<BTreeMap<Uuid, Job>>,
    writes: AtomicUsize,
    unavailable: AtomicBool,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mutating calls (`create`, `update_status`, `fail`, `delete`) received.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Simulate a store outage: every call fails with a database error until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    fn record_write(&self) -> Result<()> {
        self.check_available()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn finish(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job_id) {
            Some(job) if job.status.can_transition_to(status) => {
                job.status = status;
                job.completed_at = Some(Utc::now());
                job.error_message = error.map(String::from);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn create(&self, image_filename: &str) -> Result<Uuid> {
        self.record_write()?;
        let job = Job::new(new_v7(), image_filename, Utc::now());
        let id = job.id;
        self.jobs.write().await.insert(id, job);
        Ok(id)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        self.check_available()?;
        Ok(self.jobs.read().await.get(&job_id).cloned())
    }

    async fn update_status(&self, job_id: Uuid, status: JobStatus) -> Result<bool> {
        self.record_write()?;
        if !status.is_terminal() {
            return Err(Error::InvalidInput(format!(
                "cannot move job {job_id} to non-terminal status {status}"
            )));
        }
        self.finish(job_id, status, None).await
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<bool> {
        self.record_write()?;
        self.finish(job_id, JobStatus::Failed, Some(error)).await
    }

    async fn list_all(&self) -> Result<Vec<Job>> {
        self.check_available()?;
        Ok(self.jobs.read().await.values().cloned().collect())
    }

    async fn delete(&self, job_id: Uuid) -> Result<Option<Job>> {
        self.record_write()?;
        Ok(self.jobs.write().await.remove(&job_id))
    }
}
