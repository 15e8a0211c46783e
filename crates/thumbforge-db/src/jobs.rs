//! Job repository implementation.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres, Row};
use tracing::{debug, info};
use uuid::Uuid;

use thumbforge_core::{new_v7, Error, Job, JobRepository, JobStatus, Result};

const JOB_COLUMNS: &str =
    "id, image_filename, status, created_at, completed_at, error_message";

/// PostgreSQL implementation of JobRepository.
///
/// Terminal transitions are single `UPDATE ... WHERE status = 'processing'`
/// statements, so two workers racing on a redelivered message cannot both
/// move the same job.
#[derive(Clone)]
pub struct PgJobRepository {
    pool: Pool<Postgres>,
}

impl PgJobRepository {
    /// Create a new PgJobRepository with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Parse a job row into a Job struct.
    fn parse_job_row(row: sqlx::postgres::PgRow) -> Result<Job> {
        let status: String = row.try_get("status")?;
        Ok(Job {
            id: row.try_get("id")?,
            image_filename: row.try_get("image_filename")?,
            status: status.parse()?,
            created_at: row.try_get("created_at")?,
            completed_at: row.try_get("completed_at")?,
            error_message: row.try_get("error_message")?,
        })
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn create(&self, image_filename: &str) -> Result<Uuid> {
        let job_id = new_v7();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO jobs (id, image_filename, status, created_at)
             VALUES ($1, $2, 'processing', $3)",
        )
        .bind(job_id)
        .bind(image_filename)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        info!(
            subsystem = "db",
            component = "jobs",
            op = "create",
            job_id = %job_id,
            image_filename,
            "Created job record"
        );
        Ok(job_id)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.map(Self::parse_job_row).transpose()
    }

    async fn update_status(&self, job_id: Uuid, status: JobStatus) -> Result<bool> {
        if !status.is_terminal() {
            return Err(Error::InvalidInput(format!(
                "cannot move job {job_id} to non-terminal status {status}"
            )));
        }

        let result = sqlx::query(
            "UPDATE jobs
             SET status = $1, completed_at = $2
             WHERE id = $3 AND status = 'processing'",
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        let changed = result.rows_affected() == 1;
        debug!(
            subsystem = "db",
            component = "jobs",
            op = "update_status",
            job_id = %job_id,
            %status,
            changed,
            "Job status update"
        );
        Ok(changed)
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs
             SET status = 'failed', completed_at = $1, error_message = $2
             WHERE id = $3 AND status = 'processing'",
        )
        .bind(Utc::now())
        .bind(error)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_all(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_job_row).collect()
    }

    async fn delete(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&format!(
            "DELETE FROM jobs WHERE id = $1 RETURNING {JOB_COLUMNS}"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        if row.is_some() {
            info!(subsystem = "db", component = "jobs", op = "delete", job_id = %job_id, "Deleted job record");
        }
        row.map(Self::parse_job_row).transpose()
    }
}
