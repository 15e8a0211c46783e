//! PostgreSQL pool sizing and creation.
//!
//! One long-lived pool per process. The API serves requests on a fixed-size
//! pool; a worker sizes its pool from how many deliveries it handles at once.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use thumbforge_core::defaults;
use thumbforge_core::{Error, Result};

/// Pool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: u32,
    /// A query that cannot get a connection within this fails with
    /// `Error::Database`, which callers treat as the store being unavailable.
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: defaults::DB_MAX_CONNECTIONS,
            acquire_timeout: Duration::from_secs(defaults::DB_ACQUIRE_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(defaults::DB_IDLE_TIMEOUT_SECS),
        }
    }
}

impl PoolConfig {
    /// Pool for a worker handling `max_concurrent_jobs` deliveries at once.
    ///
    /// A delivery holds at most one connection at a time (load, then one
    /// terminal write), plus a few spare for startup and migrations.
    pub fn for_worker(max_concurrent_jobs: usize) -> Self {
        let per_job = u32::try_from(max_concurrent_jobs.max(1)).unwrap_or(u32::MAX);
        Self {
            max_connections: per_job.saturating_add(defaults::DB_WORKER_SPARE_CONNECTIONS),
            ..Self::default()
        }
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

/// Connect a pool with `config`, failing if the first connection cannot be made.
pub async fn create_pool(database_url: &str, config: &PoolConfig) -> Result<PgPool> {
    let start = Instant::now();

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "db",
        component = "pool",
        op = "connect",
        max_connections = config.max_connections,
        acquire_timeout_secs = config.acquire_timeout.as_secs(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Database pool connected"
    );
    Ok(pool)
}
