//! # thumbforge-db
//!
//! Persistence for the thumbnail pipeline.
//!
//! This crate provides:
//! - Connection pool management
//! - The PostgreSQL job record store
//! - An in-memory job record store with identical transition rules
//! - Filesystem storage for staged uploads and thumbnails
//!
//! ## Example
//!
//! ```rust,ignore
//! use thumbforge_db::{Database, JobRepository, JobStatus};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/thumbforge").await?;
//!     db.migrate().await?;
//!
//!     let job_id = db.jobs.create("1a2b-cat.jpg").await?;
//!     db.jobs.update_status(job_id, JobStatus::Succeeded).await?;
//!     Ok(())
//! }
//! ```
pub mod file_storage;
pub mod jobs;
pub mod memory;
pub mod pool;

// Always compiled so integration tests (in tests/) can use DEFAULT_TEST_DATABASE_URL
pub mod test_fixtures;

// Re-export core types
pub use thumbforge_core::*;

pub use file_storage::FilesystemBackend;
pub use jobs::PgJobRepository;
pub use memory::InMemoryJobRepository;
pub use pool::{create_pool, PoolConfig};

/// Combined database context.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Job record store.
    pub jobs: PgJobRepository,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            jobs: PgJobRepository::new(pool.clone()),
            pool,
        }
    }

    /// Connect with the default (API-sized) pool.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(url, PoolConfig::default()).await
    }

    /// Connect with an explicit pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool(url, &config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}
