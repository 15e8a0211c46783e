//! Environment-provided service configuration.

use std::path::PathBuf;

use crate::defaults;
use crate::error::{Error, Result};

/// Settings shared by the API server and the standalone worker.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub database_url: String,
    pub redis_url: String,
    pub queue_name: String,
    pub consumer_group: String,
    pub queue_pending_timeout_ms: u64,
    pub uploads_dir: PathBuf,
    pub thumbnails_dir: PathBuf,
    pub public_dir: PathBuf,
    pub host: String,
    pub port: u16,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            database_url: defaults::DATABASE_URL.to_string(),
            redis_url: defaults::REDIS_URL.to_string(),
            queue_name: defaults::QUEUE_NAME.to_string(),
            consumer_group: defaults::QUEUE_CONSUMER_GROUP.to_string(),
            queue_pending_timeout_ms: defaults::QUEUE_PENDING_TIMEOUT_MS,
            uploads_dir: PathBuf::from(defaults::UPLOADS_DIR),
            thumbnails_dir: PathBuf::from(defaults::THUMBNAILS_DIR),
            public_dir: PathBuf::from(defaults::PUBLIC_DIR),
            host: defaults::SERVER_HOST.to_string(),
            port: defaults::SERVER_PORT,
        }
    }
}

impl ServiceConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `DATABASE_URL` | `postgres://localhost/thumbforge` |
    /// | `REDIS_URL` | `redis://localhost:6379` |
    /// | `QUEUE_NAME` | `thumbforge:jobs` |
    /// | `QUEUE_CONSUMER_GROUP` | `thumbnail-workers` |
    /// | `QUEUE_PENDING_TIMEOUT_MS` | `180000` |
    /// | `UPLOADS_DIR` | `public/uploads` |
    /// | `THUMBNAILS_DIR` | `public/thumbnails` |
    /// | `PUBLIC_DIR` | `public` |
    /// | `HOST` | `0.0.0.0` |
    /// | `PORT` | `3000` |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base = Self::default();
        let get = |key: &str, fallback: String| lookup(key).filter(|v| !v.is_empty()).unwrap_or(fallback);

        let port = match lookup("PORT").filter(|v| !v.is_empty()) {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| Error::Config(format!("PORT must be a port number, got {raw:?}")))?,
            None => base.port,
        };

        let queue_pending_timeout_ms = match lookup("QUEUE_PENDING_TIMEOUT_MS").filter(|v| !v.is_empty()) {
            Some(raw) => raw.parse::<u64>().map_err(|_| {
                Error::Config(format!("QUEUE_PENDING_TIMEOUT_MS must be milliseconds, got {raw:?}"))
            })?,
            None => base.queue_pending_timeout_ms,
        };

        let queue_name = get("QUEUE_NAME", base.queue_name);
        if queue_name.ends_with(defaults::DEAD_LETTER_SUFFIX) {
            return Err(Error::Config(format!(
                "QUEUE_NAME must not end with {:?}",
                defaults::DEAD_LETTER_SUFFIX
            )));
        }

        Ok(Self {
            database_url: get("DATABASE_URL", base.database_url),
            redis_url: get("REDIS_URL", base.redis_url),
            queue_name,
            consumer_group: get("QUEUE_CONSUMER_GROUP", base.consumer_group),
            queue_pending_timeout_ms,
            uploads_dir: PathBuf::from(get("UPLOADS_DIR", defaults::UPLOADS_DIR.into())),
            thumbnails_dir: PathBuf::from(get("THUMBNAILS_DIR", defaults::THUMBNAILS_DIR.into())),
            public_dir: PathBuf::from(get("PUBLIC_DIR", defaults::PUBLIC_DIR.into())),
            host: get("HOST", base.host),
            port,
        })
    }

    /// `host:port` for the HTTP listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
