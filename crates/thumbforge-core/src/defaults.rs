//! Centralized default constants for thumbforge.
//!
//! Every crate and binary reads its defaults from here instead of defining its
//! own magic numbers. Organized by domain area.

// =============================================================================
// SERVER
// =============================================================================

/// Default HTTP bind host.
pub const SERVER_HOST: &str = "0.0.0.0";

/// Default HTTP server port.
pub const SERVER_PORT: u16 = 3000;

/// Maximum upload body size in bytes (20 MB).
pub const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

/// Multipart field carrying the uploaded image.
pub const UPLOAD_FIELD: &str = "image";

/// Default event broadcast channel capacity.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// STORAGE
// =============================================================================

/// Default PostgreSQL URL.
pub const DATABASE_URL: &str = "postgres://localhost/thumbforge";

/// Connections in the API server's pool.
pub const DB_MAX_CONNECTIONS: u32 = 10;

/// Connections a worker keeps beyond one per concurrent job.
pub const DB_WORKER_SPARE_CONNECTIONS: u32 = 2;

/// How long a query waits for a free connection before failing.
pub const DB_ACQUIRE_TIMEOUT_SECS: u64 = 5;

/// Idle connections are closed after this long.
pub const DB_IDLE_TIMEOUT_SECS: u64 = 600;

/// Directory served as static content.
pub const PUBLIC_DIR: &str = "public";

/// Directory holding staged uploads.
pub const UPLOADS_DIR: &str = "public/uploads";

/// Directory holding generated thumbnails.
pub const THUMBNAILS_DIR: &str = "public/thumbnails";

// =============================================================================
// QUEUE
// =============================================================================

/// Default Redis URL.
pub const REDIS_URL: &str = "redis://localhost:6379";

/// Well-known job queue (stream key).
pub const QUEUE_NAME: &str = "thumbforge:jobs";

/// Consumer group shared by all workers.
pub const QUEUE_CONSUMER_GROUP: &str = "thumbnail-workers";

/// Suffix appended to a queue name to form its dead-letter stream.
pub const DEAD_LETTER_SUFFIX: &str = ":dead";

/// Pending deliveries idle longer than this are reclaimed by live consumers.
///
/// Must exceed `JOB_TIMEOUT_SECS` by `PENDING_TIMEOUT_MARGIN_SECS`, or a job
/// still executing is handed to a second consumer.
pub const QUEUE_PENDING_TIMEOUT_MS: u64 = 180_000;

/// Minimum gap between the job timeout and the pending timeout.
pub const PENDING_TIMEOUT_MARGIN_SECS: u64 = 30;

/// How long a fetch blocks on an empty queue.
pub const QUEUE_BLOCK_MS: u64 = 5_000;

/// Interval between broker reads while a fetch is waiting for messages.
pub const QUEUE_POLL_STEP_MS: u64 = 200;

// =============================================================================
// THUMBNAILS
// =============================================================================

/// Target thumbnail width in pixels.
pub const THUMBNAIL_WIDTH: u32 = 100;

/// Target thumbnail height in pixels.
pub const THUMBNAIL_HEIGHT: u32 = 100;

/// Thumbnail file extension (JPEG output).
pub const THUMBNAIL_EXTENSION: &str = "jpg";

/// JPEG encoder quality (0-100).
pub const THUMBNAIL_QUALITY: u8 = 85;

// =============================================================================
// JOB PROCESSING
// =============================================================================

/// Back-off after a failed fetch before polling the broker again.
pub const JOB_POLL_INTERVAL_MS: u64 = 1_000;

/// Default maximum deliveries handled concurrently per worker.
pub const JOB_MAX_CONCURRENT: usize = 4;

/// Default job execution timeout in seconds.
pub const JOB_TIMEOUT_SECS: u64 = 120;
