//! Redis Streams-backed job queue (durable, at-least-once delivery).
//!
//! - **Stream key**: the queue name (default `thumbforge:jobs`), one entry per job
//!   message with the JSON body in the `body` field
//! - **Consumer group**: shared by every worker process (default `thumbnail-workers`)
//! - **Ack**: `XACK` + `XDEL`, the message is gone for good
//! - **Reject**: copied to `<queue>:dead`, then acked and deleted; never requeued
//! - **Redelivery**: entries pending longer than the pending timeout are taken
//!   over by live consumers with `XAUTOCLAIM`

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use thumbforge_core::defaults;
use thumbforge_core::{Delivery, Error, MessageQueue, Result, ServiceConfig};

/// Stream field holding the message body.
const BODY_FIELD: &str = "body";

/// Configuration for [`RedisStreamQueue`].
#[derive(Debug, Clone)]
pub struct RedisQueueConfig {
    /// Redis connection URL.
    pub url: String,
    /// Consumer group every worker joins.
    pub group: String,
    /// Idle time after which another consumer may take over a pending delivery.
    pub pending_timeout: Duration,
    /// Interval between reads while a fetch waits on an empty stream.
    pub poll_step: Duration,
}

impl RedisQueueConfig {
    pub fn new(url: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            group: group.into(),
            pending_timeout: Duration::from_millis(defaults::QUEUE_PENDING_TIMEOUT_MS),
            poll_step: Duration::from_millis(defaults::QUEUE_POLL_STEP_MS),
        }
    }

    /// Broker settings from the service configuration.
    pub fn from_service(config: &ServiceConfig) -> Self {
        Self::new(&config.redis_url, &config.consumer_group)
            .with_pending_timeout(Duration::from_millis(config.queue_pending_timeout_ms))
    }

    /// Set the pending-entry reclaim timeout.
    pub fn with_pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout = timeout;
        self
    }

    /// Set the read interval used while waiting for messages.
    pub fn with_poll_step(mut self, step: Duration) -> Self {
        self.poll_step = step;
        self
    }
}

impl Default for RedisQueueConfig {
    fn default() -> Self {
        Self::new(defaults::REDIS_URL, defaults::QUEUE_CONSUMER_GROUP)
    }
}

/// Name of the dead-letter stream for `queue`.
pub fn dead_letter_key(queue: &str) -> String {
    format!("{queue}{}", defaults::DEAD_LETTER_SUFFIX)
}

/// Job queue on Redis Streams.
///
/// Holds one lazily established [`ConnectionManager`] shared by every caller in
/// the process. Reads never use `XREADGROUP BLOCK`, so a waiting worker does not
/// stall publishes multiplexed over the same connection.
pub struct RedisStreamQueue {
    client: redis::Client,
    config: RedisQueueConfig,
    connection: OnceCell<ConnectionManager>,
    groups: Mutex<HashSet<String>>,
}

impl RedisStreamQueue {
    /// Create a queue adapter. No connection is made until first use.
    pub fn new(config: RedisQueueConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| Error::Config(format!("invalid REDIS_URL: {e}")))?;
        Ok(Self {
            client,
            config,
            connection: OnceCell::new(),
            groups: Mutex::new(HashSet::new()),
        })
    }

    pub fn config(&self) -> &RedisQueueConfig {
        &self.config
    }

    /// Shared connection, established on first call.
    async fn conn(&self) -> Result<ConnectionManager> {
        let conn = self
            .connection
            .get_or_try_init(|| async {
                let manager = ConnectionManager::new(self.client.clone())
                    .await
                    .map_err(|e| {
                        error!(
                            subsystem = "queue",
                            component = "redis_stream",
                            op = "connect",
                            error = %e,
                            "Failed to connect to Redis"
                        );
                        Error::Queue(format!("connect failed: {e}"))
                    })?;
                info!(
                    subsystem = "queue",
                    component = "redis_stream",
                    op = "connect",
                    group = %self.config.group,
                    "Connected to Redis"
                );
                Ok::<_, Error>(manager)
            })
            .await?;
        Ok(conn.clone())
    }

    /// Declare the stream and consumer group for `queue` if absent (idempotent).
    async fn ensure_group(&self, conn: &mut ConnectionManager, queue: &str) -> Result<()> {
        let mut groups = self.groups.lock().await;
        if groups.contains(queue) {
            return Ok(());
        }

        // "0" so a group created after the first publish still sees every entry
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(queue)
            .arg(&self.config.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(conn)
            .await;

        match created {
            Ok(()) => {
                info!(
                    subsystem = "queue",
                    component = "redis_stream",
                    op = "declare",
                    queue,
                    group = %self.config.group,
                    "Created consumer group"
                );
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(e.into()),
        }

        groups.insert(queue.to_string());
        Ok(())
    }

    /// Take over deliveries that other consumers left pending too long.
    async fn reclaim_stale(
        &self,
        conn: &mut ConnectionManager,
        queue: &str,
        consumer: &str,
        max: usize,
    ) -> Result<Vec<Delivery>> {
        let reply: Vec<redis::Value> = redis::cmd("XAUTOCLAIM")
            .arg(queue)
            .arg(&self.config.group)
            .arg(consumer)
            .arg(self.config.pending_timeout.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(max)
            .query_async(conn)
            .await?;

        // Reply: [next-cursor, [[id, [field, value, ...]], ...], (deleted ids)]
        let entries: Vec<Option<(String, HashMap<String, Vec<u8>>)>> = match reply.get(1) {
            Some(value) => redis::from_redis_value(value)?,
            None => Vec::new(),
        };

        let mut deliveries = Vec::with_capacity(entries.len());
        for (id, mut fields) in entries.into_iter().flatten() {
            let delivery_count = self.delivery_count(conn, queue, &id).await.unwrap_or(2);
            deliveries.push(Delivery {
                queue: queue.to_string(),
                body: fields.remove(BODY_FIELD).unwrap_or_default(),
                id,
                delivery_count,
            });
        }

        if !deliveries.is_empty() {
            warn!(
                subsystem = "queue",
                component = "redis_stream",
                op = "reclaim",
                queue,
                consumer,
                count = deliveries.len(),
                "Reclaimed stale pending deliveries"
            );
        }
        Ok(deliveries)
    }

    /// Delivery counter the broker keeps for a pending entry.
    async fn delivery_count(
        &self,
        conn: &mut ConnectionManager,
        queue: &str,
        id: &str,
    ) -> Result<u64> {
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(queue)
            .arg(&self.config.group)
            .arg(id)
            .arg(id)
            .arg(1)
            .query_async(conn)
            .await?;
        pending
            .first()
            .map(|(_, _, _, count)| *count)
            .ok_or_else(|| Error::Queue(format!("delivery {id} is not pending")))
    }

    /// Non-blocking read of never-delivered entries.
    async fn read_new(
        &self,
        conn: &mut ConnectionManager,
        queue: &str,
        consumer: &str,
        max: usize,
    ) -> Result<Vec<Delivery>> {
        let options = StreamReadOptions::default()
            .group(&self.config.group, consumer)
            .count(max);

        let reply: Option<StreamReadReply> =
            conn.xread_options(&[queue], &[">"], &options).await?;

        let deliveries = reply
            .map(|reply| reply.keys)
            .unwrap_or_default()
            .into_iter()
            .flat_map(|key| key.ids)
            .map(|entry| Delivery {
                queue: queue.to_string(),
                body: entry.get::<Vec<u8>>(BODY_FIELD).unwrap_or_default(),
                id: entry.id,
                delivery_count: 1,
            })
            .collect();
        Ok(deliveries)
    }
}

#[async_trait]
impl MessageQueue for RedisStreamQueue {
    async fn connect(&self) -> Result<()> {
        self.conn().await.map(|_| ())
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<()> {
        let mut conn = self.conn().await?;
        self.ensure_group(&mut conn, queue).await?;

        let id: String = conn.xadd(queue, "*", &[(BODY_FIELD, body)]).await.map_err(|e| {
            error!(
                subsystem = "queue",
                component = "redis_stream",
                op = "publish",
                queue,
                error = %e,
                "XADD failed"
            );
            Error::from(e)
        })?;

        debug!(
            subsystem = "queue",
            component = "redis_stream",
            op = "publish",
            queue,
            delivery_id = %id,
            "Published message"
        );
        Ok(())
    }

    async fn fetch(
        &self,
        queue: &str,
        consumer: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>> {
        let mut conn = self.conn().await?;
        self.ensure_group(&mut conn, queue).await?;
        let max = max.max(1);

        let reclaimed = self.reclaim_stale(&mut conn, queue, consumer, max).await?;
        if !reclaimed.is_empty() {
            return Ok(reclaimed);
        }

        let deadline = Instant::now() + wait;
        loop {
            let deliveries = self.read_new(&mut conn, queue, consumer, max).await?;
            if !deliveries.is_empty() {
                debug!(
                    subsystem = "queue",
                    component = "redis_stream",
                    op = "fetch",
                    queue,
                    consumer,
                    count = deliveries.len(),
                    "Fetched deliveries"
                );
                return Ok(deliveries);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            sleep(self.config.poll_step.min(deadline - now)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut conn = self.conn().await?;
        let (_acked, _deleted): (u64, u64) = redis::pipe()
            .atomic()
            .xack(&delivery.queue, &self.config.group, &[&delivery.id])
            .xdel(&delivery.queue, &[&delivery.id])
            .query_async(&mut conn)
            .await?;

        debug!(
            subsystem = "queue",
            component = "redis_stream",
            op = "ack",
            queue = %delivery.queue,
            delivery_id = %delivery.id,
            "Acked delivery"
        );
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery) -> Result<()> {
        let mut conn = self.conn().await?;
        let dead_letter = dead_letter_key(&delivery.queue);
        let fields: [(&str, Vec<u8>); 4] = [
            (BODY_FIELD, delivery.body.clone()),
            ("source_id", delivery.id.as_bytes().to_vec()),
            ("delivery_count", delivery.delivery_count.to_string().into_bytes()),
            ("rejected_at", chrono::Utc::now().to_rfc3339().into_bytes()),
        ];

        let (_dead_id, _acked, _deleted): (String, u64, u64) = redis::pipe()
            .atomic()
            .xadd(&dead_letter, "*", &fields)
            .xack(&delivery.queue, &self.config.group, &[&delivery.id])
            .xdel(&delivery.queue, &[&delivery.id])
            .query_async(&mut conn)
            .await?;

        warn!(
            subsystem = "queue",
            component = "redis_stream",
            op = "reject",
            queue = %delivery.queue,
            delivery_id = %delivery.id,
            dead_letter = %dead_letter,
            "Message sent to dead-letter stream"
        );
        Ok(())
    }
}
