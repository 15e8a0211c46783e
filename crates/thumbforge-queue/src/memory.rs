//! In-process message queue.
//!
//! Keeps the same contract as the Redis adapter: deliveries stay in flight
//! until acked or rejected, rejects land on `<queue>:dead`, and unacked
//! deliveries can be handed out again to simulate a consumer crash.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout, Instant};
use tracing::debug;

use thumbforge_core::{Delivery, Error, MessageQueue, Result};

use crate::redis_stream::dead_letter_key;

#[derive(Debug, Clone)]
struct Stored {
    id: String,
    body: Vec<u8>,
    delivery_count: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Stored>,
    in_flight: HashMap<String, Stored>,
    acked: usize,
}

/// Message queue held entirely in memory.
#[derive(Default)]
pub struct InMemoryQueue {
    queues: Mutex<HashMap<String, QueueState>>,
    notify: Notify,
    next_id: AtomicU64,
    unavailable: AtomicBool,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a broker outage: every call fails with a queue error until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Queue("broker unavailable".into()));
        }
        Ok(())
    }

    /// Put every in-flight delivery of `queue` back at the head of the queue,
    /// as the broker does when a consumer dies without acknowledging.
    ///
    /// Returns the number of deliveries made available again.
    pub async fn redeliver_unacked(&self, queue: &str) -> usize {
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return 0;
        };

        let mut returned: Vec<Stored> = state.in_flight.drain().map(|(_, s)| s).collect();
        returned.sort_by(|a, b| b.id.cmp(&a.id));
        let count = returned.len();
        for stored in returned {
            state.ready.push_front(stored);
        }
        drop(queues);

        if count > 0 {
            self.notify.notify_waiters();
        }
        count
    }

    /// Messages waiting to be fetched.
    pub async fn ready_len(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .await
            .get(queue)
            .map_or(0, |state| state.ready.len())
    }

    /// Deliveries fetched but neither acked nor rejected.
    pub async fn in_flight_len(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .await
            .get(queue)
            .map_or(0, |state| state.in_flight.len())
    }

    /// Number of deliveries acked on `queue`.
    pub async fn acked_count(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .await
            .get(queue)
            .map_or(0, |state| state.acked)
    }

    /// Bodies rejected from `queue`, oldest first.
    pub async fn dead_letters(&self, queue: &str) -> Vec<Vec<u8>> {
        self.queues
            .lock()
            .await
            .get(&dead_letter_key(queue))
            .map(|state| state.ready.iter().map(|s| s.body.clone()).collect())
            .unwrap_or_default()
    }

    fn next_id(&self) -> String {
        // Zero-padded so lexical order is publish order.
        format!("{:020}-0", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn push(&self, queue: &str, body: Vec<u8>) {
        let stored = Stored {
            id: self.next_id(),
            body,
            delivery_count: 0,
        };
        self.queues
            .lock()
            .await
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(stored);
        self.notify.notify_waiters();
    }

    async fn take(&self, queue: &str, max: usize) -> Vec<Delivery> {
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Vec::new();
        };

        let mut deliveries = Vec::new();
        while deliveries.len() < max {
            let Some(mut stored) = state.ready.pop_front() else {
                break;
            };
            stored.delivery_count += 1;
            deliveries.push(Delivery {
                queue: queue.to_string(),
                id: stored.id.clone(),
                body: stored.body.clone(),
                delivery_count: stored.delivery_count,
            });
            state.in_flight.insert(stored.id.clone(), stored);
        }
        deliveries
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn connect(&self) -> Result<()> {
        self.check_available()
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<()> {
        self.check_available()?;
        self.push(queue, body.to_vec()).await;
        debug!(subsystem = "queue", component = "memory", op = "publish", queue, "Published message");
        Ok(())
    }

    async fn fetch(
        &self,
        queue: &str,
        _consumer: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>> {
        self.check_available()?;
        let max = max.max(1);
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deliveries = self.take(queue, max).await;
            if !deliveries.is_empty() {
                return Ok(deliveries);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            if timeout(deadline - now, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.check_available()?;
        let mut queues = self.queues.lock().await;
        if let Some(state) = queues.get_mut(&delivery.queue) {
            if state.in_flight.remove(&delivery.id).is_some() {
                state.acked += 1;
            }
        }
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery) -> Result<()> {
        self.check_available()?;
        let removed = {
            let mut queues = self.queues.lock().await;
            queues
                .get_mut(&delivery.queue)
                .and_then(|state| state.in_flight.remove(&delivery.id))
        };
        if let Some(stored) = removed {
            self.push(&dead_letter_key(&delivery.queue), stored.body).await;
        }
        Ok(())
    }
}
