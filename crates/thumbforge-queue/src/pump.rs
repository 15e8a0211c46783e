//! Message pump: fetch deliveries, hand each to a handler, apply its outcome.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use thumbforge_core::defaults;
use thumbforge_core::{Delivery, MessageQueue, Outcome};

/// Decides the fate of a single delivery.
///
/// Implementations must not fail: every error is turned into an [`Outcome`].
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: &Delivery) -> Outcome;
}

/// Tuning for [`consume_with_options`].
#[derive(Debug, Clone)]
pub struct PumpOptions {
    /// Deliveries fetched, and handled concurrently, per round.
    pub batch_size: usize,
    /// How long a fetch waits on an empty queue.
    pub fetch_wait: Duration,
    /// Pause after a broker error before fetching again.
    pub error_backoff: Duration,
}

impl Default for PumpOptions {
    fn default() -> Self {
        Self {
            batch_size: defaults::JOB_MAX_CONCURRENT,
            fetch_wait: Duration::from_millis(defaults::QUEUE_BLOCK_MS),
            error_backoff: Duration::from_millis(defaults::JOB_POLL_INTERVAL_MS),
        }
    }
}

/// Counters reported when a pump stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub acked: u64,
    pub rejected: u64,
    /// Deliveries the handler chose to leave pending.
    pub deferred: u64,
    /// Handler tasks that panicked; their deliveries stay pending for redelivery.
    pub abandoned: u64,
}

/// Run the pump with default options until `shutdown` fires.
pub async fn consume<H: DeliveryHandler>(
    queue: Arc<dyn MessageQueue>,
    queue_name: &str,
    consumer: &str,
    handler: Arc<H>,
    shutdown: &mut mpsc::Receiver<()>,
) -> PumpStats {
    consume_with_options(
        queue,
        queue_name,
        consumer,
        handler,
        PumpOptions::default(),
        shutdown,
    )
    .await
}

/// Run the pump until `shutdown` fires (or its sender is dropped).
///
/// Broker errors are logged and retried after `error_backoff`; they never end
/// the loop. A round in progress finishes before shutdown is honoured, so
/// every handled delivery is settled as its handler decided.
pub async fn consume_with_options<H: DeliveryHandler>(
    queue: Arc<dyn MessageQueue>,
    queue_name: &str,
    consumer: &str,
    handler: Arc<H>,
    options: PumpOptions,
    shutdown: &mut mpsc::Receiver<()>,
) -> PumpStats {
    let mut stats = PumpStats::default();
    let batch_size = options.batch_size.max(1);

    info!(
        subsystem = "queue",
        component = "pump",
        queue = queue_name,
        consumer,
        batch_size,
        "Message pump started"
    );

    loop {
        let fetched = tokio::select! {
            _ = shutdown.recv() => break,
            fetched = queue.fetch(queue_name, consumer, batch_size, options.fetch_wait) => fetched,
        };

        let deliveries = match fetched {
            Ok(deliveries) => deliveries,
            Err(e) => {
                error!(
                    subsystem = "queue",
                    component = "pump",
                    op = "fetch",
                    queue = queue_name,
                    error = %e,
                    "Fetch failed, backing off"
                );
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = sleep(options.error_backoff) => continue,
                }
            }
        };

        if deliveries.is_empty() {
            continue;
        }

        let start = Instant::now();
        let count = deliveries.len();
        let mut tasks = JoinSet::new();
        for delivery in deliveries {
            let handler = handler.clone();
            tasks.spawn(async move {
                let outcome = handler.handle(&delivery).await;
                (delivery, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((delivery, outcome)) => {
                    apply_outcome(queue.as_ref(), &delivery, outcome, &mut stats).await
                }
                Err(e) => {
                    stats.abandoned += 1;
                    error!(
                        subsystem = "queue",
                        component = "pump",
                        queue = queue_name,
                        error = ?e,
                        "Delivery handler panicked, leaving delivery pending"
                    );
                }
            }
        }

        debug!(
            subsystem = "queue",
            component = "pump",
            queue = queue_name,
            count,
            duration_ms = start.elapsed().as_millis() as u64,
            "Processed delivery batch"
        );
    }

    info!(
        subsystem = "queue",
        component = "pump",
        queue = queue_name,
        consumer,
        acked = stats.acked,
        rejected = stats.rejected,
        deferred = stats.deferred,
        "Message pump stopped"
    );
    stats
}

async fn apply_outcome(
    queue: &dyn MessageQueue,
    delivery: &Delivery,
    outcome: Outcome,
    stats: &mut PumpStats,
) {
    let result = match outcome {
        Outcome::Ack => queue.ack(delivery).await,
        Outcome::Reject => queue.reject(delivery).await,
        Outcome::Retry => {
            debug!(
                subsystem = "queue",
                component = "pump",
                queue = %delivery.queue,
                delivery_id = %delivery.id,
                "Leaving delivery pending"
            );
            stats.deferred += 1;
            return;
        }
    };

    match result {
        Ok(()) => match outcome {
            Outcome::Ack => stats.acked += 1,
            Outcome::Reject => stats.rejected += 1,
            Outcome::Retry => {}
        },
        // Left pending; the broker hands it out again after the pending timeout.
        Err(e) => warn!(
            subsystem = "queue",
            component = "pump",
            queue = %delivery.queue,
            delivery_id = %delivery.id,
            ?outcome,
            error = %e,
            "Failed to settle delivery"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const QUEUE: &str = "pump:jobs";

    /// Acks bodies equal to "ok", defers "later", panics on "boom", rejects
    /// anything else.
    struct ScriptedHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DeliveryHandler for ScriptedHandler {
        async fn handle(&self, delivery: &Delivery) -> Outcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match delivery.body.as_slice() {
                b"ok" => Outcome::Ack,
                b"later" => Outcome::Retry,
                b"boom" => panic!("handler exploded"),
                _ => Outcome::Reject,
            }
        }
    }

    fn fast_options() -> PumpOptions {
        PumpOptions {
            batch_size: 4,
            fetch_wait: Duration::from_millis(10),
            error_backoff: Duration::from_millis(10),
        }
    }

    async fn run_until_drained(queue: Arc<InMemoryQueue>, handler: Arc<ScriptedHandler>, expected_calls: usize) -> PumpStats {
        let (tx, mut rx) = mpsc::channel(1);
        let pump_queue: Arc<dyn MessageQueue> = queue.clone();
        let pump_handler = handler.clone();
        let pump = tokio::spawn(async move {
            consume_with_options(pump_queue, QUEUE, "test-consumer", pump_handler, fast_options(), &mut rx).await
        });

        for _ in 0..200 {
            if handler.calls.load(Ordering::SeqCst) >= expected_calls
                && queue.in_flight_len(QUEUE).await == 0
                && queue.ready_len(QUEUE).await == 0
            {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        tx.send(()).await.unwrap();
        pump.await.unwrap()
    }

    #[tokio::test]
    async fn test_pump_applies_outcomes() {
        let queue = Arc::new(InMemoryQueue::new());
        queue.publish(QUEUE, b"ok").await.unwrap();
        queue.publish(QUEUE, b"not json").await.unwrap();
        queue.publish(QUEUE, b"ok").await.unwrap();

        let handler = Arc::new(ScriptedHandler { calls: AtomicUsize::new(0) });
        let stats = run_until_drained(queue.clone(), handler, 3).await;

        assert_eq!(stats.acked, 2);
        assert_eq!(stats.rejected, 1);
        assert_eq!(queue.dead_letters(QUEUE).await, vec![b"not json".to_vec()]);
    }

    #[tokio::test]
    async fn test_pump_leaves_deferred_delivery_pending() {
        let queue = Arc::new(InMemoryQueue::new());
        queue.publish(QUEUE, b"later").await.unwrap();
        queue.publish(QUEUE, b"ok").await.unwrap();

        let handler = Arc::new(ScriptedHandler { calls: AtomicUsize::new(0) });
        let (tx, mut rx) = mpsc::channel(1);
        let pump_queue: Arc<dyn MessageQueue> = queue.clone();
        let pump_handler = handler.clone();
        let pump = tokio::spawn(async move {
            consume_with_options(pump_queue, QUEUE, "c", pump_handler, fast_options(), &mut rx).await
        });

        while handler.calls.load(Ordering::SeqCst) < 2 {
            sleep(Duration::from_millis(5)).await;
        }
        sleep(Duration::from_millis(20)).await;
        tx.send(()).await.unwrap();
        let stats = pump.await.unwrap();

        assert_eq!(stats.deferred, 1);
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.rejected, 0);
        assert!(queue.dead_letters(QUEUE).await.is_empty());
        assert_eq!(queue.in_flight_len(QUEUE).await, 1);
        assert_eq!(queue.redeliver_unacked(QUEUE).await, 1);
    }

    #[tokio::test]
    async fn test_pump_survives_handler_panic() {
        let queue = Arc::new(InMemoryQueue::new());
        queue.publish(QUEUE, b"boom").await.unwrap();

        let handler = Arc::new(ScriptedHandler { calls: AtomicUsize::new(0) });
        let (tx, mut rx) = mpsc::channel(1);
        let pump_queue: Arc<dyn MessageQueue> = queue.clone();
        let pump_handler = handler.clone();
        let pump = tokio::spawn(async move {
            consume_with_options(pump_queue, QUEUE, "c", pump_handler, fast_options(), &mut rx).await
        });

        while handler.calls.load(Ordering::SeqCst) == 0 {
            sleep(Duration::from_millis(5)).await;
        }
        // The pump is still alive and handles later messages.
        queue.publish(QUEUE, b"ok").await.unwrap();
        while handler.calls.load(Ordering::SeqCst) < 2 {
            sleep(Duration::from_millis(5)).await;
        }
        sleep(Duration::from_millis(20)).await;
        tx.send(()).await.unwrap();
        let stats = pump.await.unwrap();

        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.acked, 1);
        // The panicked delivery was never settled.
        assert_eq!(queue.in_flight_len(QUEUE).await, 1);
    }

    #[tokio::test]
    async fn test_pump_backs_off_on_broker_error() {
        let queue = Arc::new(InMemoryQueue::new());
        queue.set_unavailable(true);
        let handler = Arc::new(ScriptedHandler { calls: AtomicUsize::new(0) });

        let (tx, mut rx) = mpsc::channel(1);
        let pump_queue: Arc<dyn MessageQueue> = queue.clone();
        let pump_handler = handler.clone();
        let pump = tokio::spawn(async move {
            consume_with_options(pump_queue, QUEUE, "c", pump_handler, fast_options(), &mut rx).await
        });

        sleep(Duration::from_millis(30)).await;
        queue.set_unavailable(false);
        queue.publish(QUEUE, b"ok").await.unwrap();
        while handler.calls.load(Ordering::SeqCst) < 1 {
            sleep(Duration::from_millis(5)).await;
        }
        sleep(Duration::from_millis(20)).await;
        tx.send(()).await.unwrap();

        assert_eq!(pump.await.unwrap().acked, 1);
    }

    #[tokio::test]
    async fn test_pump_stops_on_shutdown() {
        let queue: Arc<dyn MessageQueue> = Arc::new(InMemoryQueue::new());
        let handler = Arc::new(ScriptedHandler { calls: AtomicUsize::new(0) });
        let (tx, mut rx) = mpsc::channel(1);
        tx.send(()).await.unwrap();

        let stats = consume(queue, QUEUE, "c", handler, &mut rx).await;
        assert_eq!(stats, PumpStats::default());
    }
}
