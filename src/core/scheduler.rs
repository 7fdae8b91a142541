//! Rate-limited polling.
//!
//! One loop runs per active queue. On every tick a loop checks that the
//! worker has prefetch credits left and that the queue's rate-limit key is
//! not throttled, then fetches a batch and hands each message to the worker
//! pool. Credits are taken per fetched message and given back when the
//! message's task finishes.
//!
//! Room in the pool channel is reserved before fetching, so a tick cancelled
//! by shutdown never holds fetched messages or credits it could not hand over.

use crate::core::lifecycle::{LifecycleObserver, TaskExecutionRecord};
use crate::queue::registry::RoutingTable;
use crate::queue::{QueueMessage, SharedTransport};
use crate::ratelimit::RateLimiter;
use crate::utils::calculate_backoff;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;

/// Prefetch credits: how many more unacknowledged messages the worker may hold.
#[derive(Debug)]
pub struct QosCredits {
    available: AtomicUsize,
    capacity: usize,
    released: Notify,
}

impl QosCredits {
    /// Start with `capacity` credits.
    pub fn new(capacity: usize) -> Self {
        Self {
            available: AtomicUsize::new(capacity),
            capacity,
            released: Notify::new(),
        }
    }

    /// Whether at least one credit is left.
    pub fn can_consume(&self) -> bool {
        self.available() > 0
    }

    /// Credits left.
    pub fn available(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }

    /// Total credits.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take `n` credits. Saturates at zero: a fetch racing a release may
    /// overshoot slightly.
    pub fn acquire(&self, n: usize) {
        let _ = self
            .available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(n)));
    }

    /// Give back `n` credits, never exceeding capacity.
    pub fn release(&self, n: usize) {
        let capacity = self.capacity;
        let _ = self
            .available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some((v + n).min(capacity))
            });
        self.released.notify_waiters();
    }

    /// Resolves on the next release.
    pub async fn wait_released(&self) {
        self.released.notified().await;
    }
}

/// What a polling loop is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PollState {
    /// Waiting between ticks
    Idle,
    /// Fetching or dispatching
    Polling,
    /// Loop exited
    Stopped,
}

impl PollState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => PollState::Polling,
            2 => PollState::Stopped,
            _ => PollState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            PollState::Idle => 0,
            PollState::Polling => 1,
            PollState::Stopped => 2,
        }
    }
}

/// A fetched message on its way to the worker pool.
#[derive(Debug)]
pub struct Dispatch {
    /// Queue the message came from
    pub queue: String,
    /// The raw message
    pub message: QueueMessage,
    /// Lifecycle record, already stamped as received
    pub record: TaskExecutionRecord,
}

/// Result of one polling tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No prefetch credits left
    NoCredits,
    /// The queue's rate-limit key is throttled
    Throttled,
    /// Fetch returned nothing or failed
    Empty,
    /// Messages were handed to the pool
    Dispatched(usize),
    /// The pool is gone
    Closed,
}

/// Polling parameters.
#[derive(Debug, Clone)]
pub struct PollSettings {
    /// Messages per fetch before credits and transport cap apply
    pub prefetch_count: usize,
    /// Transport cap per fetch
    pub max_batch_size: usize,
    /// Sleep after an idle tick
    pub polling_interval: Duration,
    /// Long-poll wait passed to the transport
    pub wait_time: Duration,
}

impl PollSettings {
    /// `min(credits, prefetch_count, max_batch_size)`
    pub fn batch_size(&self, credits: usize) -> usize {
        credits.min(self.prefetch_count).min(self.max_batch_size)
    }
}

/// One polling loop per active queue.
pub struct PollScheduler {
    routing: Arc<RoutingTable>,
    transport: SharedTransport,
    rate_limiter: Arc<dyn RateLimiter>,
    observer: Arc<dyn LifecycleObserver>,
    credits: Arc<QosCredits>,
    settings: PollSettings,
    states: HashMap<String, Arc<AtomicU8>>,
}

impl PollScheduler {
    /// Create a scheduler over every queue in `routing`.
    pub fn new(
        routing: Arc<RoutingTable>,
        transport: SharedTransport,
        rate_limiter: Arc<dyn RateLimiter>,
        observer: Arc<dyn LifecycleObserver>,
        credits: Arc<QosCredits>,
        settings: PollSettings,
    ) -> Self {
        let states = routing
            .active_queues()
            .map(|q| (q.to_string(), Arc::new(AtomicU8::new(PollState::Idle.as_u8()))))
            .collect();

        Self {
            routing,
            transport,
            rate_limiter,
            observer,
            credits,
            settings,
            states,
        }
    }

    /// Current state of every loop.
    pub fn states(&self) -> HashMap<String, PollState> {
        self.states
            .iter()
            .map(|(q, s)| (q.clone(), PollState::from_u8(s.load(Ordering::Relaxed))))
            .collect()
    }

    fn set_state(&self, queue: &str, state: PollState) {
        if let Some(s) = self.states.get(queue) {
            s.store(state.as_u8(), Ordering::Relaxed);
        }
    }

    /// Spawn one loop per active queue. Loops exit when `shutdown` flips to
    /// `true` or the pool side of `dispatch_tx` is dropped.
    pub fn spawn(
        self: &Arc<Self>,
        dispatch_tx: mpsc::Sender<Dispatch>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        self.routing
            .active_queues()
            .enumerate()
            .map(|(i, queue)| {
                let scheduler = Arc::clone(self);
                let queue = queue.to_string();
                let tx = dispatch_tx.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { scheduler.poll_loop(queue, i as u64, tx, shutdown).await })
            })
            .collect()
    }

    async fn poll_loop(
        &self,
        queue: String,
        seed: u64,
        tx: mpsc::Sender<Dispatch>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!(queue = %queue, "Polling loop started");
        let mut consecutive_empty = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let outcome = tokio::select! {
                outcome = self.tick(&queue, &tx) => outcome,
                _ = shutdown.changed() => break,
            };

            let pause = match outcome {
                TickOutcome::Dispatched(_) => {
                    consecutive_empty = 0;
                    continue;
                }
                TickOutcome::Closed => break,
                TickOutcome::NoCredits => {
                    self.set_state(&queue, PollState::Idle);
                    tokio::select! {
                        _ = self.credits.wait_released() => {}
                        _ = tokio::time::sleep(self.settings.polling_interval) => {}
                        _ = shutdown.changed() => break,
                    }
                    continue;
                }
                TickOutcome::Throttled => self.settings.polling_interval,
                TickOutcome::Empty => {
                    consecutive_empty = consecutive_empty.saturating_add(1);
                    self.settings.polling_interval
                        + Duration::from_millis(calculate_backoff(consecutive_empty, seed))
                }
            };

            self.set_state(&queue, PollState::Idle);
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.set_state(&queue, PollState::Stopped);
        tracing::info!(queue = %queue, "Polling loop stopped");
    }

    /// Run one tick against `queue`.
    pub async fn tick(&self, queue: &str, tx: &mpsc::Sender<Dispatch>) -> TickOutcome {
        if !self.credits.can_consume() {
            tracing::trace!(queue, "No prefetch credits left");
            return TickOutcome::NoCredits;
        }

        if let Some(key) = self.routing.rate_limit_key_for(queue) {
            if self.rate_limiter.is_throttled(key).await {
                tracing::debug!(queue, key, "Queue throttled, skipping poll");
                return TickOutcome::Throttled;
            }
        }

        let max = self
            .settings
            .batch_size(self.credits.available())
            .min(tx.max_capacity());
        if max == 0 {
            return TickOutcome::NoCredits;
        }

        let Ok(permits) = tx.reserve_many(max).await else {
            return TickOutcome::Closed;
        };

        self.set_state(queue, PollState::Polling);
        let batch = match self
            .transport
            .fetch_batch(queue, max, self.settings.wait_time)
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!(queue, error = %e, "Fetch failed, skipping tick");
                return TickOutcome::Empty;
            }
        };

        if batch.is_empty() {
            return TickOutcome::Empty;
        }

        let count = batch.len();
        let task_name = self.routing.task_for(queue).map(str::to_string);
        tracing::debug!(queue, count, "Dispatching fetched messages");

        // No await from here on: the whole batch is handed over or none of it.
        for (message, permit) in batch.into_iter().zip(permits) {
            self.credits.acquire(1);
            let mut record = TaskExecutionRecord::for_queue(queue, task_name.clone());
            self.observer.on_received(&mut record);

            permit.send(Dispatch {
                queue: queue.to_string(),
                message,
                record,
            });
        }

        TickOutcome::Dispatched(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MetricsConfig, WorkerConfig};
    use crate::core::lifecycle::TaskLifecycleTracker;
    use crate::metrics::WorkerMetrics;
    use crate::queue::producer::TaskProducer;
    use crate::queue::registry::{QueueBinding, QueueRegistry, StaticCallerIdentity};
    use crate::queue::{InMemoryTransport, Transport};
    use crate::ratelimit::NoopRateLimiter;
    use crate::task::TaskState;
    use async_trait::async_trait;
    use std::collections::HashMap as Map;

    struct AlwaysThrottled;

    #[async_trait]
    impl RateLimiter for AlwaysThrottled {
        async fn is_throttled(&self, _key: &str) -> bool {
            true
        }

        async fn record_hit(&self, _key: &str) {}
    }

    struct Fixture {
        transport: Arc<InMemoryTransport>,
        metrics: Arc<WorkerMetrics>,
        credits: Arc<QosCredits>,
        scheduler: Arc<PollScheduler>,
    }

    fn settings(worker: &WorkerConfig, max_batch_size: usize) -> PollSettings {
        PollSettings {
            prefetch_count: worker.prefetch_count(),
            max_batch_size,
            polling_interval: Duration::from_millis(10),
            wait_time: Duration::ZERO,
        }
    }

    fn fixture(limiter: Arc<dyn RateLimiter>, settings: PollSettings, keyed: bool) -> Fixture {
        let transport = Arc::new(InMemoryTransport::new());
        let shared: SharedTransport = transport.clone();
        let mut binding = QueueBinding::new("add", "add");
        if keyed {
            binding = binding.with_rate_limit_key("add-key");
        }
        let routing = QueueRegistry::new(vec![binding])
            .build("stage", &StaticCallerIdentity("alice".into()))
            .unwrap();
        let metrics = Arc::new(WorkerMetrics::new("test", &MetricsConfig::default()).unwrap());
        let producer = Arc::new(TaskProducer::new(Arc::clone(&shared), Arc::clone(&routing)));
        let observer = Arc::new(TaskLifecycleTracker::new(
            Arc::clone(&metrics),
            Arc::clone(&limiter),
            Arc::clone(&routing),
            producer,
        ));
        let credits = Arc::new(QosCredits::new(settings.prefetch_count));
        let scheduler = Arc::new(PollScheduler::new(
            routing,
            shared,
            limiter,
            observer,
            Arc::clone(&credits),
            settings,
        ));
        Fixture {
            transport,
            metrics,
            credits,
            scheduler,
        }
    }

    async fn fill(transport: &InMemoryTransport, n: usize) {
        for i in 0..n {
            transport
                .send_message("stage-add", i.to_string(), Map::new())
                .await
                .unwrap();
        }
    }

    #[test]
    fn test_batch_size() {
        let four_by_two = settings(&WorkerConfig::with_concurrency(4).with_prefetch_multiplier(2), 10);
        assert_eq!(four_by_two.batch_size(8), 8);
        assert_eq!(four_by_two.batch_size(3), 3);

        let eight_by_two = settings(&WorkerConfig::with_concurrency(8).with_prefetch_multiplier(2), 10);
        assert_eq!(eight_by_two.batch_size(16), 10);
    }

    #[test]
    fn test_credits_saturate() {
        let credits = QosCredits::new(2);
        credits.acquire(3);
        assert_eq!(credits.available(), 0);
        assert!(!credits.can_consume());
        credits.release(5);
        assert_eq!(credits.available(), 2);
    }

    #[tokio::test]
    async fn test_tick_fetches_at_most_prefetch() {
        let worker = WorkerConfig::with_concurrency(4).with_prefetch_multiplier(2);
        let f = fixture(Arc::new(NoopRateLimiter), settings(&worker, 10), false);
        fill(&f.transport, 20).await;

        let (tx, mut rx) = mpsc::channel(100);
        let outcome = f.scheduler.tick("stage-add", &tx).await;
        assert_eq!(outcome, TickOutcome::Dispatched(8));
        assert_eq!(f.credits.available(), 0);
        assert_eq!(f.transport.pending_len("stage-add").await, 12);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.queue, "stage-add");
        assert!(first.record.received_at.is_some());
        assert_eq!(first.record.task_name.as_deref(), Some("add"));
        assert_eq!(f.metrics.consumer_count(TaskState::Received, "add", "stage-add"), 8.0);

        assert_eq!(f.scheduler.tick("stage-add", &tx).await, TickOutcome::NoCredits);
    }

    #[tokio::test]
    async fn test_tick_capped_by_transport() {
        let worker = WorkerConfig::with_concurrency(8).with_prefetch_multiplier(2);
        let f = fixture(Arc::new(NoopRateLimiter), settings(&worker, 10), false);
        fill(&f.transport, 20).await;

        let (tx, _rx) = mpsc::channel(100);
        assert_eq!(f.scheduler.tick("stage-add", &tx).await, TickOutcome::Dispatched(10));
    }

    #[tokio::test]
    async fn test_throttled_queue_is_not_fetched() {
        let worker = WorkerConfig::with_concurrency(1);
        let f = fixture(Arc::new(AlwaysThrottled), settings(&worker, 10), true);
        fill(&f.transport, 1).await;

        let (tx, _rx) = mpsc::channel(10);
        assert_eq!(f.scheduler.tick("stage-add", &tx).await, TickOutcome::Throttled);
        assert_eq!(f.transport.pending_len("stage-add").await, 1);
    }

    #[tokio::test]
    async fn test_unkeyed_queue_ignores_limiter() {
        let worker = WorkerConfig::with_concurrency(1);
        let f = fixture(Arc::new(AlwaysThrottled), settings(&worker, 10), false);
        fill(&f.transport, 1).await;

        let (tx, _rx) = mpsc::channel(10);
        assert_eq!(f.scheduler.tick("stage-add", &tx).await, TickOutcome::Dispatched(1));
    }

    #[tokio::test]
    async fn test_closed_pool_returns_credit() {
        let worker = WorkerConfig::with_concurrency(2).with_prefetch_multiplier(1);
        let f = fixture(Arc::new(NoopRateLimiter), settings(&worker, 10), false);
        fill(&f.transport, 1).await;

        let (tx, rx) = mpsc::channel(10);
        drop(rx);
        assert_eq!(f.scheduler.tick("stage-add", &tx).await, TickOutcome::Closed);
        assert_eq!(f.credits.available(), 2);
        assert_eq!(f.transport.pending_len("stage-add").await, 1);
    }

    #[tokio::test]
    async fn test_cancelled_tick_keeps_credits_and_messages() {
        let worker = WorkerConfig::with_concurrency(4).with_prefetch_multiplier(1);
        let f = fixture(Arc::new(NoopRateLimiter), settings(&worker, 10), false);
        fill(&f.transport, 5).await;

        let (tx, mut rx) = mpsc::channel(2);
        assert_eq!(f.scheduler.tick("stage-add", &tx).await, TickOutcome::Dispatched(2));
        assert_eq!(f.credits.available(), 2);

        // The pool channel is full, shutdown cancels the tick while it waits
        let tick = f.scheduler.tick("stage-add", &tx);
        assert!(tokio::time::timeout(Duration::from_millis(50), tick).await.is_err());
        assert_eq!(f.credits.available(), 2);
        assert_eq!(f.transport.pending_len("stage-add").await, 3);
        assert_eq!(f.transport.in_flight_len().await, 2);

        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        assert_eq!(f.scheduler.tick("stage-add", &tx).await, TickOutcome::Dispatched(2));
        assert_eq!(f.credits.available(), 0);
        assert_eq!(f.transport.pending_len("stage-add").await, 1);
    }

    #[tokio::test]
    async fn test_loops_stop_on_shutdown() {
        let worker = WorkerConfig::with_concurrency(1);
        let f = fixture(Arc::new(NoopRateLimiter), settings(&worker, 10), false);

        let (tx, _rx) = mpsc::channel(10);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = f.scheduler.spawn(tx, shutdown_rx);
        assert_eq!(handles.len(), 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown_tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .unwrap()
                .unwrap();
        }
        assert_eq!(f.scheduler.states()["stage-add"], PollState::Stopped);
    }
}
