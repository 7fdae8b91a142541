//! Task lifecycle tracking.
//!
//! The worker loop reports every transition of a message to a
//! [`LifecycleObserver`]. [`TaskLifecycleTracker`] is the production observer:
//! it updates metrics, records rate-limit hits and moves terminally failed
//! tasks to their dead-letter queue.

use crate::metrics::WorkerMetrics;
use crate::queue::identity::to_dead_letter_name;
use crate::queue::producer::TaskProducer;
use crate::queue::registry::RoutingTable;
use crate::ratelimit::RateLimiter;
use crate::task::{TaskId, TaskMessage, TaskState};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

/// What is known about one in-flight message.
///
/// Every field is optional: a message that cannot be decoded still gets a
/// record, just a sparse one.
#[derive(Debug, Clone, Default)]
pub struct TaskExecutionRecord {
    /// Task id from the message
    pub task_id: Option<TaskId>,
    /// Task name from the message, or from the queue binding before decoding
    pub task_name: Option<String>,
    /// Queue the message was fetched from
    pub physical_queue: Option<String>,
    /// When the current attempt was received
    pub received_at: Option<Instant>,
    /// When the current attempt started running
    pub started_at: Option<Instant>,
    /// Decoded message, kept for dead-letter resubmission
    pub message: Option<TaskMessage>,
}

impl TaskExecutionRecord {
    /// Record for a message fetched from `queue`.
    pub fn for_queue(queue: impl Into<String>, task_name: Option<String>) -> Self {
        Self {
            physical_queue: Some(queue.into()),
            task_name,
            ..Default::default()
        }
    }

    /// Fill in what the decoded message tells us.
    pub fn attach(&mut self, message: TaskMessage) {
        self.task_id = Some(message.id.clone());
        self.task_name = Some(message.task.clone());
        self.message = Some(message);
    }

    fn labels(&self) -> (Option<&str>, Option<&str>) {
        (self.task_name.as_deref(), self.physical_queue.as_deref())
    }
}

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalEvent {
    /// Task returned successfully
    Success,
    /// Task failed for good
    Failure {
        /// Error description
        error: String,
    },
    /// Task failed and another attempt is scheduled
    Retry {
        /// Error description
        error: String,
    },
    /// Message could not be decoded
    Rejected {
        /// Decode error
        reason: String,
    },
    /// Task was revoked before finishing
    Revoked {
        /// Revoked by shutdown or explicit request
        terminated: bool,
        /// Revoked because it ran past its time limit
        expired: bool,
    },
    /// No task is registered under the message's name
    Unknown,
    /// Task body panicked. Handled as a failure after being counted.
    InternalError {
        /// Panic message
        panic: String,
    },
}

impl TerminalEvent {
    /// Counter state for this event.
    pub fn state(&self) -> TaskState {
        match self {
            TerminalEvent::Success => TaskState::Success,
            TerminalEvent::Failure { .. } => TaskState::Failed,
            TerminalEvent::Retry { .. } => TaskState::Retry,
            TerminalEvent::Rejected { .. } => TaskState::Rejected,
            TerminalEvent::Revoked { .. } => TaskState::Revoked,
            TerminalEvent::Unknown => TaskState::Unknown,
            TerminalEvent::InternalError { .. } => TaskState::InternalError,
        }
    }
}

/// Receives lifecycle transitions from the consumer and the worker pool.
#[async_trait]
pub trait LifecycleObserver: Send + Sync {
    /// A message was fetched.
    fn on_received(&self, record: &mut TaskExecutionRecord);

    /// The task body is about to run.
    fn on_pre_run(&self, record: &mut TaskExecutionRecord);

    /// The task body returned.
    fn on_post_run(&self, record: &mut TaskExecutionRecord);

    /// The attempt ended.
    async fn on_terminal(&self, record: &TaskExecutionRecord, event: &TerminalEvent);
}

/// Metrics, rate-limit accounting and dead-letter rerouting.
pub struct TaskLifecycleTracker {
    metrics: Arc<WorkerMetrics>,
    rate_limiter: Arc<dyn RateLimiter>,
    routing: Arc<RoutingTable>,
    producer: Arc<TaskProducer>,
}

impl TaskLifecycleTracker {
    /// Create a tracker.
    pub fn new(
        metrics: Arc<WorkerMetrics>,
        rate_limiter: Arc<dyn RateLimiter>,
        routing: Arc<RoutingTable>,
        producer: Arc<TaskProducer>,
    ) -> Self {
        Self {
            metrics,
            rate_limiter,
            routing,
            producer,
        }
    }

    async fn dead_letter(&self, record: &TaskExecutionRecord, error: &str) {
        let (Some(queue), Some(message)) = (&record.physical_queue, &record.message) else {
            tracing::error!(
                task_id = ?record.task_id,
                error,
                "Task failed without enough context to dead-letter it"
            );
            return;
        };

        let destination = to_dead_letter_name(queue);
        match self.producer.send_to(&destination, message).await {
            Ok(_) => tracing::warn!(
                task_id = %message.id,
                task = %message.task,
                queue = %destination,
                error,
                "Task moved to dead-letter queue"
            ),
            Err(e) => tracing::error!(
                task_id = %message.id,
                task = %message.task,
                queue = %destination,
                error = %e,
                "Failed to move task to dead-letter queue"
            ),
        }
    }
}

#[async_trait]
impl LifecycleObserver for TaskLifecycleTracker {
    fn on_received(&self, record: &mut TaskExecutionRecord) {
        let (name, queue) = record.labels();
        self.metrics.inc_consumer(TaskState::Received, name, queue);
        record.received_at = Some(Instant::now());
    }

    fn on_pre_run(&self, record: &mut TaskExecutionRecord) {
        let now = Instant::now();
        record.started_at = Some(now);

        let (name, queue) = record.labels();
        self.metrics.inc_worker(TaskState::PreRun, name, queue);

        if let Some(received_at) = record.received_at {
            let latency = now.saturating_duration_since(received_at);
            self.metrics.observe_latency(name, queue, latency.as_secs_f64());
        }

        let key = queue.and_then(|q| self.routing.rate_limit_key_for(q));
        if let Some(key) = key {
            let limiter = Arc::clone(&self.rate_limiter);
            let key = key.to_string();
            tokio::spawn(async move {
                limiter.record_hit(&key).await;
            });
        }
    }

    fn on_post_run(&self, record: &mut TaskExecutionRecord) {
        let (name, queue) = record.labels();
        self.metrics.inc_worker(TaskState::PostRun, name, queue);

        if let Some(started_at) = record.started_at {
            self.metrics
                .observe_runtime(name, queue, started_at.elapsed().as_secs_f64());
        }
    }

    async fn on_terminal(&self, record: &TaskExecutionRecord, event: &TerminalEvent) {
        let (name, queue) = record.labels();
        self.metrics.inc_worker(event.state(), name, queue);

        match event {
            TerminalEvent::Failure { error } => {
                self.dead_letter(record, error).await;
            }
            TerminalEvent::InternalError { panic } => {
                self.metrics.inc_worker(TaskState::Failed, name, queue);
                self.dead_letter(record, panic).await;
            }
            TerminalEvent::Retry { error } => {
                tracing::info!(task_id = ?record.task_id, task = ?name, error = %error, "Task will be retried");
            }
            TerminalEvent::Rejected { reason } => {
                tracing::warn!(queue = ?queue, reason = %reason, "Message rejected");
            }
            TerminalEvent::Revoked { terminated, expired } => {
                tracing::warn!(task_id = ?record.task_id, task = ?name, terminated, expired, "Task revoked");
            }
            TerminalEvent::Unknown => {
                tracing::warn!(task_id = ?record.task_id, task = ?name, "No task registered under this name");
            }
            TerminalEvent::Success => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricsConfig;
    use crate::queue::codec;
    use crate::queue::registry::{QueueBinding, QueueRegistry, StaticCallerIdentity};
    use crate::queue::{InMemoryTransport, SharedTransport};
    use crate::ratelimit::NoopRateLimiter;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingLimiter {
        hits: AtomicUsize,
    }

    #[async_trait]
    impl RateLimiter for CountingLimiter {
        async fn is_throttled(&self, _key: &str) -> bool {
            false
        }

        async fn record_hit(&self, _key: &str) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        transport: Arc<InMemoryTransport>,
        metrics: Arc<WorkerMetrics>,
        tracker: TaskLifecycleTracker,
    }

    fn fixture(limiter: Arc<dyn RateLimiter>) -> Fixture {
        let transport = Arc::new(InMemoryTransport::new());
        let shared: SharedTransport = transport.clone();
        let mut registry = QueueRegistry::new(vec![
            QueueBinding::new("add", "add").with_rate_limit_key("add-key"),
        ]);
        let routing = registry
            .build("stage", &StaticCallerIdentity("alice".into()))
            .unwrap();
        let metrics = Arc::new(WorkerMetrics::new("test", &MetricsConfig::default()).unwrap());
        let producer = Arc::new(TaskProducer::new(shared, Arc::clone(&routing)));
        let tracker = TaskLifecycleTracker::new(Arc::clone(&metrics), limiter, routing, producer);
        Fixture {
            transport,
            metrics,
            tracker,
        }
    }

    fn record() -> TaskExecutionRecord {
        let mut record = TaskExecutionRecord::for_queue("stage-add", Some("add".into()));
        record.attach(TaskMessage::with_id("task-1", "add", json!([1, 0])));
        record
    }

    #[tokio::test]
    async fn test_success_counts_once_without_rerouting() {
        let f = fixture(Arc::new(NoopRateLimiter));
        let mut record = record();

        f.tracker.on_received(&mut record);
        f.tracker.on_pre_run(&mut record);
        f.tracker.on_post_run(&mut record);
        f.tracker.on_terminal(&record, &TerminalEvent::Success).await;

        assert_eq!(f.metrics.consumer_count(TaskState::Received, "add", "stage-add"), 1.0);
        assert_eq!(f.metrics.worker_count(TaskState::PreRun, "add", "stage-add"), 1.0);
        assert_eq!(f.metrics.worker_count(TaskState::PostRun, "add", "stage-add"), 1.0);
        assert_eq!(f.metrics.worker_count(TaskState::Success, "add", "stage-add"), 1.0);
        assert_eq!(f.transport.pending_len("err-stage-add").await, 0);

        let text = f.metrics.exposition().unwrap();
        assert!(text.contains("test_tasks_latency_seconds_count{name=\"add\",queue=\"stage-add\"} 1"));
        assert!(text.contains("test_tasks_runtime_seconds_count{name=\"add\",queue=\"stage-add\"} 1"));
    }

    #[tokio::test]
    async fn test_failure_reroutes_to_dead_letter_queue() {
        let f = fixture(Arc::new(NoopRateLimiter));
        let record = record();

        f.tracker
            .on_terminal(&record, &TerminalEvent::Failure { error: "boom".into() })
            .await;

        assert_eq!(f.metrics.worker_count(TaskState::Failed, "add", "stage-add"), 1.0);
        let stored = f.transport.peek("err-stage-add").await;
        assert_eq!(stored.len(), 1);
        let message: TaskMessage = codec::decode(&stored[0].body, &stored[0].attributes).unwrap();
        assert_eq!(message.id, "task-1");
        assert_eq!(message.args, json!([1, 0]));
    }

    #[tokio::test]
    async fn test_internal_error_counts_and_fails() {
        let f = fixture(Arc::new(NoopRateLimiter));
        f.tracker
            .on_terminal(&record(), &TerminalEvent::InternalError { panic: "oops".into() })
            .await;

        assert_eq!(f.metrics.worker_count(TaskState::InternalError, "add", "stage-add"), 1.0);
        assert_eq!(f.metrics.worker_count(TaskState::Failed, "add", "stage-add"), 1.0);
        assert_eq!(f.transport.pending_len("err-stage-add").await, 1);
    }

    #[tokio::test]
    async fn test_non_failure_events_never_reroute() {
        let f = fixture(Arc::new(NoopRateLimiter));
        let record = record();
        for event in [
            TerminalEvent::Retry { error: "again".into() },
            TerminalEvent::Rejected { reason: "bad".into() },
            TerminalEvent::Revoked { terminated: false, expired: true },
            TerminalEvent::Unknown,
        ] {
            f.tracker.on_terminal(&record, &event).await;
        }

        assert_eq!(f.metrics.worker_count(TaskState::Retry, "add", "stage-add"), 1.0);
        assert_eq!(f.metrics.worker_count(TaskState::Rejected, "add", "stage-add"), 1.0);
        assert_eq!(f.metrics.worker_count(TaskState::Revoked, "add", "stage-add"), 1.0);
        assert_eq!(f.metrics.worker_count(TaskState::Unknown, "add", "stage-add"), 1.0);
        assert_eq!(f.transport.pending_len("err-stage-add").await, 0);
    }

    #[tokio::test]
    async fn test_partial_record_is_tolerated() {
        let f = fixture(Arc::new(NoopRateLimiter));
        let mut record = TaskExecutionRecord::default();

        f.tracker.on_pre_run(&mut record);
        f.tracker.on_post_run(&mut record);
        f.tracker
            .on_terminal(&record, &TerminalEvent::Failure { error: "x".into() })
            .await;

        assert_eq!(f.metrics.worker_count(TaskState::Failed, "none", "none"), 1.0);
        let text = f.metrics.exposition().unwrap();
        assert!(!text.contains("test_tasks_latency_seconds_count"));
    }

    #[tokio::test]
    async fn test_pre_run_records_hit_for_keyed_queue() {
        let limiter = Arc::new(CountingLimiter::default());
        let f = fixture(limiter.clone());

        let mut record = record();
        f.tracker.on_pre_run(&mut record);

        let mut unkeyed = TaskExecutionRecord::for_queue("stage-other", None);
        f.tracker.on_pre_run(&mut unkeyed);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(limiter.hits.load(Ordering::SeqCst), 1);
    }
}
