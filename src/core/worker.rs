//! Worker pool for Dockhand.
//!
//! Workers are the individual hands that run tasks. They share one dispatch
//! channel fed by the polling loops, report every lifecycle transition to the
//! observer, ack finished messages and give their prefetch credit back.

use crate::core::WorkerContext;
use crate::core::lifecycle::{TaskExecutionRecord, TerminalEvent};
use crate::core::registry::TaskExecutor;
use crate::core::scheduler::{Dispatch, QosCredits};
use crate::queue::codec;
use crate::queue::QueueMessage;
use crate::task::{TaskContext, TaskId, TaskMessage, TaskResult};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tokio::time::{sleep, timeout};

/// How long workers get to settle revoked work once the grace period is over.
const TERMINATION_WINDOW: Duration = Duration::from_secs(5);

/// Why a task was revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeCause {
    /// `revoke(task_id)` was called
    Requested,
    /// Shutdown grace period ran out
    Shutdown,
}

/// How long a revocation waits for its task to show up before it is dropped.
pub const REVOCATION_TTL: Duration = Duration::from_secs(3600);

/// Revocation requests shared by all workers.
#[derive(Debug)]
pub struct Revocations {
    /// Revoked ids with the time of the request
    requested: Mutex<HashMap<TaskId, Instant>>,
    ttl: Duration,
    terminating: AtomicBool,
    changed: Notify,
}

impl Default for Revocations {
    fn default() -> Self {
        Self::with_ttl(REVOCATION_TTL)
    }
}

impl Revocations {
    /// Revocations that forget ids not seen within `ttl`.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            requested: Mutex::new(HashMap::new()),
            ttl,
            terminating: AtomicBool::new(false),
            changed: Notify::new(),
        }
    }

    /// Revoke `task_id`. Takes effect before its next attempt starts or,
    /// if it is running, immediately.
    pub async fn revoke(&self, task_id: impl Into<TaskId>) {
        let now = Instant::now();
        {
            let mut requested = self.requested.lock().await;
            requested.retain(|_, at| now.duration_since(*at) < self.ttl);
            requested.insert(task_id.into(), now);
        }
        self.changed.notify_waiters();
    }

    /// Number of revocations still waiting for their task.
    pub async fn pending(&self) -> usize {
        let mut requested = self.requested.lock().await;
        requested.retain(|_, at| at.elapsed() < self.ttl);
        requested.len()
    }

    /// Revoke everything still running or waiting.
    pub fn terminate_all(&self) {
        self.terminating.store(true, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    /// Whether [`terminate_all`](Self::terminate_all) was called.
    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    /// Consume a pending revocation of `task_id`, if any.
    pub async fn check(&self, task_id: &str) -> Option<RevokeCause> {
        if self.is_terminating() {
            return Some(RevokeCause::Shutdown);
        }
        match self.requested.lock().await.remove(task_id) {
            Some(at) if at.elapsed() < self.ttl => Some(RevokeCause::Requested),
            _ => None,
        }
    }

    /// Resolves once `task_id` is revoked.
    pub async fn wait(&self, task_id: &str) -> RevokeCause {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(cause) = self.check(task_id).await {
                return cause;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Default)]
struct StatsCounters {
    active_tasks: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    revoked: AtomicU64,
    rejected: AtomicU64,
    unknown: AtomicU64,
}

impl StatsCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Statistics about worker performance
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerStats {
    /// Configured pool size
    pub concurrency: usize,
    /// Workers currently alive
    pub active_workers: usize,
    /// Messages being handled right now
    pub active_tasks: u64,
    /// Tasks that succeeded
    pub completed: u64,
    /// Tasks that failed for good
    pub failed: u64,
    /// Retries scheduled
    pub retried: u64,
    /// Tasks revoked
    pub revoked: u64,
    /// Messages that could not be decoded
    pub rejected: u64,
    /// Messages naming an unregistered task
    pub unknown: u64,
}

/// How one attempt ended.
#[derive(Debug)]
enum AttemptResult {
    Finished(TaskResult<serde_json::Value>),
    Panicked(String),
    Expired,
    Revoked(RevokeCause),
}

/// What to do with the message once handling is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Ack,
    Redeliver,
}

/// Outcome of [`WorkerManager::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every worker drained within the grace period
    Drained,
    /// Leftover work was revoked, then workers exited
    Terminated,
    /// Workers still alive after revocation were aborted
    Aborted(usize),
}

/// Individual worker that processes dispatched messages
pub struct Worker {
    id: usize,
    ctx: Arc<WorkerContext>,
    credits: Arc<QosCredits>,
    revocations: Arc<Revocations>,
    stats: Arc<StatsCounters>,
    task_timeout: Option<Duration>,
}

impl Worker {
    fn new(
        id: usize,
        ctx: Arc<WorkerContext>,
        credits: Arc<QosCredits>,
        revocations: Arc<Revocations>,
        stats: Arc<StatsCounters>,
    ) -> Self {
        let task_timeout = ctx.config.worker.task_timeout_secs.map(Duration::from_secs);
        Self {
            id,
            ctx,
            credits,
            revocations,
            stats,
            task_timeout,
        }
    }

    /// Run until the dispatch channel closes.
    async fn run(&self, dispatch_rx: Arc<Mutex<mpsc::Receiver<Dispatch>>>) {
        tracing::info!("🔨 Worker {} ready", self.id);

        loop {
            let next = {
                let mut rx = dispatch_rx.lock().await;
                rx.recv().await
            };
            let Some(dispatch) = next else {
                break;
            };
            self.process(dispatch).await;
        }

        tracing::info!("🔨 Worker {} stopped", self.id);
    }

    /// Handle one dispatched message end to end.
    async fn process(&self, dispatch: Dispatch) {
        let Dispatch {
            queue,
            message,
            mut record,
        } = dispatch;

        self.stats.active_tasks.fetch_add(1, Ordering::Relaxed);
        let settlement = self.handle(&queue, &message, &mut record).await;

        match settlement {
            Settlement::Ack => {
                if let Err(e) = self.ctx.transport.ack(&queue, &message.receipt).await {
                    tracing::warn!(queue = %queue, task_id = ?record.task_id, error = %e, "Failed to ack message");
                }
            }
            Settlement::Redeliver => {
                tracing::debug!(queue = %queue, task_id = ?record.task_id, "Message left for redelivery");
            }
        }

        self.credits.release(1);
        self.stats.active_tasks.fetch_sub(1, Ordering::Relaxed);
    }

    async fn handle(
        &self,
        queue: &str,
        message: &QueueMessage,
        record: &mut TaskExecutionRecord,
    ) -> Settlement {
        let observer = &self.ctx.observer;

        let task_message: TaskMessage = match codec::decode(&message.body, &message.attributes) {
            Ok(m) => m,
            Err(e) => {
                observer
                    .on_terminal(record, &TerminalEvent::Rejected { reason: e.to_string() })
                    .await;
                StatsCounters::bump(&self.stats.rejected);
                return Settlement::Ack;
            }
        };
        record.attach(task_message.clone());
        let task_id = task_message.id.clone();

        let Some(executor) = self.ctx.tasks.get(&task_message.task) else {
            observer.on_terminal(record, &TerminalEvent::Unknown).await;
            StatsCounters::bump(&self.stats.unknown);
            return Settlement::Ack;
        };
        let policy = executor
            .retry_policy()
            .unwrap_or_else(|| self.ctx.config.retry.clone());
        let mut retries = task_message.retries;

        loop {
            if let Some(cause) = self.revocations.check(&task_id).await {
                return self.revoke(record, cause).await;
            }

            tracing::debug!(
                "🔨 Worker {} running task {} ({}) attempt {}",
                self.id,
                task_id,
                task_message.task,
                retries
            );
            observer.on_pre_run(record);

            let task_ctx = TaskContext {
                task_id: task_id.clone(),
                queue: queue.to_string(),
                attempt: retries,
                producer: Arc::clone(&self.ctx.producer),
                jobs: Arc::clone(&self.ctx.jobs),
            };
            let result = self
                .run_attempt(Arc::clone(&executor), task_message.args.clone(), task_ctx)
                .await;

            match result {
                AttemptResult::Finished(Ok(_)) => {
                    observer.on_post_run(record);
                    observer.on_terminal(record, &TerminalEvent::Success).await;
                    StatsCounters::bump(&self.stats.completed);
                    tracing::info!("🔨 Worker {} completed task {}", self.id, task_id);
                    return Settlement::Ack;
                }
                AttemptResult::Finished(Err(err)) => {
                    observer.on_post_run(record);

                    if !policy.should_retry(err.kind, retries) {
                        tracing::error!("🔨 Worker {} task {} failed: {}", self.id, task_id, err);
                        observer
                            .on_terminal(record, &TerminalEvent::Failure { error: err.to_string() })
                            .await;
                        StatsCounters::bump(&self.stats.failed);
                        return Settlement::Ack;
                    }

                    retries += 1;
                    observer
                        .on_terminal(record, &TerminalEvent::Retry { error: err.to_string() })
                        .await;
                    StatsCounters::bump(&self.stats.retried);
                    if let Some(m) = record.message.as_mut() {
                        m.retries = retries;
                    }

                    let delay = policy.delay_for(retries);
                    tracing::info!(
                        "🔨 Worker {} retrying task {} in {:?} (retry {}/{})",
                        self.id,
                        task_id,
                        delay,
                        retries,
                        policy.max_retries
                    );
                    tokio::select! {
                        _ = sleep(delay) => {}
                        cause = self.revocations.wait(&task_id) => {
                            return self.revoke(record, cause).await;
                        }
                    }

                    record.received_at = Some(Instant::now());
                    record.started_at = None;
                }
                AttemptResult::Panicked(panic) => {
                    tracing::error!("🔨 Worker {} task {} panicked: {}", self.id, task_id, panic);
                    observer.on_post_run(record);
                    observer
                        .on_terminal(record, &TerminalEvent::InternalError { panic })
                        .await;
                    StatsCounters::bump(&self.stats.failed);
                    return Settlement::Ack;
                }
                AttemptResult::Expired => {
                    tracing::error!(
                        "🔨 Worker {} task {} timed out after {:?}",
                        self.id,
                        task_id,
                        self.task_timeout
                    );
                    observer
                        .on_terminal(
                            record,
                            &TerminalEvent::Revoked {
                                terminated: false,
                                expired: true,
                            },
                        )
                        .await;
                    StatsCounters::bump(&self.stats.revoked);
                    return Settlement::Ack;
                }
                AttemptResult::Revoked(cause) => {
                    return self.revoke(record, cause).await;
                }
            }
        }
    }

    async fn run_attempt(
        &self,
        executor: Arc<dyn TaskExecutor>,
        args: serde_json::Value,
        ctx: TaskContext,
    ) -> AttemptResult {
        let task_id = ctx.task_id.clone();
        let mut handle = tokio::spawn(async move { executor.execute(args, &ctx).await });
        let abort = handle.abort_handle();

        let limit = self.task_timeout;
        let finished = async {
            match limit {
                Some(limit) => timeout(limit, &mut handle).await.ok(),
                None => Some((&mut handle).await),
            }
        };

        tokio::select! {
            joined = finished => match joined {
                Some(Ok(result)) => AttemptResult::Finished(result),
                Some(Err(e)) if e.is_cancelled() => AttemptResult::Revoked(RevokeCause::Shutdown),
                Some(Err(e)) => AttemptResult::Panicked(panic_message(e)),
                None => {
                    abort.abort();
                    AttemptResult::Expired
                }
            },
            cause = self.revocations.wait(&task_id) => {
                abort.abort();
                AttemptResult::Revoked(cause)
            }
        }
    }

    async fn revoke(&self, record: &TaskExecutionRecord, cause: RevokeCause) -> Settlement {
        self.ctx
            .observer
            .on_terminal(
                record,
                &TerminalEvent::Revoked {
                    terminated: true,
                    expired: false,
                },
            )
            .await;
        StatsCounters::bump(&self.stats.revoked);

        match cause {
            RevokeCause::Requested => Settlement::Ack,
            RevokeCause::Shutdown => Settlement::Redeliver,
        }
    }
}

fn panic_message(err: JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "task panicked".to_string()),
        Err(err) => err.to_string(),
    }
}

/// Manages the worker pool
#[derive(Clone)]
pub struct WorkerManager {
    ctx: Arc<WorkerContext>,
    credits: Arc<QosCredits>,
    revocations: Arc<Revocations>,
    stats: Arc<StatsCounters>,
    active_workers: Arc<AtomicUsize>,
    worker_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
    concurrency: usize,
}

impl WorkerManager {
    /// Create a worker manager
    pub fn new(ctx: Arc<WorkerContext>, credits: Arc<QosCredits>) -> Self {
        let concurrency = ctx.config.worker.concurrency;
        Self {
            ctx,
            credits,
            revocations: Arc::new(Revocations::default()),
            stats: Arc::new(StatsCounters::default()),
            active_workers: Arc::new(AtomicUsize::new(0)),
            worker_handles: Arc::new(Mutex::new(Vec::new())),
            concurrency,
        }
    }

    /// Spawn `concurrency` workers draining `dispatch_rx`.
    pub async fn spawn_workers(&self, dispatch_rx: mpsc::Receiver<Dispatch>) {
        let dispatch_rx = Arc::new(Mutex::new(dispatch_rx));
        let mut handles = self.worker_handles.lock().await;

        for worker_id in 0..self.concurrency {
            let worker = Worker::new(
                worker_id,
                Arc::clone(&self.ctx),
                Arc::clone(&self.credits),
                Arc::clone(&self.revocations),
                Arc::clone(&self.stats),
            );
            let rx = Arc::clone(&dispatch_rx);
            let active_workers = Arc::clone(&self.active_workers);

            handles.push(tokio::spawn(async move {
                active_workers.fetch_add(1, Ordering::Relaxed);
                worker.run(rx).await;
                active_workers.fetch_sub(1, Ordering::Relaxed);
            }));
            tracing::debug!("🔨 Spawned worker {}", worker_id);
        }
    }

    /// Revoke a task by id.
    pub async fn revoke(&self, task_id: impl Into<TaskId>) {
        let task_id = task_id.into();
        tracing::info!(task_id = %task_id, "Revoking task");
        self.revocations.revoke(task_id).await;
    }

    /// Current worker statistics
    pub fn stats(&self) -> WorkerStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        WorkerStats {
            concurrency: self.concurrency,
            active_workers: self.active_worker_count(),
            active_tasks: load(&self.stats.active_tasks),
            completed: load(&self.stats.completed),
            failed: load(&self.stats.failed),
            retried: load(&self.stats.retried),
            revoked: load(&self.stats.revoked),
            rejected: load(&self.stats.rejected),
            unknown: load(&self.stats.unknown),
        }
    }

    /// Get the number of active workers
    pub fn active_worker_count(&self) -> usize {
        self.active_workers.load(Ordering::Relaxed)
    }

    /// Wait for workers to drain the closed dispatch channel. Whatever is
    /// still running after `grace` is revoked and left for redelivery.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownOutcome {
        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };
        if handles.is_empty() {
            return ShutdownOutcome::Drained;
        }

        tracing::info!(
            "🔨 Draining {} workers with grace period {:?}",
            handles.len(),
            grace
        );

        let aborts: Vec<AbortHandle> = handles.iter().map(JoinHandle::abort_handle).collect();
        let mut all = futures::future::join_all(handles);

        if timeout(grace, &mut all).await.is_ok() {
            tracing::info!("🔨 All workers drained");
            return ShutdownOutcome::Drained;
        }

        tracing::warn!(
            active_tasks = self.stats.active_tasks.load(Ordering::Relaxed),
            "🔨 Grace period exceeded, revoking remaining tasks"
        );
        self.revocations.terminate_all();

        if timeout(TERMINATION_WINDOW, &mut all).await.is_ok() {
            return ShutdownOutcome::Terminated;
        }

        let stuck = aborts.iter().filter(|a| !a.is_finished()).count();
        tracing::error!("🔨 {} workers did not stop, aborting", stuck);
        for abort in &aborts {
            abort.abort();
        }
        ShutdownOutcome::Aborted(stuck)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DockhandConfig, RetryPolicy};
    use crate::core::registry::TaskRegistry;
    use crate::queue::registry::{QueueBinding, StaticCallerIdentity};
    use crate::queue::{InMemoryTransport, Transport};
    use crate::task::{DockhandTask, TaskError, TaskErrorKind, TaskState};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::collections::HashMap;

    #[derive(Debug, Serialize, Deserialize)]
    struct Divide {
        a: i64,
        b: i64,
    }

    #[async_trait]
    impl DockhandTask for Divide {
        const NAME: &'static str = "divide";
        type Output = i64;

        async fn run(self, _ctx: &TaskContext) -> TaskResult<i64> {
            if self.b == 0 {
                return Err(TaskError::division_by_zero());
            }
            Ok(self.a / self.b)
        }

        fn retry_policy() -> Option<RetryPolicy> {
            Some(RetryPolicy::fixed(2, 1).retry_on([TaskErrorKind::DivisionByZero]))
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Explode {}

    #[async_trait]
    impl DockhandTask for Explode {
        const NAME: &'static str = "explode";
        type Output = ();

        async fn run(self, _ctx: &TaskContext) -> TaskResult<()> {
            panic!("kaboom");
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Nap {
        ms: u64,
    }

    #[async_trait]
    impl DockhandTask for Nap {
        const NAME: &'static str = "nap";
        type Output = ();

        async fn run(self, _ctx: &TaskContext) -> TaskResult<()> {
            sleep(Duration::from_millis(self.ms)).await;
            Ok(())
        }
    }

    struct Fixture {
        transport: Arc<InMemoryTransport>,
        ctx: Arc<WorkerContext>,
        credits: Arc<QosCredits>,
        manager: WorkerManager,
    }

    fn fixture(task_timeout_secs: u64) -> Fixture {
        let mut config = DockhandConfig::testing();
        config.worker.task_timeout_secs = Some(task_timeout_secs);
        config.queues = vec![
            QueueBinding::new("divide", "divide"),
            QueueBinding::new("explode", "explode"),
            QueueBinding::new("nap", "nap"),
            QueueBinding::new("ghost", "ghost"),
        ];

        let mut tasks = TaskRegistry::new();
        tasks.register::<Divide>().register::<Explode>().register::<Nap>();

        let transport = Arc::new(InMemoryTransport::new());
        let ctx = Arc::new(
            WorkerContext::builder(config)
                .tasks(tasks)
                .transport(transport.clone())
                .caller(StaticCallerIdentity("alice".into()))
                .build()
                .unwrap(),
        );
        let credits = Arc::new(QosCredits::new(ctx.config.worker.prefetch_count()));
        let manager = WorkerManager::new(Arc::clone(&ctx), Arc::clone(&credits));
        Fixture {
            transport,
            ctx,
            credits,
            manager,
        }
    }

    fn worker(f: &Fixture) -> Worker {
        Worker::new(
            0,
            Arc::clone(&f.ctx),
            Arc::clone(&f.credits),
            Arc::clone(&f.manager.revocations),
            Arc::clone(&f.manager.stats),
        )
    }

    async fn dispatch(f: &Fixture, task: &str, args: serde_json::Value) -> Dispatch {
        f.ctx.producer.send(task, args).await.unwrap();
        let queue = f.ctx.routing.physical_name_for(task).unwrap().to_string();
        let mut batch = f.transport.fetch_batch(&queue, 1, Duration::ZERO).await.unwrap();
        let message = batch.remove(0);

        f.credits.acquire(1);
        let mut record = TaskExecutionRecord::for_queue(queue.clone(), Some(task.to_string()));
        f.ctx.observer.on_received(&mut record);
        Dispatch {
            queue,
            message,
            record,
        }
    }

    fn count(f: &Fixture, state: TaskState, task: &str) -> f64 {
        f.ctx.metrics.worker_count(state, task, &format!("test-{}", task))
    }

    #[tokio::test]
    async fn test_success_is_acked() {
        let f = fixture(10);
        let d = dispatch(&f, "divide", json!({"a": 6, "b": 3})).await;
        worker(&f).process(d).await;

        assert_eq!(count(&f, TaskState::Success, "divide"), 1.0);
        assert_eq!(count(&f, TaskState::PostRun, "divide"), 1.0);
        assert_eq!(f.transport.in_flight_len().await, 0);
        assert_eq!(f.transport.pending_len("err-test-divide").await, 0);
        assert_eq!(f.credits.available(), f.credits.capacity());
        assert_eq!(f.manager.stats().completed, 1);
    }

    #[tokio::test]
    async fn test_retries_then_dead_letters() {
        let f = fixture(10);
        let d = dispatch(&f, "divide", json!({"a": 1, "b": 0})).await;
        let task_id = d.record.task_id.clone();
        worker(&f).process(d).await;

        assert_eq!(count(&f, TaskState::PreRun, "divide"), 3.0);
        assert_eq!(count(&f, TaskState::Retry, "divide"), 2.0);
        assert_eq!(count(&f, TaskState::Failed, "divide"), 1.0);

        let dead = f.transport.peek("err-test-divide").await;
        assert_eq!(dead.len(), 1);
        let message: TaskMessage = codec::decode(&dead[0].body, &dead[0].attributes).unwrap();
        assert_eq!(Some(message.id), task_id);
        assert_eq!(message.args, json!({"a": 1, "b": 0}));
        assert_eq!(f.manager.stats().retried, 2);
    }

    #[tokio::test]
    async fn test_panic_is_internal_error() {
        let f = fixture(10);
        let d = dispatch(&f, "explode", json!({})).await;
        worker(&f).process(d).await;

        assert_eq!(count(&f, TaskState::InternalError, "explode"), 1.0);
        assert_eq!(count(&f, TaskState::Failed, "explode"), 1.0);
        assert_eq!(f.transport.pending_len("err-test-explode").await, 1);
    }

    #[tokio::test]
    async fn test_timeout_revokes_without_post_run() {
        let f = fixture(1);
        let d = dispatch(&f, "nap", json!({"ms": 5_000})).await;
        worker(&f).process(d).await;

        assert_eq!(count(&f, TaskState::Revoked, "nap"), 1.0);
        assert_eq!(count(&f, TaskState::PostRun, "nap"), 0.0);
        assert_eq!(f.transport.pending_len("err-test-nap").await, 0);
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let f = fixture(10);
        let d = dispatch(&f, "ghost", json!([])).await;
        worker(&f).process(d).await;

        assert_eq!(count(&f, TaskState::Unknown, "ghost"), 1.0);
        assert_eq!(f.manager.stats().unknown, 1);
        assert_eq!(f.transport.in_flight_len().await, 0);
    }

    #[tokio::test]
    async fn test_undecodable_message_is_rejected() {
        let f = fixture(10);
        f.transport
            .send_message("test-divide", "not json".to_string(), HashMap::new())
            .await
            .unwrap();
        let mut batch = f.transport.fetch_batch("test-divide", 1, Duration::ZERO).await.unwrap();
        let mut record = TaskExecutionRecord::for_queue("test-divide", Some("divide".into()));
        f.ctx.observer.on_received(&mut record);
        f.credits.acquire(1);

        worker(&f)
            .process(Dispatch {
                queue: "test-divide".into(),
                message: batch.remove(0),
                record,
            })
            .await;

        assert_eq!(count(&f, TaskState::Rejected, "divide"), 1.0);
        assert_eq!(f.manager.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_explicit_revoke_stops_running_task() {
        let f = fixture(10);
        let d = dispatch(&f, "nap", json!({"ms": 5_000})).await;
        let task_id = d.record.task_id.clone().unwrap_or_default();
        let w = worker(&f);

        let revoker = {
            let manager = f.manager.clone();
            async move {
                sleep(Duration::from_millis(50)).await;
                manager.revoke(task_id).await;
            }
        };
        let started = Instant::now();
        tokio::join!(w.process(d), revoker);

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(count(&f, TaskState::Revoked, "nap"), 1.0);
        assert_eq!(count(&f, TaskState::PostRun, "nap"), 0.0);
        assert_eq!(f.transport.in_flight_len().await, 0);
    }

    #[tokio::test]
    async fn test_revocations_of_unseen_tasks_expire() {
        let revocations = Revocations::with_ttl(Duration::from_millis(20));
        revocations.revoke("never-arrives").await;
        revocations.revoke("arrives-late").await;
        assert_eq!(revocations.pending().await, 2);

        sleep(Duration::from_millis(40)).await;
        assert_eq!(revocations.check("arrives-late").await, None);

        revocations.revoke("fresh").await;
        assert_eq!(revocations.pending().await, 1);
        assert_eq!(revocations.check("fresh").await, Some(RevokeCause::Requested));
        assert_eq!(revocations.pending().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_terminates_after_grace() {
        let f = fixture(10);
        let (tx, rx) = mpsc::channel(10);
        f.manager.spawn_workers(rx).await;

        tx.send(dispatch(&f, "nap", json!({"ms": 10_000})).await).await.unwrap();
        drop(tx);
        sleep(Duration::from_millis(50)).await;

        let outcome = f.manager.shutdown(Duration::from_millis(100)).await;
        assert_eq!(outcome, ShutdownOutcome::Terminated);
        assert_eq!(count(&f, TaskState::Revoked, "nap"), 1.0);
        // left unacked for redelivery
        assert_eq!(f.transport.in_flight_len().await, 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains() {
        let f = fixture(10);
        let (tx, rx) = mpsc::channel(10);
        f.manager.spawn_workers(rx).await;

        tx.send(dispatch(&f, "nap", json!({"ms": 20})).await).await.unwrap();
        drop(tx);

        assert_eq!(f.manager.shutdown(Duration::from_secs(5)).await, ShutdownOutcome::Drained);
        assert_eq!(count(&f, TaskState::Success, "nap"), 1.0);
        assert_eq!(f.manager.active_worker_count(), 0);
    }
}
