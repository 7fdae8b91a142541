//! The Dockhand engine - orchestrates polling loops, workers and the monitor.
//!
//! The engine is responsible for coordinating all the moving parts:
//! - Worker pool management
//! - Polling loops, one per queue
//! - Metrics snapshots and health monitoring
//! - The status and metrics HTTP endpoint
//! - Graceful shutdown

use crate::core::WorkerContext;
use crate::core::scheduler::{PollScheduler, PollSettings, PollState, QosCredits};
use crate::core::worker::{ShutdownOutcome, WorkerManager, WorkerStats};
use crate::error::{DockhandError, DockhandResult};
use crate::metrics::cleanup_multiproc_dir;
use crate::server;
use crate::task::TaskId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Built, not started
    Starting,
    /// Polling and executing
    Running,
    /// Fetching stopped, in-flight work finishing
    Draining,
    /// Done
    Stopped,
}

impl EngineState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => EngineState::Running,
            2 => EngineState::Draining,
            3 => EngineState::Stopped,
            _ => EngineState::Starting,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            EngineState::Starting => 0,
            EngineState::Running => 1,
            EngineState::Draining => 2,
            EngineState::Stopped => 3,
        }
    }

    /// `RUNNING` while running, `TERMINATED` otherwise.
    pub fn as_label(self) -> &'static str {
        match self {
            EngineState::Running => "RUNNING",
            _ => "TERMINATED",
        }
    }
}

/// What `/status` reports.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    /// `RUNNING` or `TERMINATED`
    pub state: String,
    /// Worker pool counters
    #[serde(flatten)]
    pub workers: WorkerStats,
    /// Prefetch credits left
    pub qos_credits: usize,
    /// Poll state per queue
    pub queues: BTreeMap<String, PollState>,
    /// Seconds since start
    pub uptime_secs: u64,
}

impl StatusSnapshot {
    /// Whether the worker reports itself as running.
    pub fn is_running(&self) -> bool {
        self.state == EngineState::Running.as_label()
    }
}

/// Source of status snapshots for the HTTP endpoint.
pub trait StatusSource: Send + Sync {
    /// Current status.
    fn snapshot(&self) -> StatusSnapshot;
}

/// Live status of an engine, read without locks.
pub struct StatusBoard {
    state: AtomicU8,
    started_at: Instant,
    workers: WorkerManager,
    scheduler: Arc<PollScheduler>,
    credits: Arc<QosCredits>,
}

impl StatusBoard {
    fn new(workers: WorkerManager, scheduler: Arc<PollScheduler>, credits: Arc<QosCredits>) -> Self {
        Self {
            state: AtomicU8::new(EngineState::Starting.as_u8()),
            started_at: Instant::now(),
            workers,
            scheduler,
            credits,
        }
    }

    /// Current engine state.
    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: EngineState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }
}

impl StatusSource for StatusBoard {
    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.state().as_label().to_string(),
            workers: self.workers.stats(),
            qos_credits: self.credits.available(),
            queues: self.scheduler.states().into_iter().collect(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

/// The engine that orchestrates all components
pub struct WorkerEngine {
    ctx: Arc<WorkerContext>,
    worker_manager: WorkerManager,
    scheduler: Arc<PollScheduler>,
    status: Arc<StatusBoard>,
    /// Stops the polling loops
    poll_shutdown: watch::Sender<bool>,
    /// Stops the HTTP endpoint, which outlives the drain
    server_shutdown: watch::Sender<bool>,
    is_running: Arc<AtomicBool>,
    poll_handles: Vec<JoinHandle<()>>,
    monitor_handle: Option<JoinHandle<()>>,
    server_handle: Option<JoinHandle<()>>,
    server_addr: Option<SocketAddr>,
}

impl WorkerEngine {
    /// Create an engine over `ctx`.
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        let credits = Arc::new(QosCredits::new(ctx.config.worker.prefetch_count()));
        let worker_manager = WorkerManager::new(Arc::clone(&ctx), Arc::clone(&credits));

        let settings = PollSettings {
            prefetch_count: ctx.config.worker.prefetch_count(),
            max_batch_size: ctx.config.broker.max_batch_size,
            polling_interval: Duration::from_millis(ctx.config.broker.polling_interval_ms),
            wait_time: Duration::from_secs(ctx.config.broker.wait_time_secs),
        };
        let scheduler = Arc::new(PollScheduler::new(
            Arc::clone(&ctx.routing),
            Arc::clone(&ctx.transport),
            Arc::clone(&ctx.rate_limiter),
            Arc::clone(&ctx.observer),
            Arc::clone(&credits),
            settings,
        ));

        let status = Arc::new(StatusBoard::new(
            worker_manager.clone(),
            Arc::clone(&scheduler),
            credits,
        ));

        Self {
            ctx,
            worker_manager,
            scheduler,
            status,
            poll_shutdown: watch::channel(false).0,
            server_shutdown: watch::channel(false).0,
            is_running: Arc::new(AtomicBool::new(false)),
            poll_handles: Vec::new(),
            monitor_handle: None,
            server_handle: None,
            server_addr: None,
        }
    }

    /// Start the engine and all its components
    pub async fn start(&mut self) -> DockhandResult<()> {
        if self.is_running.load(Ordering::Relaxed) {
            return Err(DockhandError::AlreadyRunning);
        }

        let config = &self.ctx.config;
        tracing::info!(
            env = %config.env,
            concurrency = config.worker.concurrency,
            prefetch = config.worker.prefetch_count(),
            "Starting Dockhand engine"
        );

        if let Err(e) = self.ctx.transport.health_check().await {
            tracing::warn!(error = %e, "Transport health check failed at startup");
        }

        // The HTTP endpoint binds first so a taken port fails startup cleanly.
        if config.server.enabled {
            let listener = server::bind(&config.server).await?;
            self.server_addr = listener.local_addr().ok();
            let router = server::router(
                Arc::clone(&self.status) as Arc<dyn StatusSource>,
                Arc::clone(&self.ctx.metrics),
            );
            let shutdown = self.server_shutdown.subscribe();
            self.server_handle = Some(tokio::spawn(async move {
                if let Err(e) = server::serve(listener, router, shutdown).await {
                    tracing::error!(error = %e, "Status server failed");
                }
            }));
        }

        let (dispatch_tx, dispatch_rx) = mpsc::channel(config.broker.channel_capacity);
        self.worker_manager.spawn_workers(dispatch_rx).await;
        self.poll_handles = self
            .scheduler
            .spawn(dispatch_tx, self.poll_shutdown.subscribe());
        self.monitor_handle = Some(self.start_monitor());

        self.is_running.store(true, Ordering::Relaxed);
        self.status.set_state(EngineState::Running);

        tracing::info!(
            queues = ?self.ctx.routing.active_queues().collect::<Vec<_>>(),
            "Dockhand engine started"
        );
        Ok(())
    }

    /// Stop fetching, drain in-flight and prefetched work within the grace
    /// period, revoke what is left, flush metrics and stop.
    pub async fn shutdown(mut self) -> DockhandResult<()> {
        if !self.is_running.load(Ordering::Relaxed) {
            return Err(DockhandError::NotRunning);
        }

        tracing::info!("Shutting down Dockhand engine...");
        self.status.set_state(EngineState::Draining);

        // Polling loops hold the only senders; once they exit the pool sees a
        // closed channel after the last prefetched message.
        self.poll_shutdown.send_replace(true);
        for result in futures::future::join_all(std::mem::take(&mut self.poll_handles)).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Polling loop ended abnormally");
            }
        }

        let grace = Duration::from_secs(self.ctx.config.worker.shutdown_grace_secs);
        match self.worker_manager.shutdown(grace).await {
            ShutdownOutcome::Drained => {}
            ShutdownOutcome::Terminated => {
                tracing::warn!("Remaining tasks were revoked after the grace period");
            }
            ShutdownOutcome::Aborted(n) => {
                tracing::error!(workers = n, "Workers aborted after revocation");
            }
        }

        if let Some(handle) = self.monitor_handle.take() {
            handle.abort();
        }

        self.finish_metrics();

        self.server_shutdown.send_replace(true);
        if let Some(handle) = self.server_handle.take() {
            let _ = handle.await;
        }

        self.is_running.store(false, Ordering::Relaxed);
        self.status.set_state(EngineState::Stopped);
        tracing::info!("Dockhand engine shutdown complete");
        Ok(())
    }

    fn finish_metrics(&self) {
        let metrics = &self.ctx.metrics;
        let cleanup = self.ctx.config.metrics.cleanup_on_exit;

        match metrics.multiproc_dir() {
            Some(dir) if cleanup => {
                if let Err(e) = cleanup_multiproc_dir(dir) {
                    tracing::warn!(error = %e, "Failed to clean metrics directory");
                }
            }
            _ => {
                if let Err(e) = metrics.flush() {
                    tracing::warn!(error = %e, "Failed to flush metrics");
                }
            }
        }
    }

    /// Start the health monitor. It also writes the metrics snapshot for
    /// other processes sharing the multiprocess directory.
    fn start_monitor(&self) -> JoinHandle<()> {
        let metrics = Arc::clone(&self.ctx.metrics);
        let status = Arc::clone(&self.status);
        let expected_workers = self.ctx.config.worker.concurrency;
        let period = Duration::from_secs(self.ctx.config.metrics.flush_interval_secs.max(1));

        tokio::spawn(async move {
            tracing::info!("Health monitor started");
            let mut interval = interval(period);

            loop {
                interval.tick().await;

                if let Err(e) = metrics.flush() {
                    tracing::warn!(error = %e, "Failed to flush metrics snapshot");
                }

                let snapshot = status.snapshot();
                let active = snapshot.workers.active_workers;
                let health = if active == expected_workers {
                    "HEALTHY"
                } else if active > 0 {
                    "DEGRADED"
                } else {
                    "CRITICAL"
                };

                tracing::debug!(
                    "HEALTH CHECK - Status: {} | Workers: {}/{} | Active tasks: {} | Credits: {} | C:{} F:{} R:{} V:{} | Uptime: {}s",
                    health,
                    active,
                    expected_workers,
                    snapshot.workers.active_tasks,
                    snapshot.qos_credits,
                    snapshot.workers.completed,
                    snapshot.workers.failed,
                    snapshot.workers.retried,
                    snapshot.workers.revoked,
                    snapshot.uptime_secs
                );

                if active == 0 {
                    tracing::error!("CRITICAL: All workers are dead!");
                }
            }
        })
    }

    /// Revoke a task by id.
    pub async fn revoke(&self, task_id: impl Into<TaskId>) {
        self.worker_manager.revoke(task_id).await;
    }

    /// Get worker statistics
    pub fn worker_stats(&self) -> WorkerStats {
        self.worker_manager.stats()
    }

    /// Live status.
    pub fn status(&self) -> &Arc<StatusBoard> {
        &self.status
    }

    /// Address the status endpoint listens on, once started.
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server_addr
    }

    /// Perform a health check
    pub fn health_check(&self) -> DockhandResult<()> {
        if !self.is_running.load(Ordering::Relaxed) {
            return Err(DockhandError::NotRunning);
        }

        let active_workers = self.worker_manager.active_worker_count();
        let expected_workers = self.ctx.config.worker.concurrency;

        if active_workers == 0 {
            return Err(DockhandError::config("No active workers"));
        }

        if active_workers < expected_workers / 2 {
            tracing::warn!(
                "Less than half of expected workers active: {}/{}",
                active_workers,
                expected_workers
            );
        }

        Ok(())
    }

    /// Check if engine is running
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, initiating graceful shutdown..."),
        _ = terminate => tracing::info!("Received SIGTERM, initiating graceful shutdown..."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DockhandConfig;
    use crate::core::registry::TaskRegistry;
    use crate::queue::registry::QueueBinding;
    use crate::queue::InMemoryTransport;
    use crate::task::{DockhandTask, TaskContext, TaskResult, TaskState};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Echo {
        value: String,
    }

    #[async_trait]
    impl DockhandTask for Echo {
        const NAME: &'static str = "echo";
        type Output = String;

        async fn run(self, _ctx: &TaskContext) -> TaskResult<String> {
            Ok(self.value)
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
            tokio::time::sleep(Duration::from_millis(self.ms)).await;
            Ok(())
        }
    }

    fn context(transport: Arc<InMemoryTransport>) -> Arc<WorkerContext> {
        context_with(DockhandConfig::testing(), transport)
    }

    fn context_with(mut config: DockhandConfig, transport: Arc<InMemoryTransport>) -> Arc<WorkerContext> {
        config.queues = vec![QueueBinding::new("echo", "echo"), QueueBinding::new("nap", "nap")];
        let mut tasks = TaskRegistry::new();
        tasks.register::<Echo>().register::<Nap>();

        Arc::new(
            WorkerContext::builder(config)
                .tasks(tasks)
                .transport(transport)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_state_labels() {
        assert_eq!(EngineState::Running.as_label(), "RUNNING");
        assert_eq!(EngineState::Draining.as_label(), "TERMINATED");
        assert_eq!(EngineState::Stopped.as_label(), "TERMINATED");
    }

    #[tokio::test]
    async fn test_engine_lifecycle() {
        let transport = Arc::new(InMemoryTransport::new());
        let ctx = context(transport.clone());
        let mut engine = WorkerEngine::new(Arc::clone(&ctx));
        assert!(!engine.is_running());
        assert_eq!(engine.status().state(), EngineState::Starting);

        engine.start().await.unwrap();
        assert!(engine.is_running());
        assert!(engine.health_check().is_ok());
        assert!(matches!(engine.start().await, Err(DockhandError::AlreadyRunning)));

        ctx.producer.send("echo", json!({"value": "hi"})).await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.worker_stats().completed < 1 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(engine.worker_stats().completed, 1);
        assert_eq!(ctx.metrics.worker_count(TaskState::Success, "echo", "test-echo"), 1.0);

        let snapshot = engine.status().snapshot();
        assert!(snapshot.is_running());
        assert!(snapshot.queues.contains_key("test-echo"));

        let status = Arc::clone(engine.status());
        engine.shutdown().await.unwrap();
        assert_eq!(status.state(), EngineState::Stopped);
        assert!(!status.snapshot().is_running());
        assert_eq!(status.snapshot().queues["test-echo"], PollState::Stopped);
        assert_eq!(transport.in_flight_len().await, 0);
    }

    async fn get_status(addr: SocketAddr) -> (u16, serde_json::Value) {
        let response = reqwest::get(format!("http://{}/status", addr)).await.unwrap();
        let code = response.status().as_u16();
        (code, response.json().await.unwrap())
    }

    #[tokio::test]
    async fn test_status_unavailable_while_draining() {
        let mut config = DockhandConfig::testing();
        config.server.enabled = true;
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;
        let ctx = context_with(config, Arc::new(InMemoryTransport::new()));

        let mut engine = WorkerEngine::new(Arc::clone(&ctx));
        engine.start().await.unwrap();
        let addr = engine.server_addr().unwrap();

        ctx.producer.send("nap", json!({"ms": 800})).await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.worker_stats().active_tasks < 1 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let (code, body) = get_status(addr).await;
        assert_eq!(code, 200);
        assert_eq!(body["status"]["state"], "RUNNING");

        let status = Arc::clone(engine.status());
        let shutdown = tokio::spawn(engine.shutdown());
        while status.state() == EngineState::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let (code, body) = get_status(addr).await;
        assert_eq!(code, 503);
        assert_eq!(body["status"]["state"], "TERMINATED");
        assert_eq!(body["status"]["active_tasks"], 1);
        assert_eq!(status.state(), EngineState::Draining);

        shutdown.await.unwrap().unwrap();
        assert_eq!(status.state(), EngineState::Stopped);
        assert_eq!(status.snapshot().workers.completed, 1);
        assert!(reqwest::get(format!("http://{}/status", addr)).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_before_start() {
        let engine = WorkerEngine::new(context(Arc::new(InMemoryTransport::new())));
        assert!(matches!(engine.shutdown().await, Err(DockhandError::NotRunning)));
    }

    #[tokio::test]
    async fn test_status_serializes_flat() {
        let engine = WorkerEngine::new(context(Arc::new(InMemoryTransport::new())));
        let value = serde_json::to_value(engine.status().snapshot()).unwrap();
        assert_eq!(value["state"], "TERMINATED");
        assert_eq!(value["concurrency"], 1);
        assert_eq!(value["queues"]["test-echo"], "IDLE");
    }
}
