//! The Dockhand worker: context, engine and façade.
//!
//! [`WorkerContext`] is built once at startup and carries everything the
//! polling loops and workers share. [`Dockhand`] owns a context and starts or
//! stops a [`WorkerEngine`] over it.

use crate::config::DockhandConfig;
use crate::error::{DockhandError, DockhandResult};
use crate::metrics::WorkerMetrics;
use crate::queue::identity::LOCAL_ENV;
use crate::queue::producer::{LegacyJobClient, TaskProducer};
use crate::queue::registry::{ArnCallerIdentity, CallerIdentity, QueueRegistry, RoutingTable};
use crate::queue::{SharedTransport, TransportFactory};
use crate::ratelimit::{self, RateLimiter};
use crate::task::TaskId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

pub mod engine;
pub mod lifecycle;
pub mod registry;
pub mod scheduler;
pub mod worker;

pub use engine::{EngineState, StatusBoard, StatusSnapshot, StatusSource, WorkerEngine};
pub use lifecycle::{LifecycleObserver, TaskExecutionRecord, TaskLifecycleTracker, TerminalEvent};
pub use registry::{TaskExecutor, TaskRegistry};
pub use scheduler::{PollScheduler, PollState, QosCredits};
pub use worker::{WorkerManager, WorkerStats};

/// Everything a running worker shares, built once at startup.
pub struct WorkerContext {
    /// Validated configuration
    pub config: DockhandConfig,
    /// Immutable queue routing
    pub routing: Arc<RoutingTable>,
    /// Queue transport
    pub transport: SharedTransport,
    /// Rate-limit decisions
    pub rate_limiter: Arc<dyn RateLimiter>,
    /// Lifecycle metrics
    pub metrics: Arc<WorkerMetrics>,
    /// Executable tasks
    pub tasks: Arc<TaskRegistry>,
    /// Producer routed through `routing`
    pub producer: Arc<TaskProducer>,
    /// Legacy job queue client
    pub jobs: Arc<LegacyJobClient>,
    /// Receives lifecycle transitions
    pub observer: Arc<dyn LifecycleObserver>,
}

impl WorkerContext {
    /// Start building a context from `config`.
    pub fn builder(config: DockhandConfig) -> WorkerContextBuilder {
        WorkerContextBuilder {
            config,
            tasks: TaskRegistry::new(),
            transport: None,
            caller: None,
            rate_limiter: None,
        }
    }
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("env", &self.config.env)
            .field("queues", &self.routing.active_queues().collect::<Vec<_>>())
            .field("tasks", &self.tasks)
            .finish_non_exhaustive()
    }
}

/// Builder for [`WorkerContext`].
///
/// Unset parts default to the in-memory transport, the caller identity from
/// the environment and the rate limiter described by the configuration.
pub struct WorkerContextBuilder {
    config: DockhandConfig,
    tasks: TaskRegistry,
    transport: Option<SharedTransport>,
    caller: Option<Arc<dyn CallerIdentity>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
}

impl WorkerContextBuilder {
    /// Tasks this worker can execute.
    pub fn tasks(mut self, tasks: TaskRegistry) -> Self {
        self.tasks = tasks;
        self
    }

    /// Queue transport.
    pub fn transport(mut self, transport: SharedTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Identity used to qualify queue names in the local environment.
    pub fn caller(mut self, caller: impl CallerIdentity + 'static) -> Self {
        self.caller = Some(Arc::new(caller));
        self
    }

    /// Rate limiter replacing the configured one.
    pub fn rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Validate the configuration and build the context. Every failure here
    /// is a configuration error and fatal at startup.
    pub fn build(self) -> DockhandResult<WorkerContext> {
        let config = self.config;
        if let Err(problems) = config.validate() {
            return Err(DockhandError::config(problems.join("; ")));
        }

        let transport = self.transport.unwrap_or_else(|| {
            TransportFactory::in_memory_with_visibility(config.broker.visibility_timeout())
        });
        if let Some(visibility) = transport.visibility_timeout() {
            check_transport_visibility(&config, &self.tasks, visibility)?;
        }
        let caller = self
            .caller
            .unwrap_or_else(|| Arc::new(ArnCallerIdentity::from_env()));

        let bindings = config
            .queues
            .iter()
            .cloned()
            .map(|mut binding| {
                if binding.rate_limit_key.is_none() {
                    binding.rate_limit_key = config.ratelimit.default_key.clone();
                }
                binding
            })
            .collect();
        let routing = QueueRegistry::new(bindings).build(&config.env, caller.as_ref())?;

        for queue in routing.active_queues() {
            if let Some(task) = routing.task_for(queue) {
                if !self.tasks.is_registered(task) {
                    tracing::warn!(queue, task, "Queue bound to a task that is not registered");
                }
            }
        }

        let user = if config.env == LOCAL_ENV {
            Some(caller.caller_id()?)
        } else {
            None
        };

        let rate_limiter = match self.rate_limiter {
            Some(limiter) => limiter,
            None => ratelimit::from_config(&config.ratelimit)?,
        };
        let metrics = Arc::new(WorkerMetrics::new(config.metrics_prefix(), &config.metrics)?);
        let producer = Arc::new(TaskProducer::new(Arc::clone(&transport), Arc::clone(&routing)));
        let jobs = Arc::new(LegacyJobClient::new(
            Arc::clone(&transport),
            config.env.clone(),
            user,
        ));
        let observer: Arc<dyn LifecycleObserver> = Arc::new(TaskLifecycleTracker::new(
            Arc::clone(&metrics),
            Arc::clone(&rate_limiter),
            Arc::clone(&routing),
            Arc::clone(&producer),
        ));

        Ok(WorkerContext {
            config,
            routing,
            transport,
            rate_limiter,
            metrics,
            tasks: Arc::new(self.tasks),
            producer,
            jobs,
            observer,
        })
    }
}

/// Refuse a transport that would redeliver a message while a worker may
/// still hold it, under the default policy or any registered task's own.
fn check_transport_visibility(
    config: &DockhandConfig,
    tasks: &TaskRegistry,
    visibility: Duration,
) -> DockhandResult<()> {
    config
        .check_visibility(&config.retry, visibility)
        .map_err(DockhandError::config)?;

    for name in tasks.task_names() {
        let Some(policy) = tasks.get(&name).and_then(|executor| executor.retry_policy()) else {
            continue;
        };
        config
            .check_visibility(&policy, visibility)
            .map_err(|e| DockhandError::config(format!("task '{}': {}", name, e)))?;
    }
    Ok(())
}

/// The main Dockhand worker.
///
/// # Examples
///
/// ```rust
/// use dockhand::prelude::*;
///
/// #[tokio::main]
/// async fn main() -> DockhandResult<()> {
///     let mut config = DockhandConfig::testing();
///     config.queues = vec![QueueBinding::new("add", "add")];
///
///     let dockhand = Dockhand::new(config, TaskRegistry::new())?;
///     dockhand.start().await?;
///     dockhand.stop().await?;
///     Ok(())
/// }
/// ```
pub struct Dockhand {
    context: Arc<WorkerContext>,
    engine: Arc<RwLock<Option<WorkerEngine>>>,
    is_running: Arc<RwLock<bool>>,
}

impl Dockhand {
    /// Create a worker over an in-memory transport using the configured
    /// visibility timeout.
    pub fn new(config: DockhandConfig, tasks: TaskRegistry) -> DockhandResult<Self> {
        let context = WorkerContext::builder(config).tasks(tasks).build()?;
        Ok(Self::with_context(context))
    }

    /// Create a worker over a prepared context.
    pub fn with_context(context: WorkerContext) -> Self {
        Self {
            context: Arc::new(context),
            engine: Arc::new(RwLock::new(None)),
            is_running: Arc::new(RwLock::new(false)),
        }
    }

    /// Start polling and executing tasks. Returns immediately; use
    /// [`wait_for_shutdown`](Self::wait_for_shutdown) to block.
    pub async fn start(&self) -> DockhandResult<()> {
        let mut is_running = self.is_running.write().await;
        if *is_running {
            return Err(DockhandError::AlreadyRunning);
        }

        let mut engine_guard = self.engine.write().await;
        let mut engine = WorkerEngine::new(Arc::clone(&self.context));
        engine.start().await?;
        *engine_guard = Some(engine);
        *is_running = true;

        tracing::info!(
            "🔨 Dockhand started with {} workers on {} queues",
            self.context.config.worker.concurrency,
            self.context.routing.len()
        );
        Ok(())
    }

    /// Stop fetching, drain in-flight work and stop.
    pub async fn stop(&self) -> DockhandResult<()> {
        let mut is_running = self.is_running.write().await;
        if !*is_running {
            return Err(DockhandError::NotRunning);
        }

        let mut engine_guard = self.engine.write().await;
        if let Some(engine) = engine_guard.take() {
            engine.shutdown().await?;
        }

        *is_running = false;
        tracing::info!("🔨 Dockhand stopped");
        Ok(())
    }

    /// Send a task through the routing table.
    pub async fn send(&self, task_name: &str, args: serde_json::Value) -> DockhandResult<TaskId> {
        self.context.producer.send(task_name, args).await
    }

    /// Producer routed through this worker's routing table.
    pub fn producer(&self) -> Arc<TaskProducer> {
        Arc::clone(&self.context.producer)
    }

    /// Revoke a task by id.
    pub async fn revoke(&self, task_id: impl Into<TaskId>) -> DockhandResult<()> {
        let engine_guard = self.engine.read().await;
        let engine = engine_guard.as_ref().ok_or(DockhandError::NotRunning)?;
        engine.revoke(task_id).await;
        Ok(())
    }

    /// Worker statistics, if running.
    pub async fn worker_stats(&self) -> Option<WorkerStats> {
        let engine_guard = self.engine.read().await;
        engine_guard.as_ref().map(WorkerEngine::worker_stats)
    }

    /// Status snapshot, if running.
    pub async fn status(&self) -> Option<StatusSnapshot> {
        let engine_guard = self.engine.read().await;
        engine_guard.as_ref().map(|e| e.status().snapshot())
    }

    /// Whether the worker is running.
    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    /// Block until Ctrl+C or SIGTERM, then stop.
    pub async fn wait_for_shutdown(&self) -> DockhandResult<()> {
        engine::shutdown_signal().await;
        self.stop().await
    }

    /// Check the transport and, when running, the engine.
    pub async fn health_check(&self) -> DockhandResult<()> {
        self.context.transport.health_check().await?;

        let engine_guard = self.engine.read().await;
        if let Some(engine) = engine_guard.as_ref() {
            engine.health_check()?;
        }
        Ok(())
    }

    /// The shared context.
    pub fn context(&self) -> &Arc<WorkerContext> {
        &self.context
    }

    /// Get the configuration used by this worker.
    pub fn config(&self) -> &DockhandConfig {
        &self.context.config
    }
}

impl Drop for Dockhand {
    fn drop(&mut self) {
        // Async cleanup is impossible here; only warn.
        if let Ok(running) = self.is_running.try_read() {
            if *running {
                tracing::warn!("🔨 Dockhand dropped while running. Call stop() for a graceful shutdown.");
            }
        }
    }
}
