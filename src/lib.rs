//! # Dockhand
//!
//! A queue-backed task worker for Rust applications.
//!
//! ## Features
//!
//! - **Environment-scoped queues**: short queue names resolve to
//!   `{env}-{queue}`, or `{env}-{caller}-{queue}` when running locally
//! - **Credit-based polling**: never holds more unacknowledged messages than
//!   `concurrency * prefetch_multiplier`
//! - **Rate limiting**: queues with a rate-limit key ask a decision service
//!   before every fetch
//! - **Retries and dead letters**: exhausted tasks are rerouted to `err-{queue}`
//! - **Observability**: lifecycle metrics in Prometheus format, shared across
//!   worker processes, plus a `/status` endpoint
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dockhand::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Greet {
//!     name: String,
//! }
//!
//! #[async_trait]
//! impl DockhandTask for Greet {
//!     const NAME: &'static str = "greet";
//!     type Output = String;
//!
//!     async fn run(self, _ctx: &TaskContext) -> TaskResult<String> {
//!         Ok(format!("Hello, {}", self.name))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> DockhandResult<()> {
//!     let mut config = DockhandConfig::development();
//!     config.env = "dev".to_string();
//!     config.queues.push(QueueBinding::new("greetings", "greet"));
//!
//!     let mut tasks = TaskRegistry::new();
//!     tasks.register::<Greet>();
//!
//!     let dockhand = Dockhand::new(config, tasks)?;
//!     dockhand.start().await?;
//!     dockhand.send("greet", serde_json::json!({"name": "world"})).await?;
//!     dockhand.wait_for_shutdown().await
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod ratelimit;
pub mod server;
pub mod task;
pub mod tasks;
pub mod utils;

/// Everything needed to define tasks and run a worker.
pub mod prelude {
    pub use crate::config::{DockhandConfig, RetryPolicy};
    pub use crate::core::{Dockhand, TaskRegistry, WorkerStats};
    pub use crate::error::{DockhandError, DockhandResult};
    pub use crate::queue::registry::QueueBinding;
    pub use crate::task::{DockhandTask, TaskContext, TaskError, TaskErrorKind, TaskId, TaskResult};
    pub use async_trait::async_trait;
}

pub use crate::config::DockhandConfig;
pub use crate::core::{Dockhand, WorkerContext};
pub use crate::error::{DockhandError, DockhandResult};
pub use crate::task::{DockhandTask, TaskContext, TaskError, TaskErrorKind, TaskResult};
pub use async_trait::async_trait;
