//! Task registry.
//!
//! Tasks are registered explicitly, once, before the worker starts:
//!
//! ```rust
//! use dockhand::core::registry::TaskRegistry;
//! use dockhand::task::{DockhandTask, TaskContext, TaskResult};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Add {
//!     num1: i64,
//!     num2: i64,
//! }
//!
//! #[async_trait::async_trait]
//! impl DockhandTask for Add {
//!     const NAME: &'static str = "add";
//!     type Output = i64;
//!
//!     async fn run(self, _ctx: &TaskContext) -> TaskResult<i64> {
//!         Ok(self.num1 + self.num2)
//!     }
//! }
//!
//! let mut registry = TaskRegistry::new();
//! registry.register::<Add>();
//! assert!(registry.is_registered("add"));
//! ```
//!
//! Arguments arrive as JSON and are deserialized into the task type. Named
//! structs accept both a positional array (`[1, 2]`) and an object
//! (`{"num1": 1, "num2": 2}`).

use crate::config::RetryPolicy;
use crate::task::{DockhandTask, TaskContext, TaskError, TaskResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

/// Trait for executing tasks from serialized arguments.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Deserialize `args` into the task and run it.
    async fn execute(&self, args: serde_json::Value, ctx: &TaskContext) -> TaskResult<serde_json::Value>;

    /// Name this executor is registered under.
    fn task_name(&self) -> &'static str;

    /// Retry policy of the task, if it opted in.
    fn retry_policy(&self) -> Option<RetryPolicy>;
}

/// Executor for a concrete [`DockhandTask`] type.
pub struct TypedExecutor<T> {
    _task: PhantomData<fn() -> T>,
}

impl<T> TypedExecutor<T> {
    /// Create an executor.
    pub fn new() -> Self {
        Self { _task: PhantomData }
    }
}

impl<T> Default for TypedExecutor<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: DockhandTask> TaskExecutor for TypedExecutor<T> {
    async fn execute(&self, args: serde_json::Value, ctx: &TaskContext) -> TaskResult<serde_json::Value> {
        let task: T = serde_json::from_value(args)
            .map_err(|e| TaskError::invalid_arguments(format!("{}: {}", T::NAME, e)))?;
        let output = task.run(ctx).await?;
        serde_json::to_value(output)
            .map_err(|e| TaskError::internal(format!("cannot serialize {} output: {}", T::NAME, e)))
    }

    fn task_name(&self) -> &'static str {
        T::NAME
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        T::retry_policy()
    }
}

/// Registry of executable tasks by name.
#[derive(Default, Clone)]
pub struct TaskRegistry {
    executors: HashMap<String, Arc<dyn TaskExecutor>>,
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under `T::NAME`. A later registration under the same
    /// name replaces the earlier one.
    pub fn register<T: DockhandTask>(&mut self) -> &mut Self {
        self.register_executor(Arc::new(TypedExecutor::<T>::new()))
    }

    /// Register a custom executor.
    pub fn register_executor(&mut self, executor: Arc<dyn TaskExecutor>) -> &mut Self {
        let name = executor.task_name().to_string();
        tracing::info!("Registering task: {}", name);
        if self.executors.insert(name.clone(), executor).is_some() {
            tracing::warn!("Task {} was already registered, replaced", name);
        }
        self
    }

    /// Executor for `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.get(name).cloned()
    }

    /// Whether `name` is registered.
    pub fn is_registered(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }

    /// Registered task names, sorted.
    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.executors.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.task_names())
            .finish()
    }
}
