//! Task definition and execution traits.

use crate::config::RetryPolicy;
use crate::queue::producer::{LegacyJobClient, TaskProducer};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Unique identifier for a task
pub type TaskId = String;

/// Generate a fresh task id.
pub fn new_task_id() -> TaskId {
    uuid::Uuid::new_v4().to_string()
}

/// Wire envelope of a task message.
///
/// `args` is whatever the producer sent: a positional JSON array or an
/// object. Tasks deserialize it into their own argument type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskMessage {
    /// Task id, preserved across retries and dead-letter resubmission
    pub id: TaskId,
    /// Registered task name
    pub task: String,
    /// Task arguments
    pub args: serde_json::Value,
    /// Retries already attempted by previous deliveries
    #[serde(default)]
    pub retries: u32,
}

impl TaskMessage {
    /// Create a message with a fresh id.
    pub fn new(task: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            id: new_task_id(),
            task: task.into(),
            args,
            retries: 0,
        }
    }

    /// Create a message that keeps an existing id.
    pub fn with_id(id: impl Into<TaskId>, task: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            task: task.into(),
            args,
            retries: 0,
        }
    }
}

/// Lifecycle state label attached to task counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Consumer fetched the message
    Received,
    /// Task body is about to run
    PreRun,
    /// Task body returned
    PostRun,
    /// Task finished successfully
    Success,
    /// Task failed terminally
    Failed,
    /// Task will be attempted again
    Retry,
    /// Message could not be decoded
    Rejected,
    /// Task was revoked before finishing
    Revoked,
    /// No task registered under the message's name
    Unknown,
    /// Task body panicked
    InternalError,
}

impl TaskState {
    /// Metric label for this state.
    pub fn as_label(&self) -> &'static str {
        match self {
            TaskState::Received => "RECEIVED",
            TaskState::PreRun => "PRERUN",
            TaskState::PostRun => "POSTRUN",
            TaskState::Success => "SUCCESS",
            TaskState::Failed => "FAILED",
            TaskState::Retry => "RETRY",
            TaskState::Rejected => "REJECTED",
            TaskState::Revoked => "REVOKED",
            TaskState::Unknown => "UNKNOWN",
            TaskState::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Classification of task errors, used by retry allow-lists. A task that
/// outlives its timeout is revoked instead of failing with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// Division by zero
    DivisionByZero,
    /// Arguments did not match what the task expects
    InvalidArguments,
    /// I/O or downstream service failure
    Io,
    /// Anything else
    Internal,
}

/// Error returned by a task body.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct TaskError {
    /// Error classification
    pub kind: TaskErrorKind,
    /// Human readable message
    pub message: String,
}

impl TaskError {
    /// Create a task error.
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Division by zero.
    pub fn division_by_zero() -> Self {
        Self::new(TaskErrorKind::DivisionByZero, "division by zero")
    }

    /// Arguments could not be used.
    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::InvalidArguments, message)
    }

    /// Internal failure.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Internal, message)
    }
}

impl From<crate::error::DockhandError> for TaskError {
    fn from(err: crate::error::DockhandError) -> Self {
        Self::new(TaskErrorKind::Io, err.to_string())
    }
}

/// Result type returned by task bodies.
pub type TaskResult<T> = Result<T, TaskError>;

/// Per-execution context handed to a task body.
#[derive(Clone)]
pub struct TaskContext {
    /// Id of the message being executed
    pub task_id: TaskId,
    /// Physical queue the message came from
    pub queue: String,
    /// Zero-based attempt number
    pub attempt: u32,
    /// Producer for tasks that enqueue follow-up work
    pub producer: Arc<TaskProducer>,
    /// Client for legacy job queues
    pub jobs: Arc<LegacyJobClient>,
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .field("queue", &self.queue)
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// Trait that all tasks must implement to be executable by a Dockhand worker.
///
/// The implementing type is the task's argument set; it is deserialized from
/// the message `args`. Positional arguments map naturally onto tuple structs.
///
/// ```rust
/// use dockhand::task::{DockhandTask, TaskContext, TaskResult};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Greet(String);
///
/// #[async_trait::async_trait]
/// impl DockhandTask for Greet {
///     const NAME: &'static str = "greet";
///     type Output = String;
///
///     async fn run(self, _ctx: &TaskContext) -> TaskResult<String> {
///         Ok(format!("hello {}", self.0))
///     }
/// }
/// ```
#[async_trait]
pub trait DockhandTask: Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Name the task is registered and routed under
    const NAME: &'static str;

    /// The output type returned by this task
    type Output: Serialize + Send + Sync;

    /// Execute the task and return the result
    async fn run(self, ctx: &TaskContext) -> TaskResult<Self::Output>;

    /// Retry policy for this task. `None` means every error is terminal.
    fn retry_policy() -> Option<RetryPolicy> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_wire_shape() {
        let msg = TaskMessage::with_id("abc", "add", json!([1, 2]));
        let encoded = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            encoded,
            json!({"id": "abc", "task": "add", "args": [1, 2], "retries": 0})
        );

        let decoded: TaskMessage =
            serde_json::from_str(r#"{"id":"x","task":"add","args":[3,4]}"#).unwrap();
        assert_eq!(decoded.retries, 0);
        assert_eq!(decoded.args, json!([3, 4]));
    }

    #[test]
    fn test_fresh_ids_differ() {
        let a = TaskMessage::new("add", json!([]));
        let b = TaskMessage::new("add", json!([]));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_state_labels() {
        assert_eq!(TaskState::PreRun.as_label(), "PRERUN");
        assert_eq!(TaskState::InternalError.to_string(), "INTERNAL_ERROR");
        assert_eq!(TaskState::Failed.as_label(), "FAILED");
    }

    #[test]
    fn test_error_kind_serde() {
        let kind: TaskErrorKind = serde_json::from_str("\"division_by_zero\"").unwrap();
        assert_eq!(kind, TaskErrorKind::DivisionByZero);
        assert_eq!(
            TaskError::division_by_zero().to_string(),
            "DivisionByZero: division by zero"
        );

        // Expired tasks are revoked, never retried, so there is no kind for them
        assert!(serde_json::from_str::<TaskErrorKind>("\"timeout\"").is_err());
    }
}
