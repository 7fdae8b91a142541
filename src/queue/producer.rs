//! Sending work to queues.
//!
//! [`TaskProducer`] routes task messages by task name through the routing
//! table. [`LegacyJobClient`] feeds the older job queues that use the
//! underscore naming convention.

use crate::error::{DockhandError, DockhandResult};
use crate::queue::codec;
use crate::queue::identity::{LOCAL_ENV, to_legacy_name};
use crate::queue::registry::RoutingTable;
use crate::queue::{BatchSendResult, OutboundMessage, SharedTransport};
use crate::task::{TaskId, TaskMessage};
use std::sync::Arc;

/// Sends task messages to the queue bound to their task.
#[derive(Clone)]
pub struct TaskProducer {
    transport: SharedTransport,
    routing: Arc<RoutingTable>,
}

impl TaskProducer {
    /// Create a producer over a built routing table.
    pub fn new(transport: SharedTransport, routing: Arc<RoutingTable>) -> Self {
        Self { transport, routing }
    }

    /// Enqueue `task_name` with `args` under a fresh id.
    pub async fn send(&self, task_name: &str, args: serde_json::Value) -> DockhandResult<TaskId> {
        self.send_message(TaskMessage::new(task_name, args)).await
    }

    /// Enqueue a prepared message on the queue routing its task.
    pub async fn send_message(&self, message: TaskMessage) -> DockhandResult<TaskId> {
        let queue = self
            .routing
            .physical_name_for(&message.task)
            .ok_or_else(|| DockhandError::TaskNotRouted {
                task_name: message.task.clone(),
            })?
            .to_string();
        self.send_to(&queue, &message).await
    }

    /// Enqueue a message on an explicit queue, bypassing routing.
    pub async fn send_to(&self, queue: &str, message: &TaskMessage) -> DockhandResult<TaskId> {
        let encoded = codec::encode(message)?;
        let message_id = self
            .transport
            .send_message(queue, encoded.body, encoded.attributes)
            .await?;

        tracing::debug!(
            task_id = %message.id,
            task = %message.task,
            queue,
            %message_id,
            "Task message sent"
        );
        Ok(message.id.clone())
    }

    /// Routing table used by this producer.
    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }
}

/// A job for a legacy job queue: a job name plus positional arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyJob {
    /// Job name understood by the legacy consumer
    pub name: String,
    /// Positional arguments
    pub args: Vec<serde_json::Value>,
}

impl LegacyJob {
    /// Create a job.
    pub fn new(name: impl Into<String>, args: Vec<serde_json::Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Wire body: `[name, args, {"_queued_time": unix_seconds}]`.
    fn to_body(&self, queued_at: f64) -> serde_json::Value {
        serde_json::json!([self.name, self.args, {"_queued_time": queued_at}])
    }
}

/// Client for legacy job queues named `{env}_{queue}` or, locally,
/// `{env}_{user}_{queue}`.
#[derive(Clone)]
pub struct LegacyJobClient {
    transport: SharedTransport,
    env: String,
    user: Option<String>,
}

impl LegacyJobClient {
    /// Create a client. `user` is only used in the local environment.
    pub fn new(transport: SharedTransport, env: impl Into<String>, user: Option<String>) -> Self {
        Self {
            transport,
            env: env.into(),
            user,
        }
    }

    /// Full legacy name of `queue`.
    pub fn queue_name(&self, queue: &str) -> String {
        let user = if self.env == LOCAL_ENV {
            self.user.as_deref()
        } else {
            None
        };
        to_legacy_name(queue, &self.env, user)
    }

    /// Queue one job.
    pub async fn queue_job(&self, queue: &str, job: &LegacyJob) -> DockhandResult<String> {
        let queue_name = self.queue_name(queue);
        let encoded = codec::encode(&job.to_body(unix_now()))?;

        match self
            .transport
            .send_message(&queue_name, encoded.body, encoded.attributes)
            .await
        {
            Ok(message_id) => {
                tracing::info!(queue = %queue_name, job = %job.name, %message_id, "Job queued");
                Ok(message_id)
            }
            Err(e) => {
                tracing::error!(queue = %queue_name, job = %job.name, error = %e, "Failed to queue job");
                Err(e)
            }
        }
    }

    /// Queue several jobs in one batch. Entry ids are the job's index.
    pub async fn queue_jobs(&self, queue: &str, jobs: &[LegacyJob]) -> DockhandResult<BatchSendResult> {
        let queue_name = self.queue_name(queue);
        let queued_at = unix_now();

        let entries = jobs
            .iter()
            .enumerate()
            .map(|(i, job)| {
                let encoded = codec::encode(&job.to_body(queued_at))?;
                Ok(OutboundMessage {
                    id: i.to_string(),
                    body: encoded.body,
                    attributes: encoded.attributes,
                })
            })
            .collect::<DockhandResult<Vec<_>>>()?;

        let result = self.transport.send_message_batch(&queue_name, entries).await?;

        if !result.successful.is_empty() {
            tracing::info!(
                queue = %queue_name,
                entries = ?result.successful,
                "Successfully queued jobs"
            );
        }
        for (id, reason) in &result.failed {
            tracing::error!(queue = %queue_name, entry = %id, %reason, "Failed to queue job");
        }

        Ok(result)
    }
}

fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
