//! In-memory transport.
//!
//! Every queue is a FIFO held in process memory. Fetched messages move to an
//! in-flight table until they are acked; if that does not happen within the
//! visibility timeout they become visible again, as with a real broker.
//! Useful for development, tests and single-process deployments.

use super::{BatchSendResult, DEFAULT_VISIBILITY_TIMEOUT, OutboundMessage, QueueMessage, Transport};
use crate::error::{DockhandError, DockhandResult};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, RwLock};

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    body: String,
    attributes: HashMap<String, String>,
}

#[derive(Debug)]
struct InFlight {
    queue: String,
    message: StoredMessage,
    visible_at: Instant,
}

/// In-memory transport implementation
#[derive(Debug, Clone)]
pub struct InMemoryTransport {
    /// Visible messages per queue
    queues: Arc<RwLock<HashMap<String, VecDeque<StoredMessage>>>>,
    /// Fetched, not yet acked messages by receipt
    in_flight: Arc<RwLock<HashMap<String, InFlight>>>,
    /// Wakes long-polling fetches on send
    arrivals: Arc<Notify>,
    visibility_timeout: Duration,
    max_queue_size: usize,
}

impl InMemoryTransport {
    /// Create a transport with the default one hour visibility timeout and unbounded queues
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_VISIBILITY_TIMEOUT, 0)
    }

    /// Create a transport with custom limits. A `max_queue_size` of 0 means unlimited.
    pub fn with_limits(visibility_timeout: Duration, max_queue_size: usize) -> Self {
        Self {
            queues: Arc::new(RwLock::new(HashMap::new())),
            in_flight: Arc::new(RwLock::new(HashMap::new())),
            arrivals: Arc::new(Notify::new()),
            visibility_timeout,
            max_queue_size,
        }
    }

    /// Make unacked messages visible again once their timeout expired
    async fn process_visibility_timeouts(&self) {
        let now = Instant::now();
        let mut in_flight = self.in_flight.write().await;

        let expired: Vec<String> = in_flight
            .iter()
            .filter(|(_, entry)| now >= entry.visible_at)
            .map(|(receipt, _)| receipt.clone())
            .collect();

        if expired.is_empty() {
            return;
        }

        let mut queues = self.queues.write().await;
        for receipt in expired {
            if let Some(entry) = in_flight.remove(&receipt) {
                tracing::debug!(
                    queue = %entry.queue,
                    message_id = %entry.message.message_id,
                    "Visibility timeout expired, message visible again"
                );
                queues
                    .entry(entry.queue)
                    .or_default()
                    .push_front(entry.message);
            }
        }
        drop(queues);
        self.arrivals.notify_waiters();
    }

    // Lock order is always in_flight before queues.
    async fn take_visible(&self, queue: &str, max: usize) -> Vec<QueueMessage> {
        let mut in_flight = self.in_flight.write().await;
        let mut queues = self.queues.write().await;
        let Some(pending) = queues.get_mut(queue) else {
            return Vec::new();
        };

        let count = max.min(pending.len());
        if count == 0 {
            return Vec::new();
        }

        let visible_at = Instant::now() + self.visibility_timeout;
        let mut batch = Vec::with_capacity(count);

        for message in pending.drain(..count) {
            let receipt = uuid::Uuid::new_v4().to_string();
            batch.push(QueueMessage {
                message_id: message.message_id.clone(),
                receipt: receipt.clone(),
                body: message.body.clone(),
                attributes: message.attributes.clone(),
            });
            in_flight.insert(
                receipt,
                InFlight {
                    queue: queue.to_string(),
                    message,
                    visible_at,
                },
            );
        }

        batch
    }

    async fn push(&self, queue: &str, message: StoredMessage) -> DockhandResult<()> {
        let mut queues = self.queues.write().await;
        let pending = queues.entry(queue.to_string()).or_default();

        if self.max_queue_size > 0 && pending.len() >= self.max_queue_size {
            return Err(DockhandError::TransportError {
                message: format!(
                    "Queue '{}' is full (max size: {})",
                    queue, self.max_queue_size
                ),
                source: None,
            });
        }

        pending.push_back(message);
        Ok(())
    }

    /// Number of visible messages in `queue`.
    pub async fn pending_len(&self, queue: &str) -> usize {
        let queues = self.queues.read().await;
        queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Number of fetched, unacked messages across all queues.
    pub async fn in_flight_len(&self) -> usize {
        self.in_flight.read().await.len()
    }

    /// Copy of the visible messages in `queue`, without fetching them.
    pub async fn peek(&self, queue: &str) -> Vec<QueueMessage> {
        let queues = self.queues.read().await;
        queues
            .get(queue)
            .map(|pending| {
                pending
                    .iter()
                    .map(|m| QueueMessage {
                        message_id: m.message_id.clone(),
                        receipt: String::new(),
                        body: m.body.clone(),
                        attributes: m.attributes.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop every message of every queue, returning how many were removed.
    pub async fn purge(&self) -> u64 {
        let mut in_flight = self.in_flight.write().await;
        let mut queues = self.queues.write().await;
        let purged = queues.values().map(VecDeque::len).sum::<usize>() + in_flight.len();
        queues.clear();
        in_flight.clear();
        tracing::warn!("Purged {} messages from in-memory transport", purged);
        purged as u64
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn fetch_batch(
        &self,
        queue: &str,
        max: usize,
        wait: Duration,
    ) -> DockhandResult<Vec<QueueMessage>> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + wait;
        loop {
            // Register interest before checking so a send in between is not missed.
            let notified = self.arrivals.notified();

            self.process_visibility_timeouts().await;
            let batch = self.take_visible(queue, max).await;
            if !batch.is_empty() {
                tracing::debug!(queue, count = batch.len(), "Fetched messages");
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn send_message(
        &self,
        queue: &str,
        body: String,
        attributes: HashMap<String, String>,
    ) -> DockhandResult<String> {
        let message_id = uuid::Uuid::new_v4().to_string();
        self.push(
            queue,
            StoredMessage {
                message_id: message_id.clone(),
                body,
                attributes,
            },
        )
        .await?;
        self.arrivals.notify_waiters();

        tracing::debug!(queue, %message_id, "Message sent");
        Ok(message_id)
    }

    async fn send_message_batch(
        &self,
        queue: &str,
        entries: Vec<OutboundMessage>,
    ) -> DockhandResult<BatchSendResult> {
        let mut result = BatchSendResult::default();

        for entry in entries {
            let stored = StoredMessage {
                message_id: uuid::Uuid::new_v4().to_string(),
                body: entry.body,
                attributes: entry.attributes,
            };
            match self.push(queue, stored).await {
                Ok(()) => result.successful.push(entry.id),
                Err(e) => result.failed.push((entry.id, e.to_string())),
            }
        }

        self.arrivals.notify_waiters();
        Ok(result)
    }

    async fn ack(&self, queue: &str, receipt: &str) -> DockhandResult<()> {
        let mut in_flight = self.in_flight.write().await;
        match in_flight.remove(receipt) {
            Some(entry) if entry.queue == queue => Ok(()),
            Some(entry) => {
                let owner = entry.queue.clone();
                in_flight.insert(receipt.to_string(), entry);
                Err(DockhandError::TransportError {
                    message: format!("Receipt belongs to queue '{}', not '{}'", owner, queue),
                    source: None,
                })
            }
            None => Err(DockhandError::TransportError {
                message: format!("Unknown or expired receipt for queue '{}'", queue),
                source: None,
            }),
        }
    }

    async fn health_check(&self) -> DockhandResult<()> {
        let pending: usize = {
            let queues = self.queues.read().await;
            queues.values().map(VecDeque::len).sum()
        };
        let in_flight = self.in_flight_len().await;

        tracing::debug!(
            "Transport health check: {} pending, {} in flight",
            pending,
            in_flight
        );

        Ok(())
    }

    fn visibility_timeout(&self) -> Option<Duration> {
        Some(self.visibility_timeout)
    }
}
