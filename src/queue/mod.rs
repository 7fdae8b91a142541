//! Queue transports, naming, routing and message encoding.
//!
//! Dockhand consumes an external durable queue through the [`Transport`]
//! trait:
//! - **In-Memory**: lightweight, for development, tests and single-process use
//! - **Redis**: distributed lists, for multi-process/multi-server setups
//!
//! # Examples
//!
//! ```rust,no_run
//! use dockhand::queue::{InMemoryTransport, Transport};
//! use std::collections::HashMap;
//! use std::time::Duration;
//!
//! # async fn example() -> dockhand::DockhandResult<()> {
//! let transport = InMemoryTransport::new();
//! transport.send_message("stage-add", "{}".to_string(), HashMap::new()).await?;
//! let batch = transport.fetch_batch("stage-add", 10, Duration::ZERO).await?;
//! assert_eq!(batch.len(), 1);
//! # Ok(())
//! # }
//! ```

use crate::error::DockhandResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub mod codec;
pub mod identity;
pub mod memory;
pub mod producer;
pub mod registry;

pub use memory::InMemoryTransport;

#[cfg(feature = "redis-queue")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
pub mod redis;

#[cfg(feature = "redis-queue")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
pub use redis::RedisTransport;

/// Visibility timeout of transports built without an explicit one.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(3600);

/// A message fetched from a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    /// Transport-assigned message id
    pub message_id: String,
    /// Handle passed back to [`Transport::ack`]
    pub receipt: String,
    /// Raw body
    pub body: String,
    /// Message attributes
    pub attributes: HashMap<String, String>,
}

/// A message to send.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Caller-chosen id, echoed in batch results
    pub id: String,
    /// Raw body
    pub body: String,
    /// Message attributes
    pub attributes: HashMap<String, String>,
}

/// Per-entry outcome of [`Transport::send_message_batch`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSendResult {
    /// Ids of entries accepted by the queue
    pub successful: Vec<String>,
    /// Ids of rejected entries, with the reason
    pub failed: Vec<(String, String)>,
}

/// Trait that all queue transports must implement
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch up to `max` messages from `queue`, waiting at most `wait` for the
    /// first one to arrive. Fetched messages stay invisible until acked.
    async fn fetch_batch(
        &self,
        queue: &str,
        max: usize,
        wait: Duration,
    ) -> DockhandResult<Vec<QueueMessage>>;

    /// Send one message and return its transport id.
    async fn send_message(
        &self,
        queue: &str,
        body: String,
        attributes: HashMap<String, String>,
    ) -> DockhandResult<String>;

    /// Send several messages to one queue.
    async fn send_message_batch(
        &self,
        queue: &str,
        entries: Vec<OutboundMessage>,
    ) -> DockhandResult<BatchSendResult>;

    /// Delete a fetched message for good.
    async fn ack(&self, queue: &str, receipt: &str) -> DockhandResult<()>;

    /// Health check for the transport
    async fn health_check(&self) -> DockhandResult<()>;

    /// How long a fetched, unacked message stays hidden before it is
    /// redelivered. `None` when the queue's own settings decide.
    fn visibility_timeout(&self) -> Option<Duration> {
        None
    }
}

/// Shared transport handle
pub type SharedTransport = Arc<dyn Transport>;

/// Factory methods for creating transports
pub struct TransportFactory;

impl TransportFactory {
    /// Create an in-memory transport
    pub fn in_memory() -> SharedTransport {
        Arc::new(InMemoryTransport::new())
    }

    /// Create an in-memory transport hiding fetched messages for `visibility_timeout`
    pub fn in_memory_with_visibility(visibility_timeout: Duration) -> SharedTransport {
        Arc::new(InMemoryTransport::with_limits(visibility_timeout, 0))
    }

    /// Create a Redis transport
    #[cfg(feature = "redis-queue")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
    pub async fn redis(
        connection_string: &str,
        visibility_timeout: Duration,
    ) -> DockhandResult<SharedTransport> {
        let transport =
            RedisTransport::with_options(connection_string, "dockhand", visibility_timeout).await?;
        Ok(Arc::new(transport))
    }
}
