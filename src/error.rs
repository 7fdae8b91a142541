//! Error types for Dockhand operations.

use thiserror::Error;

/// Result type used throughout Dockhand.
pub type DockhandResult<T> = Result<T, DockhandError>;

/// Main error type for Dockhand operations.
#[derive(Error, Debug)]
pub enum DockhandError {
    /// A queue name did not have the shape an inverse transform expects
    #[error("Malformed queue name '{name}': {reason}")]
    MalformedName {
        /// The offending name
        name: String,
        /// What was expected
        reason: String,
    },

    /// Two queue bindings route the same task
    #[error("Task '{task_name}' is routed to both '{first}' and '{second}'")]
    DuplicateTaskRoute {
        /// The task bound twice
        task_name: String,
        /// Queue of the first binding
        first: String,
        /// Queue of the second binding
        second: String,
    },

    /// Two queue bindings resolve to the same physical queue
    #[error("Physical queue '{physical_name}' is bound more than once")]
    DuplicateQueue {
        /// The physical queue name
        physical_name: String,
    },

    /// The caller identity needed for local queue names could not be obtained
    #[error("Could not resolve caller identity: {message}")]
    CredentialResolution {
        /// Error message
        message: String,
    },

    /// The queue registry was read before `build` was called
    #[error("Queue registry has not been built")]
    RegistryNotBuilt,

    /// No queue is bound to the task
    #[error("Task '{task_name}' has no queue route")]
    TaskNotRouted {
        /// The unrouted task
        task_name: String,
    },

    /// Message body is larger than the transport accepts, or inflates past
    /// the decoded size limit
    #[error("Message body of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge {
        /// Size in bytes, counted up to one byte past the limit when inflating
        size: usize,
        /// Transport limit in bytes
        limit: usize,
    },

    /// A message body could not be decoded
    #[error("Payload decode error: {message}")]
    PayloadDecode {
        /// Error message
        message: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Transport backend error
    #[error("Transport error: {message}")]
    TransportError {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Error message
        message: String,
    },

    /// The worker is already running
    #[error("Worker is already running")]
    AlreadyRunning,

    /// The worker is not running
    #[error("Worker is not running")]
    NotRunning,

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Filesystem or socket error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Redis connection error
    #[cfg(feature = "redis-queue")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl DockhandError {
    /// Create a new transport error
    pub fn transport<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::TransportError {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Create a malformed name error
    pub fn malformed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error must stop the process before any task is processed.
    pub fn is_fatal_config(&self) -> bool {
        matches!(
            self,
            Self::DuplicateTaskRoute { .. }
                | Self::DuplicateQueue { .. }
                | Self::CredentialResolution { .. }
                | Self::RegistryNotBuilt
                | Self::ConfigError { .. }
        )
    }
}
