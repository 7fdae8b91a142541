//! Polymorphic event processing.
//!
//! Events arrive tagged with their kind:
//!
//! ```json
//! {"event": {"type": "payment", "event_id": "evt-1"}}
//! ```

use crate::task::{DockhandTask, TaskContext, TaskResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// An event to process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A payment went through
    Payment {
        /// Event id
        event_id: String,
    },
    /// A payment was refunded
    Refund {
        /// Event id
        event_id: String,
    },
}

impl Event {
    /// Handle the event and return its id.
    pub fn process(&self) -> &str {
        match self {
            Event::Payment { event_id } => {
                tracing::info!(event_id = %event_id, "Processing payment event");
                event_id
            }
            Event::Refund { event_id } => {
                tracing::info!(event_id = %event_id, "Processing refund event");
                event_id
            }
        }
    }
}

/// `polymorphism_task(event)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolymorphismTask {
    /// The event to process
    pub event: Event,
}

#[async_trait]
impl DockhandTask for PolymorphismTask {
    const NAME: &'static str = "polymorphism_task";
    type Output = String;

    async fn run(self, _ctx: &TaskContext) -> TaskResult<String> {
        Ok(self.event.process().to_string())
    }
}
