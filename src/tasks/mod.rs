//! Demo tasks and their queue bindings.
//!
//! ```rust
//! use dockhand::core::TaskRegistry;
//! use dockhand::tasks;
//!
//! let mut registry = TaskRegistry::new();
//! tasks::register_demo_tasks(&mut registry);
//! assert_eq!(registry.len(), tasks::demo_bindings().len());
//! ```

use crate::core::registry::TaskRegistry;
use crate::queue::registry::QueueBinding;

pub mod arithmetic;
pub mod events;
pub mod jobs;

pub use arithmetic::{Add, RetryDemo};
pub use events::{Event, PolymorphismTask};
pub use jobs::{QueuedJob, QueuedTask, SmsV2};

/// Register every demo task.
pub fn register_demo_tasks(registry: &mut TaskRegistry) -> &mut TaskRegistry {
    registry
        .register::<Add>()
        .register::<RetryDemo>()
        .register::<PolymorphismTask>()
        .register::<QueuedTask>()
}

/// One queue per demo task.
pub fn demo_bindings() -> Vec<QueueBinding> {
    vec![
        QueueBinding::new("retry-demo", "retry_demo"),
        QueueBinding::new("add", "add"),
        QueueBinding::new("polymorphism-demo", "polymorphism_task"),
        QueueBinding::new("queued-demo", "queued_task"),
    ]
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::queue::producer::{LegacyJobClient, TaskProducer};
    use crate::queue::registry::RoutingTable;
    use crate::queue::{InMemoryTransport, SharedTransport};
    use crate::task::TaskContext;
    use std::sync::Arc;

    pub(crate) fn ctx_with_transport(transport: SharedTransport) -> TaskContext {
        TaskContext {
            task_id: "demo".into(),
            queue: "test-demo".into(),
            attempt: 0,
            producer: Arc::new(TaskProducer::new(
                Arc::clone(&transport),
                Arc::new(RoutingTable::default()),
            )),
            jobs: Arc::new(LegacyJobClient::new(transport, "test", None)),
        }
    }

    pub(crate) fn ctx() -> TaskContext {
        ctx_with_transport(Arc::new(InMemoryTransport::new()))
    }

    #[test]
    fn test_every_binding_has_a_task() {
        let mut registry = TaskRegistry::new();
        register_demo_tasks(&mut registry);

        for binding in demo_bindings() {
            assert!(registry.is_registered(&binding.task_name), "{}", binding.task_name);
        }
    }
}
