use dockhand::logging;
use dockhand::prelude::*;
use dockhand::tasks;
use serde_json::json;
use std::time::Duration;

/// Sends one task of every kind to a worker running in the same process,
/// then shuts it down once they are all settled.
#[tokio::main]
async fn main() -> DockhandResult<()> {
    let mut config = DockhandConfig::development();
    config.env = "dev".to_string();
    config.queues = tasks::demo_bindings();
    config.server.enabled = false;
    logging::init(&config.logging)?;

    let mut registry = TaskRegistry::new();
    tasks::register_demo_tasks(&mut registry);

    let dockhand = Dockhand::new(config, registry)?;
    dockhand.start().await?;

    let sends = [
        ("add", json!({"num1": 2, "num2": 3})),
        ("retry_demo", json!({"num": 5})),
        ("polymorphism_task", json!({"event": {"type": "payment", "event_id": "evt-1"}})),
        ("polymorphism_task", json!({"event": {"type": "refund", "event_id": "evt-2"}})),
        ("queued_task", json!({"job": {"type": "sms_v2", "user_id": "42", "phone_number": "5550100"}})),
    ];

    for (task, args) in sends {
        let task_id = dockhand.send(task, args).await?;
        println!("📥 {} sent as {}", task, task_id);
    }

    let expected = 5;
    loop {
        let Some(stats) = dockhand.worker_stats().await else {
            break;
        };
        if stats.completed + stats.failed >= expected {
            println!("✅ {} completed, {} failed", stats.completed, stats.failed);
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    dockhand.stop().await
}
