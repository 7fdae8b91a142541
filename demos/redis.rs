use dockhand::core::WorkerContext;
use dockhand::logging;
use dockhand::prelude::*;
use dockhand::queue::RedisTransport;
use dockhand::tasks;
use serde_json::json;
use std::sync::Arc;

#[tokio::main]
async fn main() -> DockhandResult<()> {
    let mut config = DockhandConfig::development();
    config.env = "dev".to_string();
    config.queues = tasks::demo_bindings();
    logging::init(&config.logging)?;

    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    println!("🔗 Connecting to Redis at {}", url);

    let visibility = config.broker.visibility_timeout();
    let transport = RedisTransport::with_options(&url, "dockhand-demo", visibility).await?;
    for queue in ["dev-add", "err-dev-add"] {
        transport.purge(queue).await?;
    }
    println!("🧹 Purged demo queues");

    let mut registry = TaskRegistry::new();
    tasks::register_demo_tasks(&mut registry);

    let context = WorkerContext::builder(config)
        .tasks(registry)
        .transport(Arc::new(transport))
        .build()?;
    let dockhand = Dockhand::with_context(context);
    dockhand.start().await?;

    for (num1, num2) in [(1, 2), (20, 22), (-5, 5)] {
        let task_id = dockhand.send("add", json!({"num1": num1, "num2": num2})).await?;
        println!("📥 add({}, {}) sent as {}", num1, num2, task_id);
    }
    // Exhausts its retries and lands in err-dev-retry-demo.
    dockhand.send("retry_demo", json!({"num": 0})).await?;

    println!("🔨 Press Ctrl+C to stop...");
    dockhand.wait_for_shutdown().await
}
