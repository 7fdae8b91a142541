use dockhand::logging;
use dockhand::prelude::*;
use dockhand::tasks;

#[tokio::main]
async fn main() -> DockhandResult<()> {
    // Set DOCKHAND_ENV=local (plus DOCKHAND_CALLER_ARN) for per-developer queues.
    let mut config = DockhandConfig {
        env: "dev".to_string(),
        ..DockhandConfig::development()
    }
    .apply_env()?;
    config.queues = tasks::demo_bindings();
    logging::init(&config.logging)?;

    let mut registry = TaskRegistry::new();
    tasks::register_demo_tasks(&mut registry);

    let dockhand = Dockhand::new(config, registry)?;
    dockhand.start().await?;

    println!("🔨 Dockhand is working! Press Ctrl+C to stop...");
    dockhand.wait_for_shutdown().await?;

    println!("🔨 Dockhand stopped");
    Ok(())
}
