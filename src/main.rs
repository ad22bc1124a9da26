use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use uuid::Uuid;

use cortex::config::CortexConfig;
use cortex::engine::Scheduler;
use cortex::store::{InMemoryTaskStore, LibSqlTaskStore, TaskStore};
use cortex::task::{TaskContext, TaskPriority, TaskSnapshot};
use cortex::workers::{WorkerRegistry, builtin};

/// How long the demo waits for its tasks to settle.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = CortexConfig::from_env().context("invalid configuration")?;

    // Keep the guard alive so buffered file logs are flushed on exit.
    let (file_layer, _log_guard) = match &config.log_dir {
        Some(dir) => {
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("cortex")
                .filename_suffix("log")
                .build(dir)
                .with_context(|| format!("failed to open log directory {}", dir.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    eprintln!("Cortex v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Mode: {}", config.mode);
    eprintln!("   Dispatch workers: {}", config.dispatch_workers);

    // ── Store ────────────────────────────────────────────────────────────
    let store: Arc<dyn TaskStore> = match &config.db_path {
        Some(path) => {
            eprintln!("   Database: {}", path.display());
            Arc::new(
                LibSqlTaskStore::new_local(path)
                    .await
                    .with_context(|| format!("failed to open database at {}", path.display()))?,
            )
        }
        None => {
            eprintln!("   Database: in-memory");
            Arc::new(InMemoryTaskStore::new())
        }
    };

    // ── Workers ──────────────────────────────────────────────────────────
    let registry = Arc::new(WorkerRegistry::new());
    let loaded = builtin::install(&registry, config.mode).await;
    eprintln!("   Workers: {loaded} registered\n");

    // ── Scheduler ────────────────────────────────────────────────────────
    let mode = config.mode;
    let scheduler = Scheduler::new(config, store, Arc::clone(&registry));
    let recovered = scheduler.start().await?;
    if recovered > 0 {
        eprintln!("   Recovered {recovered} unfinished task(s)\n");
    }

    let critical = scheduler
        .submit(
            "Report CRITICAL security fault in the ingress gateway",
            TaskContext::new(mode, "Report CRITICAL security fault in the ingress gateway"),
            TaskPriority::Critical,
            Some("engineer".to_string()),
        )
        .await?;
    let routine = scheduler
        .submit(
            "Compile weekly report",
            TaskContext::new(mode, "Compile weekly report"),
            TaskPriority::Low,
            None,
        )
        .await?;

    let mut results = Vec::new();
    for id in [critical.id, routine.id] {
        results.push(wait_settled(&scheduler, id).await?);
    }

    let health = scheduler.health().await;
    scheduler.stop().await?;

    for snapshot in &results {
        println!("{}", serde_json::to_string_pretty(snapshot)?);
    }
    println!("{}", serde_json::to_string_pretty(&health)?);
    Ok(())
}

/// Poll until the task is terminal or the settle timeout passes.
async fn wait_settled(scheduler: &Scheduler, id: Uuid) -> anyhow::Result<TaskSnapshot> {
    let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
    loop {
        let snapshot = scheduler.get_status(id).await?;
        if snapshot.status.is_terminal() || tokio::time::Instant::now() >= deadline {
            return Ok(snapshot);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
