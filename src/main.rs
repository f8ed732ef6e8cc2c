use std::path::Path;
use std::sync::Arc;

use agent_jobs::config::HostConfig;
use agent_jobs::queue::{JobEvent, JobQueue, LibSqlJobQueue};
use agent_jobs::services::{PluginHost, ServiceRegistry};
use agent_jobs::tasks::TaskFactory;
use agent_jobs::tasks::builtin::register_builtin_tasks;
use agent_jobs::worker::WorkerPool;
use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = HostConfig::from_env().context("invalid configuration")?;

    eprintln!("Agent Jobs v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path);
    eprintln!("   Agents: {}", config.agents.join(", "));
    eprintln!(
        "   Lease: {}s, poll: {}ms",
        config.queue.lease_duration.as_secs(),
        config.worker.poll_interval.as_millis()
    );
    eprintln!("   Press Ctrl-C to stop.\n");

    // ── Queue ───────────────────────────────────────────────────────────
    let queue: Arc<dyn JobQueue> = Arc::new(
        LibSqlJobQueue::new_local(Path::new(&config.db_path), config.queue.clone())
            .await
            .with_context(|| format!("failed to open job store at {}", config.db_path))?,
    );

    let stats = queue.stats().await?;
    tracing::info!(
        waiting = stats.waiting,
        delayed = stats.delayed,
        active = stats.active,
        "Job store ready"
    );

    // ── Event log ───────────────────────────────────────────────────────
    let mut events = queue.subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(JobEvent::StatusChanged { id, from, to }) => {
                    tracing::debug!(job_id = %id, %from, %to, "Job status changed");
                }
                Ok(event) => tracing::trace!(?event, "Job event"),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event log fell behind");
                }
                Err(RecvError::Closed) => return,
            }
        }
    });

    // ── Tasks and services ──────────────────────────────────────────────
    let factory = Arc::new(TaskFactory::new());
    register_builtin_tasks(&factory).await;
    tracing::info!(tasks = ?factory.names().await, "Tasks registered");

    let plugins = PluginHost::new(Arc::new(ServiceRegistry::new()));

    // ── Workers ─────────────────────────────────────────────────────────
    let pool = WorkerPool::start(
        &config.agents,
        Arc::clone(&queue),
        Arc::clone(&factory),
        config.worker.clone(),
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    eprintln!("\nShutting down, waiting for running jobs to finish...");

    pool.shutdown().await;
    if let Err(e) = plugins.shutdown().await {
        tracing::warn!("Plugin shutdown: {e}");
    }
    event_log.abort();

    Ok(())
}
