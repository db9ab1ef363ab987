//! Daemon entry point (spec §0.1): loads configuration, connects to
//! Postgres, and runs the Scheduler against the Worker pool until killed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use openthreat::config::OpenThreatConfig;
use openthreat::llm::OllamaGenerator;
use openthreat::pipeline::build_job_registry;
use openthreat::scheduler::Scheduler;
use openthreat::store::Store;
use openthreat::worker::{WorkerPool, WorkerPoolConfig, WorkerRetryPolicy};
use openthreat::{db, observability};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cfg = OpenThreatConfig::load().context("loading configuration")?;
    let store = db::connect_and_migrate(&cfg).await.context("connecting to database")?;
    let monitor_pool = store.pool().clone();
    let store: Arc<dyn Store> = Arc::new(store);

    let pool_config = WorkerPoolConfig {
        concurrency: cfg.worker.concurrency,
        soft_timeout: cfg.worker.soft_timeout,
        hard_timeout: cfg.worker.hard_timeout,
        retry: WorkerRetryPolicy {
            max_attempts: cfg.worker.max_retries,
            ..WorkerRetryPolicy::default()
        },
    };
    let (pool, _dispatcher) = WorkerPool::spawn(pool_config);

    let generator = if cfg.llm.enabled {
        Some(Arc::new(OllamaGenerator::new(cfg.llm.ollama_host.clone(), cfg.llm.ollama_model.clone())) as Arc<dyn openthreat::llm::Generator>)
    } else {
        None
    };

    let builders = build_job_registry(&cfg, store.clone(), generator);
    tracing::info!(jobs = builders.len(), "openthreatd starting");

    tokio::spawn(observability::memory_monitor_task(monitor_pool, Duration::from_secs(30)));

    let scheduler = Arc::new(
        Scheduler::bootstrap(store.clone(), cfg.scheduler.run_missed_on_startup)
            .await
            .context("bootstrapping scheduler")?,
    );

    let shutdown_pool = pool.clone();
    if cfg.scheduler.enabled {
        tokio::select! {
            _ = scheduler.run(pool, cfg.scheduler.tick_interval, builders) => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received, cancelling running jobs");
                shutdown_pool.cancel_all().await;
            }
        }
    } else {
        tracing::warn!("scheduler disabled via config, idling");
        tokio::select! {
            _ = std::future::pending::<()>() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
            }
        }
    }

    Ok(())
}
