//! Operator CLI (spec §0.1, §6): a thin `clap` front end over the
//! `Trigger` interface, for manually firing jobs and inspecting state
//! without going through the scheduler loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use openthreat::config::OpenThreatConfig;
use openthreat::db;
use openthreat::llm::OllamaGenerator;
use openthreat::pipeline::build_job_registry;
use openthreat::scheduler::Scheduler;
use openthreat::store::Store;
use openthreat::trigger::Trigger;
use openthreat::worker::{WorkerPool, WorkerPoolConfig, WorkerRetryPolicy};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "openthreatctl", author, version, about = "Operator CLI for the openthreat catalog")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enqueue a named job immediately.
    Enqueue { job: String },
    /// Show the status of a previously enqueued task.
    Status { task_id: Uuid },
    /// List worker pool occupancy.
    ListWorkers,
    /// List every scheduled job and its next fire time.
    ListJobs,
    /// Run pending database migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let cfg = OpenThreatConfig::load().context("loading configuration")?;

    if matches!(cli.command, Command::Migrate) {
        db::connect_and_migrate(&cfg).await.context("running migrations")?;
        println!("migrations applied");
        return Ok(());
    }

    let store = db::connect_and_migrate(&cfg).await.context("connecting to database")?;
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
    let scheduler = Arc::new(Scheduler::bootstrap(store.clone(), false).await.context("bootstrapping scheduler")?);

    let generator = if cfg.llm.enabled {
        Some(Arc::new(OllamaGenerator::new(cfg.llm.ollama_host.clone(), cfg.llm.ollama_model.clone())) as Arc<dyn openthreat::llm::Generator>)
    } else {
        None
    };
    let builders = build_job_registry(&cfg, store.clone(), generator);
    let trigger = Trigger::new(pool, scheduler, builders);

    match cli.command {
        Command::Enqueue { job } => {
            let task_id = trigger.enqueue_job(&job).await?;
            println!("enqueued {job} as {task_id}, waiting for completion...");
            loop {
                tokio::time::sleep(Duration::from_millis(200)).await;
                let Some(status) = trigger.get_task_status(task_id).await else {
                    break;
                };
                use openthreat::worker::TaskState;
                if matches!(status.state, TaskState::Success | TaskState::Failure) {
                    println!("{:?}", status);
                    break;
                }
            }
        }
        Command::Status { task_id } => match trigger.get_task_status(task_id).await {
            Some(status) => println!("{:?}", status),
            None => println!("no task found with id {task_id}"),
        },
        Command::ListWorkers => {
            for (name, snapshot) in trigger.list_workers().await {
                println!("{name}: active={} registered={}", snapshot.active_tasks, snapshot.registered_tasks);
            }
        }
        Command::ListJobs => {
            for job in trigger.list_scheduled_jobs().await {
                println!("{}: next_fire_utc={} last_result={:?}", job.name, job.next_fire_utc, job.last_result);
            }
        }
        Command::Migrate => unreachable!("handled above"),
    }

    Ok(())
}
