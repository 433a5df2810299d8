mod config;
mod http;
#[cfg(test)]
mod test_util;

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use taskrelay_core::{default_executor_registry, failure_detector, recovery, retry, scheduler, worker};
use taskrelay_db::config::DbConfig;
use taskrelay_db::models::{TaskStatus, TaskType};
use taskrelay_db::{pool, queries::tasks as tasks_db};

use config::{ConfigFile, DatabaseSection, MonitoringSection, RetrySection, SchedulerSection, TaskrelayConfig, WorkerSection};

#[derive(Parser)]
#[command(name = "taskrelay", about = "Fault-tolerant distributed task scheduling engine")]
struct Cli {
    /// Database URL (overrides TASKRELAY_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a taskrelay config file (no database required)
    Init {
        #[arg(long, default_value = DbConfig::DEFAULT_URL)]
        db_url: String,
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create and migrate the taskrelay database
    Migrate,
    /// Run recovery, then the scheduler, worker, and failure detector loops
    /// until interrupted, alongside the HTTP API.
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Task management
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Print the aggregate health snapshot and exit
    Health,
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Submit a new task
    Create {
        /// One of: http, shell, dummy
        #[arg(long)]
        r#type: TaskType,
        /// JSON payload for the executor
        #[arg(long)]
        payload: String,
        /// Maximum retry attempts before the task is finalised as failed
        #[arg(long)]
        max_retries: Option<i32>,
    },
    /// Show a task and its attempt history
    Get { id: Uuid },
    /// List tasks, optionally filtered by status/type
    List {
        #[arg(long)]
        status: Option<TaskStatus>,
        #[arg(long = "type")]
        task_type: Option<TaskType>,
        #[arg(long, default_value_t = 1)]
        page: i64,
        #[arg(long, default_value_t = 20)]
        size: i64,
    },
    /// Cancel a pending task
    Cancel { id: Uuid },
}

fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = ConfigFile {
        database: DatabaseSection {
            url: db_url.to_string(),
        },
        scheduler: SchedulerSection::default(),
        worker: WorkerSection::default(),
        retry: RetrySection::default(),
        monitoring: MonitoringSection::default(),
    };
    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: run `taskrelay migrate` to create and migrate the database.");

    Ok(())
}

async fn cmd_migrate(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = TaskrelayConfig::resolve(cli_db_url)?;

    println!("Initializing taskrelay database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    let migrations_path = pool::default_migrations_path();
    pool::run_migrations(&db_pool, migrations_path).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;
    println!("taskrelay migrate complete.");
    Ok(())
}

/// Run recovery once, then the scheduler/worker/failure-detector loops and
/// the HTTP server, all until `Ctrl+C`. Init order -- Store, Recovery,
/// Executor Registry, then the loops -- is explicit here rather than
/// implied by framework wiring.
async fn cmd_serve(cli_db_url: Option<&str>, bind: String, port: u16) -> anyhow::Result<()> {
    let resolved = TaskrelayConfig::resolve(cli_db_url)?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;

    let report = recovery::run(&db_pool).await?;
    tracing::info!(
        reclaimed_tasks = report.reclaimed_tasks,
        cleared_heartbeats = report.cleared_heartbeats,
        "startup recovery complete"
    );

    let registry = default_executor_registry();
    let cancel = CancellationToken::new();
    let retry_config = resolved.retry_config;
    let failure_detector_config = resolved.failure_detector_config;
    let heartbeat_timeout_ms = failure_detector_config.heartbeat_timeout_ms;

    let mut handles = Vec::new();

    if resolved.scheduler_enabled {
        let scheduler_pool = db_pool.clone();
        let scheduler_cancel = cancel.clone();
        let scheduler_config = resolved.scheduler_config;
        handles.push(tokio::spawn(async move {
            scheduler::run(&scheduler_pool, &scheduler_config, scheduler_cancel).await;
        }));
    } else {
        tracing::info!("scheduler loop disabled by config");
    }

    if resolved.worker_enabled {
        let worker_pool = db_pool.clone();
        let worker_cancel = cancel.clone();
        let worker_config = resolved.worker_config;
        let worker_retry_config = retry_config;
        handles.push(tokio::spawn(async move {
            if let Err(e) = worker::run(&worker_pool, &registry, &worker_config, &worker_retry_config, worker_cancel).await {
                tracing::error!(error = %e, "worker loop exited with an error");
            }
        }));
    } else {
        tracing::info!("worker loop disabled by config");
    }

    let fd_pool = db_pool.clone();
    let fd_cancel = cancel.clone();
    let sweep_interval_ms = failure_detector_config.detection_interval_ms;
    handles.push(tokio::spawn(async move {
        failure_detector::run(&fd_pool, &failure_detector_config, fd_cancel).await;
    }));

    // Safety-net sweep for I3: correct any row whose retry_count has raced
    // past max_retries without being caught by the normal failure path. Runs
    // on the same cadence as the failure detector.
    let sweep_pool = db_pool.clone();
    let sweep_cancel = cancel.clone();
    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(sweep_interval_ms));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = retry::process_tasks_exceeding_retry_limit(&sweep_pool, chrono::Utc::now()).await {
                        tracing::error!(error = %e, "retry-limit sweep failed");
                    }
                }
                _ = sweep_cancel.cancelled() => return,
            }
        }
    }));

    let state = http::AppState {
        pool: db_pool.clone(),
        start_time: Arc::new(Instant::now()),
        retry_config,
        heartbeat_timeout_ms,
    };
    let serve_result = http::run_serve(state, &bind, port).await;

    tracing::info!("shutting down, draining in-flight loops");
    cancel.cancel();
    let drain_deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    for mut handle in handles {
        if tokio::time::timeout_at(drain_deadline, &mut handle).await.is_err() {
            tracing::warn!("drain timeout expired, aborting a loop that did not shut down in time");
            handle.abort();
        }
    }
    db_pool.close().await;

    serve_result
}

async fn cmd_task(command: TaskCommands, cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = TaskrelayConfig::resolve(cli_db_url)?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;

    match command {
        TaskCommands::Create { r#type, payload, max_retries } => {
            let payload: serde_json::Value = serde_json::from_str(&payload)?;
            let max_retries = max_retries.unwrap_or(retry::DEFAULT_MAX_RETRIES);
            let task = tasks_db::insert_task(&db_pool, r#type, &payload, chrono::Utc::now(), max_retries).await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        TaskCommands::Get { id } => {
            let task = tasks_db::get_task(&db_pool, id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("task {id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        TaskCommands::List { status, task_type, page, size } => {
            let tasks = tasks_db::list_tasks(&db_pool, status, task_type, page, size).await?;
            println!("{}", serde_json::to_string_pretty(&tasks)?);
        }
        TaskCommands::Cancel { id } => {
            let deleted = tasks_db::delete_task(&db_pool, id).await?;
            if deleted {
                println!("task {id} cancelled");
            } else {
                anyhow::bail!("task {id} not found or not pending");
            }
        }
    }

    db_pool.close().await;
    Ok(())
}

async fn cmd_health(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = TaskrelayConfig::resolve(cli_db_url)?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;

    let counts = taskrelay_core::monitoring::task_counts(&db_pool).await?;
    let consistent = taskrelay_core::monitoring::counts_are_consistent(&db_pool).await?;
    println!(
        "tasks: pending={} running={} success={} failed={} total={}",
        counts.pending, counts.running, counts.success, counts.failed, counts.total
    );
    println!("consistent: {consistent}");

    db_pool.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => cmd_init(&db_url, force)?,
        Commands::Migrate => cmd_migrate(cli.database_url.as_deref()).await?,
        Commands::Serve { bind, port } => cmd_serve(cli.database_url.as_deref(), bind, port).await?,
        Commands::Task { command } => cmd_task(command, cli.database_url.as_deref()).await?,
        Commands::Health => cmd_health(cli.database_url.as_deref()).await?,
    }

    Ok(())
}
