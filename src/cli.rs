//! Command-line interface for queuectl.
//!
//! Thin layer over [`JobQueue`]: every subcommand opens the queue database,
//! performs one operation and prints a plain-text result.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use crate::executor::ShellExecutor;
use crate::job::{Job, JobId, JobState};
use crate::jobqueue::{EnqueueRequest, JobQueue};
use crate::storage::SqliteStorage;

/// Durable background job queue for shell commands.
#[derive(Parser, Debug)]
#[command(name = "queuectl")]
#[command(about = "A CLI-based background job queue with retries and a dead letter queue")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the queue database (default: ~/.queuectl/queue.db).
    #[arg(long, env = "QUEUECTL_DB", global = true)]
    pub db: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the database and default configuration.
    InitDb,

    /// Add a job, e.g. '{"id": "job1", "command": "sleep 2"}'.
    Enqueue {
        /// JSON object with "id", "command" and optional "max_retries".
        job: String,
    },

    /// List jobs, oldest first.
    List {
        /// Only show jobs in this state.
        #[arg(long)]
        state: Option<JobState>,
    },

    /// Show job counts per state.
    Status,

    /// Manage worker processes.
    #[command(subcommand)]
    Worker(WorkerCommand),

    /// Inspect and retry the dead letter queue.
    #[command(subcommand)]
    Dlq(DlqCommand),

    /// Manage configuration (max_retries, backoff_base).
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Serve the web dashboard.
    Dashboard {
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum WorkerCommand {
    /// Run workers in the foreground until SIGINT/SIGTERM.
    Start {
        #[arg(long, default_value_t = 1)]
        count: usize,

        /// Idle wait between claim attempts.
        #[arg(long, default_value_t = 1000)]
        poll_interval_ms: u64,

        /// Per-command timeout in seconds.
        #[arg(long, default_value_t = ShellExecutor::DEFAULT_TIMEOUT.as_secs())]
        timeout_secs: u64,
    },
}

#[derive(Subcommand, Debug)]
pub enum DlqCommand {
    /// List jobs in the dead letter queue.
    List,
    /// Move a dead job back to pending.
    Retry { id: String },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

pub fn parse_cli() -> Cli {
    Cli::parse()
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let path = database_path(cli.db.clone())?;
    let mut queue = open_queue(&path).await?;

    match cli.command {
        Commands::InitDb => {
            println!("Database and config initialized at: {}", path.display());
        }
        Commands::Enqueue { job } => {
            let request = EnqueueRequest::from_json(&job)?;
            let id = queue.enqueue(request).await?;
            println!("Job '{id}' enqueued with state 'pending'.");
        }
        Commands::List { state } => {
            let jobs = queue.list(state).await?;
            print!("{}", format_jobs(&jobs));
        }
        Commands::Status => {
            let summary = queue.summary().await?;
            for state in JobState::ALL {
                println!("{:<12} {}", state.as_str(), summary.count(state));
            }
            println!("{:<12} {}", "total", summary.total);
        }
        Commands::Worker(WorkerCommand::Start {
            count,
            poll_interval_ms,
            timeout_secs,
        }) => {
            let executor = ShellExecutor::new().with_timeout(Duration::from_secs(timeout_secs));
            queue = queue
                .with_executor(Arc::new(executor))
                .with_poll_interval(Duration::from_millis(poll_interval_ms));

            queue.start(count.max(1));
            info!(workers = queue.worker_count(), "Workers started");
            println!("Started {} worker(s). Press Ctrl+C to stop.", queue.worker_count());

            queue
                .wait_for_shutdown()
                .await
                .context("failed to install signal handlers")?;
        }
        Commands::Dlq(DlqCommand::List) => {
            let jobs = queue.list(Some(JobState::Dead)).await?;
            print!("{}", format_jobs(&jobs));
        }
        Commands::Dlq(DlqCommand::Retry { id }) => {
            queue.retry_from_dlq(&JobId(id.clone())).await?;
            println!("Job '{id}' moved from DLQ to 'pending' state.");
        }
        Commands::Config(ConfigCommand::Set { key, value }) => {
            queue.set_config(&key, &value).await?;
            println!("Config '{key}' set to '{value}'.");
        }
        Commands::Config(ConfigCommand::Get { key }) => match queue.get_config(&key).await? {
            Some(value) => println!("{key} = {value}"),
            None => anyhow::bail!("config '{key}' is not set"),
        },
        Commands::Config(ConfigCommand::List) => {
            for (key, value) in queue.list_config().await? {
                println!("{key} = {value}");
            }
        }
        Commands::Dashboard { bind } => {
            let listener = tokio::net::TcpListener::bind(&bind)
                .await
                .with_context(|| format!("failed to bind dashboard to {bind}"))?;
            info!(address = %bind, "Dashboard listening");
            axum::serve(listener, queue.dashboard()).await?;
        }
    }

    Ok(())
}

fn database_path(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }

    let mut path = dirs::home_dir().context("failed to resolve home directory for the queue database")?;
    path.push(".queuectl");
    path.push("queue.db");
    Ok(path)
}

async fn open_queue(path: &Path) -> anyhow::Result<JobQueue> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create queue directory at {:?}", parent))?;
    }

    let storage = SqliteStorage::open(path)
        .await
        .with_context(|| format!("failed to open queue database at {:?}", path))?;
    let storage = Arc::new(storage);

    Ok(JobQueue::from_parts(storage.clone(), storage))
}

/// Job table with attempts shown as `attempts/max_retries`.
pub fn format_jobs(jobs: &[Job]) -> String {
    if jobs.is_empty() {
        return "No jobs found.\n".to_string();
    }

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<20} {:<25} {:<12} {:<10} {:<20}",
        "ID", "COMMAND", "STATE", "ATTEMPTS", "LAST_UPDATED"
    );
    let _ = writeln!(out, "{}", "-".repeat(87));

    for job in jobs {
        let attempts = format!("{}/{}", job.attempts, job.max_retries);
        let _ = writeln!(
            out,
            "{:<20} {:<25} {:<12} {:<10} {:<20}",
            job.id,
            job.command,
            job.state.as_str(),
            attempts,
            job.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    out
}
