//! segflow – command-line front end over the segmentation service.
//!
//! Startup order:
//! 1. Parse configuration from environment variables.
//! 2. Initialise structured tracing (JSON when `SEGFLOW_LOG_JSON` is set).
//! 3. Validate configuration and create the data directories.
//! 4. Open the SQLite database and run pending migrations.
//! 5. Build the runner and the service, then dispatch the subcommand.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use segflow_core::{Config, NnUnetRunner, SegmentationService, SqliteTaskStore, Task, TaskStore};

#[derive(Parser)]
#[command(name = "segflow", version)]
#[command(about = "Queue, run and inspect volumetric segmentation jobs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a task from a scan, run it and print the finished record.
    Run {
        scan: PathBuf,
        /// Name recorded for the upload; defaults to the scan's file name.
        #[arg(long)]
        name: Option<String>,
    },
    /// Re-queue an existing task and wait for it to finish.
    Start { id: String },
    Status { id: String },
    Result { id: String },
    List {
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 10)]
        page_size: u32,
    },
    Delete {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Resolve an artifact path, optionally as a downsampled preview.
    Artifact {
        id: String,
        /// `original` or `segmentation`, optionally with `.nii` / `.nii.gz`.
        name: String,
        #[arg(long)]
        preview: bool,
        #[arg(long)]
        factor: Option<String>,
    },
    /// Fail tasks left PROCESSING by a process that exited mid-run.
    Recover,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::from_env();

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: SEGFLOW_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    // ── 3. Validation and directories ──────────────────────────────────────────
    cfg.validate().context("invalid configuration")?;
    cfg.ensure_dirs().context("failed to create data directories")?;

    // ── 4. Database ────────────────────────────────────────────────────────────
    let store = Arc::new(SqliteTaskStore::connect(&cfg.database_url).await?);
    info!(database_url = %cfg.database_url, "database ready");

    // ── 5. Service ─────────────────────────────────────────────────────────────
    let runner = Arc::new(NnUnetRunner::from_config(&cfg)?);
    let service = SegmentationService::from_config(&cfg, store, runner);

    match cli.command {
        Command::Run { scan, name } => {
            let filename = match name {
                Some(name) => name,
                None => scan
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .context("scan path has no file name")?,
            };
            let id = service.submit_upload(&filename, &scan).await?;
            info!(task_id = %id, "task submitted");
            let task = wait_for(&service, &id).await?;
            print_json(&task.summary())?;
        }
        Command::Start { id } => {
            service.start(&id).await?;
            let task = wait_for(&service, &id).await?;
            print_json(&task.summary())?;
        }
        Command::Status { id } => print_json(&service.status(&id).await?)?,
        Command::Result { id } => print_json(&service.result(&id).await?)?,
        Command::List { page, page_size } => {
            let (tasks, total) = service.list(page, page_size).await?;
            print_json(&serde_json::json!({
                "page": page,
                "pageSize": page_size,
                "total": total,
                "tasks": tasks.iter().map(Task::summary).collect::<Vec<_>>(),
            }))?;
        }
        Command::Delete { ids } => {
            let deleted = service.batch_delete(&ids).await?;
            print_json(&serde_json::json!({ "deleted": deleted }))?;
        }
        Command::Artifact {
            id,
            name,
            preview,
            factor,
        } => print_json(&service.artifact(&id, &name, preview, factor.as_deref()).await?)?,
        Command::Recover => {
            let failed = service.recover_interrupted().await?;
            print_json(&serde_json::json!({ "failed": failed }))?;
        }
    }

    service.shutdown().await;
    Ok(())
}

/// Poll `id` until it reaches a terminal state, logging progress changes.
/// Ctrl-C abandons the wait and stops the workers.
async fn wait_for<S: TaskStore>(service: &SegmentationService<S>, id: &str) -> anyhow::Result<Task> {
    let poll = async {
        let mut last = None;
        loop {
            let task = service.get(id).await?;
            if task.is_terminal() {
                return anyhow::Ok(task);
            }
            let seen = (task.status, task.progress);
            if last != Some(seen) {
                info!(
                    task_id = %id,
                    status = %task.status,
                    progress = task.progress,
                    message = task.message.as_deref().unwrap_or(""),
                    "task progress"
                );
                last = Some(seen);
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    };

    tokio::select! {
        task = poll => task,
        _ = tokio::signal::ctrl_c() => {
            warn!(task_id = %id, "interrupted; stopping workers");
            service.scheduler().stop();
            anyhow::bail!("interrupted while waiting for task {id}")
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
