//! overseer - resumable background task execution.
//!
//! Usage:
//!   overseer run <task-type>        Run a callback directly, to completion
//!   overseer tick                   One scheduler pass over due records
//!   overseer list                   List persisted task records
//!   overseer enqueue-backup <site>  Enqueue a one-off backup for a site

use chrono::Utc;
use clap::{Parser, Subcommand};
use overseer::tasks::LogRotateCallback;
use overseer::{
    enqueue_one_off, EnqueueRequest, EventBus, RunContext, RunOnceAction, Runner, SiteId,
    SqliteStore, StateBag, TaskParams, TaskRegistry, TaskStore, TracingHandler,
};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// overseer - resumable background task execution
#[derive(Parser)]
#[command(name = "overseer")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the SQLite task database
    #[arg(short, long, default_value = "overseer.db", global = true)]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a registered callback directly, outside any task record
    Run {
        /// Task type to run
        #[arg(value_name = "TASK_TYPE")]
        task_type: String,

        /// Refresh even when cached information is still fresh
        #[arg(long)]
        force: bool,

        /// Items processed per invocation
        #[arg(long, default_value = "10")]
        batch_size: usize,

        /// Restrict the run to these site ids (repeatable)
        #[arg(long = "id", value_name = "SITE_ID")]
        ids: Vec<i64>,

        /// Extra callback parameter as key=value (repeatable)
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },

    /// One scheduler pass: run every due task record
    Tick {
        /// Maximum records processed in this pass
        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// List persisted task records
    List,

    /// Enqueue a one-off backup for a site
    EnqueueBackup {
        /// Site id
        #[arg(value_name = "SITE_ID")]
        site: i64,

        /// Remote backup profile to run
        #[arg(long, default_value = "1")]
        profile: i64,

        /// Short description for the backup
        #[arg(long)]
        description: Option<String>,

        /// Delete the record after a successful run instead of disabling it
        #[arg(long)]
        delete: bool,

        /// Timezone the one-off schedule is written in
        #[arg(long, default_value = "UTC")]
        timezone: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let store = Arc::new(SqliteStore::new(&cli.db).await?);
    let registry = Arc::new(
        TaskRegistry::builder()
            .register(Arc::new(LogRotateCallback::new()))
            .build()?,
    );

    match cli.command {
        Commands::Run {
            task_type,
            force,
            batch_size,
            ids,
            params,
        } => {
            let runner = Runner::new(registry, store).with_events(event_bus().await);
            let mut task_params = TaskParams::new()
                .with_value("limit", batch_size)
                .with_value("force", force);
            if !ids.is_empty() {
                task_params = task_params.with_value("filter_ids", ids);
            }
            for pair in params {
                let (key, value) = parse_param(&pair)?;
                task_params = task_params.with_value(key, value);
            }

            let mut ctx = RunContext::new().with_params(task_params);
            let mut bag = StateBag::new();
            let status = runner.run_callback(&task_type, &mut ctx, &mut bag).await?;
            info!("run finished with status: {}", status);
            if !status.is_success() {
                std::process::exit(1);
            }
        }
        Commands::Tick { limit } => {
            let runner = Runner::new(registry, store).with_events(event_bus().await);
            let summary = runner.tick(Utc::now(), limit).await?;
            info!(
                "tick done: {} scheduled, {} completed, {} failed, {} skipped",
                summary.scheduled, summary.completed, summary.failed, summary.skipped
            );
            if summary.failed > 0 {
                std::process::exit(1);
            }
        }
        Commands::List => {
            let records = store.list().await?;
            if records.is_empty() {
                println!("No task records.");
                return Ok(());
            }
            println!(
                "{:>6}  {:>6}  {:<18}  {:<14}  {:<8}  {:<20}  {}",
                "id", "site", "type", "status", "enabled", "next run", "schedule"
            );
            for record in records {
                println!(
                    "{:>6}  {:>6}  {:<18}  {:<14}  {:<8}  {:<20}  {}",
                    record.id,
                    record
                        .site_id
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "-".into()),
                    record.task_type,
                    record.last_exit_code.to_string(),
                    if record.enabled { "yes" } else { "no" },
                    record
                        .next_execution
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "-".into()),
                    record.cron_expression,
                );
            }
        }
        Commands::EnqueueBackup {
            site,
            profile,
            description,
            delete,
            timezone,
        } => {
            let mut params = TaskParams::new().with_value("profile_id", profile);
            if let Some(description) = description {
                params = params.with_value("description", description);
            }
            let action = if delete {
                RunOnceAction::Delete
            } else {
                RunOnceAction::Disable
            };

            let request = EnqueueRequest::new(SiteId::new(site), "backup")
                .with_params(params)
                .with_run_once(action);
            let record = enqueue_one_off(store.as_ref(), request, &timezone, Utc::now()).await?;
            info!(
                "enqueued backup task {} for site {}, next run {}",
                record.id,
                site,
                record
                    .next_execution
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".into())
            );
        }
    }

    Ok(())
}

/// Event bus reporting run lifecycle events through tracing.
async fn event_bus() -> Arc<EventBus> {
    let bus = Arc::new(EventBus::new());
    bus.register(Arc::new(TracingHandler)).await;
    bus
}

/// Parse a `key=value` parameter. Values that parse as JSON keep their
/// type; everything else is taken as a string.
fn parse_param(pair: &str) -> Result<(String, Value), Box<dyn std::error::Error>> {
    let (key, value) = pair
        .split_once('=')
        .ok_or_else(|| format!("invalid parameter '{}', expected key=value", pair))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}
