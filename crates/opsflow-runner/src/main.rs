//! `opsflow`
//!
//! Runs workflows from the local catalog against a pool of interpreter
//! processes and keeps a history of execution logs.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use opsflow_core::config::{self, Config, DialectKind};
use opsflow_runner::orchestration::{
    EventStatus, ExecutionControl, ExecutionStatus, Orchestrator,
};
use opsflow_runner::pool::ResourcePool;
use opsflow_runner::process::{BulkDelimiter, ProcessHandle};
use opsflow_runner::storage::{
    CredentialStore, Database, FileCredentialStore, LocalStore, WorkflowCatalog,
};
use opsflow_runner::workflow::RuntimeParameters;

#[derive(Parser, Debug)]
#[command(name = "opsflow")]
#[command(version, about = "opsflow - run scripted workflows against many targets")]
struct Args {
    /// Project directory holding `.opsflow/settings.json`
    #[arg(long, env = "OPSFLOW_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    /// Execution log database path
    #[arg(long, env = "OPSFLOW_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Directory of `<id>.toml` workflow definitions
    #[arg(long, env = "OPSFLOW_WORKFLOWS_DIR")]
    workflows_dir: Option<PathBuf>,

    /// TOML file of `[[credential]]` entries
    #[arg(long, env = "OPSFLOW_CREDENTIALS_FILE")]
    credentials_file: Option<PathBuf>,

    /// Interpreter dialect ("powershell" or "posix")
    #[arg(long)]
    dialect: Option<DialectKind>,

    /// Maximum pooled interpreter processes
    #[arg(long)]
    pool_max_size: Option<i64>,

    /// Interpreter processes created at startup
    #[arg(long)]
    pool_preallocated_size: Option<i64>,

    /// Maximum queued acquire requests
    #[arg(long)]
    pool_max_queue_size: Option<i64>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "OPSFLOW_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a workflow. Ctrl+C once cancels, twice kills.
    Run {
        workflow_id: String,

        /// Runtime parameter as `step.name=value`; repeatable.
        #[arg(short, long = "param")]
        params: Vec<String>,
    },
    /// Print a stored execution log.
    Show { execution_id: String },
    /// List recent executions of a workflow.
    History {
        workflow_id: String,

        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// List workflows in the catalog.
    Workflows,
}

fn resolve_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = config::load_config(args.project_dir.as_deref())?;

    if let Some(n) = args.pool_max_size {
        config.pool.max_size = Some(n);
    }
    if let Some(n) = args.pool_preallocated_size {
        config.pool.preallocated_size = Some(n);
    }
    if let Some(n) = args.pool_max_queue_size {
        config.pool.max_queue_size = Some(n);
    }
    if let Some(dialect) = args.dialect {
        config.interpreter.dialect = dialect;
    }
    if let Some(level) = &args.log_level {
        config.log_level.clone_from(level);
    }
    if args.db_path.is_some() {
        config.storage.database_path.clone_from(&args.db_path);
    }
    if args.workflows_dir.is_some() {
        config.storage.workflows_dir.clone_from(&args.workflows_dir);
    }
    if args.credentials_file.is_some() {
        config.storage.credentials_file.clone_from(&args.credentials_file);
    }
    Ok(config)
}

async fn open_store(config: &Config) -> anyhow::Result<LocalStore> {
    let db_path = config
        .storage
        .database_path
        .clone()
        .or_else(config::database_path)
        .context("No database path configured and no config directory found")?;
    let workflows_dir = config
        .storage
        .workflows_dir
        .clone()
        .or_else(config::workflows_dir)
        .context("No workflows directory configured and no config directory found")?;

    info!(path = %db_path.display(), "Opening database");
    let db = Database::open(&db_path).await?;
    Ok(LocalStore::new(WorkflowCatalog::new(workflows_dir), db))
}

#[tokio::main]
#[allow(clippy::print_stdout)]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    let config = resolve_config(&args)?;

    let log_filter = format!("opsflow={0},opsflow_runner={0}", config.log_level);
    opsflow_core::tracing_init::init_tracing(&log_filter, args.log_json);

    let store = open_store(&config).await?;

    match args.command {
        Commands::Run {
            workflow_id,
            params,
        } => run(config, store, &workflow_id, &params).await,
        Commands::Show { execution_id } => {
            let log = store.database().get_execution_log(&execution_id).await?;
            println!("{}", serde_json::to_string_pretty(&log)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::History { workflow_id, limit } => {
            let rows = store.database().list_executions(&workflow_id, limit).await?;
            for row in rows {
                println!(
                    "{}  {:<18} {}  {}",
                    row.id,
                    row.status,
                    row.started_at,
                    row.error.unwrap_or_default()
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Workflows => {
            for id in store.catalog().list().await? {
                println!("{id}");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[allow(clippy::print_stdout)]
async fn run(
    config: Config,
    store: LocalStore,
    workflow_id: &str,
    params: &[String],
) -> anyhow::Result<ExitCode> {
    let mut runtime = RuntimeParameters::new();
    for assignment in params {
        runtime.parse_assignment(assignment)?;
    }

    let credentials: Arc<dyn CredentialStore> = match &config.storage.credentials_file {
        Some(path) => Arc::new(FileCredentialStore::load(path).await?),
        None => Arc::new(FileCredentialStore::default()),
    };

    let delimiter = match &config.interpreter.delimiter_pattern {
        Some(pattern) => BulkDelimiter::new(pattern)?,
        None => BulkDelimiter::default(),
    };
    let dialect = config.interpreter.dialect.into();
    let pool_config = config.pool.normalize();
    let pool = Arc::new(ResourcePool::new(
        pool_config,
        ProcessHandle::factory(config.interpreter, delimiter),
    )?);

    let orchestrator = Orchestrator::new(Arc::clone(&pool), Arc::new(store), credentials, dialect);

    let mut events = orchestrator.subscribe();
    let event_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match event.status {
                    EventStatus::Execution(status) => info!(
                        execution_id = %event.execution_id,
                        %status,
                        step = ?event.context.current_step,
                        "{}",
                        event.message
                    ),
                    EventStatus::Invocation(status) => info!(
                        execution_id = %event.execution_id,
                        source = event.source.as_deref().unwrap_or_default(),
                        %status,
                        "{}",
                        event.message.trim_end()
                    ),
                },
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "Event listener lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let control = ExecutionControl::new();
    let signal_control = control.clone();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupt received, cancelling after running targets finish (Ctrl+C again to kill)");
        signal_control.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Second interrupt received, killing running targets");
            signal_control.kill();
        }
    });

    let result = orchestrator.execute(workflow_id, &runtime, &control).await;

    signal_task.abort();
    drop(orchestrator);
    if let Err(e) = event_task.await {
        warn!(error = %e, "Event listener task failed");
    }
    pool.dispose().await;

    println!("{}", serde_json::to_string_pretty(&result)?);

    Ok(match result.status {
        ExecutionStatus::Success | ExecutionStatus::Skipped => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}
