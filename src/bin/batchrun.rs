//! batchrun command line
//!
//! Runs an external command once per line of an input file with
//! checkpointing, and inspects or maintains stored runs.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use batchrun::batch::{
    recover_stale_runs, BatchProcessor, CommandProcessor, LinesWorkSource, TimeoutPolicy,
};
use batchrun::checkpoint::{new_run_id, CheckpointStore};
use batchrun::config::{EngineConfig, StoreConfig};
use batchrun::telemetry::{init_logging, LogFormat, ProgressSnapshot, RenderMode};

#[derive(Parser)]
#[command(name = "batchrun")]
#[command(about = "Checkpointed batch execution")]
#[command(version)]
struct Cli {
    /// Checkpoint database URL (sqlite:, postgres:, memory:)
    #[arg(long, global = true, env = "BATCHRUN_DATABASE_URL")]
    database_url: Option<String>,

    /// Console log format (pretty or json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start or resume a run over an input file
    Run {
        /// Logical source identifier
        #[arg(long)]
        source_id: String,

        /// File with one item key per line
        #[arg(long)]
        input: PathBuf,

        /// Run id to start or resume (generated when omitted)
        #[arg(long)]
        run_id: Option<String>,

        /// Items per batch for new runs
        #[arg(long)]
        batch_size: Option<u32>,

        /// Fail instead of resuming an existing run
        #[arg(long)]
        no_resume: bool,

        /// Items processed at the same time within a batch
        #[arg(long)]
        concurrency: Option<usize>,

        /// Per-item timeout in seconds
        #[arg(long)]
        item_timeout: Option<f64>,

        /// Treat item timeouts as fatal
        #[arg(long)]
        timeout_fatal: bool,

        /// Exit code of the command that aborts the run
        #[arg(long)]
        fatal_exit_code: Option<i32>,

        /// Command to run per item; the item key is appended
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// List runs, newest first
    List {
        /// Only runs of this source
        #[arg(long)]
        source_id: Option<String>,

        /// Only running or interrupted runs
        #[arg(long)]
        incomplete: bool,

        /// Maximum number of runs
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show one run with its progress
    Inspect {
        /// Run to show
        run_id: String,
    },

    /// Mark runs whose process died as interrupted
    Recover {
        /// Only runs of this source
        #[arg(long)]
        source_id: Option<String>,

        /// Seconds without a commit before a running run counts as dead
        #[arg(long)]
        stale_after: Option<u64>,
    },

    /// Delete old completed runs
    Archive {
        /// Completed runs to keep per source
        #[arg(long)]
        keep: usize,

        /// Only runs of this source
        #[arg(long)]
        source_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    let mut config = EngineConfig::from_env().context("invalid environment configuration")?;
    if let Some(url) = &cli.database_url {
        config.store = url.parse::<StoreConfig>()?;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    let _log_guard = init_logging(&config.logging)?;

    let store = config
        .store
        .connect()
        .await
        .context("failed to open checkpoint store")?;

    match cli.command {
        Commands::Run {
            source_id,
            input,
            run_id,
            batch_size,
            no_resume,
            concurrency,
            item_timeout,
            timeout_fatal,
            fatal_exit_code,
            command,
        } => {
            let mut processor = CommandProcessor::from_command_line(&command)
                .context("a command to run per item is required")?;
            if let Some(code) = fatal_exit_code {
                processor = processor.with_fatal_exit_code(code);
            }

            let mut engine = BatchProcessor::new()
                .with_batch_size(batch_size.unwrap_or(config.batch_size))
                .with_concurrency(concurrency.unwrap_or(config.concurrency))
                .with_resume(!no_resume)
                .with_progress_callback(|update| {
                    eprintln!("{}", update.snapshot.render(RenderMode::Bar, ""));
                });

            let timeout = match item_timeout {
                Some(secs) => Some(
                    Duration::try_from_secs_f64(secs).context("--item-timeout must be positive")?,
                ),
                None => config.item_timeout,
            };
            if let Some(timeout) = timeout {
                let policy = if timeout_fatal {
                    TimeoutPolicy::Fatal
                } else {
                    config.timeout_policy
                };
                engine = engine.with_item_timeout(timeout, policy);
            }

            let cancel = CancellationToken::new();
            engine = engine.with_cancellation(cancel.clone());
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received; stopping after the current batch");
                    cancel.cancel();
                }
            });

            let run_id = run_id.unwrap_or_else(|| new_run_id(&source_id));
            let source = LinesWorkSource::new(source_id, input);
            let result = engine
                .run(&source, &processor, store.as_ref(), &run_id)
                .await
                .with_context(|| format!("run {} failed", run_id))?;

            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(ExitCode::from(result.exit_code() as u8))
        }

        Commands::List {
            source_id,
            incomplete,
            limit,
        } => {
            let runs = if incomplete {
                let mut runs = store.list_incomplete_runs(source_id.as_deref()).await?;
                if let Some(limit) = limit {
                    runs.truncate(limit);
                }
                runs
            } else {
                store.list_runs(source_id.as_deref(), limit).await?
            };

            for run in &runs {
                let progress = ProgressSnapshot::from_record(run);
                println!(
                    "{}\t{}\t{}\t{}",
                    run.run_id,
                    run.source_id,
                    run.status,
                    progress.render(RenderMode::Percentage, "")
                );
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Inspect { run_id } => {
            let record = store.load_run(&run_id).await?;
            let progress = if record.status.is_terminal() {
                ProgressSnapshot::from_record(&record)
            } else {
                ProgressSnapshot::from_record_now(&record)
            };
            println!("{}", serde_json::to_string_pretty(&record)?);
            println!("{}", progress.render(RenderMode::Text, &record.source_id));
            Ok(ExitCode::SUCCESS)
        }

        Commands::Recover {
            source_id,
            stale_after,
        } => {
            let stale_after = stale_after.map_or(config.stale_after, Duration::from_secs);
            let recovered = recover_stale_runs(store.as_ref(), source_id.as_deref(), stale_after).await?;
            info!(count = recovered.len(), "Recovery finished");
            for run_id in recovered {
                println!("{}", run_id);
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Archive { keep, source_id } => {
            if keep == 0 && source_id.is_none() {
                bail!("refusing to archive every completed run; pass --keep N or --source-id");
            }
            let archived = archive(store, source_id.as_deref(), keep).await?;
            println!("archived {} run(s)", archived);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn archive(
    store: Arc<dyn CheckpointStore>,
    source_id: Option<&str>,
    keep: usize,
) -> Result<u64> {
    let archived = store
        .archive_runs(source_id, keep)
        .await
        .context("failed to archive runs")?;
    info!(archived, keep, "Archived completed runs");
    Ok(archived)
}
