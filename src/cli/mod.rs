//! CLI commands implementation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use console::style;

use crate::batch::CommandBatchRequest;
use crate::config::OrchestratorSettings;
use crate::orchestrator::Orchestrator;
use crate::status::{list_batches, BatchStatus, FsStatusProvider};

#[derive(Parser)]
#[command(name = "batchmill")]
#[command(about = "Batch work orchestration across a hot-swappable endpoint fleet")]
#[command(version)]
pub struct Cli {
    /// Data directory (batch records, logs)
    #[arg(long, global = true, env = "BATCHMILL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Run one batch over a directory of input files and exit
    Run {
        /// Endpoint configuration file (YAML), watched for changes
        #[arg(short, long, env = "BATCHMILL_CONFIG")]
        config: PathBuf,

        /// Fail on any invalid endpoint entry instead of skipping it
        #[arg(long)]
        strict_config: bool,

        /// Directory of input files; one work item per file
        #[arg(short, long)]
        input_dir: PathBuf,

        /// Command template run per item ({input} and {output_dir} expand)
        #[arg(long)]
        command: String,

        /// Language tag attached to every work item (routes to matching
        /// endpoints)
        #[arg(short, long)]
        language: Option<String>,

        /// Concatenate per-item result artifacts after completion
        #[arg(long)]
        combine_results: bool,

        /// Write the run summary to this single path instead of the batch
        /// record
        #[arg(long)]
        run_summary_path: Option<PathBuf>,

        /// Per-item retry budget
        #[arg(long, default_value_t = crate::config::DEFAULT_MAX_RETRIES)]
        max_retries: u32,

        /// Seconds between run-summary writes
        #[arg(long, default_value = "30")]
        summary_interval: u64,

        /// Enable the periodic introspection dump at this many seconds
        #[arg(long)]
        debug_loop_interval: Option<u64>,
    },

    /// Show persisted batch status and summary
    Status {
        /// Batch id; lists all batches when omitted
        batch_id: Option<i64>,
    },
}

fn data_dir(cli_dir: Option<PathBuf>) -> PathBuf {
    cli_dir.unwrap_or_else(|| {
        dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("batchmill")
    })
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let data_dir = data_dir(cli.data_dir.clone());

    match cli.command {
        Commands::Run {
            config,
            strict_config,
            input_dir,
            command,
            language,
            combine_results,
            run_summary_path,
            max_retries,
            summary_interval,
            debug_loop_interval,
        } => {
            run_batch(RunArgs {
                data_dir,
                config,
                strict_config,
                input_dir,
                command,
                language,
                combine_results,
                run_summary_path,
                max_retries,
                summary_interval,
                debug_loop_interval,
            })
            .await
        }
        Commands::Status { batch_id } => show_status(data_dir, batch_id).await,
    }
}

struct RunArgs {
    data_dir: PathBuf,
    config: PathBuf,
    strict_config: bool,
    input_dir: PathBuf,
    command: String,
    language: Option<String>,
    combine_results: bool,
    run_summary_path: Option<PathBuf>,
    max_retries: u32,
    summary_interval: u64,
    debug_loop_interval: Option<u64>,
}

async fn run_batch(args: RunArgs) -> anyhow::Result<()> {
    let provider = Arc::new(
        FsStatusProvider::new(args.data_dir.join("batches"))
            .context("creating batch status store")?,
    );
    let log_folder = args.data_dir.join("logs");
    std::fs::create_dir_all(&log_folder).context("creating log folder")?;

    let batch_id = chrono::Utc::now().timestamp();
    provider
        .create_batch(batch_id)
        .await
        .context("registering batch")?;

    let request = CommandBatchRequest::from_dir(
        batch_id,
        &args.input_dir,
        args.command,
        args.language,
        args.combine_results,
    )
    .with_context(|| format!("reading input directory {}", args.input_dir.display()))?;
    if request.files.is_empty() {
        anyhow::bail!("No input files in {}", args.input_dir.display());
    }
    let total = request.files.len();

    let mut settings = OrchestratorSettings::new(args.config, log_folder);
    settings.strict_config = args.strict_config;
    settings.singleton_run_summary_path = args.run_summary_path;
    settings.max_retries = args.max_retries;
    settings.run_summary_interval = Duration::from_secs(args.summary_interval.max(1));
    settings.debug_loop_interval = args.debug_loop_interval.map(Duration::from_secs);

    let orchestrator = Arc::new(Orchestrator::start(settings, provider.clone()));

    // Translate ctrl-c into an orderly stop; the handler is installed
    // only here, in the supervisor process.
    {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{}", style("Interrupted; stopping batch...").yellow());
                orchestrator.request_stop().await;
            }
        });
    }

    println!(
        "Submitted batch {} ({} item{})",
        style(batch_id).bold(),
        total,
        if total == 1 { "" } else { "s" }
    );

    orchestrator.submit(Arc::new(request));
    orchestrator.submit_stop();
    orchestrator.join().await;

    report_outcome(&provider, batch_id).await
}

async fn report_outcome(provider: &FsStatusProvider, batch_id: i64) -> anyhow::Result<()> {
    let status = provider.read_status(batch_id).await;
    match status {
        Some(BatchStatus::Done) => println!("Batch {}: {}", batch_id, style("done").green()),
        Some(status) => println!("Batch {}: {}", batch_id, style(status).yellow()),
        None => println!("Batch {}: {}", batch_id, style("deleted").red()),
    }

    if let Some(summary) = provider.read_run_summary(batch_id).await {
        let overall = &summary["overall"];
        println!(
            "  {} succeeded, {} failed, {} never attempted (of {})",
            style(&overall["succeeded"]).green(),
            style(&overall["failed"]).red(),
            overall["pending"],
            overall["total"]
        );
    }

    match status {
        Some(BatchStatus::Done) => Ok(()),
        _ => anyhow::bail!("Batch {} did not complete", batch_id),
    }
}

async fn show_status(data_dir: PathBuf, batch_id: Option<i64>) -> anyhow::Result<()> {
    let root = data_dir.join("batches");
    let provider = FsStatusProvider::new(&root).context("opening batch status store")?;

    match batch_id {
        Some(batch_id) => {
            let status = provider
                .read_status(batch_id)
                .await
                .with_context(|| format!("batch {batch_id} not found"))?;
            println!("Batch {}: {}", batch_id, status);
            if let Some(summary) = provider.read_run_summary(batch_id).await {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
        }
        None => {
            let ids = list_batches(&root).context("listing batches")?;
            if ids.is_empty() {
                println!("No batches recorded under {}", root.display());
            }
            for id in ids {
                match provider.read_status(id).await {
                    Some(status) => println!("{id}\t{status}"),
                    None => println!("{id}\t(no status)"),
                }
            }
        }
    }
    Ok(())
}
