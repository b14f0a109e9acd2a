//! digestline CLI
//!
//! Local execution entry point. Storage is the `--storage-dir` directory
//! unless the `s3` feature is enabled and `DIGESTLINE_S3_BUCKET` is set.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use digestline::{
    error::Result,
    models::{Config, StageId},
    pipeline::Orchestrator,
    storage::{BlobStore, LocalBlobStore},
};

/// digestline - social links to scored digests
#[derive(Parser, Debug)]
#[command(
    name = "digestline",
    version,
    about = "Resumable pipeline: collect posts, fetch articles, evaluate, report"
)]
struct Cli {
    /// Path to storage directory
    #[arg(short, long, default_value = "storage")]
    storage_dir: PathBuf,

    /// Path to config file (default: {storage_dir}/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one stage
    Run {
        /// collect, fetch, evaluate or report
        stage: StageId,

        /// Partition date (default: today, UTC)
        #[arg(long)]
        partition: Option<NaiveDate>,
    },

    /// Run all stages in order, stopping at the first abort
    RunAll {
        #[arg(long)]
        partition: Option<NaiveDate>,
    },

    /// Show item counts per stage
    Status {
        #[arg(long)]
        partition: Option<NaiveDate>,
    },

    /// List committed items of a stage
    List {
        stage: StageId,

        #[arg(long)]
        partition: Option<NaiveDate>,

        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Remove a stage partition so it is processed again
    Clean {
        stage: StageId,

        #[arg(long)]
        partition: Option<NaiveDate>,

        /// Actually delete; without it only the item count is shown
        #[arg(long)]
        yes: bool,
    },

    /// Make one item eligible for processing again
    Retry {
        stage: StageId,

        key: String,

        /// Partition of the item (default: where it was last seen)
        #[arg(long)]
        partition: Option<NaiveDate>,
    },

    /// Write a Parquet snapshot of a stage
    #[cfg(feature = "export")]
    Export {
        stage: StageId,

        /// Last day of the window (default: today, UTC)
        #[arg(long)]
        run_date: Option<NaiveDate>,

        /// Window length in days (default: export.days from config)
        #[arg(long)]
        days: Option<u32>,
    },

    /// Validate configuration
    Validate,
}

/// Initialize logging based on verbosity flags.
fn init_logging(verbose: bool, quiet: bool) {
    let level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

#[cfg(feature = "s3")]
async fn open_storage(storage_dir: &Path) -> Result<Arc<dyn BlobStore>> {
    if std::env::var("DIGESTLINE_S3_BUCKET").is_ok() {
        let store = digestline::storage::s3::S3BlobStore::from_env().await?;
        return Ok(Arc::new(store));
    }
    Ok(Arc::new(LocalBlobStore::new(storage_dir)))
}

#[cfg(not(feature = "s3"))]
async fn open_storage(storage_dir: &Path) -> Result<Arc<dyn BlobStore>> {
    Ok(Arc::new(LocalBlobStore::new(storage_dir)))
}

/// Stop dispatching new units on Ctrl-C; in-flight results are still committed.
fn install_cancel_handler(orchestrator: &Orchestrator) {
    let cancel = orchestrator.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupt received, finishing in-flight work...");
            cancel.store(true, Ordering::SeqCst);
        }
    });
}

fn validate(config: &Config) -> Result<()> {
    log::info!("Validating configuration...");
    if let Err(e) = config.validate() {
        log::error!("Config validation failed: {}", e);
        return Err(e);
    }
    if std::env::var("ANTHROPIC_API_KEY").is_err() {
        log::warn!("ANTHROPIC_API_KEY is not set; the evaluate stage will abort");
    }
    log::info!("Config OK");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| cli.storage_dir.join("config.toml"));
    let config = Config::load_or_default(&config_path);
    log::debug!("Configuration from {}", config_path.display());

    if matches!(cli.command, Command::Validate) {
        return validate(&config);
    }

    let blobs = open_storage(&cli.storage_dir).await?;
    let orchestrator = Orchestrator::from_config(config, blobs)?;
    install_cancel_handler(&orchestrator);

    match cli.command {
        Command::Run { stage, partition } => {
            let report = orchestrator
                .run_stage(stage, partition.unwrap_or_else(today))
                .await?;
            log::info!("{}", report);
        }

        Command::RunAll { partition } => {
            let partition = partition.unwrap_or_else(today);
            let reports = orchestrator.run_pipeline(partition, &StageId::ALL).await?;
            for report in &reports {
                log::info!("{}", report);
            }
            log::info!("Pipeline complete for {}", partition);
        }

        Command::Status { partition } => {
            let partition = partition.unwrap_or_else(today);
            println!("Partition {partition}");
            println!(
                "{:<10} {:>6} {:>8} {:>10} {:>10} {:>10} {:>8}",
                "stage", "total", "success", "transient", "permanent", "malformed", "pending"
            );
            for status in orchestrator.status(partition).await? {
                println!(
                    "{:<10} {:>6} {:>8} {:>10} {:>10} {:>10} {:>8}",
                    status.stage.to_string(),
                    status.total,
                    status.success,
                    status.transient_failure,
                    status.permanent_failure,
                    status.malformed,
                    status.registry.pending
                );
            }
        }

        Command::List {
            stage,
            partition,
            limit,
        } => {
            let partition = partition.unwrap_or_else(today);
            let items = orchestrator.list(stage, partition, limit).await?;
            if items.is_empty() {
                println!("No {stage} items for {partition}");
            }
            for item in items {
                let meta = &item.metadata;
                let status = match &meta.error {
                    None => "success".to_string(),
                    Some(f) => format!("{:?}:{}", f.class, f.kind).to_lowercase(),
                };
                println!("{:<28} {:<24} {}", meta.key, status, meta.identity);
            }
        }

        Command::Clean {
            stage,
            partition,
            yes,
        } => {
            let partition = partition.unwrap_or_else(today);
            if !yes {
                let keys = orchestrator.store().list_keys(stage, partition).await?;
                log::warn!(
                    "Would remove {} {} items for {}; pass --yes to delete",
                    keys.len(),
                    stage,
                    partition
                );
                return Ok(());
            }
            let summary = orchestrator.clean(stage, partition).await?;
            log::info!(
                "removed={} forgotten={}",
                summary.removed,
                summary.forgotten
            );
        }

        Command::Retry {
            stage,
            key,
            partition,
        } => {
            let summary = orchestrator.retry(stage, &key, partition).await?;
            log::info!(
                "Key {} in {} is pending again (item removed: {})",
                key,
                summary.partition,
                summary.removed_item
            );
        }

        #[cfg(feature = "export")]
        Command::Export {
            stage,
            run_date,
            days,
        } => {
            let summary = orchestrator
                .export(stage, run_date.unwrap_or_else(today), days)
                .await?;
            log::info!("rows={} file={}", summary.rows, summary.location);
        }

        Command::Validate => validate(orchestrator.config())?,
    }

    Ok(())
}
