//! bMINTY command-line tool
//!
//! Imports dataset folders, writes exports and restores snapshots against
//! the database named by the configuration.

use anyhow::{bail, Context};
use async_trait::async_trait;
use bminty_common::{
    config::AppConfig,
    db::DbPool,
    jobs::{JobPhase, PhaseProgress, ProgressSink},
    ExportEngine, ExportRequest, Repository, SnapshotService, VERSION,
};
use bminty_ingestion::{folder, BulkImporter, FolderImporter, ImportLocks, ImportOptions};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bminty", version, about = "bMINTY catalog import, export and restore")]
struct Cli {
    /// Configuration file, instead of config/default + APP__ environment
    #[arg(long, env = "BMINTY_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Import dataset folders
    Import(ImportArgs),
    /// Write an export to a file
    Export(ExportArgs),
    /// Replace the whole database with a snapshot
    Restore(RestoreArgs),
}

#[derive(Args)]
struct ImportArgs {
    /// Dataset folders to import
    folders: Vec<PathBuf>,

    /// Import every subfolder of this directory
    #[arg(long, conflicts_with = "folders")]
    data_root: Option<PathBuf>,

    #[arg(long)]
    omit_zero_signals: bool,

    #[arg(long)]
    deduplicate_intervals: bool,

    #[arg(long)]
    ignore_row_errors: bool,

    #[arg(long)]
    ignore_optional_type_errors: bool,
}

#[derive(Args)]
struct ExportArgs {
    /// sqlite, zip, csv or full
    #[arg(long, default_value = "sqlite")]
    format: String,

    /// Table for csv exports
    #[arg(long)]
    table: Option<String>,

    #[arg(long)]
    ro_crate: bool,

    /// Filter as key=value; repeat for multiple values
    #[arg(long = "filter", value_name = "KEY=VALUE")]
    filters: Vec<String>,

    #[arg(long)]
    out: PathBuf,
}

#[derive(Args)]
struct RestoreArgs {
    snapshot: PathBuf,

    /// Skip the backup of the current database
    #[arg(long)]
    no_backup: bool,

    /// Confirm that every row will be replaced
    #[arg(long)]
    yes: bool,
}

/// Logs phase changes and progress
struct LogProgress;

#[async_trait]
impl ProgressSink for LogProgress {
    async fn phase(&self, phase: JobPhase, message: String) {
        info!(step = phase.step(), phase = ?phase, "{}", message);
    }

    async fn progress(&self, phase: JobPhase, progress: PhaseProgress) {
        info!(
            phase = ?phase,
            processed = progress.processed,
            total = progress.total,
            skipped = progress.skipped,
            "Progress"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Load configuration
    let config = match &cli.config {
        Some(path) => AppConfig::from_file(path),
        None => AppConfig::load(),
    }
    .context("failed to load configuration")?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if config.observability.json_logging {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("bMINTY tool v{}", VERSION);

    let pool = DbPool::new(&config.database).await?;

    let outcome = match cli.command {
        Command::Import(args) => import(&config, pool.clone(), args).await,
        Command::Export(args) => export(&config, pool.clone(), args).await,
        Command::Restore(args) => restore(&config, pool.clone(), args).await,
    };

    pool.close().await;
    outcome
}

async fn import(config: &AppConfig, pool: DbPool, args: ImportArgs) -> anyhow::Result<()> {
    let folders = match &args.data_root {
        Some(root) => folder::discover(root)?,
        None => args.folders,
    };
    if folders.is_empty() {
        bail!("no dataset folders given");
    }

    let options = ImportOptions {
        omit_zero_signals: args.omit_zero_signals,
        ignore_optional_type_errors: args.ignore_optional_type_errors,
        ignore_row_errors: args.ignore_row_errors,
        deduplicate_intervals: args.deduplicate_intervals,
    };
    let importer = FolderImporter::new(BulkImporter::new(
        Repository::new(pool),
        ImportLocks::new(),
        &config.import,
    ));

    let mut failed = 0;
    for path in &folders {
        match importer.import_folder(path, options, &LogProgress).await {
            Ok(Some(outcome)) => println!("{}", serde_json::to_string_pretty(&outcome)?),
            Ok(None) => warn!(folder = %path.display(), "Skipped"),
            Err(e) => {
                error!(folder = %path.display(), error = %e, "Folder import failed");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} folders failed", failed, folders.len());
    }
    Ok(())
}

async fn export(config: &AppConfig, pool: DbPool, args: ExportArgs) -> anyhow::Result<()> {
    let mut pairs = vec![("export_format".to_string(), args.format)];
    if let Some(table) = args.table {
        pairs.push(("table".to_string(), table));
    }
    if args.ro_crate {
        pairs.push(("ro_crate".to_string(), "true".to_string()));
    }
    for filter in args.filters {
        let Some((key, value)) = filter.split_once('=') else {
            bail!("filter '{}' is not KEY=VALUE", filter);
        };
        pairs.push((key.trim().to_string(), value.trim().to_string()));
    }

    let request = ExportRequest::from_pairs(&pairs)?;
    let engine = ExportEngine::new(pool, config.export_dir());
    let artifact = engine.export(&request).await?;
    let counts = artifact.counts;
    let path = artifact.persist(&args.out).await?;

    info!(path = %path.display(), "Export written");
    println!("{}", serde_json::to_string_pretty(&counts)?);
    Ok(())
}

async fn restore(config: &AppConfig, pool: DbPool, args: RestoreArgs) -> anyhow::Result<()> {
    if !args.yes {
        bail!("restore replaces every row in {}; pass --yes to confirm", config.database.path.display());
    }

    let service = SnapshotService::new(pool, config.backup_dir());
    let report = service.restore(&args.snapshot, !args.no_backup).await?;
    if let Some(backup) = &report.backup_path {
        info!(path = %backup.display(), "Backup written");
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
