//! recsys-pipelines
//!
//! - `run`: ingest, compute, validate and publish every day in a range
//! - `import-tags`: load a catalog CSV into the item tag store
//! - `version`
//!
//! Exit codes: 0 success, 1 run failure, 2 usage or config error.

use anyhow::Context;
use artifact_schema::date_start;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use signal_pipelines::adapters::{CsvCatalogReader, FsCheckpoints, FsItemTagStore};
use signal_pipelines::jobs::ImportItemTags;
use signal_pipelines::{Backfill, Clock, Pipeline, PipelineConfig, SystemClock};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_RUN_FAILURE: u8 = 1;
const EXIT_USAGE: u8 = 2;

#[derive(Parser)]
#[command(name = "recsys-pipelines")]
#[command(about = "Offline signal pipelines for the recommendation engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline for each day in [start, end]
    Run(RunArgs),
    /// Import catalog item tags from a CSV file
    ImportTags(ImportTagsArgs),
    /// Print the version
    Version,
}

#[derive(clap::Args)]
struct RunArgs {
    /// JSON config file
    #[arg(long)]
    config: PathBuf,
    #[arg(long)]
    tenant: String,
    #[arg(long)]
    surface: String,
    #[arg(long, default_value = "")]
    segment: String,
    /// First day, YYYY-MM-DD
    #[arg(long, value_parser = parse_day)]
    start: NaiveDate,
    /// Last day (inclusive), YYYY-MM-DD
    #[arg(long, value_parser = parse_day)]
    end: NaiveDate,
    /// Skip days already marked complete in the checkpoint store
    #[arg(long)]
    incremental: bool,
}

#[derive(clap::Args)]
struct ImportTagsArgs {
    #[arg(long)]
    config: PathBuf,
    #[arg(long)]
    tenant: String,
    #[arg(long, default_value = "")]
    namespace: String,
    /// Catalog CSV; defaults to `catalog_csv` from the config
    #[arg(long)]
    csv: Option<PathBuf>,
}

fn parse_day(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| format!("invalid date {:?}, expected YYYY-MM-DD", raw))
}

#[tokio::main]
async fn main() -> ExitCode {
    // clap exits with 2 on usage errors and 0 for help
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Version => {
            println!("recsys-pipelines {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        Commands::Run(args) => {
            let cfg = match PipelineConfig::load(&args.config) {
                Ok(cfg) => cfg,
                Err(err) => {
                    error!(error = %err, config = %args.config.display(), "config load failed");
                    return ExitCode::from(EXIT_USAGE);
                }
            };
            finish(run(cfg, args).await)
        }
        Commands::ImportTags(args) => {
            let cfg = match PipelineConfig::load(&args.config) {
                Ok(cfg) => cfg,
                Err(err) => {
                    error!(error = %err, config = %args.config.display(), "config load failed");
                    return ExitCode::from(EXIT_USAGE);
                }
            };
            let Some(csv) = args.csv.clone().or_else(|| cfg.catalog_path()) else {
                error!("no catalog csv: pass --csv or set catalog_csv");
                return ExitCode::from(EXIT_USAGE);
            };
            finish(import_tags(cfg, args, csv).await)
        }
    }
}

fn finish(result: anyhow::Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{:#}", err), "pipeline failed");
            ExitCode::from(EXIT_RUN_FAILURE)
        }
    }
}

fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling");
            on_signal.cancel();
        }
    });
    cancel
}

async fn run(cfg: PipelineConfig, args: RunArgs) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let pipeline = Pipeline::from_config(&cfg, clock.clone())
        .await
        .context("build pipeline")?;
    let cancel = shutdown_token();

    let mut backfill = Backfill::new(cfg.limits.max_days_backfill, clock);
    if args.incremental {
        backfill = backfill.incremental(FsCheckpoints::new(&cfg.checkpoint_dir));
    }

    let (tenant, surface, segment) = (&args.tenant, &args.surface, &args.segment);
    let days = backfill
        .execute(
            &cancel,
            tenant,
            surface,
            date_start(args.start),
            date_start(args.end),
            |window| {
                let (pipeline, cancel) = (&pipeline, &cancel);
                async move {
                    let outcome = pipeline
                        .run_day(cancel, tenant, surface, segment, window)
                        .await?;
                    info!(
                        tenant = %tenant,
                        surface = %surface,
                        events = outcome.events,
                        artifacts = outcome.manifest.current.len(),
                        "day published"
                    );
                    Ok(())
                }
            },
        )
        .await
        .with_context(|| format!("run {}/{}", tenant, surface))?;

    info!(tenant = %tenant, surface = %surface, days, "run complete");
    Ok(())
}

async fn import_tags(cfg: PipelineConfig, args: ImportTagsArgs, csv: PathBuf) -> anyhow::Result<()> {
    let job = ImportItemTags::new(
        Arc::new(CsvCatalogReader::new(csv)),
        Arc::new(FsItemTagStore::new(PathBuf::from(&cfg.out_dir).join("catalog"))),
        Arc::new(SystemClock),
        cfg.limits.max_distinct_items_per_run,
    );
    let written = job
        .execute(&args.tenant, &args.namespace)
        .await
        .with_context(|| format!("import tags for {}", args.tenant))?;
    info!(tenant = %args.tenant, items = written, "import complete");
    Ok(())
}
