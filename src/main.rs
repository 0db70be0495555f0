use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pit_sync::api::CsvSource;
use pit_sync::config::{Config, DEFAULT_CONFIG_PATH};
use pit_sync::database::{MemoryGateway, PersistenceGateway, SqliteGateway};
use pit_sync::executor::RetryingExecutor;
use pit_sync::jobs::builder::csv_sources;
use pit_sync::jobs::build_registry;
use pit_sync::models::{DateRange, UpdateMode};
use pit_sync::orchestrator::{RunParameters, TaskOrchestrator};

/// Point-in-time financial data synchronisation
#[derive(Parser)]
#[command(name = "pit-sync")]
#[command(version)]
#[command(about = "Fetch, reconcile and persist point-in-time financial records")]
#[command(long_about = "
Runs the configured sync jobs under a concurrency limit with retry and backoff.
Multi-source tables are reconciled into a point-in-time ledger so that a query
as of date D never sees a figure announced after D.

Examples:
  pit-sync run --target all --mode incremental --parallel --workers 8
  pit-sync run --target income --mode manual --start 2024-01-01 --end 2024-03-31
  pit-sync status
  pit-sync validate --config staging.toml
")]
struct Cli {
    /// Configuration file
    #[arg(long, short = 'c', global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Debug logging for pit_sync
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one job (with its dependencies) or all jobs
    Run(RunArgs),
    /// Show stored tables and watermarks
    Status,
    /// Check the configuration and job graph without touching the database
    Validate,
}

#[derive(Args)]
struct RunArgs {
    /// Job name, or "all"
    #[arg(long, short = 't', default_value = "all")]
    target: String,

    #[arg(long, short = 'm', value_enum, default_value_t = UpdateMode::Incremental)]
    mode: UpdateMode,

    /// First date for manual mode (YYYY-MM-DD or YYYYMMDD)
    #[arg(long, short = 's')]
    start: Option<String>,

    /// Last date for manual mode (YYYY-MM-DD or YYYYMMDD)
    #[arg(long, short = 'e')]
    end: Option<String>,

    /// Run independent jobs concurrently
    #[arg(long)]
    parallel: bool,

    /// Concurrent jobs with --parallel; defaults to settings.max_concurrency
    #[arg(long, short = 'w')]
    workers: Option<usize>,

    /// Write the JSON execution summary to this file
    #[arg(long)]
    report: Option<PathBuf>,

    /// Exit non-zero when any job was skipped
    #[arg(long)]
    fail_on_skipped: bool,
}

fn parse_date(value: &str, field_name: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%Y%m%d"))
        .map_err(|_| anyhow!("{} must be YYYY-MM-DD or YYYYMMDD, got: {}", field_name, value))
}

fn manual_range(args: &RunArgs) -> Result<Option<DateRange>> {
    match (args.mode, &args.start, &args.end) {
        (UpdateMode::Manual, Some(start), Some(end)) => Ok(Some(DateRange::new(
            parse_date(start, "--start")?,
            parse_date(end, "--end")?,
        ))),
        (UpdateMode::Manual, _, _) => Err(anyhow!("--mode manual requires --start and --end")),
        (_, None, None) => Ok(None),
        (mode, _, _) => {
            warn!("⚠️ --start/--end are ignored in {:?} mode", mode);
            Ok(None)
        }
    }
}

fn concurrency(args: &RunArgs, configured: usize) -> usize {
    match (args.parallel, args.workers) {
        (true, workers) => workers.unwrap_or(configured),
        (false, Some(workers)) => {
            warn!("⚠️ --workers {} is ignored without --parallel; running jobs one at a time", workers);
            1
        }
        (false, None) => 1,
    }
}

async fn run(config: Config, args: RunArgs) -> Result<i32> {
    config.validate()?;
    let params = RunParameters {
        mode: args.mode,
        today: Utc::now().date_naive(),
        manual_range: manual_range(&args)?,
    };

    let gateway: Arc<dyn PersistenceGateway> = Arc::new(
        SqliteGateway::new(&config.settings.database_path)
            .await
            .with_context(|| format!("cannot open database {}", config.settings.database_path.display()))?,
    );
    info!("💾 Database ready at {}", config.settings.database_path.display());

    let registry = build_registry(&config, gateway, &csv_sources(&config)).await?;
    registry.validate()?;
    let jobs = registry.select(&args.target)?;

    let max_concurrency = concurrency(&args, config.settings.max_concurrency);

    let orchestrator = TaskOrchestrator::new(RetryingExecutor::new(config.retry_policy()));
    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let outcome = orchestrator.run_all(jobs, max_concurrency, params).await?;
    println!("{}", outcome.summary.render());

    if let Some(path) = &args.report {
        std::fs::write(path, outcome.summary.to_json()?)
            .with_context(|| format!("cannot write report {}", path.display()))?;
        info!("📝 Report written to {}", path.display());
    }

    Ok(outcome.summary.exit_code(args.fail_on_skipped))
}

async fn status(config: Config) -> Result<i32> {
    let path = &config.settings.database_path;
    if !path.exists() {
        println!("📭 No database at {} yet", path.display());
        return Ok(0);
    }
    let gateway = SqliteGateway::open_read_only(path)
        .await
        .with_context(|| format!("cannot open database {}", path.display()))?;

    println!("📊 TABLES ({})", path.display());
    for (table, rows) in gateway.tables().await? {
        println!("   • {}: {} rows", table, rows);
    }

    println!("\n🕒 WATERMARKS");
    for job in &config.jobs {
        let watermark = gateway.source_watermark(&job.table, &job.source, None).await?;
        println!(
            "   • {} → {}: {}",
            job.name,
            job.table,
            watermark.map_or_else(|| "never synced".to_string(), |d| d.to_string())
        );
    }
    Ok(0)
}

async fn validate(config: Config) -> Result<i32> {
    config.validate()?;
    let registry = build_registry(&config, Arc::new(MemoryGateway::new()), &csv_sources(&config)).await?;
    registry.validate()?;

    for job in &config.jobs {
        let file = CsvSource::new(job.source.clone(), config.settings.data_dir.clone()).file_path(&job.api);
        if !file.exists() {
            warn!("⚠️ {} has no data file at {}", job.name, file.display());
        }
    }

    println!(
        "✅ Configuration valid: {} jobs, {} domains",
        registry.len(),
        config.domains.len()
    );
    Ok(0)
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let config = Config::load(&cli.config)?;
    match cli.command {
        Command::Run(args) => run(config, args).await,
        Command::Status => status(config).await,
        Command::Validate => validate(config).await,
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "pit_sync=debug" } else { "pit_sync=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("❌ {:#}", e);
            eprintln!("❌ Error: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}
