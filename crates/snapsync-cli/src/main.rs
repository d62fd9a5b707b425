use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dotenv::dotenv;
use snapsync_storage::{PgVoteStore, VoteStore};
use snapsync_sync::{SyncConfig, SyncPipeline, WatermarkResolver};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Debug, Parser)]
#[command(name = "snapsync")]
#[command(about = "Incrementally sync Snapshot governance votes into PostgreSQL")]
struct Cli {
    /// Log output format; overrides SNAPSYNC_LOG_FORMAT.
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll the hub until interrupted.
    Run,
    /// Run a single sync cycle and print its summary.
    Once,
    /// Apply the vote table migrations.
    Migrate,
    /// Print the stored watermark and row count.
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

fn log_format_from_env() -> LogFormat {
    match std::env::var("SNAPSYNC_LOG_FORMAT").as_deref() {
        Ok("json") | Ok("JSON") => LogFormat::Json,
        _ => LogFormat::Pretty,
    }
}

/// Install the process-wide subscriber.
fn init_tracing(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn,hyper=warn,reqwest=warn"));

    let fmt_layer = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .try_init()
        .context("installing tracing subscriber")
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_format.unwrap_or_else(log_format_from_env))?;

    let result = run(cli.command.unwrap_or(Commands::Run)).await;
    if let Err(err) = &result {
        let message = format!("{err:#}");
        error!(error = %message, "snapsync exited with error");
    }
    result
}

async fn run(command: Commands) -> Result<()> {
    let config = SyncConfig::from_env().context("loading configuration")?;

    match command {
        Commands::Run => {
            let pipeline = SyncPipeline::from_config(&config).await?;
            info!(
                service_version = env!("CARGO_PKG_VERSION"),
                endpoint = %config.graphql_url,
                policy = ?pipeline.policy(),
                "starting vote sync loop"
            );
            let summary = pipeline.run_forever().await?;
            info!(
                cycles = summary.cycles,
                failed_cycles = summary.failed_cycles,
                inserted = summary.inserted,
                "vote sync loop stopped"
            );
        }
        Commands::Once => {
            let pipeline = SyncPipeline::from_config(&config).await?;
            let summary = pipeline.run_cycle().await?;
            println!(
                "sync complete: cycle_id={} watermark={} fetched={} inserted={} high_water={}",
                summary.cycle_id,
                summary.watermark,
                summary.fetched,
                summary.inserted,
                summary
                    .high_water
                    .map(|h| h.to_string())
                    .unwrap_or_else(|| "-".to_string())
            );
        }
        Commands::Migrate => {
            let store = PgVoteStore::connect(&config.store)
                .await
                .context("connecting to vote store")?;
            store.migrate().await.context("running vote store migrations")?;
            println!("migrations applied");
        }
        Commands::Status => {
            let store: Arc<dyn VoteStore> = Arc::new(
                PgVoteStore::connect(&config.store)
                    .await
                    .context("connecting to vote store")?,
            );
            println!("{}", status_line(store, config.store_timeout).await?);
        }
    }

    Ok(())
}

async fn status_line(store: Arc<dyn VoteStore>, timeout: Duration) -> Result<String> {
    let watermark = WatermarkResolver::new(store.clone(), timeout).resolve().await;
    let count = tokio::time::timeout(timeout, store.count())
        .await
        .context("counting stored votes timed out")?
        .context("counting stored votes")?;
    Ok(format!("watermark={watermark} votes={count}"))
}
