use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rentrack_storage::SqliteStore;
use rentrack_sync::{Pipeline, PipelineConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rentrack-cli")]
#[command(about = "Rental listing tracker command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the database schema if it is missing.
    Migrate,
    /// Append a JSON batch of raw listings to the bronze table.
    Ingest {
        file: PathBuf,
        /// Run the pipeline right after ingesting.
        #[arg(long)]
        promote: bool,
    },
    /// Promote the latest capture to silver, rebuild gold and write reports.
    Promote,
    /// Print new and re-priced listings between two capture dates.
    Changes {
        #[arg(long, conflicts_with_all = ["from", "to"])]
        as_of: Option<NaiveDate>,
        #[arg(long, requires = "to")]
        from: Option<NaiveDate>,
        #[arg(long, requires = "from")]
        to: Option<NaiveDate>,
    },
    /// Count listings on the latest date that were absent the day before.
    NewListings,
    Serve,
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .context("building log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|err| anyhow::anyhow!("installing tracing subscriber: {err}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Promote) {
        Commands::Migrate => {
            SqliteStore::open(&config.db_path).await?;
            println!("schema ready: {}", config.db_path.display());
        }
        Commands::Ingest { file, promote } => {
            let pipeline = Pipeline::open(config).await?;
            let inserted = pipeline.ingest_file(&file).await?;
            println!("ingested {inserted} raw listings from {}", file.display());
            if promote {
                print_run(&pipeline).await?;
            }
        }
        Commands::Promote => {
            let pipeline = Pipeline::open(config).await?;
            print_run(&pipeline).await?;
        }
        Commands::Changes { as_of, from, to } => {
            let store = SqliteStore::open(&config.db_path).await?;
            let report = match (from, to) {
                (Some(from), Some(to)) => rentrack_sync::delta_between(&store, from, to).await?,
                _ => rentrack_sync::delta_as_of(&store, as_of).await?,
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("serializing delta report")?
            );
        }
        Commands::NewListings => {
            let store = SqliteStore::open(&config.db_path).await?;
            let count = rentrack_sync::count_new_listings(&store).await?;
            println!(
                "{} new listings on {} since {}",
                count.new_listings, count.latest_date, count.previous_date
            );
        }
        Commands::Serve => {
            rentrack_web::serve_from_env().await?;
        }
    }

    Ok(())
}

async fn print_run(pipeline: &Pipeline) -> Result<()> {
    let summary = pipeline.run_once().await?;
    let inserted = summary.silver.as_ref().map_or(0, |s| s.inserted);
    println!(
        "run complete: run_id={} date={} silver_rows={} gold_rows={} reports={}",
        summary.run_id, summary.report_date, inserted, summary.gold.rows_written, summary.reports_dir
    );
    Ok(())
}
