use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use polymarket_pnl_pipeline::{Config, Pipeline, WorkerOutcome};
use rust_decimal::Decimal;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "polymarket-pnl-pipeline")]
#[command(about = "Polymarket trade reconstruction and wallet P&L pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch transfer logs into the raw partitions
    Ingest {
        #[arg(long)]
        to_block: Option<u64>,
    },
    /// Rebuild the canonical trade table from raw transfers
    Reconstruct,
    /// Join trades to markets and resolutions
    Map,
    /// Rebuild wallet and wallet/category P&L
    Aggregate,
    /// Ingest, then rebuild every derived table
    Run {
        #[arg(long)]
        to_block: Option<u64>,
    },
    /// Checkpoint progress and table sizes
    Status,
    /// Transfer and trade completeness report for one wallet
    Audit {
        #[arg(required = true)]
        wallet: String,
        #[arg(long)]
        reference_volume: Option<Decimal>,
    },
    /// Load a JSONL market feed
    ImportMarkets {
        #[arg(required = true)]
        file: PathBuf,
    },
    /// Load a JSONL resolution feed
    ImportResolutions {
        #[arg(required = true)]
        file: PathBuf,
    },
    /// Move a table out of the canonical namespace
    Archive {
        #[arg(required = true)]
        table: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let filter =
        EnvFilter::from_default_env().add_directive("polymarket_pnl_pipeline=info".parse()?);
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    info!("Warehouse: {}", config.data_dir.display());
    let pipeline = Pipeline::new(config).context("open pipeline")?;

    match cli.command {
        Commands::Ingest { to_block } => run_ingest(&pipeline, to_block).await,
        Commands::Reconstruct => {
            let (report, swap) = pipeline.reconstruct().await?;
            info!(
                "{}: {} rows ({} quarantined)",
                swap.table,
                swap.rows,
                report.quarantined()
            );
            Ok(())
        }
        Commands::Map => {
            let (report, swap) = pipeline.map().await?;
            info!(
                "{}: {} rows, coverage {:.1}%, {} resolved",
                swap.table,
                swap.rows,
                report.coverage() * 100.0,
                report.resolved_trades
            );
            Ok(())
        }
        Commands::Aggregate => {
            let report = pipeline.aggregate().await?;
            info!(
                "{}: {} wallets, {}: {} rows",
                report.wallets.table,
                report.wallets.rows,
                report.categories.table,
                report.categories.rows
            );
            Ok(())
        }
        Commands::Run { to_block } => {
            let report = pipeline.run(to_block).await?;
            info!("Done: {} positions, {} wallets", report.positions, report.wallets.rows);
            Ok(())
        }
        Commands::Status => run_status(&pipeline),
        Commands::Audit {
            wallet,
            reference_volume,
        } => {
            let audit = pipeline.audit(&wallet, reference_volume)?;
            info!("{}", serde_json::to_string_pretty(&audit)?);
            Ok(())
        }
        Commands::ImportMarkets { file } => {
            let swap = pipeline.import_markets(&file)?;
            info!("{}: {} rows", swap.table, swap.rows);
            Ok(())
        }
        Commands::ImportResolutions { file } => {
            let swap = pipeline.import_resolutions(&file)?;
            info!("{}: {} rows", swap.table, swap.rows);
            Ok(())
        }
        Commands::Archive { table } => {
            let name = pipeline.archive(&table)?;
            info!("{} archived as {}", table, name);
            Ok(())
        }
    }
}

async fn run_ingest(pipeline: &Pipeline, to_block: Option<u64>) -> Result<()> {
    let report = pipeline.ingest(to_block).await?;
    for w in &report.workers {
        match &w.outcome {
            WorkerOutcome::Completed => info!(
                "worker {}: {}..={} done, +{} events ({} already stored)",
                w.worker_id, w.range_start, w.range_end, w.inserted, w.unchanged
            ),
            WorkerOutcome::Halted { at_block, error } => warn!(
                "worker {}: halted at block {} ({}); rerun to resume",
                w.worker_id, at_block, error
            ),
        }
    }
    if !report.is_complete() {
        anyhow::bail!("ingestion incomplete up to block {}", report.head);
    }
    Ok(())
}

fn run_status(pipeline: &Pipeline) -> Result<()> {
    let status = pipeline.status()?;
    for cp in &status.checkpoints {
        info!(
            "worker {}: {}..={} at {:?}, {} events, {} batches, {} errors",
            cp.worker_id,
            cp.range_start,
            cp.range_end,
            cp.last_block,
            cp.events_ingested,
            cp.batches_committed,
            cp.errors.len()
        );
    }
    for (table, rows) in &status.tables {
        info!("{}: {} rows", table, rows);
    }
    Ok(())
}
