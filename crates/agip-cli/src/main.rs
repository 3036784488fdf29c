use std::sync::Arc;

use agip_ingest::{IngestConfig, Registry};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "agip-cli")]
#[command(about = "Audit-gated ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once.
    Run {
        /// Use an in-process warehouse; nothing is written to Postgres.
        #[arg(long)]
        dry_run: bool,
    },
    /// Run on the `AGIP_CRON` schedule until interrupted.
    Schedule,
    /// Validate `pipeline.yaml` without fetching anything.
    CheckConfig,
    /// List the latest run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run { dry_run: false }) {
        Commands::Run { dry_run } => {
            let outcome = agip_ingest::run_once_from_env(dry_run).await?;
            print!("{}", outcome.report.render());
            if let Some(dir) = &outcome.report_dir {
                println!("reports: {}", dir.display());
            }
            if let Some(manifest) = &outcome.parquet_manifest {
                println!("parquet manifest: {}", manifest.display());
            }
        }
        Commands::Schedule => {
            let (config, pipeline) = agip_ingest::postgres_pipeline_from_env().await?;
            let mut sched = agip_ingest::build_scheduler(Arc::new(pipeline), &config.crons).await?;
            sched.start().await.context("starting scheduler")?;
            info!(jobs = config.crons.len(), "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::CheckConfig => {
            let config = IngestConfig::from_env();
            let path = config.pipeline_path();
            let registry = Registry::load(&path)?;
            println!(
                "{}: {} datasets, {} joins, {} marts ({} tables), change detection {:?}",
                path.display(),
                registry.datasets.len(),
                registry.joins.len(),
                registry.marts.len(),
                registry
                    .marts
                    .iter()
                    .map(|m| m.horizons_months.len())
                    .sum::<usize>(),
                registry.change_detection
            );
            for dataset in &registry.datasets {
                println!(
                    " - {}: {} -> {}",
                    dataset.spec.name, dataset.spec.source_url, dataset.spec.staging_table
                );
            }
        }
        Commands::Report { runs } => {
            let config = IngestConfig::from_env();
            println!(
                "{}",
                agip_ingest::list_recent_reports(&config.reports_path(), runs)?
            );
        }
    }

    Ok(())
}
