use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing::Instrument;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod config;
mod db;
mod detect;
mod error;
mod fit;
mod grid;
mod models;
mod pipeline;
mod report;
mod residuals;
mod series;

use config::DetectionConfig;

#[derive(Parser)]
#[command(name = "mapping-event-finder")]
#[command(about = "Detects surges of editing activity in gridded edit histories", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Import monthly aggregates from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Fit growth curves per cell and write the event report
    Detect {
        /// GeoJSON FeatureCollection of grid cells with an integer `id` property
        #[arg(long, env = "EVENT_FINDER_GRID")]
        grid: PathBuf,
        #[arg(long, default_value = "target")]
        out_dir: PathBuf,
        /// Months on or before this date are excluded from the curve fit
        #[arg(long, default_value = "2007-09-30")]
        cutoff: NaiveDate,
        #[arg(long, env = "EVENT_FINDER_FIT_TIMEOUT_SECS", default_value_t = 60)]
        fit_timeout_secs: u64,
        #[arg(long, default_value_t = config::CRITICAL_VALUE_95)]
        threshold: f64,
        #[arg(long, default_value = "2004-01-01")]
        grid_start: NaiveDate,
        #[arg(long, default_value = "2019-02-01")]
        grid_end: NaiveDate,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a Postgres instance holding the edit history")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Import { csv } => {
            let written = db::import_csv(&pool, &csv).await?;
            println!("Wrote {written} monthly aggregates from {}.", csv.display());
        }
        Commands::Detect {
            grid,
            out_dir,
            cutoff,
            fit_timeout_secs,
            threshold,
            grid_start,
            grid_end,
        } => {
            anyhow::ensure!(grid_start < grid_end, "--grid-start must precede --grid-end");
            let config = DetectionConfig {
                cutoff,
                fit_timeout: Duration::from_secs(fit_timeout_secs),
                threshold,
                grid_start,
                grid_end,
            };

            let run_id = Uuid::new_v4();
            let span = tracing::info_span!("detect", %run_id);
            let report = async {
                tracing::info!("start preparation");
                let cells = grid::load_cells(&grid)?;

                tracing::info!("run query");
                let started = Instant::now();
                let aggregates =
                    db::fetch_monthly_aggregates(&pool, config.grid_start, config.grid_end)
                        .await?;
                tracing::info!(
                    cells = aggregates.len(),
                    minutes = started.elapsed().as_secs_f64() / 60.0,
                    "query finished"
                );

                let store = db::PgHistoryStore::new(pool.clone());
                anyhow::Ok(pipeline::run(aggregates, &cells, &config, &store).await)
            }
            .instrument(span)
            .await?;

            std::fs::create_dir_all(&out_dir)
                .with_context(|| format!("failed to create {}", out_dir.display()))?;
            report.log_summary();
            let events_path = out_dir.join("mapping_events.csv");
            let failures_path = out_dir.join("convergence_errors.csv");
            let written = report::write_events(&events_path, &report)?;
            report::write_failure_log(&failures_path, &report)?;

            println!(
                "Wrote {written} events to {} and {} fit failures to {}.",
                events_path.display(),
                report.failures.len(),
                failures_path.display()
            );
        }
    }

    Ok(())
}
