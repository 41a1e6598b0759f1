//! Club Ratings Ingestion Service
//!
//! One-shot imports (snapshot, fixtures, history) for timers and manual runs,
//! or `serve` for the health endpoint plus token-protected import triggers.
//! Scheduling belongs to whatever invokes this binary.

use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use ratings_ingestion::config::Config;
use ratings_ingestion::feed::{FeedClient, FixtureWindow};
use ratings_ingestion::server::{self, AppState};
use ratings_ingestion::store::PgStore;
use ratings_ingestion::{ImportError, ImportStats, Pipeline};

#[derive(Parser, Debug)]
#[command(name = "ratings-ingestion", version, about = "Club ratings ingestion service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import the ratings snapshot for a date (default: today, UTC)
    Snapshot {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Import fixtures for a date, a date range, or everything upcoming
    Fixtures {
        #[arg(long)]
        date: Option<NaiveDate>,
        /// End of an inclusive range starting at --date
        #[arg(long, requires = "date")]
        to: Option<NaiveDate>,
    },
    /// Import the complete rating history of one club (feed identifier)
    History { club: String },
    /// Serve the health endpoint and HTTP import triggers
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Local runs only; deployed containers get real env vars and secret files.
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ratings_ingestion=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    info!("Club Ratings Ingestion Service v{}", env!("CARGO_PKG_VERSION"));

    let store = PgStore::connect(&config.database_url, config.pool_size()?).await?;
    let feed = FeedClient::new(
        &config.feed_base_url,
        config.feed_requests_per_minute,
        Duration::from_secs(config.feed_timeout_seconds),
        config.retry_policy(),
    )?;
    let pipeline = Arc::new(Pipeline::new(feed, store, config.import_concurrency));

    let outcome = match cli.command {
        Command::Snapshot { date } => pipeline.import_snapshot(date).await,
        Command::Fixtures { date, to } => {
            let window = match (date, to) {
                (Some(from), Some(to)) => FixtureWindow::Between(from, to),
                (Some(day), None) => FixtureWindow::On(day),
                _ => FixtureWindow::Upcoming,
            };
            pipeline.import_fixture_window(window).await
        }
        Command::History { club } => pipeline.import_history(&club).await,
        Command::Serve => {
            let state = AppState::new(pipeline, config.import_token.clone());
            if config.import_token.is_none() {
                info!("IMPORT_TOKEN not configured; HTTP import triggers are disabled");
            }

            // Handle shutdown gracefully
            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);

            tokio::select! {
                result = server::serve(state, config.http_port) => {
                    if let Err(e) = result {
                        error!("Server error: {:?}", e);
                        return Err(e);
                    }
                }
                _ = ctrl_c => {
                    info!("Shutting down...");
                }
            }
            return Ok(());
        }
    };

    report(outcome)
}

fn report(outcome: Result<ImportStats, ImportError>) -> Result<()> {
    match outcome {
        Ok(stats) => {
            info!(
                "Import completed: {} succeeded, {} failed",
                stats.success, stats.errors
            );
            println!("{}", serde_json::to_string(&stats)?);
            Ok(())
        }
        Err(e) => {
            error!("Import failed: {}", e);
            Err(anyhow!(e))
        }
    }
}
