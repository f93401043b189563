mod config;
mod models;
mod notifier;
mod pipeline;
mod scraper;
mod storage;
mod utils;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::AppConfig;
use crate::notifier::Notifier;
use crate::pipeline::Pipeline;
use crate::scraper::SuumoScraper;
use crate::storage::Repository;

#[derive(Parser)]
#[command(name = "suumo-watch", about = "Notify new SUUMO rental listings", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Scrape, diff against the database, notify new listings
    Run {
        /// Skip notifications (listings are still saved)
        #[arg(long)]
        dry_run: bool,

        /// Search URL (overrides SUUMO_SEARCH_URL)
        #[arg(long, value_name = "URL")]
        url: Option<String>,
    },

    /// Show database statistics
    Stats,

    /// Show the most recently seen listings
    List {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },

    /// Write every stored listing to a CSV file
    Export {
        #[arg(short, long, default_value = "listings.csv")]
        out: PathBuf,
    },

    /// Apply schema migrations without scraping
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load()?;
    let _log_guard = init_logging(cli.verbose, &config.storage.db_path)?;

    match cli.command {
        Command::Run { dry_run, url } => {
            if let Some(url) = url {
                config.scraper.search_url = url;
            }
            config.validate()?;

            let _t = utils::Timer::start("SUUMO monitor run");
            let repo = open_repo(&config)?;
            let scraper = SuumoScraper::new(&config.scraper).context("Failed to build scraper")?;
            let notifier = Notifier::from_config(&config.notify)?;
            info!("Notification channels: {:?}", notifier.channel_names());

            let stats = Pipeline::new(scraper, notifier, repo, config.scraper.search_url.clone())
                .dry_run(dry_run)
                .run()
                .await?;
            info!(
                "Done: {} found | {} new | {} delisted",
                stats.listings_found, stats.new_listings, stats.expired
            );
        }

        Command::Stats => {
            let repo = open_repo(&config)?;
            let listings = repo.listing_count()?;
            let notified = repo.notified_count()?;
            let last = repo.recent_runs(1)?.into_iter().next();
            println!("─────────────────────────────────");
            println!("  SUUMO Watch — Database Stats");
            println!("─────────────────────────────────");
            println!("  Listings : {}", utils::fmt_number(listings));
            println!("  Notified : {}", utils::fmt_number(notified));
            match last {
                Some(run) => {
                    println!("  Last run : {}", run.run_at.format("%Y-%m-%d %H:%M:%S UTC"));
                    println!("             {} found, {} new", run.listings_found, run.new_listings);
                    if let Some(err) = run.error {
                        println!("             error: {}", err);
                    }
                }
                None => println!("  Last run : —"),
            }
            println!("─────────────────────────────────");
        }

        Command::List { limit } => {
            let repo = open_repo(&config)?;
            let records = repo.list_listings(Some(limit))?;
            if records.is_empty() {
                println!("No listings — run `suumo-watch run` first.");
            } else {
                for r in &records {
                    println!(
                        "{}  {}  {} {} {} {}",
                        r.first_seen_at.format("%Y-%m-%d %H:%M"),
                        r.listing_id,
                        r.building_name,
                        r.rent,
                        r.layout,
                        r.unit_floor
                    );
                }
            }
        }

        Command::Export { out } => {
            let repo = open_repo(&config)?;
            let records = repo.list_listings(None)?;
            utils::write_csv(&out, &records)?;
            println!("Exported {} listings to {:?}", records.len(), out);
        }

        Command::Migrate => {
            Repository::open(&config.storage.db_path)?.run_migrations()?;
            println!("Migrations applied.");
        }
    }

    Ok(())
}

/// stdout plus `<db dir>/monitor.log`. RUST_LOG wins, then -v, then LOG_LEVEL.
fn init_logging(verbose: u8, db_path: &Path) -> Result<WorkerGuard> {
    let log_dir = match db_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Could not create log dir {:?}", log_dir))?;
    let (file_writer, guard) = tracing_appender::non_blocking(rolling::never(&log_dir, "monitor.log"));

    let log_level = std::env::var("LOG_LEVEL").ok();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose, log_level.as_deref())));

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .with(filter)
        .init();

    Ok(guard)
}

fn default_filter(verbose: u8, log_level: Option<&str>) -> String {
    match verbose {
        0 => {
            let level = log_level
                .and_then(|l| match l.trim().to_ascii_lowercase().as_str() {
                    l @ ("trace" | "debug" | "info" | "warn" | "error") => Some(l.to_string()),
                    "warning" => Some("warn".to_string()),
                    "critical" => Some("error".to_string()),
                    _ => None,
                })
                .unwrap_or_else(|| "info".to_string());
            format!("suumo_watch={},warn", level)
        }
        1 => "suumo_watch=debug,info".to_string(),
        _ => "trace".to_string(),
    }
}

fn open_repo(config: &AppConfig) -> Result<Repository> {
    let repo = Repository::open(&config.storage.db_path)?;
    if config.storage.run_migrations {
        repo.run_migrations()?;
    }
    Ok(repo)
}
