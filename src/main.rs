//! Main application entry point (CLI binary).
//!
//! This is a thin wrapper around the `page_harvest` library that handles:
//! - Command-line argument parsing
//! - Logger initialization
//! - User-facing output formatting
//!
//! All core functionality is implemented in the library crate.

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use page_harvest::initialization::init_logger_with;
use page_harvest::store::{
    init_db_pool_with_path, list_blocked_events, resolve_blocked_event, run_migrations,
};
use page_harvest::{run_harvest, HarvestConfig, LogFormat, LogLevel};

#[derive(Parser)]
#[command(name = "page_harvest", version, about = "Resilient paginated fetching for hostile sites")]
struct Cli {
    /// Log level
    #[arg(long, value_enum, default_value = "info", global = true)]
    log_level: LogLevel,

    /// Log output format
    #[arg(long, value_enum, default_value = "plain", global = true)]
    log_format: LogFormat,

    /// SQLite database path
    #[arg(long, default_value = "./page_harvest.db", global = true)]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a fetch plan
    Run {
        /// Path to the plan file (JSON)
        plan: PathBuf,

        /// Continue the latest checkpointed run for this plan
        #[arg(long)]
        resume: bool,

        /// Record responses under this directory (overrides the plan)
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Serve responses from the cache only; never hit the network
        #[arg(long)]
        replay: bool,

        /// Cap the number of batches for this run
        #[arg(long)]
        max_batches: Option<u32>,
    },
    /// Inspect and resolve blocked events
    Blocked {
        #[command(subcommand)]
        command: BlockedCommand,
    },
}

#[derive(Subcommand)]
enum BlockedCommand {
    /// List blocked events (open ones by default)
    List {
        /// Only events for this profile
        #[arg(long)]
        profile: Option<String>,

        /// Include resolved events
        #[arg(long)]
        all: bool,

        /// Maximum rows to show
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Mark a blocked event as handled
    Resolve {
        /// Event id from `blocked list`
        bid: i64,

        /// What was done about it
        #[arg(long)]
        note: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logger_with(cli.log_level.clone().into(), cli.log_format.clone())
        .context("Failed to initialize logger")?;

    match cli.command {
        Command::Run {
            plan,
            resume,
            cache_dir,
            replay,
            max_batches,
        } => {
            let config = HarvestConfig {
                plan_path: plan,
                log_level: cli.log_level,
                log_format: cli.log_format,
                db_path: cli.db,
                resume,
                cache_dir,
                replay,
                max_batches,
            };
            match run_harvest(config).await {
                Ok(report) => {
                    if report.blocked {
                        println!(
                            "⛔ {} blocked after {} batch{} ({} items stored); checkpoint saved",
                            report.profile,
                            report.batches,
                            if report.batches == 1 { "" } else { "es" },
                            report.raw_inserted
                        );
                        println!(
                            "Inspect the queue with `page_harvest blocked list`, then rerun with --resume"
                        );
                    } else {
                        println!(
                            "✅ {} finished: {} batch{}, {} items ({} new, {} updated) in {:.1}s",
                            report.profile,
                            report.batches,
                            if report.batches == 1 { "" } else { "es" },
                            report.raw_inserted,
                            report.unique_inserted,
                            report.unique_updated,
                            report.elapsed_seconds
                        );
                    }
                    println!("Results saved in {}", report.db_path.display());
                    Ok(())
                }
                Err(e) => {
                    eprintln!("page_harvest error: {:#}", e);
                    process::exit(1);
                }
            }
        }
        Command::Blocked { command } => {
            let pool = init_db_pool_with_path(&cli.db)
                .await
                .context("Failed to open database")?;
            run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;

            match command {
                BlockedCommand::List { profile, all, limit } => {
                    let rows =
                        list_blocked_events(&pool, profile.as_deref(), !all, limit, 0).await?;
                    if rows.is_empty() {
                        println!("No blocked events.");
                        return Ok(());
                    }
                    for row in rows {
                        let status = if row.resolved_at.is_some() {
                            "resolved"
                        } else {
                            "open"
                        };
                        println!(
                            "#{} [{}] {} {} {} ({}) at {}",
                            row.bid,
                            status,
                            row.profile,
                            row.block_hint.as_deref().unwrap_or("unknown"),
                            row.url,
                            row.status_code
                                .map(|c| c.to_string())
                                .unwrap_or_else(|| "-".to_string()),
                            row.created_at
                        );
                    }
                    Ok(())
                }
                BlockedCommand::Resolve { bid, note } => {
                    if resolve_blocked_event(&pool, bid, note.as_deref()).await? {
                        println!("✅ Blocked event #{bid} resolved");
                        Ok(())
                    } else {
                        eprintln!("page_harvest error: event #{bid} not found or already resolved");
                        process::exit(1);
                    }
                }
            }
        }
    }
}
