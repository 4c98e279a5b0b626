//! page_harvest library: resilient paginated fetching for hostile sites.
//!
//! Drives a declarative fetch plan against a paginated endpoint with
//! per-domain rate limiting, retry with backoff, an anti-block fallback
//! ladder, a content-addressed response cache, and checkpointed dual-write
//! persistence in SQLite. When a wall is detected the run records a
//! blocked event and stops cleanly so a human can intervene and resume.
//!
//! # Example
//!
//! ```no_run
//! use page_harvest::{run_harvest, HarvestConfig};
//! use std::path::PathBuf;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = HarvestConfig {
//!     plan_path: PathBuf::from("plan.json"),
//!     ..Default::default()
//! };
//!
//! let report = run_harvest(config).await?;
//! println!("{} items across {} batches", report.items_seen, report.batches);
//! # Ok(())
//! # }
//! ```

pub mod classify;
pub mod config;
pub mod engine;
pub mod extract;
pub mod initialization;
pub mod limiter;
pub mod paginate;
pub mod plan;
pub mod store;

// Re-export public API
pub use config::{HarvestConfig, LogFormat, LogLevel};
pub use plan::{load_plan, FetchPlan};
pub use run::{run_harvest, HarvestReport};
pub use store::run_migrations;

// Internal run module (contains the main harvesting logic)
mod run {
    use std::path::PathBuf;
    use std::time::{Duration, Instant};

    use anyhow::{Context, Result};
    use chrono::Utc;
    use log::{info, warn};

    use crate::config::{HarvestConfig, DEFAULT_USER_AGENT};
    use crate::initialization::init_client;
    use crate::paginate::{BatchOutcome, PaginationState, Paginator};
    use crate::plan::load_plan;
    use crate::store::{
        add_blocked_event, init_db_pool_with_path, latest_open_blocked, latest_run_id,
        load_checkpoint, run_migrations, save_checkpoint, store_batch,
    };

    /// Results of a harvest run.
    #[derive(Debug, Clone)]
    pub struct HarvestReport {
        /// Profile name from the plan
        pub profile: String,
        /// Run identifier (format: `run_<timestamp_millis>`)
        pub run_id: String,
        /// Batches persisted in this run
        pub batches: u32,
        /// Items seen across the run lifetime (including resumed portions)
        pub items_seen: i64,
        /// Raw rows appended in this run
        pub raw_inserted: u64,
        /// New unique items in this run
        pub unique_inserted: u64,
        /// Unique items refreshed in this run
        pub unique_updated: u64,
        /// Whether the run stopped on a blocked event
        pub blocked: bool,
        /// Why the walk ended, when it ended normally
        pub stop_reason: Option<String>,
        /// Path to the SQLite database containing results
        pub db_path: PathBuf,
        /// Elapsed time in seconds
        pub elapsed_seconds: f64,
    }

    /// Runs a harvest with the provided configuration.
    ///
    /// Loads the plan, opens the database, optionally restores the latest
    /// checkpoint, then pulls batches until the walk ends or a block is
    /// detected. A blocked run saves its checkpoint and queues an event
    /// instead of failing.
    pub async fn run_harvest(config: HarvestConfig) -> Result<HarvestReport> {
        let start_time = Instant::now();

        let mut plan = load_plan(&config.plan_path).context("Failed to load fetch plan")?;
        if let Some(dir) = &config.cache_dir {
            plan.http.cache.dir = Some(dir.clone());
        }
        if config.replay {
            plan.http.cache.replay = true;
        }

        let pool = init_db_pool_with_path(&config.db_path)
            .await
            .context("Failed to initialize database pool")?;
        run_migrations(&pool)
            .await
            .context("Failed to run database migrations")?;

        let profile = plan.name.clone();

        let mut run_id = format!("run_{}", Utc::now().timestamp_millis());
        let mut start_state: Option<PaginationState> = None;
        let mut last_seq: i64 = -1;
        let mut items_seen: i64 = 0;

        if config.resume {
            match latest_run_id(&pool, &profile).await? {
                Some(previous) => match load_checkpoint(&pool, &profile, &previous).await? {
                    Some(cp) => {
                        info!(
                            "Resuming {profile} {previous} from batch {} ({} items seen)",
                            cp.state.batch_idx, cp.items_seen
                        );
                        run_id = previous;
                        start_state = Some(cp.state);
                        last_seq = cp.last_seq;
                        items_seen = cp.items_seen;
                    }
                    None => warn!("Run {previous} has no checkpoint; starting fresh"),
                },
                None => warn!("No previous run for {profile}; starting fresh"),
            }
        }

        if let Some(open) = latest_open_blocked(&pool, &profile).await? {
            warn!(
                "Unresolved blocked event #{} ({}) from {} is still open",
                open.bid,
                open.block_hint.as_deref().unwrap_or("unknown"),
                open.created_at
            );
        }

        let client = init_client(Duration::from_secs_f64(plan.timeout), DEFAULT_USER_AGENT)
            .context("Failed to build HTTP client")?;
        let engine = plan.build_engine(client);

        let mut paginator = Paginator::new(&engine, &plan, start_state);
        if let Some(max_batches) = config.max_batches {
            paginator = paginator.with_max_batches(max_batches);
        }

        let mut report = HarvestReport {
            profile: profile.clone(),
            run_id: run_id.clone(),
            batches: 0,
            items_seen,
            raw_inserted: 0,
            unique_inserted: 0,
            unique_updated: 0,
            blocked: false,
            stop_reason: None,
            db_path: config.db_path.clone(),
            elapsed_seconds: 0.0,
        };

        loop {
            match paginator.next_batch().await {
                BatchOutcome::Batch { records, checkpoint } => {
                    let stats = store_batch(
                        &pool,
                        &profile,
                        &run_id,
                        &records,
                        &plan.extract,
                        &checkpoint,
                        last_seq + 1,
                        items_seen,
                    )
                    .await
                    .context("Failed to persist batch")?;

                    last_seq = stats.last_seq;
                    items_seen += stats.raw_inserted as i64;
                    report.batches += 1;
                    report.raw_inserted += stats.raw_inserted;
                    report.unique_inserted += stats.unique_inserted;
                    report.unique_updated += stats.unique_updated;

                    info!(
                        "Batch {}: {} items ({} new, {} updated)",
                        checkpoint.batch_idx,
                        stats.raw_inserted,
                        stats.unique_inserted,
                        stats.unique_updated
                    );
                }
                BatchOutcome::Blocked(blocked) => {
                    save_checkpoint(&pool, &profile, &run_id, &blocked.state, last_seq, items_seen)
                        .await
                        .context("Failed to save checkpoint for blocked run")?;
                    let bid = add_blocked_event(
                        &pool,
                        &profile,
                        config.plan_path.to_str(),
                        &run_id,
                        &blocked,
                    )
                    .await
                    .context("Failed to record blocked event")?;
                    warn!(
                        "Blocked ({}) at batch {} on {}; event #{bid} queued, run checkpointed",
                        blocked.event.hint, blocked.state.batch_idx, blocked.url
                    );
                    report.blocked = true;
                    break;
                }
                BatchOutcome::Done(reason) => {
                    info!("Harvest finished: {reason}");
                    report.stop_reason = Some(reason.to_string());
                    break;
                }
            }
        }

        report.items_seen = items_seen;

        // Checkpoint WAL to fold -wal/-shm back into the main file.
        if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&*pool)
            .await
        {
            warn!("Failed to checkpoint WAL: {e}");
        }

        report.elapsed_seconds = start_time.elapsed().as_secs_f64();
        Ok(report)
    }
}
