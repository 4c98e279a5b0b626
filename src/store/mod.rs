//! SQLite persistence: dual-write record store, run checkpoints, and the
//! blocked-event queue.

pub mod blocked;
pub mod checkpoint;
mod migrations;
mod pool;
pub mod records;
#[cfg(test)]
pub mod test_helpers;

use chrono::Utc;
use thiserror::Error;

pub use blocked::{
    add_blocked_event, get_blocked_event, latest_open_blocked, list_blocked_events,
    resolve_blocked_event, BlockedEventRow,
};
pub use checkpoint::{latest_run_id, load_checkpoint, save_checkpoint, Checkpoint};
pub use migrations::run_migrations;
pub use pool::init_db_pool_with_path;
pub use records::{put_record, store_batch, BatchStats};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to create database file: {0}")]
    FileCreationError(String),
    #[error("SQL error: {0}")]
    SqlError(#[from] sqlx::Error),
    #[error("Failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Timestamps are stored as RFC 3339 text so they sort lexicographically.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}
