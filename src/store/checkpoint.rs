//! Run checkpoints: the last saved pagination state per (profile, run).

use sqlx::{Executor, Row, Sqlite, SqlitePool};

use super::{now_iso, StoreError};
use crate::paginate::PaginationState;

/// A restored checkpoint, with the counters needed to continue numbering.
#[derive(Debug)]
pub struct Checkpoint {
    pub state: PaginationState,
    pub last_seq: i64,
    pub items_seen: i64,
}

pub(super) async fn upsert_checkpoint<'e, E>(
    executor: E,
    profile: &str,
    run_id: &str,
    state: &PaginationState,
    last_seq: i64,
    items_seen: i64,
) -> Result<(), StoreError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let state_json = serde_json::to_string(state)?;
    sqlx::query(
        "INSERT INTO run_state (profile, run_id, state_json, updated_at, batch_idx, last_seq, items_seen)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(profile, run_id) DO UPDATE SET
            state_json = excluded.state_json,
            updated_at = excluded.updated_at,
            batch_idx = excluded.batch_idx,
            last_seq = excluded.last_seq,
            items_seen = excluded.items_seen",
    )
    .bind(profile)
    .bind(run_id)
    .bind(state_json)
    .bind(now_iso())
    .bind(i64::from(state.batch_idx))
    .bind(last_seq)
    .bind(items_seen)
    .execute(executor)
    .await?;
    Ok(())
}

/// Saves (or replaces) the checkpoint for a run.
pub async fn save_checkpoint(
    pool: &SqlitePool,
    profile: &str,
    run_id: &str,
    state: &PaginationState,
    last_seq: i64,
    items_seen: i64,
) -> Result<(), StoreError> {
    upsert_checkpoint(pool, profile, run_id, state, last_seq, items_seen).await
}

/// Restores the checkpoint for a run, if one was saved.
pub async fn load_checkpoint(
    pool: &SqlitePool,
    profile: &str,
    run_id: &str,
) -> Result<Option<Checkpoint>, StoreError> {
    let row = sqlx::query(
        "SELECT state_json, last_seq, items_seen FROM run_state WHERE profile = ? AND run_id = ?",
    )
    .bind(profile)
    .bind(run_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else { return Ok(None) };
    let state_json: String = row.get(0);
    let state: PaginationState = serde_json::from_str(&state_json)?;
    Ok(Some(Checkpoint {
        state,
        last_seq: row.try_get::<Option<i64>, _>(1)?.unwrap_or(0),
        items_seen: row.try_get::<Option<i64>, _>(2)?.unwrap_or(0),
    }))
}

/// The most recently updated run for a profile, for `--resume`.
pub async fn latest_run_id(pool: &SqlitePool, profile: &str) -> Result<Option<String>, StoreError> {
    let row = sqlx::query(
        "SELECT run_id FROM run_state WHERE profile = ? ORDER BY updated_at DESC LIMIT 1",
    )
    .bind(profile)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| r.get(0)))
}
