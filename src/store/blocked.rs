//! The blocked-event queue: one row per wall the pipeline hit, open until a
//! human resolves it.

use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};

use super::{now_iso, StoreError};
use crate::paginate::BlockedBatch;

#[derive(Debug, Clone, FromRow)]
pub struct BlockedEventRow {
    pub bid: i64,
    pub created_at: String,
    pub resolved_at: Option<String>,
    pub resolved_note: Option<String>,
    pub profile: String,
    pub profile_path: Option<String>,
    pub run_id: Option<String>,
    pub batch_idx: Option<i64>,
    pub url: String,
    pub method: Option<String>,
    pub params_json: Option<String>,
    pub pagination_state_json: Option<String>,
    pub status_code: Option<i64>,
    pub block_hint: Option<String>,
    pub error: Option<String>,
    pub resp_url_final: Option<String>,
    pub resp_headers_json: Option<String>,
    pub resp_snippet: Option<String>,
}

/// Records a blocked batch and returns its queue id.
pub async fn add_blocked_event(
    pool: &SqlitePool,
    profile: &str,
    profile_path: Option<&str>,
    run_id: &str,
    blocked: &BlockedBatch,
) -> Result<i64, StoreError> {
    let params_json = serde_json::to_string(&blocked.params)?;
    let state_json = serde_json::to_string(&blocked.state)?;
    let headers_json = serde_json::to_string(&blocked.event.headers)?;

    let bid: i64 = sqlx::query_scalar(
        "INSERT INTO blocked_events (
            created_at, profile, profile_path, run_id, batch_idx,
            url, method, params_json, pagination_state_json,
            status_code, block_hint, error,
            resp_url_final, resp_headers_json, resp_snippet
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING bid",
    )
    .bind(now_iso())
    .bind(profile)
    .bind(profile_path)
    .bind(run_id)
    .bind(i64::from(blocked.state.batch_idx))
    .bind(&blocked.url)
    .bind(&blocked.method)
    .bind(params_json)
    .bind(state_json)
    .bind(i64::from(blocked.event.status))
    .bind(blocked.event.hint.to_string())
    .bind(blocked.error.as_deref())
    .bind(&blocked.event.final_url)
    .bind(headers_json)
    .bind(&blocked.event.snippet)
    .fetch_one(pool)
    .await?;

    Ok(bid)
}

/// Lists queue entries, newest first.
pub async fn list_blocked_events(
    pool: &SqlitePool,
    profile: Option<&str>,
    only_open: bool,
    limit: i64,
    offset: i64,
) -> Result<Vec<BlockedEventRow>, StoreError> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM blocked_events WHERE 1=1");
    if let Some(profile) = profile {
        qb.push(" AND profile = ").push_bind(profile);
    }
    if only_open {
        qb.push(" AND resolved_at IS NULL");
    }
    qb.push(" ORDER BY bid DESC LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);

    let rows = qb.build_query_as::<BlockedEventRow>().fetch_all(pool).await?;
    Ok(rows)
}

pub async fn get_blocked_event(
    pool: &SqlitePool,
    bid: i64,
) -> Result<Option<BlockedEventRow>, StoreError> {
    let row = sqlx::query_as::<_, BlockedEventRow>("SELECT * FROM blocked_events WHERE bid = ?")
        .bind(bid)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Marks an open event resolved. Returns false when the event does not
/// exist or was already resolved.
pub async fn resolve_blocked_event(
    pool: &SqlitePool,
    bid: i64,
    note: Option<&str>,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        "UPDATE blocked_events SET resolved_at = ?, resolved_note = ?
         WHERE bid = ? AND resolved_at IS NULL",
    )
    .bind(now_iso())
    .bind(note)
    .bind(bid)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// The newest unresolved event for a profile, if any.
pub async fn latest_open_blocked(
    pool: &SqlitePool,
    profile: &str,
) -> Result<Option<BlockedEventRow>, StoreError> {
    let row = sqlx::query_as::<_, BlockedEventRow>(
        "SELECT * FROM blocked_events WHERE profile = ? AND resolved_at IS NULL
         ORDER BY bid DESC LIMIT 1",
    )
    .bind(profile)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}
