//! Dual-write record persistence: every sighting appended to `items_raw`,
//! deduplicated view upserted into `items_unique`, checkpoint saved in the
//! same transaction.

use serde_json::Value;
use sqlx::{Row, SqlitePool};

use super::checkpoint::upsert_checkpoint;
use super::{now_iso, StoreError};
use crate::extract::{item_key, record_id, ExtractSpec};
use crate::paginate::PaginationState;

/// What one `store_batch` call wrote.
#[derive(Debug, Default)]
pub struct BatchStats {
    pub raw_inserted: u64,
    pub unique_inserted: u64,
    pub unique_updated: u64,
    /// Sequence number of the last raw row, for checkpoint continuity.
    pub last_seq: i64,
}

/// Dual write of a single record inside an open transaction: appends the
/// sighting to `items_raw` and upserts the deduplicated row in
/// `items_unique`. Returns `true` when the item key was new.
pub async fn put_record(
    conn: &mut sqlx::SqliteConnection,
    run_id: &str,
    seq: i64,
    record: &Value,
    spec: &ExtractSpec,
    now: &str,
) -> Result<bool, StoreError> {
    let key = item_key(record, spec);
    let id = record_id(record, spec);
    let payload = serde_json::to_string(record)?;

    sqlx::query(
        "INSERT INTO items_raw (run_id, seq, item_key, item_id, payload, seen_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(run_id)
    .bind(seq)
    .bind(&key)
    .bind(id.as_deref())
    .bind(&payload)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    // seen_count comes back as 1 only on a fresh insert
    let seen_count: i64 = sqlx::query(
        "INSERT INTO items_unique (item_key, item_id, payload, first_seen_at, last_seen_at, seen_count)
         VALUES (?, ?, ?, ?, ?, 1)
         ON CONFLICT(item_key) DO UPDATE SET
            last_seen_at = excluded.last_seen_at,
            payload = excluded.payload,
            item_id = COALESCE(excluded.item_id, items_unique.item_id),
            seen_count = items_unique.seen_count + 1
         RETURNING seen_count",
    )
    .bind(&key)
    .bind(id.as_deref())
    .bind(&payload)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?
    .get(0);

    Ok(seen_count == 1)
}

/// Persists one batch atomically: raw rows, unique upserts, and the
/// post-batch checkpoint all commit together or not at all.
pub async fn store_batch(
    pool: &SqlitePool,
    profile: &str,
    run_id: &str,
    records: &[Value],
    spec: &ExtractSpec,
    checkpoint: &PaginationState,
    start_seq: i64,
    items_seen: i64,
) -> Result<BatchStats, StoreError> {
    let mut tx = pool.begin().await?;
    let now = now_iso();
    let mut stats = BatchStats {
        last_seq: start_seq - 1,
        ..Default::default()
    };

    let mut seq = start_seq;
    for record in records {
        let fresh = put_record(&mut *tx, run_id, seq, record, spec, &now).await?;
        stats.raw_inserted += 1;
        stats.last_seq = seq;
        seq += 1;

        if fresh {
            stats.unique_inserted += 1;
        } else {
            stats.unique_updated += 1;
        }
    }

    upsert_checkpoint(
        &mut *tx,
        profile,
        run_id,
        checkpoint,
        stats.last_seq,
        items_seen + stats.raw_inserted as i64,
    )
    .await?;

    tx.commit().await?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paginate::PaginationKind;
    use crate::store::checkpoint::load_checkpoint;
    use crate::store::test_helpers::create_test_pool;
    use serde_json::json;

    fn state(batch_idx: u32) -> PaginationState {
        PaginationState {
            kind: PaginationKind::Page,
            url: "https://site.com/api/items".to_string(),
            page: 2,
            offset: 0,
            cursor: None,
            next_url: None,
            batch_idx,
        }
    }

    #[tokio::test]
    async fn dual_write_dedupes_by_item_key() {
        let pool = create_test_pool().await;
        let spec = ExtractSpec::default();

        let first = vec![json!({"id": 1, "name": "a"}), json!({"id": 2, "name": "b"})];
        let stats = store_batch(&pool, "shop", "run_1", &first, &spec, &state(1), 0, 0)
            .await
            .unwrap();
        assert_eq!(stats.raw_inserted, 2);
        assert_eq!(stats.unique_inserted, 2);
        assert_eq!(stats.unique_updated, 0);
        assert_eq!(stats.last_seq, 1);

        // item 2 again, with fresher payload
        let second = vec![json!({"id": 2, "name": "b2"}), json!({"id": 3, "name": "c"})];
        let stats = store_batch(&pool, "shop", "run_1", &second, &spec, &state(2), 2, 2)
            .await
            .unwrap();
        assert_eq!(stats.unique_inserted, 1);
        assert_eq!(stats.unique_updated, 1);

        let raw_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items_raw")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(raw_count, 4);

        let (payload, seen_count): (String, i64) = sqlx::query_as(
            "SELECT payload, seen_count FROM items_unique WHERE item_key = 'id:2'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(seen_count, 2);
        assert!(payload.contains("b2"));
    }

    #[tokio::test]
    async fn checkpoint_commits_with_the_batch() {
        let pool = create_test_pool().await;
        let spec = ExtractSpec::default();

        let records = vec![json!({"id": 10})];
        store_batch(&pool, "shop", "run_1", &records, &spec, &state(1), 0, 0)
            .await
            .unwrap();

        let cp = load_checkpoint(&pool, "shop", "run_1").await.unwrap().unwrap();
        assert_eq!(cp.state.page, 2);
        assert_eq!(cp.last_seq, 0);
        assert_eq!(cp.items_seen, 1);
    }

    #[tokio::test]
    async fn keyless_records_hash_to_distinct_keys() {
        let pool = create_test_pool().await;
        let spec = ExtractSpec::default();

        let records = vec![json!({"name": "x"}), json!({"name": "y"}), json!({"name": "x"})];
        let stats = store_batch(&pool, "shop", "run_1", &records, &spec, &state(1), 0, 0)
            .await
            .unwrap();
        assert_eq!(stats.unique_inserted, 2);
        assert_eq!(stats.unique_updated, 1);
    }
}
