use std::str::FromStr;

use sqlx::SqlitePool;

use crate::db::{get_system_state, set_system_state};
use crate::models::{EventKey, OrderIntent, PositionDeltaEvent};

use super::intent_repo;

/// Singleton ingest cursor. `last_ingest_success_ms` tracks source liveness;
/// `last_processed_*` tracks actual event progress. The two are deliberately
/// separate so a quiet leader does not look like an outage.
#[derive(Debug, Clone, Default)]
pub struct Cursor {
    pub last_processed_timestamp_ms: i64,
    pub last_processed_event_key: Option<EventKey>,
    pub last_ingest_success_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    Duplicate,
}

pub async fn load_cursor(pool: &SqlitePool) -> anyhow::Result<Cursor> {
    let last_ts = get_system_state(pool, "last_processed_timestamp_ms")
        .await?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let last_key = get_system_state(pool, "last_processed_event_key")
        .await?
        .filter(|v| !v.is_empty())
        .and_then(|v| EventKey::from_str(&v).ok());
    let last_success = get_system_state(pool, "last_ingest_success_ms")
        .await?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    Ok(Cursor {
        last_processed_timestamp_ms: last_ts,
        last_processed_event_key: last_key,
        last_ingest_success_ms: last_success,
    })
}

/// Stamp a successful source response (even an empty one).
pub async fn record_ingest_success(pool: &SqlitePool, now_ms: i64) -> anyhow::Result<()> {
    set_system_state(pool, "last_ingest_success_ms", &now_ms.to_string(), now_ms).await
}

pub async fn has_processed(
    pool: &SqlitePool,
    tx_hash: &str,
    event_index: i64,
    symbol: &str,
) -> anyhow::Result<bool> {
    let row = sqlx::query(
        "SELECT 1 FROM processed_txs WHERE tx_hash = ?1 AND event_index = ?2 AND symbol = ?3",
    )
    .bind(tx_hash)
    .bind(event_index)
    .bind(symbol)
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}

/// Atomically mark an event processed: dedup insert, cursor advance, and the
/// event's intents, all in one transaction. Returns `Duplicate` without any
/// side effects when the dedup key already exists.
pub async fn record_event(
    pool: &SqlitePool,
    event: &PositionDeltaEvent,
    intents: &[OrderIntent],
    now_ms: i64,
) -> anyhow::Result<RecordOutcome> {
    let mut tx = pool.begin().await?;

    let inserted = sqlx::query(
        "INSERT OR IGNORE INTO processed_txs \
         (tx_hash, event_index, symbol, timestamp_ms, is_replay, created_at_ms) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .bind(&event.tx_hash)
    .bind(event.event_index)
    .bind(&event.symbol)
    .bind(event.timestamp_ms)
    .bind(event.is_replay as i64)
    .bind(now_ms)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if inserted == 0 {
        tx.rollback().await?;
        return Ok(RecordOutcome::Duplicate);
    }

    let key = event.key();
    let stored = get_system_state(&mut *tx, "last_processed_event_key")
        .await?
        .filter(|v| !v.is_empty())
        .and_then(|v| EventKey::from_str(&v).ok());
    let is_newer = stored.as_ref().map(|old| key > *old).unwrap_or(true);
    if is_newer {
        set_system_state(
            &mut *tx,
            "last_processed_timestamp_ms",
            &event.timestamp_ms.to_string(),
            now_ms,
        )
        .await?;
        set_system_state(&mut *tx, "last_processed_event_key", &key.to_string(), now_ms).await?;
    }

    for intent in intents {
        intent_repo::insert_intent(&mut *tx, intent, now_ms).await?;
    }

    tx.commit().await?;
    Ok(RecordOutcome::Inserted)
}

/// Purge dedup records past their TTL.
pub async fn sweep_dedup(pool: &SqlitePool, before_ms: i64) -> anyhow::Result<u64> {
    let deleted = sqlx::query("DELETE FROM processed_txs WHERE created_at_ms < ?1")
        .bind(before_ms)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(deleted)
}

/// One-shot maintenance bypass: jump the cursor to `now` without backfill.
pub async fn apply_maintenance_skip(pool: &SqlitePool, now_ms: i64) -> anyhow::Result<()> {
    let key = EventKey {
        timestamp_ms: now_ms,
        event_index: 0,
        tx_hash: "maintenance".to_string(),
        symbol: "MAINTENANCE".to_string(),
    };
    let mut tx = pool.begin().await?;
    set_system_state(
        &mut *tx,
        "last_processed_timestamp_ms",
        &now_ms.to_string(),
        now_ms,
    )
    .await?;
    set_system_state(&mut *tx, "last_processed_event_key", &key.to_string(), now_ms).await?;
    set_system_state(
        &mut *tx,
        "maintenance_skip_applied_ms",
        &now_ms.to_string(),
        now_ms,
    )
    .await?;
    tx.commit().await?;
    Ok(())
}
