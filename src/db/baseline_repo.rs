use std::collections::HashMap;

use rust_decimal::Decimal;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::db::decimal_from_db;
use crate::models::normalize_execution_symbol;

/// Operator-installed reference positions added to derived local positions
/// during reconciliation, so manual/external exposure counts as approved.
#[derive(Debug, Clone)]
pub struct BaselineSnapshot {
    pub baseline_id: String,
    pub created_at_ms: i64,
    pub operator: String,
    pub reason_message: String,
    pub positions: HashMap<String, Decimal>,
}

pub async fn load_active_baseline(pool: &SqlitePool) -> anyhow::Result<Option<BaselineSnapshot>> {
    let Some(row) = sqlx::query(
        "SELECT baseline_id, created_at_ms, operator, reason_message \
         FROM baseline_snapshots WHERE active = 1 \
         ORDER BY created_at_ms DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?
    else {
        return Ok(None);
    };

    let baseline_id: String = row.get("baseline_id");
    let positions_rows =
        sqlx::query("SELECT symbol, qty FROM baseline_positions WHERE baseline_id = ?1")
            .bind(&baseline_id)
            .fetch_all(pool)
            .await?;

    let mut positions = HashMap::new();
    for pos in positions_rows {
        let symbol: String = pos.get("symbol");
        let qty = decimal_from_db(&pos.get::<String, _>("qty"))?;
        positions.insert(normalize_execution_symbol(&symbol), qty);
    }

    Ok(Some(BaselineSnapshot {
        baseline_id,
        created_at_ms: row.get("created_at_ms"),
        operator: row.get("operator"),
        reason_message: row.get("reason_message"),
        positions,
    }))
}

/// Install a new baseline. Without `replace`, refuses when one is already
/// active.
pub async fn insert_baseline(
    pool: &SqlitePool,
    positions: &HashMap<String, Decimal>,
    operator: &str,
    reason_message: &str,
    replace: bool,
    now_ms: i64,
) -> anyhow::Result<BaselineSnapshot> {
    if !replace {
        let existing = sqlx::query("SELECT baseline_id FROM baseline_snapshots WHERE active = 1 LIMIT 1")
            .fetch_optional(pool)
            .await?;
        if existing.is_some() {
            anyhow::bail!("an active baseline already exists");
        }
    }

    let baseline_id = Uuid::new_v4().to_string();
    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE baseline_snapshots SET active = 0 WHERE active = 1")
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "INSERT INTO baseline_snapshots(baseline_id, created_at_ms, operator, reason_message, active) \
         VALUES (?1, ?2, ?3, ?4, 1)",
    )
    .bind(&baseline_id)
    .bind(now_ms)
    .bind(operator)
    .bind(reason_message)
    .execute(&mut *tx)
    .await?;

    let mut normalized = HashMap::new();
    for (symbol, qty) in positions {
        let symbol = normalize_execution_symbol(symbol);
        sqlx::query("INSERT INTO baseline_positions(baseline_id, symbol, qty) VALUES (?1, ?2, ?3)")
            .bind(&baseline_id)
            .bind(&symbol)
            .bind(qty.to_string())
            .execute(&mut *tx)
            .await?;
        normalized.insert(symbol, *qty);
    }
    tx.commit().await?;

    Ok(BaselineSnapshot {
        baseline_id,
        created_at_ms: now_ms,
        operator: operator.to_string(),
        reason_message: reason_message.to_string(),
        positions: normalized,
    })
}

pub async fn reset_baseline(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query("UPDATE baseline_snapshots SET active = 0 WHERE active = 1")
        .execute(pool)
        .await?;
    Ok(())
}
