use std::collections::HashMap;

use rust_decimal::Decimal;
use sqlx::{Row, SqlitePool};

use crate::db::{baseline_repo, decimal_from_db};
use crate::models::{normalize_execution_symbol, OrderIntent, OrderStatus};

/// Insert-or-ignore by correlation_id. Once stored the payload never changes.
pub async fn insert_intent<'e, E>(executor: E, intent: &OrderIntent, now_ms: i64) -> anyhow::Result<bool>
where
    E: sqlx::SqliteExecutor<'e>,
{
    let payload = serde_json::to_string(intent)?;
    let inserted = sqlx::query(
        "INSERT OR IGNORE INTO order_intents(correlation_id, intent_payload, created_at_ms) \
         VALUES (?1, ?2, ?3)",
    )
    .bind(&intent.correlation_id)
    .bind(payload)
    .bind(now_ms)
    .execute(executor)
    .await?
    .rows_affected();
    Ok(inserted > 0)
}

pub async fn get_intent(pool: &SqlitePool, correlation_id: &str) -> anyhow::Result<Option<OrderIntent>> {
    let row = sqlx::query("SELECT intent_payload FROM order_intents WHERE correlation_id = ?1")
        .bind(correlation_id)
        .fetch_optional(pool)
        .await?;
    row.map(|r| {
        let payload: String = r.get("intent_payload");
        serde_json::from_str(&payload).map_err(Into::into)
    })
    .transpose()
}

/// Derive local positions by joining intents with their results: each pair
/// contributes `side_sign × min(intent.qty, filled_qty)`. Pass an empty
/// symbol list to get every symbol.
pub async fn derive_local_positions(
    pool: &SqlitePool,
    symbols: &[String],
    since_ms: Option<i64>,
) -> anyhow::Result<HashMap<String, Decimal>> {
    let rows = sqlx::query(
        "SELECT i.intent_payload, r.status, r.filled_qty, r.created_at_ms \
         FROM order_intents i \
         JOIN order_results r ON r.correlation_id = i.correlation_id",
    )
    .fetch_all(pool)
    .await?;

    let wanted: Vec<String> = symbols.iter().map(|s| normalize_execution_symbol(s)).collect();
    let mut positions: HashMap<String, Decimal> = HashMap::new();
    for row in rows {
        if let Some(since) = since_ms {
            let created: i64 = row.get("created_at_ms");
            if created < since {
                continue;
            }
        }
        let status_raw: String = row.get("status");
        let Some(status) = OrderStatus::from_str_opt(&status_raw) else {
            tracing::warn!(status = %status_raw, "Skipping result row with unknown status");
            continue;
        };
        if status == OrderStatus::Pending || status == OrderStatus::Rejected {
            continue;
        }
        let filled = decimal_from_db(&row.get::<String, _>("filled_qty"))?;
        if filled.is_zero() {
            continue;
        }
        let payload: String = row.get("intent_payload");
        let intent: OrderIntent = serde_json::from_str(&payload)?;
        let symbol = normalize_execution_symbol(&intent.symbol);
        if !wanted.is_empty() && !wanted.contains(&symbol) {
            continue;
        }
        let effective = intent.qty.min(filled);
        *positions.entry(symbol).or_insert(Decimal::ZERO) += intent.side.sign() * effective;
    }
    Ok(positions)
}

/// Positions used for reconciliation: order-derived positions on top of the
/// operator-installed baseline (orders before the baseline are already part
/// of it).
pub async fn load_local_positions(
    pool: &SqlitePool,
    symbols: &[String],
) -> anyhow::Result<HashMap<String, Decimal>> {
    let baseline = baseline_repo::load_active_baseline(pool).await?;
    let since_ms = baseline.as_ref().map(|b| b.created_at_ms);
    let mut positions = derive_local_positions(pool, symbols, since_ms).await?;
    if let Some(baseline) = baseline {
        for (symbol, qty) in baseline.positions {
            *positions.entry(symbol).or_insert(Decimal::ZERO) += qty;
        }
    }
    Ok(positions)
}
