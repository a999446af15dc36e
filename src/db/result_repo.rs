use sqlx::{Row, SqlitePool};

use crate::db::{audit_repo, opt_decimal_from_db};
use crate::models::audit::category;
use crate::models::{AuditRecord, OrderResult, OrderStatus};

use super::decimal_from_db;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Applied { from: Option<OrderStatus> },
    /// The stored result already progressed past the proposed status; the
    /// write was refused to keep the FSM monotone.
    RejectedTransition { existing: OrderStatus },
}

/// Upsert a result keyed by correlation_id. Status transitions are validated
/// against the FSM; a status change appends the prior→new transition to the
/// audit log in the same transaction.
pub async fn upsert_result(
    pool: &SqlitePool,
    result: &OrderResult,
    now_ms: i64,
) -> anyhow::Result<UpsertOutcome> {
    let mut tx = pool.begin().await?;

    let existing = sqlx::query("SELECT status FROM order_results WHERE correlation_id = ?1")
        .bind(&result.correlation_id)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row.get::<String, _>("status"));
    let existing_status = existing.as_deref().and_then(OrderStatus::from_str_opt);

    if let Some(from) = existing_status {
        if !from.can_transition(result.status) {
            tx.rollback().await?;
            return Ok(UpsertOutcome::RejectedTransition { existing: from });
        }
    }

    if existing_status.map(|from| from != result.status).unwrap_or(true) {
        let record = AuditRecord::new(
            category::ORDER,
            &result.correlation_id,
            existing_status.map(|s| s.as_str()),
            result.status.as_str(),
            result.error_code.as_deref().unwrap_or(""),
            result.error_message.as_deref().unwrap_or(""),
            now_ms,
        );
        audit_repo::append_audit(&mut *tx, &record).await?;
    }

    sqlx::query(
        "INSERT INTO order_results( \
            correlation_id, exchange_order_id, status, filled_qty, avg_price, \
            error_code, error_message, contract_version, created_at_ms, updated_at_ms \
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
         ON CONFLICT(correlation_id) DO UPDATE SET \
            exchange_order_id = excluded.exchange_order_id, \
            status = excluded.status, \
            filled_qty = excluded.filled_qty, \
            avg_price = excluded.avg_price, \
            error_code = excluded.error_code, \
            error_message = excluded.error_message, \
            updated_at_ms = excluded.updated_at_ms",
    )
    .bind(&result.correlation_id)
    .bind(&result.exchange_order_id)
    .bind(result.status.as_str())
    .bind(result.filled_qty.to_string())
    .bind(result.avg_price.map(|p| p.to_string()))
    .bind(&result.error_code)
    .bind(&result.error_message)
    .bind(&result.contract_version)
    .bind(now_ms)
    .bind(now_ms)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(UpsertOutcome::Applied {
        from: existing_status,
    })
}

pub async fn get_result(pool: &SqlitePool, correlation_id: &str) -> anyhow::Result<Option<OrderResult>> {
    let row = sqlx::query(
        "SELECT correlation_id, exchange_order_id, status, filled_qty, avg_price, \
                error_code, error_message, contract_version, updated_at_ms \
         FROM order_results WHERE correlation_id = ?1",
    )
    .bind(correlation_id)
    .fetch_optional(pool)
    .await?;
    row.map(row_to_result).transpose()
}

/// Results still in flight (used on restart to re-query the venue).
pub async fn list_nonterminal(pool: &SqlitePool) -> anyhow::Result<Vec<OrderResult>> {
    let rows = sqlx::query(
        "SELECT correlation_id, exchange_order_id, status, filled_qty, avg_price, \
                error_code, error_message, contract_version, updated_at_ms \
         FROM order_results \
         WHERE status IN ('PENDING', 'SUBMITTED', 'PARTIALLY_FILLED', 'UNKNOWN') \
         ORDER BY updated_at_ms ASC",
    )
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(row_to_result).collect()
}

fn row_to_result(row: sqlx::sqlite::SqliteRow) -> anyhow::Result<OrderResult> {
    let status_raw: String = row.get("status");
    let status = OrderStatus::from_str_opt(&status_raw)
        .ok_or_else(|| anyhow::anyhow!("corrupt order status: {status_raw}"))?;
    Ok(OrderResult {
        correlation_id: row.get("correlation_id"),
        exchange_order_id: row.get("exchange_order_id"),
        status,
        filled_qty: decimal_from_db(&row.get::<String, _>("filled_qty"))?,
        avg_price: opt_decimal_from_db(row.get("avg_price"))?,
        error_code: row.get("error_code"),
        error_message: row.get("error_message"),
        contract_version: row.get("contract_version"),
        updated_at_ms: row.get("updated_at_ms"),
    })
}
