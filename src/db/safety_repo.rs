use sqlx::SqlitePool;

use crate::db::{audit_repo, get_system_state, set_system_state};
use crate::models::audit::category;
use crate::models::{AuditRecord, SafetyMode, SafetyReason, SafetyState};

pub async fn load_safety_state(pool: &SqlitePool) -> anyhow::Result<Option<SafetyState>> {
    let Some(mode_raw) = get_system_state(pool, "safety_mode").await? else {
        return Ok(None);
    };
    let mode = SafetyMode::from_str_opt(&mode_raw)
        .ok_or_else(|| anyhow::anyhow!("corrupt safety_mode: {mode_raw}"))?;
    let reason_code = get_system_state(pool, "safety_reason_code")
        .await?
        .and_then(|v| SafetyReason::from_str_opt(&v))
        .unwrap_or(SafetyReason::Bootstrap);
    let reason_message = get_system_state(pool, "safety_reason_message")
        .await?
        .unwrap_or_default();
    let changed_at_ms = get_system_state(pool, "safety_changed_at_ms")
        .await?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    Ok(Some(SafetyState {
        mode,
        reason_code,
        reason_message,
        changed_at_ms,
    }))
}

/// Persist a safety transition. The audit record is appended in the same
/// transaction, before the mode keys change, so the log is a strict superset
/// of externally visible state.
pub async fn set_safety_state(
    pool: &SqlitePool,
    mode: SafetyMode,
    reason_code: SafetyReason,
    reason_message: &str,
    now_ms: i64,
) -> anyhow::Result<()> {
    let previous = load_safety_state(pool).await?;
    let changed = previous
        .as_ref()
        .map(|p| p.mode != mode || p.reason_code != reason_code)
        .unwrap_or(true);

    let mut tx = pool.begin().await?;

    if changed {
        let record = AuditRecord::new(
            category::SAFETY,
            "safety_mode",
            previous.as_ref().map(|p| p.mode.as_str()),
            mode.as_str(),
            reason_code.as_str(),
            reason_message,
            now_ms,
        );
        audit_repo::append_audit(&mut *tx, &record).await?;
        metrics::counter!("safety_transitions_total").increment(1);
        tracing::info!(
            from = previous.as_ref().map(|p| p.mode.as_str()).unwrap_or("-"),
            to = mode.as_str(),
            reason = reason_code.as_str(),
            message = reason_message,
            "Safety transition"
        );
    }

    set_system_state(&mut *tx, "safety_mode", mode.as_str(), now_ms).await?;
    set_system_state(&mut *tx, "safety_reason_code", reason_code.as_str(), now_ms).await?;
    set_system_state(&mut *tx, "safety_reason_message", reason_message, now_ms).await?;
    set_system_state(&mut *tx, "safety_changed_at_ms", &now_ms.to_string(), now_ms).await?;

    tx.commit().await?;
    Ok(())
}
