use sqlx::{Row, SqlitePool};

use crate::models::AuditRecord;

pub async fn append_audit<'e, E>(executor: E, record: &AuditRecord) -> anyhow::Result<()>
where
    E: sqlx::SqliteExecutor<'e>,
{
    let metadata = record
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    sqlx::query(
        "INSERT INTO audit_log( \
            category, entity_id, from_state, to_state, reason_code, reason_message, \
            timestamp_ms, metadata \
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )
    .bind(&record.category)
    .bind(&record.entity_id)
    .bind(&record.from_state)
    .bind(&record.to_state)
    .bind(&record.reason_code)
    .bind(&record.reason_message)
    .bind(record.timestamp_ms)
    .bind(metadata)
    .execute(executor)
    .await?;
    Ok(())
}

/// Most recent audit entries, newest first.
pub async fn list_recent(pool: &SqlitePool, limit: i64) -> anyhow::Result<Vec<AuditRecord>> {
    let rows = sqlx::query(
        "SELECT category, entity_id, from_state, to_state, reason_code, reason_message, \
                timestamp_ms, metadata \
         FROM audit_log ORDER BY id DESC LIMIT ?1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            let metadata: Option<String> = row.get("metadata");
            Ok(AuditRecord {
                category: row.get("category"),
                entity_id: row.get("entity_id"),
                from_state: row.get("from_state"),
                to_state: row.get("to_state"),
                reason_code: row.get("reason_code"),
                reason_message: row.get("reason_message"),
                timestamp_ms: row.get("timestamp_ms"),
                metadata: metadata.map(|m| serde_json::from_str(&m)).transpose()?,
            })
        })
        .collect()
}
