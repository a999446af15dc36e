pub mod audit_repo;
pub mod baseline_repo;
pub mod event_repo;
pub mod intent_repo;
pub mod result_repo;
pub mod safety_repo;

use std::str::FromStr;

use anyhow::Context;
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

/// Monotone schema version persisted in system_state. Bumped on any table
/// change that needs a migration.
pub const SCHEMA_VERSION: i64 = 1;

/// Open (creating if missing) the local store. A single connection keeps the
/// single-writer discipline: every transaction holds the one connection, so
/// composite writes serialize and readers only ever observe committed state.
pub async fn init_pool(database_url: &str) -> anyhow::Result<SqlitePool> {
    if let Some(parent) = std::path::Path::new(database_url.trim_start_matches("sqlite://"))
        .parent()
        .filter(|p| !p.as_os_str().is_empty() && !database_url.contains(":memory:"))
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create store directory {}", parent.display()))?;
    }
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("invalid database url: {database_url}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(std::time::Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .context("failed to open local store")?;

    create_schema(&pool).await?;
    Ok(pool)
}

async fn create_schema(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::raw_sql(
        r#"
        CREATE TABLE IF NOT EXISTS processed_txs (
            tx_hash TEXT NOT NULL,
            event_index INTEGER NOT NULL,
            symbol TEXT NOT NULL,
            timestamp_ms INTEGER NOT NULL,
            is_replay INTEGER NOT NULL DEFAULT 0,
            created_at_ms INTEGER NOT NULL,
            PRIMARY KEY (tx_hash, event_index, symbol)
        );

        CREATE INDEX IF NOT EXISTS idx_processed_txs_created_at_ms
            ON processed_txs(created_at_ms);

        CREATE TABLE IF NOT EXISTS order_intents (
            correlation_id TEXT PRIMARY KEY,
            intent_payload TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS order_results (
            correlation_id TEXT PRIMARY KEY,
            exchange_order_id TEXT,
            status TEXT NOT NULL,
            filled_qty TEXT NOT NULL,
            avg_price TEXT,
            error_code TEXT,
            error_message TEXT,
            contract_version TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_order_results_status
            ON order_results(status);

        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            category TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            from_state TEXT,
            to_state TEXT NOT NULL,
            reason_code TEXT NOT NULL,
            reason_message TEXT NOT NULL,
            timestamp_ms INTEGER NOT NULL,
            metadata TEXT
        );

        CREATE TABLE IF NOT EXISTS baseline_snapshots (
            baseline_id TEXT PRIMARY KEY,
            created_at_ms INTEGER NOT NULL,
            operator TEXT NOT NULL,
            reason_message TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS baseline_positions (
            baseline_id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            qty TEXT NOT NULL,
            PRIMARY KEY (baseline_id, symbol)
        );

        CREATE TABLE IF NOT EXISTS system_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at_ms INTEGER NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create schema")?;

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaStatus {
    Current,
    /// Persisted version is lower than the code's and no migration applies.
    Behind { persisted: i64 },
}

/// Check the persisted schema version against the code's. A persisted
/// version *ahead* of the code is a fatal startup error; a lower non-zero
/// version without a migration is reported for the caller to HALT on.
pub async fn check_schema_version(pool: &SqlitePool, now_ms: i64) -> anyhow::Result<SchemaStatus> {
    match get_system_state(pool, "schema_version").await? {
        None => {
            set_system_state(pool, "schema_version", &SCHEMA_VERSION.to_string(), now_ms).await?;
            Ok(SchemaStatus::Current)
        }
        Some(raw) => {
            let persisted: i64 = raw
                .parse()
                .with_context(|| format!("corrupt schema_version: {raw}"))?;
            if persisted > SCHEMA_VERSION {
                anyhow::bail!(
                    "store schema version {persisted} is ahead of supported {SCHEMA_VERSION}"
                );
            }
            if persisted < SCHEMA_VERSION {
                return Ok(SchemaStatus::Behind { persisted });
            }
            Ok(SchemaStatus::Current)
        }
    }
}

pub async fn get_system_state<'e, E>(executor: E, key: &str) -> anyhow::Result<Option<String>>
where
    E: sqlx::SqliteExecutor<'e>,
{
    let row = sqlx::query("SELECT value FROM system_state WHERE key = ?1")
        .bind(key)
        .fetch_optional(executor)
        .await?;
    Ok(row.map(|r| r.get::<String, _>("value")))
}

pub async fn set_system_state<'e, E>(
    executor: E,
    key: &str,
    value: &str,
    now_ms: i64,
) -> anyhow::Result<()>
where
    E: sqlx::SqliteExecutor<'e>,
{
    sqlx::query(
        "INSERT INTO system_state(key, value, updated_at_ms) VALUES(?1, ?2, ?3) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at_ms = excluded.updated_at_ms",
    )
    .bind(key)
    .bind(value)
    .bind(now_ms)
    .execute(executor)
    .await?;
    Ok(())
}

pub(crate) fn decimal_from_db(raw: &str) -> anyhow::Result<Decimal> {
    Decimal::from_str(raw).with_context(|| format!("corrupt decimal column: {raw}"))
}

pub(crate) fn opt_decimal_from_db(raw: Option<String>) -> anyhow::Result<Option<Decimal>> {
    raw.map(|s| decimal_from_db(&s)).transpose()
}
