use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::clock::Clock;
use crate::config::{AppConfig, RunMode};
use crate::db::{
    audit_repo, check_schema_version, event_repo, get_system_state, intent_repo, safety_repo,
    set_system_state, SchemaStatus,
};
use crate::decision::{DecisionInputs, DecisionService};
use crate::execution::OrderExecutor;
use crate::ingestion::coordinator::IngestCoordinator;
use crate::models::audit::category;
use crate::models::{
    assert_contract_version, normalize_execution_symbol, AuditRecord, PositionDeltaEvent,
    SafetyMode, SafetyReason, SafetyState, CONTRACT_VERSION,
};
use crate::safety::SafetyMonitor;
use crate::venue::ExecutionVenue;

/// Supervises the startup state machine and the main processing loop:
/// ingest poll → decision → atomic store commit → execution, with
/// reconciliation on a cadence and heartbeat for observability.
pub struct Orchestrator<V> {
    pool: SqlitePool,
    coordinator: IngestCoordinator,
    decision: DecisionService,
    executor: OrderExecutor<V>,
    monitor: SafetyMonitor<V>,
    venue: Arc<V>,
    config: AppConfig,
    mode: RunMode,
    clock: Arc<dyn Clock>,
}

impl<V: ExecutionVenue> Orchestrator<V> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        coordinator: IngestCoordinator,
        decision: DecisionService,
        executor: OrderExecutor<V>,
        monitor: SafetyMonitor<V>,
        venue: Arc<V>,
        config: AppConfig,
        mode: RunMode,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pool,
            coordinator,
            decision,
            executor,
            monitor,
            venue,
            config,
            mode,
            clock,
        }
    }

    pub async fn run(mut self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        tracing::info!(mode = %self.mode, "Bootstrap starting");
        self.bootstrap().await?;

        self.snapshot_check().await;
        // Without live credentials the signed position endpoint cannot
        // succeed, so only live mode escalates a failed startup reconcile.
        let startup_context = if self.mode == RunMode::Live { "startup" } else { "boot" };
        self.monitor.run_reconcile(&self.pool, startup_context).await?;

        // Resume whatever execution was in flight before the restart, then
        // catch up on missed events.
        self.executor.recover_nonterminal(&self.pool).await?;
        let now = self.clock.now_ms();
        let events = self
            .coordinator
            .run_once(&self.pool, self.mode != RunMode::BackfillOnly, now)
            .await?;
        if !events.is_empty() {
            tracing::info!(count = events.len(), "Backfill catch-up events");
            self.process_events(events).await?;
        }
        // In live mode the startup catch-up must actually reach the source;
        // a retry budget exhausted here means we cannot know what was missed.
        if self.mode == RunMode::Live {
            let cursor = event_repo::load_cursor(&self.pool).await?;
            if cursor.last_ingest_success_ms == 0 {
                safety_repo::set_safety_state(
                    &self.pool,
                    SafetyMode::Halt,
                    SafetyReason::IngestBackfillFailed,
                    "Startup backfill never reached the leader source",
                    now,
                )
                .await?;
            }
        }

        let state = safety_repo::load_safety_state(&self.pool).await?;
        tracing::info!(
            mode = %self.mode,
            safety = state.as_ref().map(|s| s.mode.as_str()).unwrap_or("-"),
            "Bootstrap complete, entering main loop"
        );

        self.run_loop(shutdown).await
    }

    // -- startup ------------------------------------------------------------

    async fn bootstrap(&self) -> anyhow::Result<()> {
        let now = self.clock.now_ms();

        match check_schema_version(&self.pool, now).await? {
            SchemaStatus::Current => {}
            SchemaStatus::Behind { persisted } => {
                tracing::error!(persisted, expected = crate::db::SCHEMA_VERSION, "Schema behind code");
                safety_repo::set_safety_state(
                    &self.pool,
                    SafetyMode::Halt,
                    SafetyReason::SchemaVersionMismatch,
                    &format!("store schema {persisted} has no migration path"),
                    now,
                )
                .await?;
            }
        }

        if safety_repo::load_safety_state(&self.pool).await?.is_none() {
            let state = SafetyState::bootstrap(now);
            safety_repo::set_safety_state(
                &self.pool,
                state.mode,
                state.reason_code,
                &state.reason_message,
                now,
            )
            .await?;
        }
        if get_system_state(&self.pool, "last_processed_timestamp_ms").await?.is_none() {
            set_system_state(&self.pool, "last_processed_timestamp_ms", "0", now).await?;
        }
        if get_system_state(&self.pool, "last_processed_event_key").await?.is_none() {
            set_system_state(&self.pool, "last_processed_event_key", "", now).await?;
        }

        // A store written by a newer contract must not be consumed (I7).
        if let Some(existing) = get_system_state(&self.pool, "contract_version").await? {
            if let Err(e) = assert_contract_version(&existing) {
                tracing::error!(error = %e, "Persisted contract version incompatible");
                safety_repo::set_safety_state(
                    &self.pool,
                    SafetyMode::Halt,
                    SafetyReason::ContractVersionMismatch,
                    &e.to_string(),
                    now,
                )
                .await?;
            }
        }
        set_system_state(&self.pool, "contract_version", CONTRACT_VERSION, now).await?;

        let config_hash = self.config.config_hash();
        if let Some(previous) = get_system_state(&self.pool, "config_hash").await? {
            if previous != config_hash {
                tracing::warn!(previous = %previous, "Config hash changed since last run");
                let mode = safety_repo::load_safety_state(&self.pool)
                    .await?
                    .map(|s| s.mode)
                    .unwrap_or(SafetyMode::ArmedSafe);
                if mode != SafetyMode::Halt {
                    safety_repo::set_safety_state(
                        &self.pool,
                        mode,
                        SafetyReason::ConfigHashChanged,
                        "Config hash changed; continuing per operator policy",
                        now,
                    )
                    .await?;
                }
            }
        }
        set_system_state(&self.pool, "config_hash", &config_hash, now).await?;
        set_system_state(&self.pool, "config_version", &self.config.config_version, now).await?;

        Ok(())
    }

    /// Capture the venue clock offset early so signed requests are valid and
    /// the operator can see skew in the logs.
    async fn snapshot_check(&self) {
        match self.venue.server_time().await {
            Ok(server_ms) => {
                let offset = server_ms - self.clock.now_ms();
                tracing::info!(offset_ms = offset, "Venue server time captured");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Venue server time unavailable at startup");
            }
        }
    }

    // -- event pipeline -----------------------------------------------------

    async fn process_events(&self, events: Vec<PositionDeltaEvent>) -> anyhow::Result<usize> {
        let mut executed = 0usize;
        for event in events {
            let now = self.clock.now_ms();
            let inputs = self.build_inputs(&event).await?;
            let output = self.decision.decide(&event, &inputs);

            for rejection in &output.rejections {
                metrics::counter!("decision_rejections_total").increment(1);
                tracing::warn!(
                    symbol = %event.symbol,
                    tx_hash = %event.tx_hash,
                    reason = rejection.reason.as_str(),
                    detail = %rejection.detail,
                    "Decision rejected event component"
                );
                let record = AuditRecord::new(
                    category::DECISION,
                    &event.key().to_string(),
                    None,
                    "rejected",
                    rejection.reason.as_str(),
                    &rejection.detail,
                    now,
                );
                audit_repo::append_audit(&self.pool, &record).await?;
            }

            // Dedup insert, cursor advance, and intent rows commit together;
            // only a fresh event reaches execution.
            match event_repo::record_event(&self.pool, &event, &output.intents, now).await? {
                event_repo::RecordOutcome::Duplicate => {
                    metrics::counter!("events_duplicate_total").increment(1);
                    tracing::debug!(key = %event.key(), "Event already processed");
                    continue;
                }
                event_repo::RecordOutcome::Inserted => {}
            }

            metrics::counter!("intents_built_total").increment(output.intents.len() as u64);
            for intent in &output.intents {
                match self.executor.execute(&self.pool, intent).await {
                    Ok(result) => {
                        executed += 1;
                        tracing::info!(
                            correlation_id = %intent.correlation_id,
                            status = %result.status,
                            filled = %result.filled_qty,
                            "Intent executed"
                        );
                    }
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            correlation_id = %intent.correlation_id,
                            "Execution failed"
                        );
                    }
                }
            }
        }
        Ok(executed)
    }

    async fn build_inputs(&self, event: &PositionDeltaEvent) -> anyhow::Result<DecisionInputs> {
        let now = self.clock.now_ms();
        let safety_mode = safety_repo::load_safety_state(&self.pool)
            .await?
            .map(|s| s.mode);

        let positions =
            intent_repo::load_local_positions(&self.pool, &[event.symbol.clone()]).await?;
        let local = positions
            .get(&normalize_execution_symbol(&event.symbol))
            .copied()
            .unwrap_or_default();

        let reference_price = match self.venue.fetch_mark_price(&event.symbol).await {
            Ok(snapshot) => {
                set_system_state(&self.pool, "adapter_last_success_ms", &now.to_string(), now)
                    .await?;
                Some(snapshot)
            }
            Err(e) => {
                set_system_state(&self.pool, "adapter_last_error_ms", &now.to_string(), now)
                    .await?;
                tracing::debug!(error = %e, symbol = %event.symbol, "Mark price unavailable");
                None
            }
        };
        let filters = if self.decision.config.filters_enabled {
            self.venue.fetch_filters(&event.symbol).await.ok()
        } else {
            None
        };

        Ok(DecisionInputs {
            safety_mode,
            local_current_position: Some(local),
            closable_qty: Some(local.abs()),
            reference_price,
            filters,
            now_ms: now,
        })
    }

    // -- main loop ----------------------------------------------------------

    async fn run_loop(&mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let idle_sleep = self.config.loop_idle_sleep_sec.max(1);
        let max_idle_sleep = self.config.loop_max_idle_sleep_sec.max(idle_sleep);
        let reconcile_interval_ms = self.config.reconcile_interval_sec as i64 * 1_000;
        let heartbeat_ms = self.config.heartbeat_sec.max(1) as i64 * 1_000;
        let tick_warn_ms = self.config.tick_warn_sec.max(1) as i64 * 1_000;

        let mut idle_backoff = idle_sleep;
        let mut next_reconcile_ms = self.clock.now_ms();
        let mut last_heartbeat_ms = 0i64;

        loop {
            if *shutdown.borrow() {
                break;
            }
            let tick_start = self.clock.now_ms();
            set_system_state(&self.pool, "loop_last_tick_started_ms", &tick_start.to_string(), tick_start)
                .await?;

            let mut evaluation = None;
            if reconcile_interval_ms > 0 && tick_start >= next_reconcile_ms {
                evaluation = self.monitor.run_reconcile(&self.pool, "loop").await?;
                next_reconcile_ms = tick_start + reconcile_interval_ms;
            }
            self.monitor
                .maybe_auto_recover(&self.pool, evaluation.as_ref())
                .await?;

            let halted = safety_repo::load_safety_state(&self.pool)
                .await?
                .map(|s| s.mode == SafetyMode::Halt)
                .unwrap_or(false);

            // In HALT the loop keeps ingest/reconcile/heartbeat alive for
            // observability; the coordinator itself refuses to advance.
            let events = self
                .coordinator
                .run_once(&self.pool, self.mode != RunMode::BackfillOnly, self.clock.now_ms())
                .await?;

            if !halted && !events.is_empty() {
                let count = events.len();
                let executed = self.process_events(events).await?;
                tracing::info!(event_count = count, executed, "Loop tick processed events");
                idle_backoff = idle_sleep;
                if self.config.loop_active_sleep_sec > 0 {
                    self.interruptible_sleep(self.config.loop_active_sleep_sec, &mut shutdown)
                        .await;
                }
            } else {
                tracing::debug!(sleep_sec = idle_backoff, halted, "Loop idle");
                self.interruptible_sleep(idle_backoff, &mut shutdown).await;
                idle_backoff = (idle_backoff * 2).min(max_idle_sleep);
            }

            let tick_end = self.clock.now_ms();
            set_system_state(&self.pool, "loop_last_tick_ms", &tick_end.to_string(), tick_end)
                .await?;
            let duration_ms = tick_end - tick_start;
            metrics::histogram!("loop_tick_seconds").record(duration_ms as f64 / 1_000.0);
            if duration_ms >= tick_warn_ms {
                tracing::warn!(duration_ms, "Slow loop tick");
            }
            if tick_end - last_heartbeat_ms >= heartbeat_ms {
                last_heartbeat_ms = tick_end;
                let state = safety_repo::load_safety_state(&self.pool).await?;
                tracing::info!(
                    safety = state.as_ref().map(|s| s.mode.as_str()).unwrap_or("-"),
                    last_tick_ms = tick_end,
                    "Heartbeat"
                );
            }
        }

        tracing::info!("Shutdown requested, draining");
        Ok(())
    }

    async fn interruptible_sleep(&self, secs: u64, shutdown: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = sleep(Duration::from_secs(secs)) => {}
            _ = shutdown.changed() => {}
        }
    }
}
