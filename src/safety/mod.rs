pub mod reconcile;

use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use sqlx::SqlitePool;

use crate::clock::Clock;
use crate::db::{get_system_state, intent_repo, safety_repo, set_system_state};
use crate::models::{SafetyMode, SafetyReason};
use crate::venue::ExecutionVenue;

pub use reconcile::{ReconcileConfig, ReconcileEvaluation, ReconcileVerdict};

#[derive(Debug, Clone)]
pub struct SafetyConfig {
    pub reconcile: ReconcileConfig,
    /// Consecutive non-critical reconciliations required before HALT may
    /// auto-recover to ARMED_SAFE.
    pub auto_recovery_required_noncritical: u32,
    /// Adapter must have succeeded within this window (and not errored) for
    /// auto-recovery.
    pub adapter_health_window_ms: i64,
    /// Whether the operator enabled the gap-HALT maintenance bypass.
    pub maintenance_skip_allowed: bool,
}

/// Periodic reconciliation between derived local positions and venue
/// positions, plus the HALT auto-recovery policy.
pub struct SafetyMonitor<V> {
    venue: Arc<V>,
    config: SafetyConfig,
    symbols: Vec<String>,
    clock: Arc<dyn Clock>,
}

impl<V: ExecutionVenue> SafetyMonitor<V> {
    pub fn new(
        venue: Arc<V>,
        config: SafetyConfig,
        symbols: Vec<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            venue,
            config,
            symbols,
            clock,
        }
    }

    /// Run one reconciliation pass and apply the decision table. Returns the
    /// raw evaluation so the caller can feed the auto-recovery counter, or
    /// `None` when the venue snapshot could not be fetched.
    pub async fn run_reconcile(
        &self,
        pool: &SqlitePool,
        context: &str,
    ) -> anyhow::Result<Option<ReconcileEvaluation>> {
        let now_ms = self.clock.now_ms();
        metrics::counter!("reconcile_runs_total").increment(1);

        let snapshot = match self.venue.fetch_positions(&self.symbols).await {
            Ok(snapshot) => {
                set_system_state(pool, "adapter_last_success_ms", &now_ms.to_string(), now_ms)
                    .await?;
                snapshot
            }
            Err(e) => {
                set_system_state(pool, "adapter_last_error_ms", &now_ms.to_string(), now_ms)
                    .await?;
                tracing::warn!(error = %e, context, "Reconcile failed to fetch venue positions");
                metrics::counter!("reconcile_failures_total").increment(1);
                if context == "startup" {
                    safety_repo::set_safety_state(
                        pool,
                        SafetyMode::Halt,
                        SafetyReason::ReconcileFailed,
                        "Startup reconciliation failed",
                        now_ms,
                    )
                    .await?;
                }
                return Ok(None);
            }
        };

        let local = intent_repo::load_local_positions(pool, &self.symbols).await?;
        let snapshot_age_ms = (now_ms - snapshot.timestamp_ms).max(0);
        let evaluation = reconcile::evaluate(
            &local,
            &snapshot.positions,
            snapshot_age_ms,
            &self.config.reconcile,
        );

        metrics::gauge!("reconcile_max_drift")
            .set(evaluation.report.max_drift.to_f64().unwrap_or(0.0));
        tracing::info!(
            context,
            max_drift = %evaluation.report.max_drift,
            verdict = ?evaluation.verdict,
            snapshot_age_ms,
            "Reconcile pass complete"
        );

        let current = safety_repo::load_safety_state(pool).await?;
        let current_mode = current.map(|s| s.mode).unwrap_or(SafetyMode::ArmedSafe);

        match &evaluation.verdict {
            ReconcileVerdict::Critical { message } => {
                safety_repo::set_safety_state(
                    pool,
                    SafetyMode::Halt,
                    SafetyReason::ReconcileCritical,
                    message,
                    now_ms,
                )
                .await?;
            }
            ReconcileVerdict::SnapshotStale => {
                // HALT is stickier than a stale snapshot; never soften it here.
                if current_mode != SafetyMode::Halt {
                    safety_repo::set_safety_state(
                        pool,
                        SafetyMode::ArmedSafe,
                        SafetyReason::SnapshotStale,
                        "Venue position snapshot is stale",
                        now_ms,
                    )
                    .await?;
                }
            }
            ReconcileVerdict::Warn => {
                tracing::warn!(
                    max_drift = %evaluation.report.max_drift,
                    "Position drift above warn threshold"
                );
                metrics::counter!("reconcile_warnings_total").increment(1);
            }
            ReconcileVerdict::Ok => {}
        }

        Ok(Some(evaluation))
    }

    /// HALT → ARMED_SAFE auto-recovery. Promotion out of ARMED_SAFE is never
    /// automatic. Returns true when a recovery transition was applied.
    pub async fn maybe_auto_recover(
        &self,
        pool: &SqlitePool,
        evaluation: Option<&ReconcileEvaluation>,
    ) -> anyhow::Result<bool> {
        let now_ms = self.clock.now_ms();
        let Some(state) = safety_repo::load_safety_state(pool).await? else {
            return Ok(false);
        };
        if state.mode != SafetyMode::Halt {
            set_system_state(pool, "halt_recovery_noncritical_count", "0", now_ms).await?;
            return Ok(false);
        }

        // Track consecutive non-critical reconciliations across ticks.
        let mut noncritical: u32 = get_system_state(pool, "halt_recovery_noncritical_count")
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        match evaluation {
            Some(eval) if eval.is_noncritical() => noncritical += 1,
            Some(_) => noncritical = 0,
            None => noncritical = 0,
        }
        set_system_state(
            pool,
            "halt_recovery_noncritical_count",
            &noncritical.to_string(),
            now_ms,
        )
        .await?;

        let allowlisted = matches!(
            state.reason_code,
            SafetyReason::SnapshotStale
                | SafetyReason::ReconcileCritical
                | SafetyReason::BackfillWindowExceeded
        );
        if !allowlisted {
            return Ok(false);
        }
        let Some(eval) = evaluation else {
            return Ok(false);
        };
        if eval.verdict == ReconcileVerdict::SnapshotStale {
            return Ok(false);
        }
        if noncritical < self.config.auto_recovery_required_noncritical {
            return Ok(false);
        }

        // Adapter health: a recent success and no recent exception.
        let last_success: i64 = get_system_state(pool, "adapter_last_success_ms")
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let last_error: i64 = get_system_state(pool, "adapter_last_error_ms")
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if now_ms - last_success > self.config.adapter_health_window_ms {
            return Ok(false);
        }
        if last_error > 0 && now_ms - last_error <= self.config.adapter_health_window_ms {
            return Ok(false);
        }

        if state.reason_code == SafetyReason::BackfillWindowExceeded {
            let skip_applied = get_system_state(pool, "maintenance_skip_applied_ms")
                .await?
                .is_some();
            if !self.config.maintenance_skip_allowed || !skip_applied {
                return Ok(false);
            }
        }

        tracing::warn!(
            reason = state.reason_code.as_str(),
            noncritical,
            "Auto-recovering HALT to reduce-only"
        );
        metrics::counter!("halt_auto_recoveries_total").increment(1);
        safety_repo::set_safety_state(
            pool,
            SafetyMode::ArmedSafe,
            SafetyReason::HaltRecoveryAuto,
            "Auto-recovered to reduce-only after HALT",
            now_ms,
        )
        .await?;
        set_system_state(pool, "halt_recovery_noncritical_count", "0", now_ms).await?;
        Ok(true)
    }
}
