use std::fmt;

use serde::{Deserialize, Serialize};

/// Global ternary gate controlling what kinds of intents may submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyMode {
    ArmedLive,
    ArmedSafe,
    Halt,
}

impl SafetyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyMode::ArmedLive => "ARMED_LIVE",
            SafetyMode::ArmedSafe => "ARMED_SAFE",
            SafetyMode::Halt => "HALT",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "ARMED_LIVE" => Some(SafetyMode::ArmedLive),
            "ARMED_SAFE" => Some(SafetyMode::ArmedSafe),
            "HALT" => Some(SafetyMode::Halt),
            _ => None,
        }
    }
}

impl fmt::Display for SafetyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of reason codes attached to safety transitions and surfaced
/// through system_state and the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyReason {
    Bootstrap,
    Ok,
    SnapshotStale,
    ReconcileWarn,
    ReconcileCritical,
    ReconcileFailed,
    BackfillWindowExceeded,
    IngestBackfillFailed,
    SchemaVersionMismatch,
    ContractVersionMismatch,
    ConfigHashChanged,
    ExecutionRetryBudgetExceeded,
    HaltRecoveryAuto,
    MaintenanceSkip,
    Operator,
}

impl SafetyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyReason::Bootstrap => "BOOTSTRAP",
            SafetyReason::Ok => "OK",
            SafetyReason::SnapshotStale => "SNAPSHOT_STALE",
            SafetyReason::ReconcileWarn => "RECONCILE_WARN",
            SafetyReason::ReconcileCritical => "RECONCILE_CRITICAL",
            SafetyReason::ReconcileFailed => "RECONCILE_FAILED",
            SafetyReason::BackfillWindowExceeded => "BACKFILL_WINDOW_EXCEEDED",
            SafetyReason::IngestBackfillFailed => "INGEST_BACKFILL_FAILED",
            SafetyReason::SchemaVersionMismatch => "SCHEMA_VERSION_MISMATCH",
            SafetyReason::ContractVersionMismatch => "CONTRACT_VERSION_MISMATCH",
            SafetyReason::ConfigHashChanged => "CONFIG_HASH_CHANGED",
            SafetyReason::ExecutionRetryBudgetExceeded => "EXECUTION_RETRY_BUDGET_EXCEEDED",
            SafetyReason::HaltRecoveryAuto => "HALT_RECOVERY_AUTO",
            SafetyReason::MaintenanceSkip => "MAINTENANCE_SKIP",
            SafetyReason::Operator => "OPERATOR",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "BOOTSTRAP" => Some(SafetyReason::Bootstrap),
            "OK" => Some(SafetyReason::Ok),
            "SNAPSHOT_STALE" => Some(SafetyReason::SnapshotStale),
            "RECONCILE_WARN" => Some(SafetyReason::ReconcileWarn),
            "RECONCILE_CRITICAL" => Some(SafetyReason::ReconcileCritical),
            "RECONCILE_FAILED" => Some(SafetyReason::ReconcileFailed),
            "BACKFILL_WINDOW_EXCEEDED" => Some(SafetyReason::BackfillWindowExceeded),
            "INGEST_BACKFILL_FAILED" => Some(SafetyReason::IngestBackfillFailed),
            "SCHEMA_VERSION_MISMATCH" => Some(SafetyReason::SchemaVersionMismatch),
            "CONTRACT_VERSION_MISMATCH" => Some(SafetyReason::ContractVersionMismatch),
            "CONFIG_HASH_CHANGED" => Some(SafetyReason::ConfigHashChanged),
            "EXECUTION_RETRY_BUDGET_EXCEEDED" => Some(SafetyReason::ExecutionRetryBudgetExceeded),
            "HALT_RECOVERY_AUTO" => Some(SafetyReason::HaltRecoveryAuto),
            "MAINTENANCE_SKIP" => Some(SafetyReason::MaintenanceSkip),
            "OPERATOR" => Some(SafetyReason::Operator),
            _ => None,
        }
    }
}

impl fmt::Display for SafetyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyState {
    pub mode: SafetyMode,
    pub reason_code: SafetyReason,
    pub reason_message: String,
    pub changed_at_ms: i64,
}

impl SafetyState {
    pub fn bootstrap(now_ms: i64) -> Self {
        Self {
            mode: SafetyMode::ArmedSafe,
            reason_code: SafetyReason::Bootstrap,
            reason_message: "Initial bootstrap state".to_string(),
            changed_at_ms: now_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_round_trip() {
        for mode in [SafetyMode::ArmedLive, SafetyMode::ArmedSafe, SafetyMode::Halt] {
            assert_eq!(SafetyMode::from_str_opt(mode.as_str()), Some(mode));
        }
        assert_eq!(SafetyMode::from_str_opt("ARMED"), None);
    }

    #[test]
    fn test_reason_round_trip() {
        for reason in [
            SafetyReason::Bootstrap,
            SafetyReason::SnapshotStale,
            SafetyReason::ReconcileCritical,
            SafetyReason::BackfillWindowExceeded,
            SafetyReason::ExecutionRetryBudgetExceeded,
            SafetyReason::HaltRecoveryAuto,
        ] {
            assert_eq!(SafetyReason::from_str_opt(reason.as_str()), Some(reason));
        }
    }
}
