use std::collections::{BTreeSet, HashMap};

use rust_decimal::Decimal;

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Drift at or above this emits a warning but keeps the mode.
    pub warn_threshold: Decimal,
    /// Drift at or above this is a HALT.
    pub critical_threshold: Decimal,
    /// Venue snapshot age beyond this degrades to ARMED_SAFE.
    pub snapshot_max_stale_ms: i64,
}

#[derive(Debug, Clone, Default)]
pub struct DriftReport {
    pub drifts: HashMap<String, Decimal>,
    pub max_drift: Decimal,
    /// Symbols with local exposure the venue does not show (after zero-filter).
    pub missing_on_venue: Vec<String>,
    /// Symbols with venue exposure the store does not show.
    pub missing_on_local: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileVerdict {
    Ok,
    Warn,
    SnapshotStale,
    Critical { message: String },
}

#[derive(Debug, Clone)]
pub struct ReconcileEvaluation {
    pub verdict: ReconcileVerdict,
    pub report: DriftReport,
}

impl ReconcileEvaluation {
    pub fn is_noncritical(&self) -> bool {
        matches!(self.verdict, ReconcileVerdict::Ok | ReconcileVerdict::Warn)
    }
}

pub fn compute_drift(
    local: &HashMap<String, Decimal>,
    venue: &HashMap<String, Decimal>,
) -> DriftReport {
    let symbols: BTreeSet<&String> = local.keys().chain(venue.keys()).collect();
    let mut report = DriftReport::default();
    for symbol in symbols {
        let local_qty = local.get(symbol).copied().unwrap_or(Decimal::ZERO);
        let venue_qty = venue.get(symbol).copied().unwrap_or(Decimal::ZERO);
        let drift = (local_qty - venue_qty).abs();
        report.max_drift = report.max_drift.max(drift);
        report.drifts.insert(symbol.clone(), drift);
        match (local_qty.is_zero(), venue_qty.is_zero()) {
            (false, true) => report.missing_on_venue.push(symbol.clone()),
            (true, false) => report.missing_on_local.push(symbol.clone()),
            _ => {}
        }
    }
    report
}

/// Apply the reconciliation decision table to one snapshot pair. Check order
/// matters: a stale snapshot is not trustworthy enough to HALT over, so
/// staleness is decided before the drift rows.
pub fn evaluate(
    local: &HashMap<String, Decimal>,
    venue: &HashMap<String, Decimal>,
    snapshot_age_ms: i64,
    config: &ReconcileConfig,
) -> ReconcileEvaluation {
    let report = compute_drift(local, venue);

    if config.snapshot_max_stale_ms > 0 && snapshot_age_ms > config.snapshot_max_stale_ms {
        return ReconcileEvaluation {
            verdict: ReconcileVerdict::SnapshotStale,
            report,
        };
    }
    if !report.missing_on_venue.is_empty() || !report.missing_on_local.is_empty() {
        let message = format!(
            "position missing: venue-side {:?}, local-side {:?}",
            report.missing_on_venue, report.missing_on_local
        );
        return ReconcileEvaluation {
            verdict: ReconcileVerdict::Critical { message },
            report,
        };
    }
    if config.critical_threshold > Decimal::ZERO && report.max_drift >= config.critical_threshold {
        let message = format!(
            "max drift {} >= critical threshold {}",
            report.max_drift, config.critical_threshold
        );
        return ReconcileEvaluation {
            verdict: ReconcileVerdict::Critical { message },
            report,
        };
    }
    if config.warn_threshold > Decimal::ZERO && report.max_drift >= config.warn_threshold {
        return ReconcileEvaluation {
            verdict: ReconcileVerdict::Warn,
            report,
        };
    }
    ReconcileEvaluation {
        verdict: ReconcileVerdict::Ok,
        report,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr as _;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn config() -> ReconcileConfig {
        ReconcileConfig {
            warn_threshold: dec("0.001"),
            critical_threshold: dec("0.01"),
            snapshot_max_stale_ms: 60_000,
        }
    }

    fn positions(pairs: &[(&str, &str)]) -> HashMap<String, Decimal> {
        pairs
            .iter()
            .map(|(symbol, qty)| (symbol.to_string(), dec(qty)))
            .collect()
    }

    #[test]
    fn test_matching_positions_ok() {
        let local = positions(&[("BTCUSDT", "0.1")]);
        let venue = positions(&[("BTCUSDT", "0.1")]);
        let eval = evaluate(&local, &venue, 1_000, &config());
        assert_eq!(eval.verdict, ReconcileVerdict::Ok);
        assert_eq!(eval.report.max_drift, Decimal::ZERO);
    }

    #[test]
    fn test_missing_symbol_is_critical() {
        let local = positions(&[("BTCUSDT", "0.1")]);
        let venue = HashMap::new();
        let eval = evaluate(&local, &venue, 1_000, &config());
        match eval.verdict {
            ReconcileVerdict::Critical { message } => {
                assert!(message.contains("BTCUSDT"));
            }
            other => panic!("expected critical, got {other:?}"),
        }
        assert_eq!(eval.report.missing_on_venue, vec!["BTCUSDT".to_string()]);
    }

    #[test]
    fn test_zero_filter_treats_zero_as_absent() {
        // Venue reporting an explicit zero is the same as missing.
        let local = positions(&[("BTCUSDT", "0.1")]);
        let venue = positions(&[("BTCUSDT", "0")]);
        let eval = evaluate(&local, &venue, 1_000, &config());
        assert!(matches!(eval.verdict, ReconcileVerdict::Critical { .. }));

        // Flat on both sides is not a divergence.
        let local = positions(&[("BTCUSDT", "0")]);
        let venue = HashMap::new();
        let eval = evaluate(&local, &venue, 1_000, &config());
        assert_eq!(eval.verdict, ReconcileVerdict::Ok);
    }

    #[test]
    fn test_critical_drift_threshold() {
        let local = positions(&[("BTCUSDT", "0.5")]);
        let venue = positions(&[("BTCUSDT", "0.45")]);
        let eval = evaluate(&local, &venue, 1_000, &config());
        assert!(matches!(eval.verdict, ReconcileVerdict::Critical { .. }));
        assert_eq!(eval.report.max_drift, dec("0.05"));
    }

    #[test]
    fn test_warn_band_keeps_mode() {
        let local = positions(&[("BTCUSDT", "0.5")]);
        let venue = positions(&[("BTCUSDT", "0.498")]);
        let eval = evaluate(&local, &venue, 1_000, &config());
        assert_eq!(eval.verdict, ReconcileVerdict::Warn);
    }

    #[test]
    fn test_stale_snapshot_wins_over_drift() {
        let local = positions(&[("BTCUSDT", "0.5")]);
        let venue = HashMap::new();
        let eval = evaluate(&local, &venue, 120_000, &config());
        assert_eq!(eval.verdict, ReconcileVerdict::SnapshotStale);
    }
}
