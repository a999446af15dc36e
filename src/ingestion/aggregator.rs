use std::collections::HashMap;
use std::str::FromStr;

use rust_decimal::Decimal;

use crate::models::{LeaderFill, PositionDeltaEvent};

/// One aggregated position move, pre-contract. A group of fills sharing
/// `(tx_hash, coin)` collapses to at most one of these.
#[derive(Debug, Clone)]
pub struct RawDelta {
    pub symbol: String,
    pub tx_hash: String,
    pub event_index: i64,
    pub timestamp_ms: i64,
    pub prev_net: Decimal,
    pub next_net: Decimal,
    pub expected_price: Option<Decimal>,
}

#[derive(Debug, Default)]
pub struct AggregationStats {
    pub fills_seen: u64,
    pub fills_unmapped: u64,
    pub fills_invalid: u64,
    pub fills_missing_hash: u64,
    pub groups_emitted: u64,
    pub groups_dropped: u64,
}

/// The venue splits one leader order into many fills under one tx hash;
/// per-fill deltas are too small for the execution venue's filters, so the
/// whole group must collapse into a single net move.
///
/// Groups by `(tx_hash, coin)`, orders each group by `(time_ms, tid)`, and
/// nets the signed sizes. Unmapped coins (including `@`-prefixed spot-style
/// ids) are dropped; fills with an invalid side or size are skipped but do
/// not poison the rest of their group.
pub fn aggregate_fills(
    fills: &[LeaderFill],
    symbol_map: &HashMap<String, String>,
) -> (Vec<RawDelta>, AggregationStats) {
    let mut stats = AggregationStats {
        fills_seen: fills.len() as u64,
        ..Default::default()
    };

    let mut groups: HashMap<(String, String), Vec<&LeaderFill>> = HashMap::new();
    for fill in fills {
        if fill.coin.starts_with('@') || !symbol_map.contains_key(&fill.coin) {
            stats.fills_unmapped += 1;
            tracing::warn!(coin = %fill.coin, "Dropping fill for unmapped coin");
            continue;
        }
        if fill.tx_hash.as_deref().map(str::is_empty).unwrap_or(true) {
            stats.fills_missing_hash += 1;
        }
        groups
            .entry((fill.tx_hash_or_tid(), fill.coin.clone()))
            .or_default()
            .push(fill);
    }

    let mut deltas = Vec::with_capacity(groups.len());
    for ((tx_hash, coin), mut group) in groups {
        group.sort_by_key(|f| (f.time_ms, f.tid.unwrap_or(0)));
        let symbol = symbol_map[&coin].clone();
        match aggregate_group(&group, &tx_hash, &coin, &symbol, &mut stats) {
            Some(delta) => {
                stats.groups_emitted += 1;
                deltas.push(delta);
            }
            None => stats.groups_dropped += 1,
        }
    }

    // Monotone hand-off to the pipeline under the cursor composite key.
    deltas.sort_by(|a, b| {
        (a.timestamp_ms, a.event_index, &a.tx_hash, &a.symbol).cmp(&(
            b.timestamp_ms,
            b.event_index,
            &b.tx_hash,
            &b.symbol,
        ))
    });

    (deltas, stats)
}

struct ParsedFill {
    signed_size: Decimal,
    start_position: Option<Decimal>,
    px: Option<Decimal>,
}

fn parse_fill(fill: &LeaderFill) -> Option<ParsedFill> {
    let sign = match fill.side.as_deref() {
        Some("B") | Some("b") => Decimal::ONE,
        Some("A") | Some("a") => -Decimal::ONE,
        _ => return None,
    };
    let size = fill
        .size
        .as_deref()
        .and_then(|s| Decimal::from_str(s).ok())?;
    Some(ParsedFill {
        signed_size: sign * size,
        start_position: fill
            .start_position
            .as_deref()
            .and_then(|s| Decimal::from_str(s).ok()),
        px: fill.px.as_deref().and_then(|s| Decimal::from_str(s).ok()),
    })
}

fn aggregate_group(
    group: &[&LeaderFill],
    tx_hash: &str,
    coin: &str,
    symbol: &str,
    stats: &mut AggregationStats,
) -> Option<RawDelta> {
    let mut total_delta = Decimal::ZERO;
    let mut prev_net: Option<Decimal> = None;
    let mut last_snapshot: Option<(Decimal, Decimal)> = None;
    let mut px_volume = Decimal::ZERO;
    let mut px_weighted = Decimal::ZERO;
    let mut sides_seen = [false; 2];
    let mut valid = 0usize;

    for fill in group {
        let Some(parsed) = parse_fill(fill) else {
            stats.fills_invalid += 1;
            tracing::warn!(tx_hash, coin, side = ?fill.side, "Skipping fill with invalid side or size");
            continue;
        };
        valid += 1;
        sides_seen[if parsed.signed_size >= Decimal::ZERO { 0 } else { 1 }] = true;
        total_delta += parsed.signed_size;
        if prev_net.is_none() {
            prev_net = parsed.start_position;
        }
        if let Some(start) = parsed.start_position {
            last_snapshot = Some((start, parsed.signed_size));
        }
        if let Some(px) = parsed.px {
            let size = parsed.signed_size.abs();
            px_volume += size;
            px_weighted += px * size;
        }
    }

    if valid == 0 {
        tracing::warn!(tx_hash, coin, "Dropping fill group with no valid sides");
        return None;
    }
    if sides_seen[0] && sides_seen[1] {
        tracing::warn!(tx_hash, coin, "Fill group mixes buy and sell sides");
    }

    let prev_net = prev_net.unwrap_or(Decimal::ZERO);
    let derived_next = prev_net + total_delta;
    // Prefer the venue's own post-fill snapshot for the next position.
    let next_net = match last_snapshot {
        Some((start, delta)) => start + delta,
        None => derived_next,
    };
    if (derived_next - next_net).abs() > Decimal::new(1, 9) {
        tracing::warn!(
            tx_hash,
            coin,
            derived = %derived_next,
            snapshot = %next_net,
            "Derived next position disagrees with venue snapshot"
        );
    }

    let last = group.last().expect("group is non-empty");
    Some(RawDelta {
        symbol: symbol.to_string(),
        tx_hash: tx_hash.to_string(),
        event_index: last.tid.unwrap_or(0),
        timestamp_ms: last.time_ms,
        prev_net,
        next_net,
        expected_price: (!px_volume.is_zero()).then(|| px_weighted / px_volume),
    })
}

/// Promote an aggregated delta into the pipeline's contract event.
pub fn build_event(raw: &RawDelta, is_replay: bool) -> PositionDeltaEvent {
    PositionDeltaEvent::new(
        raw.symbol.clone(),
        raw.timestamp_ms,
        raw.tx_hash.clone(),
        raw.event_index,
        is_replay,
        raw.prev_net,
        raw.next_net,
        raw.expected_price,
        raw.expected_price.map(|_| raw.timestamp_ms),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeltaAction;

    fn fill(
        tx_hash: &str,
        tid: i64,
        coin: &str,
        side: &str,
        size: &str,
        start: Option<&str>,
        time_ms: i64,
    ) -> LeaderFill {
        LeaderFill {
            tx_hash: Some(tx_hash.to_string()),
            tid: Some(tid),
            coin: coin.to_string(),
            side: Some(side.to_string()),
            size: Some(size.to_string()),
            start_position: start.map(str::to_string),
            time_ms,
            px: None,
        }
    }

    fn btc_map() -> HashMap<String, String> {
        HashMap::from([("BTC".to_string(), "BTCUSDT".to_string())])
    }

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_single_group_nets_all_fills() {
        let fills = vec![
            fill("0xabc", 1, "BTC", "B", "0.4", Some("10.0"), 1_000),
            fill("0xabc", 2, "BTC", "B", "0.5", Some("10.4"), 1_001),
            fill("0xabc", 3, "BTC", "B", "0.1", Some("10.9"), 1_002),
        ];
        let (deltas, stats) = aggregate_fills(&fills, &btc_map());
        assert_eq!(deltas.len(), 1);
        assert_eq!(stats.groups_emitted, 1);
        let delta = &deltas[0];
        assert_eq!(delta.prev_net, dec("10.0"));
        assert_eq!(delta.next_net, dec("11.0"));
        assert_eq!(delta.event_index, 3);
        assert_eq!(delta.timestamp_ms, 1_002);

        let event = build_event(delta, false);
        assert_eq!(event.action, DeltaAction::Increase);
        assert_eq!(event.delta, dec("1.0"));
    }

    #[test]
    fn test_sort_order_within_group_is_time_then_tid() {
        // Deliver out of order; the venue snapshot of the (time, tid)-last
        // fill must win.
        let fills = vec![
            fill("0xabc", 9, "BTC", "A", "1", Some("4.0"), 2_000),
            fill("0xabc", 3, "BTC", "A", "2", Some("6.0"), 1_000),
        ];
        let (deltas, _) = aggregate_fills(&fills, &btc_map());
        assert_eq!(deltas[0].prev_net, dec("6.0"));
        assert_eq!(deltas[0].next_net, dec("3.0"));
        assert_eq!(deltas[0].event_index, 9);
    }

    #[test]
    fn test_unmapped_and_spot_coins_dropped() {
        let fills = vec![
            fill("0xa", 1, "DOGE", "B", "1", None, 1_000),
            fill("0xb", 1, "@107", "B", "1", None, 1_000),
            fill("0xc", 1, "BTC", "B", "1", Some("0"), 1_000),
        ];
        let (deltas, stats) = aggregate_fills(&fills, &btc_map());
        assert_eq!(deltas.len(), 1);
        assert_eq!(stats.fills_unmapped, 2);
        assert_eq!(deltas[0].symbol, "BTCUSDT");
    }

    #[test]
    fn test_invalid_side_does_not_poison_group() {
        let fills = vec![
            fill("0xabc", 1, "BTC", "B", "1", Some("0"), 1_000),
            fill("0xabc", 2, "BTC", "X", "99", Some("1"), 1_001),
            fill("0xabc", 3, "BTC", "B", "2", Some("1"), 1_002),
        ];
        let (deltas, stats) = aggregate_fills(&fills, &btc_map());
        assert_eq!(stats.fills_invalid, 1);
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].next_net, dec("3"));
    }

    #[test]
    fn test_group_with_only_invalid_fills_dropped() {
        let fills = vec![fill("0xabc", 1, "BTC", "X", "1", None, 1_000)];
        let (deltas, stats) = aggregate_fills(&fills, &btc_map());
        assert!(deltas.is_empty());
        assert_eq!(stats.groups_dropped, 1);
    }

    #[test]
    fn test_missing_hash_falls_back_to_tid() {
        let mut f = fill("", 7, "BTC", "B", "1", Some("0"), 1_000);
        f.tx_hash = None;
        let (deltas, stats) = aggregate_fills(&[f], &btc_map());
        assert_eq!(stats.fills_missing_hash, 1);
        assert_eq!(deltas[0].tx_hash, "tid-7");
    }

    #[test]
    fn test_missing_start_position_defaults_to_zero() {
        let fills = vec![fill("0xabc", 1, "BTC", "A", "2.5", None, 1_000)];
        let (deltas, _) = aggregate_fills(&fills, &btc_map());
        assert_eq!(deltas[0].prev_net, Decimal::ZERO);
        assert_eq!(deltas[0].next_net, dec("-2.5"));
    }

    #[test]
    fn test_expected_price_is_size_weighted() {
        let mut a = fill("0xabc", 1, "BTC", "B", "1", Some("0"), 1_000);
        a.px = Some("100".into());
        let mut b = fill("0xabc", 2, "BTC", "B", "3", Some("1"), 1_001);
        b.px = Some("104".into());
        let (deltas, _) = aggregate_fills(&[a, b], &btc_map());
        assert_eq!(deltas[0].expected_price, Some(dec("103")));
    }

    #[test]
    fn test_output_sorted_across_groups() {
        let fills = vec![
            fill("0xlate", 1, "BTC", "B", "1", Some("0"), 3_000),
            fill("0xearly", 1, "BTC", "B", "1", Some("1"), 1_000),
        ];
        let (deltas, _) = aggregate_fills(&fills, &btc_map());
        assert_eq!(deltas[0].tx_hash, "0xearly");
        assert_eq!(deltas[1].tx_hash, "0xlate");
    }
}
