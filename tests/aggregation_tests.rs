mod common;

use std::collections::HashMap;

use mirrorbot::db::event_repo::{self, RecordOutcome};
use mirrorbot::decision::{
    DecisionConfig, DecisionInputs, DecisionService, SizingConfig, SizingMode, SymbolFilters,
};
use mirrorbot::ingestion::aggregator::{aggregate_fills, build_event};
use mirrorbot::models::{DeltaAction, LeaderFill, PriceSnapshot, PriceSource, SafetyMode, Side};

use common::{dec, make_fill, setup_test_db};

fn btc_map() -> HashMap<String, String> {
    HashMap::from([("BTC".to_string(), "BTCUSDT".to_string())])
}

/// One leader order split into 86 venue fills must collapse into a single
/// actionable event instead of 86 dust deltas.
#[tokio::test]
async fn test_many_fills_aggregate_into_one_actionable_intent() {
    let mut fills: Vec<LeaderFill> = Vec::new();
    for i in 0..86i64 {
        let start = dec("10.0") + dec("0.15") * rust_decimal::Decimal::from(i);
        fills.push(make_fill(
            "0xabc",
            i + 1,
            "BTC",
            "B",
            "0.15",
            Some(&start.to_string()),
            1_700_000_000_000 + i,
        ));
    }

    let (deltas, stats) = aggregate_fills(&fills, &btc_map());
    assert_eq!(stats.groups_emitted, 1);
    assert_eq!(deltas.len(), 1);

    let event = build_event(&deltas[0], false);
    assert_eq!(event.prev_net, dec("10.0"));
    assert_eq!(event.next_net, dec("22.9"));
    assert_eq!(event.delta, dec("12.9"));
    assert_eq!(event.action, DeltaAction::Increase);

    // The aggregated event clears the venue filters that per-fill deltas
    // (0.15 × 0.001 ratio) would have failed min-qty on.
    let service = DecisionService::new(DecisionConfig {
        sizing: SizingConfig {
            mode: SizingMode::Proportional,
            proportional_ratio: dec("0.001"),
            ..Default::default()
        },
        ..Default::default()
    });
    let inputs = DecisionInputs {
        safety_mode: Some(SafetyMode::ArmedLive),
        local_current_position: Some(dec("0")),
        closable_qty: Some(dec("0")),
        reference_price: Some(PriceSnapshot {
            price: dec("43000"),
            timestamp_ms: event.timestamp_ms,
            source: PriceSource::Venue,
        }),
        filters: Some(SymbolFilters {
            min_qty: dec("0.001"),
            step_size: dec("0.0001"),
            min_notional: dec("0"),
            tick_size: dec("0.1"),
        }),
        now_ms: event.timestamp_ms + 100,
    };
    let output = service.decide(&event, &inputs);
    assert!(output.rejections.is_empty());
    assert_eq!(output.intents.len(), 1);
    let intent = &output.intents[0];
    assert_eq!(intent.symbol, "BTCUSDT");
    assert_eq!(intent.side, Side::Buy);
    assert_eq!(intent.qty, dec("0.0129"));
    assert!(!intent.reduce_only);
}

/// Delivery order must not matter: the same fills permuted produce the same
/// persisted dedup keys and the same final cursor.
#[tokio::test]
async fn test_fill_permutation_yields_identical_store_state() {
    let fills = vec![
        make_fill("0xaaa", 1, "BTC", "B", "0.5", Some("0"), 1_000),
        make_fill("0xaaa", 2, "BTC", "B", "0.5", Some("0.5"), 1_000),
        make_fill("0xbbb", 3, "BTC", "A", "0.2", Some("1.0"), 2_000),
    ];
    let mut permuted = fills.clone();
    permuted.reverse();

    let mut cursors = Vec::new();
    for input in [fills, permuted] {
        let pool = setup_test_db().await;
        let (deltas, _) = aggregate_fills(&input, &btc_map());
        for delta in &deltas {
            let event = build_event(delta, false);
            let outcome = event_repo::record_event(&pool, &event, &[], 10_000).await.unwrap();
            assert_eq!(outcome, RecordOutcome::Inserted);
        }
        let cursor = event_repo::load_cursor(&pool).await.unwrap();
        let mut keys = Vec::new();
        for delta in &deltas {
            assert!(
                event_repo::has_processed(&pool, &delta.tx_hash, delta.event_index, &delta.symbol)
                    .await
                    .unwrap()
            );
            keys.push((delta.tx_hash.clone(), delta.event_index, delta.symbol.clone()));
        }
        keys.sort();
        cursors.push((cursor.last_processed_event_key, keys));
    }

    assert_eq!(cursors[0], cursors[1]);
}

#[tokio::test]
async fn test_next_net_prefers_venue_snapshot_over_derived_sum() {
    // A poison fill (bad size) drops out of the sum; the venue snapshot on
    // the last valid fill still pins the final position.
    let mut poison = make_fill("0xabc", 2, "BTC", "B", "not-a-number", Some("10.5"), 1_001);
    poison.size = Some("garbage".to_string());
    let fills = vec![
        make_fill("0xabc", 1, "BTC", "B", "0.5", Some("10.0"), 1_000),
        poison,
        make_fill("0xabc", 3, "BTC", "B", "0.5", Some("11.0"), 1_002),
    ];
    let (deltas, stats) = aggregate_fills(&fills, &btc_map());
    assert_eq!(stats.fills_invalid, 1);
    assert_eq!(deltas.len(), 1);
    assert_eq!(deltas[0].prev_net, dec("10.0"));
    // Venue snapshot: last valid fill started at 11.0 and bought 0.5.
    assert_eq!(deltas[0].next_net, dec("11.5"));
}
