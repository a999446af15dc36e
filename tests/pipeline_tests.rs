mod common;

use mirrorbot::db::event_repo::{self, RecordOutcome};
use mirrorbot::db::{audit_repo, intent_repo, result_repo};
use mirrorbot::decision::{DecisionConfig, DecisionInputs, DecisionService, PriceFailurePolicy};
use mirrorbot::models::{
    EventKey, OrderResult, OrderStatus, PositionDeltaEvent, SafetyMode, Side,
};

use common::{dec, make_event, make_intent, setup_test_db};

fn replay(event: &PositionDeltaEvent) -> PositionDeltaEvent {
    let mut event = event.clone();
    event.is_replay = true;
    event
}

fn permissive_decision() -> DecisionService {
    DecisionService::new(DecisionConfig {
        filters_enabled: false,
        price_failure_policy: PriceFailurePolicy::AllowWithoutPrice,
        ..Default::default()
    })
}

#[tokio::test]
async fn test_record_event_is_atomic_and_deduplicated() {
    let pool = setup_test_db().await;
    let event = make_event("BTCUSDT", "0xabc", 1, "0", "1.0", 1_000);
    let intent = make_intent("hl-0xabc-1-BTCUSDT", "BTCUSDT", Side::Buy, "0.001");

    let outcome = event_repo::record_event(&pool, &event, &[intent.clone()], 5_000)
        .await
        .unwrap();
    assert_eq!(outcome, RecordOutcome::Inserted);
    assert!(event_repo::has_processed(&pool, "0xabc", 1, "BTCUSDT").await.unwrap());
    assert!(intent_repo::get_intent(&pool, "hl-0xabc-1-BTCUSDT").await.unwrap().is_some());

    // Replaying the same event is a no-op in every table.
    let outcome = event_repo::record_event(&pool, &event, &[intent], 6_000)
        .await
        .unwrap();
    assert_eq!(outcome, RecordOutcome::Duplicate);
}

#[tokio::test]
async fn test_cursor_is_monotone_under_out_of_order_events() {
    let pool = setup_test_db().await;

    let newer = make_event("BTCUSDT", "0xbbb", 2, "1.0", "2.0", 2_000);
    event_repo::record_event(&pool, &newer, &[], 9_000).await.unwrap();
    let cursor = event_repo::load_cursor(&pool).await.unwrap();
    assert_eq!(cursor.last_processed_timestamp_ms, 2_000);

    // An older event still gets recorded (dedup + history) but must not move
    // the cursor backwards.
    let older = make_event("BTCUSDT", "0xaaa", 1, "0", "1.0", 1_000);
    let outcome = event_repo::record_event(&pool, &older, &[], 9_100).await.unwrap();
    assert_eq!(outcome, RecordOutcome::Inserted);

    let cursor = event_repo::load_cursor(&pool).await.unwrap();
    assert_eq!(cursor.last_processed_timestamp_ms, 2_000);
    let key: EventKey = cursor.last_processed_event_key.unwrap();
    assert_eq!(key.tx_hash, "0xbbb");
}

#[tokio::test]
async fn test_intents_are_insert_or_ignore() {
    let pool = setup_test_db().await;
    let original = make_intent("hl-0xabc-1-BTCUSDT", "BTCUSDT", Side::Buy, "0.5");
    assert!(intent_repo::insert_intent(&pool, &original, 1_000).await.unwrap());

    // A conflicting payload under the same correlation id never replaces the
    // stored one.
    let mut conflicting = original.clone();
    conflicting.qty = dec("99");
    assert!(!intent_repo::insert_intent(&pool, &conflicting, 2_000).await.unwrap());

    let stored = intent_repo::get_intent(&pool, "hl-0xabc-1-BTCUSDT")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.qty, dec("0.5"));
}

/// Backfilled INCREASE under the close-only replay policy: no intents, the
/// rejection is reasoned, and the event is still consumed (dedup + cursor).
#[tokio::test]
async fn test_replay_increase_blocked_but_event_consumed() {
    let pool = setup_test_db().await;
    let event = replay(&make_event("BTCUSDT", "0xrep", 7, "10.0", "22.9", 3_000));

    let service = permissive_decision();
    let inputs = DecisionInputs {
        safety_mode: Some(SafetyMode::ArmedLive),
        local_current_position: Some(dec("0")),
        closable_qty: Some(dec("0")),
        reference_price: None,
        filters: None,
        now_ms: 3_500,
    };
    let output = service.decide(&event, &inputs);
    assert!(output.intents.is_empty());
    assert_eq!(
        output.rejections[0].reason.as_str(),
        "replay_policy_increase_blocked"
    );

    let outcome = event_repo::record_event(&pool, &event, &output.intents, 4_000)
        .await
        .unwrap();
    assert_eq!(outcome, RecordOutcome::Inserted);
    assert!(event_repo::has_processed(&pool, "0xrep", 7, "BTCUSDT").await.unwrap());
    let cursor = event_repo::load_cursor(&pool).await.unwrap();
    assert_eq!(cursor.last_processed_timestamp_ms, 3_000);
}

/// FLIP split end-to-end through decision and the store: two intents, close
/// first, both insert-or-ignore under their suffixed correlation ids.
#[tokio::test]
async fn test_flip_event_persists_close_and_open_intents() {
    let pool = setup_test_db().await;
    let event = make_event("ETHUSDT", "0xflip", 3, "5.0", "-3.0", 5_000);

    let service = permissive_decision();
    let inputs = DecisionInputs {
        safety_mode: Some(SafetyMode::ArmedLive),
        local_current_position: Some(dec("5.0")),
        closable_qty: Some(dec("5.0")),
        reference_price: None,
        filters: None,
        now_ms: 5_100,
    };
    let output = service.decide(&event, &inputs);
    assert_eq!(output.intents.len(), 2);
    assert_eq!(output.intents[0].correlation_id, "hl-0xflip-3-ETHUSDT-close");
    assert_eq!(output.intents[1].correlation_id, "hl-0xflip-3-ETHUSDT-open");
    assert!(output.intents[0].reduce_only);
    assert_eq!(output.intents[0].qty, dec("5.0"));
    assert!(!output.intents[1].reduce_only);

    event_repo::record_event(&pool, &event, &output.intents, 5_200)
        .await
        .unwrap();
    assert!(intent_repo::get_intent(&pool, "hl-0xflip-3-ETHUSDT-close")
        .await
        .unwrap()
        .is_some());
    assert!(intent_repo::get_intent(&pool, "hl-0xflip-3-ETHUSDT-open")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_derive_local_positions_joins_intents_and_results() {
    let pool = setup_test_db().await;

    let buy = make_intent("hl-a-1-BTCUSDT", "BTCUSDT", Side::Buy, "0.5");
    let sell = make_intent("hl-b-1-BTCUSDT", "BTCUSDT", Side::Sell, "0.2");
    let unfilled = make_intent("hl-c-1-BTCUSDT", "BTCUSDT", Side::Buy, "9.9");
    for intent in [&buy, &sell, &unfilled] {
        intent_repo::insert_intent(&pool, intent, 1_000).await.unwrap();
    }

    let mut filled = OrderResult::new("hl-a-1-BTCUSDT", OrderStatus::Filled, 2_000);
    filled.filled_qty = dec("0.5");
    result_repo::upsert_result(&pool, &filled, 2_000).await.unwrap();

    let mut partial = OrderResult::new("hl-b-1-BTCUSDT", OrderStatus::PartiallyFilled, 2_100);
    partial.filled_qty = dec("0.1");
    result_repo::upsert_result(&pool, &partial, 2_100).await.unwrap();

    let rejected = OrderResult::new("hl-c-1-BTCUSDT", OrderStatus::Rejected, 2_200);
    result_repo::upsert_result(&pool, &rejected, 2_200).await.unwrap();

    let positions = intent_repo::derive_local_positions(&pool, &[], None).await.unwrap();
    // 0.5 long - 0.1 sold; the rejected intent contributes nothing.
    assert_eq!(positions["BTCUSDT"], dec("0.4"));
}

#[tokio::test]
async fn test_dedup_sweep_respects_ttl() {
    let pool = setup_test_db().await;
    let old = make_event("BTCUSDT", "0xold", 1, "0", "1", 1_000);
    let fresh = make_event("BTCUSDT", "0xnew", 2, "1", "2", 2_000);
    event_repo::record_event(&pool, &old, &[], 1_000).await.unwrap();
    event_repo::record_event(&pool, &fresh, &[], 500_000).await.unwrap();

    let swept = event_repo::sweep_dedup(&pool, 100_000).await.unwrap();
    assert_eq!(swept, 1);
    assert!(!event_repo::has_processed(&pool, "0xold", 1, "BTCUSDT").await.unwrap());
    assert!(event_repo::has_processed(&pool, "0xnew", 2, "BTCUSDT").await.unwrap());
}

#[tokio::test]
async fn test_result_status_never_leaves_terminal() {
    let pool = setup_test_db().await;
    let intent = make_intent("hl-t-1-BTCUSDT", "BTCUSDT", Side::Buy, "1");
    intent_repo::insert_intent(&pool, &intent, 1_000).await.unwrap();

    let mut filled = OrderResult::new("hl-t-1-BTCUSDT", OrderStatus::Filled, 2_000);
    filled.filled_qty = dec("1");
    result_repo::upsert_result(&pool, &filled, 2_000).await.unwrap();

    let regress = OrderResult::new("hl-t-1-BTCUSDT", OrderStatus::Pending, 3_000);
    let outcome = result_repo::upsert_result(&pool, &regress, 3_000).await.unwrap();
    assert!(matches!(
        outcome,
        result_repo::UpsertOutcome::RejectedTransition {
            existing: OrderStatus::Filled
        }
    ));

    let stored = result_repo::get_result(&pool, "hl-t-1-BTCUSDT").await.unwrap().unwrap();
    assert_eq!(stored.status, OrderStatus::Filled);
}

#[tokio::test]
async fn test_status_changes_append_audit_records() {
    let pool = setup_test_db().await;
    let submitted = OrderResult::new("hl-aud-1-BTCUSDT", OrderStatus::Submitted, 1_000);
    result_repo::upsert_result(&pool, &submitted, 1_000).await.unwrap();
    let mut filled = OrderResult::new("hl-aud-1-BTCUSDT", OrderStatus::Filled, 2_000);
    filled.filled_qty = dec("1");
    result_repo::upsert_result(&pool, &filled, 2_000).await.unwrap();

    let records = audit_repo::list_recent(&pool, 10).await.unwrap();
    let transitions: Vec<_> = records
        .iter()
        .filter(|r| r.category == "order" && r.entity_id == "hl-aud-1-BTCUSDT")
        .collect();
    assert_eq!(transitions.len(), 2);
    // newest first
    assert_eq!(transitions[0].from_state.as_deref(), Some("SUBMITTED"));
    assert_eq!(transitions[0].to_state, "FILLED");
}
