mod common;

use std::sync::Arc;

use mirrorbot::clock::ManualClock;
use mirrorbot::db::{audit_repo, result_repo, safety_repo};
use mirrorbot::execution::{ExecutionConfig, OrderExecutor};
use mirrorbot::models::{
    OrderResult, OrderStatus, OrderType, SafetyMode, SafetyReason, Side, TimeInForce,
};
use mirrorbot::venue::{CancelOutcome, SubmitOutcome, VenueError};

use common::{dec, make_intent, setup_test_db, venue_order, MockVenue};

const NOW_MS: i64 = 1_700_000_000_000;

fn fast_config() -> ExecutionConfig {
    ExecutionConfig {
        tif_seconds: 0,
        order_poll_interval_sec: 0,
        unknown_poll_interval_sec: 0,
        retry_budget_max_attempts: 3,
        retry_budget_window_sec: 60,
        retry_budget_mode: SafetyMode::ArmedSafe,
        market_fallback_enabled: true,
        market_fallback_threshold_pct: dec("0.5"),
        market_slippage_cap_pct: dec("0.005"),
        rate_limit_cooldown_sec: 0,
        suppress_venue_writes: false,
    }
}

fn executor(venue: Arc<MockVenue>, config: ExecutionConfig) -> OrderExecutor<MockVenue> {
    OrderExecutor::new(venue, config, Arc::new(ManualClock::new(NOW_MS)))
}

async fn arm_live(pool: &sqlx::SqlitePool) {
    safety_repo::set_safety_state(pool, SafetyMode::ArmedLive, SafetyReason::Ok, "test", NOW_MS)
        .await
        .unwrap();
}

/// TIF expiry on a partially filled LIMIT order: cancel, mark EXPIRED, then
/// chase the remainder with a MARKET fallback and merge the fills
/// volume-weighted.
#[tokio::test]
async fn test_tif_expiry_with_market_fallback_merges_fills() {
    let pool = setup_test_db().await;
    arm_live(&pool).await;

    let venue = Arc::new(MockVenue::new());
    // LIMIT accepted, unfilled
    venue
        .script_submit(Ok(SubmitOutcome::Accepted(venue_order(
            OrderStatus::Submitted,
            "0",
            None,
        ))))
        .await;
    // cancel confirmation captures the partial fill of 0.8 @ 100
    venue.script_cancel(Ok(CancelOutcome::Canceled)).await;
    venue
        .script_query(Ok(venue_order(OrderStatus::Canceled, "0.8", Some("100"))))
        .await;
    // fallback: mark price within the 0.5% cap, market fill 0.2 @ 110
    venue.set_mark_price("100.2", NOW_MS).await;
    venue
        .script_submit(Ok(SubmitOutcome::Accepted(venue_order(
            OrderStatus::Filled,
            "0.2",
            Some("110"),
        ))))
        .await;

    let mut intent = make_intent("hl-0xtif-1-BTCUSDT", "BTCUSDT", Side::Buy, "1.0");
    intent.order_type = OrderType::Limit;
    intent.price = Some(dec("100"));
    intent.time_in_force = TimeInForce::Gtc;

    let exec = executor(Arc::clone(&venue), fast_config());
    let result = exec.execute(&pool, &intent).await.unwrap();

    assert_eq!(result.status, OrderStatus::Expired);
    assert_eq!(result.filled_qty, dec("1.0"));
    assert_eq!(result.avg_price, Some(dec("102")));
    assert_eq!(venue.submit_calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    // The fallback runs under a fresh client id; the original result row is
    // the merge target.
    let stored = result_repo::get_result(&pool, "hl-0xtif-1-BTCUSDT")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.filled_qty, dec("1.0"));
    assert_eq!(stored.avg_price, Some(dec("102")));
}

/// Fallback slippage above the cap: the EXPIRED state stands, nothing is
/// submitted.
#[tokio::test]
async fn test_fallback_blocked_by_slippage_cap() {
    let pool = setup_test_db().await;
    arm_live(&pool).await;

    let venue = Arc::new(MockVenue::new());
    venue
        .script_submit(Ok(SubmitOutcome::Accepted(venue_order(
            OrderStatus::Submitted,
            "0",
            None,
        ))))
        .await;
    venue.script_cancel(Ok(CancelOutcome::Canceled)).await;
    venue
        .script_query(Ok(venue_order(OrderStatus::Canceled, "0.8", Some("100"))))
        .await;
    // 2% away from the limit price, cap is 0.5%
    venue.set_mark_price("102", NOW_MS).await;

    let mut intent = make_intent("hl-0xslip-1-BTCUSDT", "BTCUSDT", Side::Buy, "1.0");
    intent.order_type = OrderType::Limit;
    intent.price = Some(dec("100"));

    let exec = executor(Arc::clone(&venue), fast_config());
    let result = exec.execute(&pool, &intent).await.unwrap();

    assert_eq!(result.status, OrderStatus::Expired);
    assert_eq!(result.filled_qty, dec("0.8"));
    assert_eq!(venue.submit_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

/// A stored UNKNOWN result whose queries keep timing out exhausts the retry
/// budget and escalates to ARMED_SAFE; the result itself stays UNKNOWN.
#[tokio::test]
async fn test_unknown_retry_budget_exhaustion_escalates_safety() {
    let pool = setup_test_db().await;
    arm_live(&pool).await;

    let unknown = OrderResult::new("hl-0xunk-1-BTCUSDT", OrderStatus::Unknown, NOW_MS)
        .with_error("TIMEOUT", "submit timed out");
    result_repo::upsert_result(&pool, &unknown, NOW_MS).await.unwrap();

    // MockVenue's unscripted query default is a timeout.
    let venue = Arc::new(MockVenue::new());
    let intent = make_intent("hl-0xunk-1-BTCUSDT", "BTCUSDT", Side::Buy, "1.0");

    let exec = executor(Arc::clone(&venue), fast_config());
    let result = exec.execute(&pool, &intent).await.unwrap();

    assert_eq!(result.status, OrderStatus::Unknown);
    assert_eq!(venue.query_calls.load(std::sync::atomic::Ordering::SeqCst), 3);

    let state = safety_repo::load_safety_state(&pool).await.unwrap().unwrap();
    assert_eq!(state.mode, SafetyMode::ArmedSafe);
    assert_eq!(state.reason_code, SafetyReason::ExecutionRetryBudgetExceeded);

    let audit = audit_repo::list_recent(&pool, 10).await.unwrap();
    assert!(audit
        .iter()
        .any(|r| r.category == "safety" && r.reason_code == "EXECUTION_RETRY_BUDGET_EXCEEDED"));
}

/// Duplicate client id is not an error: the existing order is queried and
/// adopted as the authoritative submission.
#[tokio::test]
async fn test_duplicate_client_id_adopts_existing_order() {
    let pool = setup_test_db().await;
    arm_live(&pool).await;

    let venue = Arc::new(MockVenue::new());
    venue.script_submit(Ok(SubmitOutcome::DuplicateClientId)).await;
    venue
        .script_query(Ok(venue_order(OrderStatus::Filled, "1.0", Some("99.5"))))
        .await;

    let intent = make_intent("hl-0xdup-1-BTCUSDT", "BTCUSDT", Side::Buy, "1.0");
    let exec = executor(Arc::clone(&venue), fast_config());
    let result = exec.execute(&pool, &intent).await.unwrap();

    assert_eq!(result.status, OrderStatus::Filled);
    assert_eq!(result.filled_qty, dec("1.0"));
    assert_eq!(result.avg_price, Some(dec("99.5")));
}

/// While safety is degraded, no exposure-increasing submit reaches the venue.
#[tokio::test]
async fn test_safety_gate_blocks_submit_calls() {
    let pool = setup_test_db().await;
    safety_repo::set_safety_state(
        &pool,
        SafetyMode::ArmedSafe,
        SafetyReason::SnapshotStale,
        "test",
        NOW_MS,
    )
    .await
    .unwrap();

    let venue = Arc::new(MockVenue::new());
    let intent = make_intent("hl-0xgate-1-BTCUSDT", "BTCUSDT", Side::Buy, "1.0");
    let exec = executor(Arc::clone(&venue), fast_config());
    let result = exec.execute(&pool, &intent).await.unwrap();

    assert_eq!(result.status, OrderStatus::Rejected);
    assert_eq!(result.error_code.as_deref(), Some("SAFETY_REJECTED"));
    assert_eq!(venue.submit_calls.load(std::sync::atomic::Ordering::SeqCst), 0);

    // HALT blocks even reduce-only.
    safety_repo::set_safety_state(&pool, SafetyMode::Halt, SafetyReason::ReconcileCritical, "test", NOW_MS)
        .await
        .unwrap();
    let mut reduce = make_intent("hl-0xgate-2-BTCUSDT", "BTCUSDT", Side::Sell, "1.0");
    reduce.reduce_only = true;
    let result = exec.execute(&pool, &reduce).await.unwrap();
    assert_eq!(result.status, OrderStatus::Rejected);
    assert_eq!(venue.submit_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_insufficient_balance_is_permanent_rejection() {
    let pool = setup_test_db().await;
    arm_live(&pool).await;

    let venue = Arc::new(MockVenue::new());
    venue
        .script_submit(Ok(SubmitOutcome::Rejected {
            code: "INSUFFICIENT_BALANCE".into(),
            message: "-2019:Margin is insufficient".into(),
        }))
        .await;

    let intent = make_intent("hl-0xbal-1-BTCUSDT", "BTCUSDT", Side::Buy, "1.0");
    let exec = executor(Arc::clone(&venue), fast_config());
    let result = exec.execute(&pool, &intent).await.unwrap();

    assert_eq!(result.status, OrderStatus::Rejected);
    assert_eq!(result.error_code.as_deref(), Some("INSUFFICIENT_BALANCE"));
    // Terminal: a retry of the same intent never talks to the venue again.
    let again = exec.execute(&pool, &intent).await.unwrap();
    assert_eq!(again.status, OrderStatus::Rejected);
    assert_eq!(venue.submit_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

/// Network timeout on submit leaves the order UNKNOWN and recovery adopts
/// the venue's answer once queries succeed.
#[tokio::test]
async fn test_submit_timeout_recovers_via_query() {
    let pool = setup_test_db().await;
    arm_live(&pool).await;

    let venue = Arc::new(MockVenue::new());
    venue.script_submit(Err(VenueError::Timeout)).await;
    venue
        .script_query(Ok(venue_order(OrderStatus::Filled, "1.0", Some("100"))))
        .await;

    let intent = make_intent("hl-0xto-1-BTCUSDT", "BTCUSDT", Side::Buy, "1.0");
    let exec = executor(Arc::clone(&venue), fast_config());
    let result = exec.execute(&pool, &intent).await.unwrap();

    assert_eq!(result.status, OrderStatus::Filled);
    assert_eq!(result.filled_qty, dec("1.0"));
}

/// dry-run mode drives the full FSM locally without any venue write.
#[tokio::test]
async fn test_dry_run_simulates_fsm_without_venue_writes() {
    let pool = setup_test_db().await;
    arm_live(&pool).await;

    let venue = Arc::new(MockVenue::new());
    let mut config = fast_config();
    config.suppress_venue_writes = true;

    let mut intent = make_intent("hl-0xdry-1-BTCUSDT", "BTCUSDT", Side::Buy, "0.5");
    intent.price = Some(dec("101"));

    let exec = executor(Arc::clone(&venue), config);
    let result = exec.execute(&pool, &intent).await.unwrap();

    assert_eq!(result.status, OrderStatus::Filled);
    assert_eq!(result.filled_qty, dec("0.5"));
    assert_eq!(result.avg_price, Some(dec("101")));
    assert_eq!(venue.submit_calls.load(std::sync::atomic::Ordering::SeqCst), 0);

    // The simulated path still walked SUBMITTED -> FILLED in the audit log.
    let audit = audit_repo::list_recent(&pool, 10).await.unwrap();
    let order_audit: Vec<_> = audit
        .iter()
        .filter(|r| r.entity_id == "hl-0xdry-1-BTCUSDT")
        .collect();
    assert_eq!(order_audit.len(), 2);
}
