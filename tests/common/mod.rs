#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use mirrorbot::db;
use mirrorbot::decision::SymbolFilters;
use mirrorbot::models::{
    LeaderFill, OrderIntent, OrderStatus, OrderType, PositionDeltaEvent, PriceSnapshot,
    PriceSource, Side, TimeInForce, CONTRACT_VERSION,
};
use mirrorbot::venue::{
    CancelOutcome, ExecutionVenue, PositionsSnapshot, SubmitOutcome, VenueError, VenueOrder,
};

pub async fn setup_test_db() -> SqlitePool {
    db::init_pool("sqlite::memory:")
        .await
        .expect("in-memory store should open")
}

pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

pub fn make_fill(
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

pub fn make_event(
    symbol: &str,
    tx_hash: &str,
    event_index: i64,
    prev: &str,
    next: &str,
    timestamp_ms: i64,
) -> PositionDeltaEvent {
    PositionDeltaEvent::new(
        symbol.to_string(),
        timestamp_ms,
        tx_hash.to_string(),
        event_index,
        false,
        dec(prev),
        dec(next),
        None,
        None,
    )
}

pub fn make_intent(correlation_id: &str, symbol: &str, side: Side, qty: &str) -> OrderIntent {
    OrderIntent {
        correlation_id: correlation_id.to_string(),
        client_order_id: None,
        symbol: symbol.to_string(),
        side,
        order_type: OrderType::Market,
        qty: dec(qty),
        price: None,
        reduce_only: false,
        time_in_force: TimeInForce::Ioc,
        is_replay: false,
        strategy_version: "v1".to_string(),
        risk_notes: None,
        contract_version: CONTRACT_VERSION.to_string(),
    }
}

pub fn venue_order(status: OrderStatus, filled: &str, avg: Option<&str>) -> VenueOrder {
    VenueOrder {
        status,
        exchange_order_id: Some("ex-1".to_string()),
        filled_qty: dec(filled),
        avg_price: avg.map(dec),
    }
}

/// Scripted venue double. Each call pops the next scripted response; an
/// empty script falls back to a per-method default (queries time out, which
/// keeps UNKNOWN paths honest).
#[derive(Default)]
pub struct MockVenue {
    pub submit_responses: Mutex<VecDeque<Result<SubmitOutcome, VenueError>>>,
    pub query_responses: Mutex<VecDeque<Result<VenueOrder, VenueError>>>,
    pub cancel_responses: Mutex<VecDeque<Result<CancelOutcome, VenueError>>>,
    pub positions: Mutex<HashMap<String, Decimal>>,
    pub positions_timestamp_ms: AtomicI64,
    pub mark_price: Mutex<Option<PriceSnapshot>>,
    pub filters: Mutex<Option<SymbolFilters>>,
    pub submit_calls: AtomicU32,
    pub query_calls: AtomicU32,
    pub cancel_calls: AtomicU32,
}

impl MockVenue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn script_submit(&self, response: Result<SubmitOutcome, VenueError>) {
        self.submit_responses.lock().await.push_back(response);
    }

    pub async fn script_query(&self, response: Result<VenueOrder, VenueError>) {
        self.query_responses.lock().await.push_back(response);
    }

    pub async fn script_cancel(&self, response: Result<CancelOutcome, VenueError>) {
        self.cancel_responses.lock().await.push_back(response);
    }

    pub async fn set_positions(&self, positions: &[(&str, &str)], timestamp_ms: i64) {
        let mut map = self.positions.lock().await;
        map.clear();
        for (symbol, qty) in positions {
            map.insert(symbol.to_string(), dec(qty));
        }
        self.positions_timestamp_ms.store(timestamp_ms, Ordering::SeqCst);
    }

    pub async fn set_mark_price(&self, price: &str, timestamp_ms: i64) {
        *self.mark_price.lock().await = Some(PriceSnapshot {
            price: dec(price),
            timestamp_ms,
            source: PriceSource::Venue,
        });
    }

    pub async fn set_filters(&self, min_qty: &str, step: &str, min_notional: &str, tick: &str) {
        *self.filters.lock().await = Some(SymbolFilters {
            min_qty: dec(min_qty),
            step_size: dec(step),
            min_notional: dec(min_notional),
            tick_size: dec(tick),
        });
    }
}

#[async_trait]
impl ExecutionVenue for MockVenue {
    async fn submit_order(
        &self,
        _intent: &OrderIntent,
        _client_order_id: &str,
    ) -> Result<SubmitOutcome, VenueError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        match self.submit_responses.lock().await.pop_front() {
            Some(response) => response,
            None => Ok(SubmitOutcome::Accepted(venue_order(
                OrderStatus::Submitted,
                "0",
                None,
            ))),
        }
    }

    async fn query_order(
        &self,
        _symbol: &str,
        _client_order_id: &str,
    ) -> Result<VenueOrder, VenueError> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        match self.query_responses.lock().await.pop_front() {
            Some(response) => response,
            None => Err(VenueError::Timeout),
        }
    }

    async fn cancel_order(
        &self,
        _symbol: &str,
        _client_order_id: &str,
    ) -> Result<CancelOutcome, VenueError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        match self.cancel_responses.lock().await.pop_front() {
            Some(response) => response,
            None => Ok(CancelOutcome::Canceled),
        }
    }

    async fn fetch_positions(&self, symbols: &[String]) -> Result<PositionsSnapshot, VenueError> {
        let all = self.positions.lock().await.clone();
        let positions = if symbols.is_empty() {
            all
        } else {
            all.into_iter().filter(|(s, _)| symbols.contains(s)).collect()
        };
        Ok(PositionsSnapshot {
            positions,
            timestamp_ms: self.positions_timestamp_ms.load(Ordering::SeqCst),
        })
    }

    async fn fetch_mark_price(&self, _symbol: &str) -> Result<PriceSnapshot, VenueError> {
        (*self.mark_price.lock().await).ok_or(VenueError::Timeout)
    }

    async fn fetch_filters(&self, _symbol: &str) -> Result<SymbolFilters, VenueError> {
        (*self.filters.lock().await)
            .ok_or_else(|| VenueError::InvalidResponse("no filters scripted".into()))
    }

    async fn server_time(&self) -> Result<i64, VenueError> {
        Ok(self.positions_timestamp_ms.load(Ordering::SeqCst))
    }
}
