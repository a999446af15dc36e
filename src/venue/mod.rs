pub mod binance;

use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::decision::SymbolFilters;
use crate::models::{OrderIntent, OrderStatus, PriceSnapshot};

/// Venue-side view of an order, as returned by submit and query.
#[derive(Debug, Clone)]
pub struct VenueOrder {
    pub status: OrderStatus,
    pub exchange_order_id: Option<String>,
    pub filled_qty: Decimal,
    pub avg_price: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Accepted(VenueOrder),
    /// The client order id was already used: the existing order is the
    /// authoritative submission and must be adopted via query.
    DuplicateClientId,
    Rejected { code: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Canceled,
    NotFound,
}

#[derive(Debug, Clone)]
pub struct PositionsSnapshot {
    pub positions: HashMap<String, Decimal>,
    pub timestamp_ms: i64,
}

#[derive(Debug, Error)]
pub enum VenueError {
    #[error("venue rate limit hit")]
    RateLimited,

    #[error("venue request timed out")]
    Timeout,

    #[error("venue network error: {0}")]
    Network(String),

    #[error("venue api error {code}: {message} (http {status})")]
    Api { code: i64, message: String, status: u16 },

    #[error("venue response invalid: {0}")]
    InvalidResponse(String),
}

impl VenueError {
    /// Errors that leave the order in an unknowable state on the venue side.
    pub fn is_unknown_outcome(&self) -> bool {
        matches!(
            self,
            VenueError::Timeout | VenueError::Network(_) | VenueError::Api { status: 500.., .. }
        )
    }
}

/// Contractual surface of the execution venue. The executor only depends on
/// these responses; transport, signing, and pagination live in the adapter.
#[async_trait]
pub trait ExecutionVenue: Send + Sync {
    async fn submit_order(
        &self,
        intent: &OrderIntent,
        client_order_id: &str,
    ) -> Result<SubmitOutcome, VenueError>;

    async fn query_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<VenueOrder, VenueError>;

    async fn cancel_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<CancelOutcome, VenueError>;

    async fn fetch_positions(&self, symbols: &[String]) -> Result<PositionsSnapshot, VenueError>;

    async fn fetch_mark_price(&self, symbol: &str) -> Result<PriceSnapshot, VenueError>;

    async fn fetch_filters(&self, symbol: &str) -> Result<SymbolFilters, VenueError>;

    async fn server_time(&self) -> Result<i64, VenueError>;
}
