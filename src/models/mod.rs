pub mod audit;
pub mod contract;
pub mod event;
pub mod fill;
pub mod order;
pub mod safety;

pub use audit::AuditRecord;
pub use contract::{
    assert_contract_version, correlation_id, generate_nonce, normalize_execution_symbol,
    normalize_symbol, parse_correlation_id, sanitize_client_order_id, ContractVersion,
    CONTRACT_VERSION,
};
pub use event::{DeltaAction, EventKey, PositionDeltaEvent};
pub use fill::LeaderFill;
pub use order::{OrderIntent, OrderResult, OrderStatus, OrderType, Side, TimeInForce};
pub use safety::{SafetyMode, SafetyReason, SafetyState};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A price observation with its provenance, used by the decision slippage
/// check and the market-fallback re-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub price: Decimal,
    pub timestamp_ms: i64,
    pub source: PriceSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    Venue,
    Ingest,
}
