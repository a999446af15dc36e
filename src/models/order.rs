use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::contract::CONTRACT_VERSION;

// ---------------------------------------------------------------------------
// Side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn from_api_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }

    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => -Decimal::ONE,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

// ---------------------------------------------------------------------------
// Order type / time-in-force
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Limit,
    Market,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Limit => write!(f, "LIMIT"),
            OrderType::Market => write!(f, "MARKET"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Gtc,
    Ioc,
}

impl fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeInForce::Gtc => write!(f, "GTC"),
            TimeInForce::Ioc => write!(f, "IOC"),
        }
    }
}

// ---------------------------------------------------------------------------
// OrderStatus — the execution state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Submitted,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
    Unknown,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Submitted => "SUBMITTED",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Expired => "EXPIRED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Unknown => "UNKNOWN",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(OrderStatus::Pending),
            "SUBMITTED" => Some(OrderStatus::Submitted),
            "PARTIALLY_FILLED" => Some(OrderStatus::PartiallyFilled),
            "FILLED" => Some(OrderStatus::Filled),
            "CANCELED" => Some(OrderStatus::Canceled),
            "EXPIRED" => Some(OrderStatus::Expired),
            "REJECTED" => Some(OrderStatus::Rejected),
            "UNKNOWN" => Some(OrderStatus::Unknown),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Expired | OrderStatus::Rejected
        )
    }

    /// Whether `next` is a legal successor of `self`. Terminal states admit
    /// only themselves (fill merges update quantities, never status), and
    /// progress never regresses.
    pub fn can_transition(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        if *self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        match self {
            Pending => true,
            Submitted => !matches!(next, Pending),
            PartiallyFilled => !matches!(next, Pending | Submitted),
            Unknown => !matches!(next, Pending),
            _ => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// OrderIntent — immutable, insert-or-ignore by correlation_id
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub correlation_id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: Decimal,
    pub price: Option<Decimal>,
    pub reduce_only: bool,
    pub time_in_force: TimeInForce,
    pub is_replay: bool,
    pub strategy_version: String,
    pub risk_notes: Option<String>,
    pub contract_version: String,
}

// ---------------------------------------------------------------------------
// OrderResult — mutable, driven through the FSM by Execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub correlation_id: String,
    pub exchange_order_id: Option<String>,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub avg_price: Option<Decimal>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub contract_version: String,
    pub updated_at_ms: i64,
}

impl OrderResult {
    pub fn new(correlation_id: &str, status: OrderStatus, updated_at_ms: i64) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            exchange_order_id: None,
            status,
            filled_qty: Decimal::ZERO,
            avg_price: None,
            error_code: None,
            error_message: None,
            contract_version: CONTRACT_VERSION.to_string(),
            updated_at_ms,
        }
    }

    pub fn with_error(mut self, code: &str, message: &str) -> Self {
        self.error_code = Some(code.to_string());
        self.error_message = Some(message.to_string());
        self
    }

    /// Merge an additional fill into this result. `filled_qty` accumulates
    /// and `avg_price` becomes the volume-weighted average.
    pub fn merge_fill(&mut self, fill_qty: Decimal, fill_price: Option<Decimal>) {
        if fill_qty <= Decimal::ZERO {
            return;
        }
        let total = self.filled_qty + fill_qty;
        self.avg_price = match (self.avg_price, fill_price) {
            (Some(prev), Some(px)) => Some((prev * self.filled_qty + px * fill_qty) / total),
            (None, Some(px)) => Some(px),
            (prev, None) => prev,
        };
        self.filled_qty = total;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr as _;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_terminal_states_admit_no_transition() {
        for terminal in [
            OrderStatus::Filled,
            OrderStatus::Canceled,
            OrderStatus::Expired,
            OrderStatus::Rejected,
        ] {
            assert!(terminal.is_terminal());
            assert!(terminal.can_transition(terminal));
            assert!(!terminal.can_transition(OrderStatus::Pending));
            assert!(!terminal.can_transition(OrderStatus::Submitted));
            assert!(!terminal.can_transition(OrderStatus::Unknown));
        }
    }

    #[test]
    fn test_progress_never_regresses() {
        assert!(!OrderStatus::Submitted.can_transition(OrderStatus::Pending));
        assert!(!OrderStatus::PartiallyFilled.can_transition(OrderStatus::Submitted));
        assert!(OrderStatus::Submitted.can_transition(OrderStatus::PartiallyFilled));
        assert!(OrderStatus::Submitted.can_transition(OrderStatus::Unknown));
        assert!(OrderStatus::Unknown.can_transition(OrderStatus::Filled));
    }

    #[test]
    fn test_merge_fill_volume_weighted() {
        let mut result = OrderResult::new("hl-a-1-BTCUSDT", OrderStatus::Expired, 0);
        result.merge_fill(dec("0.8"), Some(dec("100")));
        result.merge_fill(dec("0.2"), Some(dec("110")));
        assert_eq!(result.filled_qty, dec("1.0"));
        assert_eq!(result.avg_price, Some(dec("102")));
    }

    #[test]
    fn test_merge_fill_ignores_zero() {
        let mut result = OrderResult::new("hl-a-1-BTCUSDT", OrderStatus::Submitted, 0);
        result.merge_fill(Decimal::ZERO, Some(dec("50")));
        assert_eq!(result.filled_qty, Decimal::ZERO);
        assert_eq!(result.avg_price, None);
    }
}
