use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::contract::CONTRACT_VERSION;

// ---------------------------------------------------------------------------
// DeltaAction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeltaAction {
    Increase,
    Decrease,
    Flip,
}

impl DeltaAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaAction::Increase => "INCREASE",
            DeltaAction::Decrease => "DECREASE",
            DeltaAction::Flip => "FLIP",
        }
    }
}

impl fmt::Display for DeltaAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a net-position move. A sign change through zero is a FLIP;
/// otherwise the absolute sizes decide between INCREASE and DECREASE.
/// Starting from flat, any non-zero delta is an INCREASE.
pub fn classify(prev_net: Decimal, next_net: Decimal) -> DeltaAction {
    if prev_net.is_zero() {
        return DeltaAction::Increase;
    }
    if (prev_net > Decimal::ZERO && next_net < Decimal::ZERO)
        || (prev_net < Decimal::ZERO && next_net > Decimal::ZERO)
    {
        return DeltaAction::Flip;
    }
    if next_net.abs() < prev_net.abs() {
        DeltaAction::Decrease
    } else {
        DeltaAction::Increase
    }
}

// ---------------------------------------------------------------------------
// EventKey — the cursor's composite ordering key
// ---------------------------------------------------------------------------

/// Composite key `(timestamp_ms, event_index, tx_hash, symbol)` under which
/// the cursor is monotone non-decreasing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventKey {
    pub timestamp_ms: i64,
    pub event_index: i64,
    pub tx_hash: String,
    pub symbol: String,
}

impl Ord for EventKey {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.timestamp_ms, self.event_index, &self.tx_hash, &self.symbol).cmp(&(
            other.timestamp_ms,
            other.event_index,
            &other.tx_hash,
            &other.symbol,
        ))
    }
}

impl PartialOrd for EventKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.timestamp_ms, self.event_index, self.tx_hash, self.symbol
        )
    }
}

impl FromStr for EventKey {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = raw.splitn(4, ':').collect();
        if parts.len() != 4 {
            return Err(format!("invalid event key: {raw}"));
        }
        let timestamp_ms = parts[0]
            .parse()
            .map_err(|_| format!("invalid event key: {raw}"))?;
        let event_index = parts[1]
            .parse()
            .map_err(|_| format!("invalid event key: {raw}"))?;
        Ok(EventKey {
            timestamp_ms,
            event_index,
            tx_hash: parts[2].to_string(),
            symbol: parts[3].to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// PositionDeltaEvent — core pipeline message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionDeltaEvent {
    pub symbol: String,
    pub timestamp_ms: i64,
    pub tx_hash: String,
    pub event_index: i64,
    pub is_replay: bool,
    pub prev_net: Decimal,
    pub next_net: Decimal,
    pub delta: Decimal,
    pub action: DeltaAction,
    /// |next_net| when the event crosses zero.
    pub open_component: Option<Decimal>,
    /// |prev_net| when the event crosses zero.
    pub close_component: Option<Decimal>,
    /// Leader-side reference price (size-weighted across the fill group).
    pub expected_price: Option<Decimal>,
    pub expected_price_timestamp_ms: Option<i64>,
    pub contract_version: String,
}

impl PositionDeltaEvent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: String,
        timestamp_ms: i64,
        tx_hash: String,
        event_index: i64,
        is_replay: bool,
        prev_net: Decimal,
        next_net: Decimal,
        expected_price: Option<Decimal>,
        expected_price_timestamp_ms: Option<i64>,
    ) -> Self {
        let action = classify(prev_net, next_net);
        let (open_component, close_component) = match action {
            DeltaAction::Flip => (Some(next_net.abs()), Some(prev_net.abs())),
            _ => (None, None),
        };
        Self {
            symbol,
            timestamp_ms,
            tx_hash,
            event_index,
            is_replay,
            prev_net,
            next_net,
            delta: next_net - prev_net,
            action,
            open_component,
            close_component,
            expected_price,
            expected_price_timestamp_ms: expected_price_timestamp_ms
                .or(expected_price.map(|_| timestamp_ms)),
            contract_version: CONTRACT_VERSION.to_string(),
        }
    }

    pub fn key(&self) -> EventKey {
        EventKey {
            timestamp_ms: self.timestamp_ms,
            event_index: self.event_index,
            tx_hash: self.tx_hash.clone(),
            symbol: self.symbol.clone(),
        }
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
    fn test_classify_from_flat_is_increase() {
        assert_eq!(classify(Decimal::ZERO, dec("1.5")), DeltaAction::Increase);
        assert_eq!(classify(Decimal::ZERO, dec("-2")), DeltaAction::Increase);
    }

    #[test]
    fn test_classify_same_sign() {
        assert_eq!(classify(dec("10"), dec("22.9")), DeltaAction::Increase);
        assert_eq!(classify(dec("10"), dec("4")), DeltaAction::Decrease);
        assert_eq!(classify(dec("-3"), dec("-7")), DeltaAction::Increase);
        assert_eq!(classify(dec("-3"), dec("-1")), DeltaAction::Decrease);
    }

    #[test]
    fn test_classify_through_zero_is_flip() {
        assert_eq!(classify(dec("5"), dec("-3")), DeltaAction::Flip);
        assert_eq!(classify(dec("-5"), dec("0.1")), DeltaAction::Flip);
    }

    #[test]
    fn test_flip_components() {
        let event = PositionDeltaEvent::new(
            "ETHUSDT".into(),
            1_700_000_000_000,
            "0xabc".into(),
            3,
            false,
            dec("5"),
            dec("-3"),
            None,
            None,
        );
        assert_eq!(event.action, DeltaAction::Flip);
        assert_eq!(event.close_component, Some(dec("5")));
        assert_eq!(event.open_component, Some(dec("3")));
        assert_eq!(event.delta, dec("-8"));
    }

    #[test]
    fn test_event_key_ordering() {
        let a = EventKey {
            timestamp_ms: 100,
            event_index: 1,
            tx_hash: "aa".into(),
            symbol: "BTCUSDT".into(),
        };
        let mut b = a.clone();
        b.event_index = 2;
        assert!(a < b);

        let mut c = a.clone();
        c.timestamp_ms = 99;
        assert!(c < a);

        let mut d = a.clone();
        d.tx_hash = "ab".into();
        assert!(a < d);
    }

    #[test]
    fn test_event_key_round_trip() {
        let key = EventKey {
            timestamp_ms: 1_700_000_000_123,
            event_index: 42,
            tx_hash: "0xdead".into(),
            symbol: "BTCUSDT".into(),
        };
        let parsed = EventKey::from_str(&key.to_string()).unwrap();
        assert_eq!(parsed, key);
    }
}
