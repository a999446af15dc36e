use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::DecisionReason;

/// Per-symbol venue trading filters, cached by the venue adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolFilters {
    pub min_qty: Decimal,
    pub step_size: Decimal,
    pub min_notional: Decimal,
    pub tick_size: Decimal,
}

fn is_multiple(value: Decimal, step: Decimal) -> bool {
    if step <= Decimal::ZERO {
        return true;
    }
    (value % step).is_zero()
}

/// Exact-multiple validation against the venue filters. No rounding: a
/// quantity or price off the step grid is a rejection, not a nudge.
pub fn validate(
    qty: Decimal,
    price: Option<Decimal>,
    filters: &SymbolFilters,
) -> Result<(), DecisionReason> {
    if filters.min_qty > Decimal::ZERO && qty < filters.min_qty {
        return Err(DecisionReason::FilterMinQty);
    }
    if !is_multiple(qty, filters.step_size) {
        return Err(DecisionReason::FilterStepSize);
    }
    let Some(price) = price else {
        return Ok(());
    };
    if !is_multiple(price, filters.tick_size) {
        return Err(DecisionReason::FilterTickSize);
    }
    if filters.min_notional > Decimal::ZERO && price * qty < filters.min_notional {
        return Err(DecisionReason::FilterMinNotional);
    }
    Ok(())
}
