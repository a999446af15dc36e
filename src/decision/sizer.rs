use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::DecisionReason;

/// Sizing strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizingMode {
    Fixed,
    Proportional,
    Kelly,
}

impl SizingMode {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "proportional" => SizingMode::Proportional,
            "kelly" => SizingMode::Kelly,
            _ => SizingMode::Fixed,
        }
    }
}

impl fmt::Display for SizingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizingMode::Fixed => write!(f, "fixed"),
            SizingMode::Proportional => write!(f, "proportional"),
            SizingMode::Kelly => write!(f, "kelly"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SizingConfig {
    pub mode: SizingMode,
    /// Base-asset quantity used by the fixed mode.
    pub fixed_qty: Decimal,
    /// Fraction of the leader's component mirrored by the proportional mode.
    pub proportional_ratio: Decimal,
    pub kelly_win_rate: Decimal,
    pub kelly_edge: Decimal,
    /// Fraction of full Kelly actually deployed.
    pub kelly_multiplier: Decimal,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            mode: SizingMode::Proportional,
            fixed_qty: Decimal::ZERO,
            proportional_ratio: Decimal::new(1, 3), // 0.001
            kelly_win_rate: Decimal::ZERO,
            kelly_edge: Decimal::ZERO,
            kelly_multiplier: Decimal::new(5, 1), // half-Kelly
        }
    }
}

/// Map a leader-side exposure component to a local base-asset quantity.
pub fn size_open_qty(config: &SizingConfig, component: Decimal) -> Result<Decimal, DecisionReason> {
    if component <= Decimal::ZERO {
        return Err(DecisionReason::SizingInvalid);
    }
    let qty = match config.mode {
        SizingMode::Fixed => config.fixed_qty,
        SizingMode::Proportional => component * config.proportional_ratio,
        SizingMode::Kelly => {
            if config.kelly_win_rate <= Decimal::ZERO || config.kelly_edge <= Decimal::ZERO {
                return Err(DecisionReason::KellyParamsMissing);
            }
            let kelly = config.kelly_win_rate
                - (Decimal::ONE - config.kelly_win_rate) / config.kelly_edge;
            if kelly <= Decimal::ZERO {
                return Err(DecisionReason::SizingInvalid);
            }
            component * kelly * config.kelly_multiplier
        }
    };
    if qty <= Decimal::ZERO {
        return Err(DecisionReason::SizingInvalid);
    }
    Ok(qty)
}
