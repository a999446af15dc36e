pub mod filters;
pub mod sizer;

use std::fmt;

use rust_decimal::Decimal;

use crate::models::{
    assert_contract_version, correlation_id, DeltaAction, OrderIntent, OrderType,
    PositionDeltaEvent, PriceSnapshot, SafetyMode, Side, TimeInForce, CONTRACT_VERSION,
};

pub use filters::SymbolFilters;
pub use sizer::{SizingConfig, SizingMode};

const SLIPPAGE_EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 9); // 1e-9

// ---------------------------------------------------------------------------
// Config & inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayPolicy {
    Off,
    CloseOnly,
    Full,
}

impl ReplayPolicy {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "off" => ReplayPolicy::Off,
            "full" => ReplayPolicy::Full,
            _ => ReplayPolicy::CloseOnly,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceFailurePolicy {
    Reject,
    AllowWithoutPrice,
}

impl PriceFailurePolicy {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "allow_without_price" => PriceFailurePolicy::AllowWithoutPrice,
            _ => PriceFailurePolicy::Reject,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecisionConfig {
    /// Events older than this are rejected. Zero disables the check.
    pub max_stale_ms: i64,
    /// Events this far ahead of the clock are rejected.
    pub max_future_ms: i64,
    pub replay_policy: ReplayPolicy,
    /// Staleness bound on the venue reference price. Zero disables.
    pub price_max_stale_ms: i64,
    pub price_fallback_enabled: bool,
    /// Stricter staleness bound applied to the ingest-supplied fallback.
    pub price_fallback_max_stale_ms: i64,
    pub price_failure_policy: PriceFailurePolicy,
    /// Slippage cap as a fraction (0.005 = 0.5%). Zero disables.
    pub slippage_cap_pct: Decimal,
    pub filters_enabled: bool,
    pub blacklist_symbols: Vec<String>,
    pub sizing: SizingConfig,
    pub default_order_type: OrderType,
    pub limit_tif: TimeInForce,
    pub strategy_version: String,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            max_stale_ms: 0,
            max_future_ms: 2_000,
            replay_policy: ReplayPolicy::CloseOnly,
            price_max_stale_ms: 10_000,
            price_fallback_enabled: false,
            price_fallback_max_stale_ms: 3_000,
            price_failure_policy: PriceFailurePolicy::Reject,
            slippage_cap_pct: Decimal::ZERO,
            filters_enabled: true,
            blacklist_symbols: Vec::new(),
            sizing: SizingConfig::default(),
            default_order_type: OrderType::Market,
            limit_tif: TimeInForce::Gtc,
            strategy_version: "v1".to_string(),
        }
    }
}

/// Provider readings gathered by the orchestrator before the gate runs, so
/// the decision itself stays pure and reproducible.
#[derive(Debug, Clone, Default)]
pub struct DecisionInputs {
    pub safety_mode: Option<SafetyMode>,
    pub local_current_position: Option<Decimal>,
    pub closable_qty: Option<Decimal>,
    pub reference_price: Option<PriceSnapshot>,
    pub filters: Option<SymbolFilters>,
    pub now_ms: i64,
}

// ---------------------------------------------------------------------------
// Rejection reasons
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    ContractVersionMismatch,
    StaleEvent,
    FutureEvent,
    BlacklistedSymbol,
    ReplayPolicyDrop,
    ReplayPolicyIncreaseBlocked,
    HaltDrop,
    ArmedSafeIncreaseBlocked,
    PriceUnavailable,
    SlippageExceeded,
    FilterMinQty,
    FilterStepSize,
    FilterTickSize,
    FilterMinNotional,
    MissingSymbolFilters,
    NoClosableQty,
    MissingLocalPosition,
    SizingInvalid,
    KellyParamsMissing,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::ContractVersionMismatch => "contract_version_mismatch",
            DecisionReason::StaleEvent => "stale_event",
            DecisionReason::FutureEvent => "future_event",
            DecisionReason::BlacklistedSymbol => "blacklisted_symbol",
            DecisionReason::ReplayPolicyDrop => "replay_policy_drop",
            DecisionReason::ReplayPolicyIncreaseBlocked => "replay_policy_increase_blocked",
            DecisionReason::HaltDrop => "halt_drop",
            DecisionReason::ArmedSafeIncreaseBlocked => "armed_safe_increase_blocked",
            DecisionReason::PriceUnavailable => "price_unavailable",
            DecisionReason::SlippageExceeded => "slippage_exceeded",
            DecisionReason::FilterMinQty => "filter_min_qty",
            DecisionReason::FilterStepSize => "filter_step_size",
            DecisionReason::FilterTickSize => "filter_tick_size",
            DecisionReason::FilterMinNotional => "filter_min_notional",
            DecisionReason::MissingSymbolFilters => "missing_symbol_filters",
            DecisionReason::NoClosableQty => "no_closable_qty",
            DecisionReason::MissingLocalPosition => "missing_local_position",
            DecisionReason::SizingInvalid => "sizing_invalid",
            DecisionReason::KellyParamsMissing => "kelly_params_missing",
        }
    }
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Rejection {
    pub reason: DecisionReason,
    pub detail: String,
}

#[derive(Debug, Clone, Default)]
pub struct DecisionOutput {
    /// Ordered intents; on a FLIP the close intent precedes the open intent.
    pub intents: Vec<OrderIntent>,
    pub rejections: Vec<Rejection>,
}

impl DecisionOutput {
    fn reject(reason: DecisionReason, detail: impl Into<String>) -> Self {
        Self {
            intents: Vec::new(),
            rejections: vec![Rejection {
                reason,
                detail: detail.into(),
            }],
        }
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Component of an event before sizing: either the closing leg or the
/// opening leg of the position move.
#[derive(Debug, Clone, Copy)]
struct Leg {
    role: Option<&'static str>,
    side: Side,
    reduce_only: bool,
    increases_exposure: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DecisionService {
    pub config: DecisionConfig,
}

impl DecisionService {
    pub fn new(config: DecisionConfig) -> Self {
        Self { config }
    }

    /// Run the strict gate order on one event. Deterministic for fixed
    /// inputs: identical events and provider readings produce bit-identical
    /// output.
    pub fn decide(&self, event: &PositionDeltaEvent, inputs: &DecisionInputs) -> DecisionOutput {
        // 1. Schema & freshness.
        if let Err(e) = assert_contract_version(&event.contract_version) {
            return DecisionOutput::reject(DecisionReason::ContractVersionMismatch, e.to_string());
        }
        if self.config.max_stale_ms > 0
            && event.timestamp_ms < inputs.now_ms - self.config.max_stale_ms
        {
            return DecisionOutput::reject(
                DecisionReason::StaleEvent,
                format!("event age {}ms", inputs.now_ms - event.timestamp_ms),
            );
        }
        if event.timestamp_ms > inputs.now_ms + self.config.max_future_ms {
            return DecisionOutput::reject(
                DecisionReason::FutureEvent,
                format!("event ahead by {}ms", event.timestamp_ms - inputs.now_ms),
            );
        }
        if self.config.blacklist_symbols.contains(&event.symbol) {
            return DecisionOutput::reject(DecisionReason::BlacklistedSymbol, event.symbol.clone());
        }

        let mut output = DecisionOutput::default();
        let mut legs = plan_legs(event);

        // 2. Replay gate.
        if event.is_replay {
            match self.config.replay_policy {
                ReplayPolicy::Off => {
                    return DecisionOutput::reject(DecisionReason::ReplayPolicyDrop, "replay");
                }
                ReplayPolicy::CloseOnly => {
                    legs.retain(|leg| {
                        if leg.increases_exposure {
                            output.rejections.push(Rejection {
                                reason: DecisionReason::ReplayPolicyIncreaseBlocked,
                                detail: leg.role.unwrap_or(event.action.as_str()).to_string(),
                            });
                            false
                        } else {
                            true
                        }
                    });
                }
                ReplayPolicy::Full => {}
            }
        }

        // 3. Safety gate (read at gate time; later downgrades do not
        //    retroactively invalidate what was already gated).
        match inputs.safety_mode {
            Some(SafetyMode::Halt) => {
                return DecisionOutput::reject(DecisionReason::HaltDrop, "safety HALT");
            }
            Some(SafetyMode::ArmedSafe) => {
                legs.retain(|leg| {
                    if leg.increases_exposure {
                        output.rejections.push(Rejection {
                            reason: DecisionReason::ArmedSafeIncreaseBlocked,
                            detail: leg.role.unwrap_or(event.action.as_str()).to_string(),
                        });
                        false
                    } else {
                        true
                    }
                });
            }
            _ => {}
        }
        if legs.is_empty() {
            return output;
        }

        // 4. Hard risk checks: reference price + slippage.
        let mut risk_notes: Option<String> = None;
        let reference_price = match self.resolve_reference_price(event, inputs) {
            Ok(price) => price,
            Err(rejection) => {
                output.rejections.push(rejection);
                return output;
            }
        };
        if reference_price.is_none() {
            risk_notes = Some("price_unverified".to_string());
        }
        if let (Some(reference), Some(expected)) = (reference_price, event.expected_price) {
            if self.config.slippage_cap_pct > Decimal::ZERO {
                let slippage =
                    (reference.price - expected).abs() / expected.max(SLIPPAGE_EPSILON);
                if slippage > self.config.slippage_cap_pct {
                    output.rejections.push(Rejection {
                        reason: DecisionReason::SlippageExceeded,
                        detail: format!("slippage {slippage} > cap {}", self.config.slippage_cap_pct),
                    });
                    return output;
                }
            }
        }

        // 5+6. Sizing, venue filters, intent assembly. Close legs precede
        //      open legs by construction.
        for leg in legs {
            let qty = if leg.reduce_only {
                match self.compute_close_qty(event, inputs) {
                    Ok(qty) => qty,
                    Err(reason) => {
                        output.rejections.push(Rejection {
                            reason,
                            detail: leg.role.unwrap_or(event.action.as_str()).to_string(),
                        });
                        continue;
                    }
                }
            } else {
                let component = match event.action {
                    DeltaAction::Flip => event.open_component.unwrap_or(Decimal::ZERO),
                    _ => event.delta.abs(),
                };
                match sizer::size_open_qty(&self.config.sizing, component) {
                    Ok(qty) => qty,
                    Err(reason) => {
                        output.rejections.push(Rejection {
                            reason,
                            detail: leg.role.unwrap_or(event.action.as_str()).to_string(),
                        });
                        continue;
                    }
                }
            };

            let (order_type, price, tif) = self.order_shape(reference_price);
            if self.config.filters_enabled {
                let Some(symbol_filters) = inputs.filters else {
                    output.rejections.push(Rejection {
                        reason: DecisionReason::MissingSymbolFilters,
                        detail: event.symbol.clone(),
                    });
                    continue;
                };
                if let Err(reason) = filters::validate(qty, price, &symbol_filters) {
                    output.rejections.push(Rejection {
                        reason,
                        detail: format!("qty {qty}"),
                    });
                    continue;
                }
            }

            output.intents.push(OrderIntent {
                correlation_id: correlation_id(
                    &event.tx_hash,
                    event.event_index,
                    &event.symbol,
                    leg.role,
                ),
                client_order_id: None,
                symbol: event.symbol.clone(),
                side: leg.side,
                order_type,
                qty,
                price,
                reduce_only: leg.reduce_only,
                time_in_force: tif,
                is_replay: event.is_replay,
                strategy_version: self.config.strategy_version.clone(),
                risk_notes: risk_notes.clone(),
                contract_version: CONTRACT_VERSION.to_string(),
            });
        }

        output
    }

    fn order_shape(
        &self,
        reference_price: Option<PriceSnapshot>,
    ) -> (OrderType, Option<Decimal>, TimeInForce) {
        match (self.config.default_order_type, reference_price) {
            (OrderType::Limit, Some(reference)) => {
                (OrderType::Limit, Some(reference.price), self.config.limit_tif)
            }
            _ => (OrderType::Market, None, TimeInForce::Ioc),
        }
    }

    /// Venue mark price first; the ingest-supplied expected price only as an
    /// explicitly enabled fallback under its stricter staleness bound.
    fn resolve_reference_price(
        &self,
        event: &PositionDeltaEvent,
        inputs: &DecisionInputs,
    ) -> Result<Option<PriceSnapshot>, Rejection> {
        if let Some(snapshot) = inputs.reference_price {
            let fresh = self.config.price_max_stale_ms <= 0
                || inputs.now_ms - snapshot.timestamp_ms <= self.config.price_max_stale_ms;
            if fresh {
                return Ok(Some(snapshot));
            }
        }
        if self.config.price_fallback_enabled {
            if let (Some(price), Some(ts)) = (event.expected_price, event.expected_price_timestamp_ms)
            {
                if self.config.price_fallback_max_stale_ms <= 0
                    || inputs.now_ms - ts <= self.config.price_fallback_max_stale_ms
                {
                    return Ok(Some(PriceSnapshot {
                        price,
                        timestamp_ms: ts,
                        source: crate::models::PriceSource::Ingest,
                    }));
                }
            }
        }
        match self.config.price_failure_policy {
            PriceFailurePolicy::Reject => Err(Rejection {
                reason: DecisionReason::PriceUnavailable,
                detail: event.symbol.clone(),
            }),
            PriceFailurePolicy::AllowWithoutPrice => Ok(None),
        }
    }

    /// Reduce-only quantity: the proportional close ratio applied to the
    /// local position, capped by what is actually closable.
    fn compute_close_qty(
        &self,
        event: &PositionDeltaEvent,
        inputs: &DecisionInputs,
    ) -> Result<Decimal, DecisionReason> {
        let local = inputs
            .local_current_position
            .ok_or(DecisionReason::MissingLocalPosition)?;
        let closable = inputs.closable_qty.ok_or(DecisionReason::NoClosableQty)?;
        if closable <= Decimal::ZERO {
            return Err(DecisionReason::NoClosableQty);
        }
        if event.prev_net.is_zero() {
            return Err(DecisionReason::NoClosableQty);
        }
        let ratio = (event.delta.abs() / event.prev_net.abs().max(SLIPPAGE_EPSILON))
            .min(Decimal::ONE);
        let qty = (local.abs() * ratio).min(closable.abs());
        if qty <= Decimal::ZERO {
            return Err(DecisionReason::NoClosableQty);
        }
        Ok(qty)
    }
}

/// Break an event into its ordered legs. DECREASE and FLIP close legs are
/// always reduce-only; the FLIP close leg comes first.
fn plan_legs(event: &PositionDeltaEvent) -> Vec<Leg> {
    match event.action {
        DeltaAction::Increase => {
            let side = if event.delta > Decimal::ZERO {
                Side::Buy
            } else {
                Side::Sell
            };
            vec![Leg {
                role: None,
                side,
                reduce_only: false,
                increases_exposure: true,
            }]
        }
        DeltaAction::Decrease => {
            let side = if event.prev_net > Decimal::ZERO {
                Side::Sell
            } else {
                Side::Buy
            };
            vec![Leg {
                role: None,
                side,
                reduce_only: true,
                increases_exposure: false,
            }]
        }
        DeltaAction::Flip => {
            let close_side = if event.prev_net > Decimal::ZERO {
                Side::Sell
            } else {
                Side::Buy
            };
            let open_side = if event.next_net > Decimal::ZERO {
                Side::Buy
            } else {
                Side::Sell
            };
            vec![
                Leg {
                    role: Some("close"),
                    side: close_side,
                    reduce_only: true,
                    increases_exposure: false,
                },
                Leg {
                    role: Some("open"),
                    side: open_side,
                    reduce_only: false,
                    increases_exposure: true,
                },
            ]
        }
    }
}
