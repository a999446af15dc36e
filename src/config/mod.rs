use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use sha2::{Digest, Sha256};

use crate::decision::{
    DecisionConfig, PriceFailurePolicy, ReplayPolicy, SizingConfig, SizingMode,
};
use crate::execution::ExecutionConfig;
use crate::ingestion::coordinator::IngestConfig;
use crate::ingestion::hyperliquid::{HyperliquidConfig, RateLimitPolicy, RetryPolicy};
use crate::models::{OrderType, SafetyMode, TimeInForce};
use crate::safety::{ReconcileConfig, SafetyConfig};
use crate::venue::binance::BinanceConfig;

const DEFAULT_LEADER_REST_URL: &str = "https://api.hyperliquid.xyz/info";
const DEFAULT_LEADER_WS_URL: &str = "wss://api.hyperliquid.xyz/ws";
const DEFAULT_BINANCE_BASE_URL: &str = "https://fapi.binance.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Live,
    DryRun,
    BackfillOnly,
}

impl RunMode {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "live" => Ok(RunMode::Live),
            "dry-run" | "dryrun" => Ok(RunMode::DryRun),
            "backfill-only" | "backfill" => Ok(RunMode::BackfillOnly),
            other => anyhow::bail!("invalid mode '{other}'; expected live|dry-run|backfill-only"),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Live => write!(f, "live"),
            RunMode::DryRun => write!(f, "dry-run"),
            RunMode::BackfillOnly => write!(f, "backfill-only"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: String,
    pub config_version: String,

    // Leader source
    pub leader_rest_url: String,
    pub leader_ws_url: String,
    pub leader_wallet: String,
    pub request_timeout_ms: u64,
    pub symbol_map: HashMap<String, String>,

    // Ingest
    pub backfill_window_ms: i64,
    pub cursor_overlap_ms: i64,
    pub maintenance_skip_gap: bool,
    pub dedup_ttl_ms: i64,
    pub ws_max_reconnect_delay_sec: u64,

    // Execution venue
    pub binance_base_url: String,
    pub binance_api_key: Option<String>,
    pub binance_api_secret: Option<String>,
    pub recv_window_ms: u64,
    pub exchange_info_ttl_sec: u64,

    // Decision
    pub max_stale_ms: i64,
    pub max_future_ms: i64,
    pub replay_policy: ReplayPolicy,
    pub price_max_stale_ms: i64,
    pub price_fallback_enabled: bool,
    pub price_fallback_max_stale_ms: i64,
    pub price_failure_policy: PriceFailurePolicy,
    pub slippage_cap_pct: Decimal,
    pub filters_enabled: bool,
    pub blacklist_symbols: Vec<String>,
    pub sizing_mode: SizingMode,
    pub fixed_qty: Decimal,
    pub proportional_ratio: Decimal,
    pub kelly_win_rate: Decimal,
    pub kelly_edge: Decimal,
    pub kelly_multiplier: Decimal,
    pub default_order_type: OrderType,
    pub strategy_version: String,

    // Execution
    pub tif_seconds: u64,
    pub order_poll_interval_sec: u64,
    pub unknown_poll_interval_sec: u64,
    pub retry_budget_max_attempts: u32,
    pub retry_budget_window_sec: u64,
    pub retry_budget_mode: SafetyMode,
    pub market_fallback_enabled: bool,
    pub market_fallback_threshold_pct: Decimal,
    pub market_slippage_cap_pct: Decimal,
    pub rate_limit_cooldown_sec: u64,

    // Safety
    pub warn_threshold: Decimal,
    pub critical_threshold: Decimal,
    pub snapshot_max_stale_ms: i64,
    pub reconcile_interval_sec: u64,
    pub auto_recovery_required_noncritical: u32,

    // Orchestrator loop
    pub loop_idle_sleep_sec: u64,
    pub loop_max_idle_sleep_sec: u64,
    pub loop_active_sleep_sec: u64,
    pub heartbeat_sec: u64,
    pub tick_warn_sec: u64,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn decimal_or(key: &str, default: &str) -> Decimal {
    env::var(key)
        .ok()
        .and_then(|v| Decimal::from_str(&v).ok())
        .unwrap_or_else(|| Decimal::from_str(default).expect("default decimal is well-formed"))
}

fn parse_symbol_map(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, ':');
            match (parts.next(), parts.next()) {
                (Some(coin), Some(symbol)) if !coin.trim().is_empty() && !symbol.trim().is_empty() => {
                    Some((coin.trim().to_string(), symbol.trim().to_string()))
                }
                _ => None,
            }
        })
        .collect()
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let symbol_map = parse_symbol_map(&var_or("SYMBOL_MAP", "BTC:BTCUSDT,ETH:ETHUSDT"));

        Ok(Self {
            db_path: var_or("DB_PATH", "data/mirrorbot.db"),
            config_version: var_or("CONFIG_VERSION", "1"),

            leader_rest_url: var_or("LEADER_REST_URL", DEFAULT_LEADER_REST_URL),
            leader_ws_url: var_or("LEADER_WS_URL", DEFAULT_LEADER_WS_URL),
            leader_wallet: var_or("LEADER_WALLET", ""),
            request_timeout_ms: parse_or("REQUEST_TIMEOUT_MS", 10_000),
            symbol_map,

            backfill_window_ms: parse_or("BACKFILL_WINDOW_MS", 3_600_000),
            cursor_overlap_ms: parse_or("CURSOR_OVERLAP_MS", 2_000),
            maintenance_skip_gap: parse_or("MAINTENANCE_SKIP_GAP", false),
            dedup_ttl_ms: parse_or("DEDUP_TTL_MS", 604_800_000),
            ws_max_reconnect_delay_sec: parse_or("WS_MAX_RECONNECT_DELAY_SEC", 60),

            binance_base_url: var_or("BINANCE_BASE_URL", DEFAULT_BINANCE_BASE_URL),
            binance_api_key: env::var("BINANCE_API_KEY").ok().filter(|v| !v.is_empty()),
            binance_api_secret: env::var("BINANCE_API_SECRET").ok().filter(|v| !v.is_empty()),
            recv_window_ms: parse_or("RECV_WINDOW_MS", 5_000),
            exchange_info_ttl_sec: parse_or("EXCHANGE_INFO_TTL_SEC", 300),

            max_stale_ms: parse_or("MAX_STALE_MS", 0),
            max_future_ms: parse_or("MAX_FUTURE_MS", 2_000),
            replay_policy: ReplayPolicy::parse(&var_or("REPLAY_POLICY", "close-only")),
            price_max_stale_ms: parse_or("PRICE_MAX_STALE_MS", 10_000),
            price_fallback_enabled: parse_or("PRICE_FALLBACK_ENABLED", false),
            price_fallback_max_stale_ms: parse_or("PRICE_FALLBACK_MAX_STALE_MS", 3_000),
            price_failure_policy: PriceFailurePolicy::parse(&var_or("PRICE_FAILURE_POLICY", "reject")),
            slippage_cap_pct: decimal_or("SLIPPAGE_CAP_PCT", "0"),
            filters_enabled: parse_or("FILTERS_ENABLED", true),
            blacklist_symbols: var_or("BLACKLIST_SYMBOLS", "")
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            sizing_mode: SizingMode::parse(&var_or("SIZING_MODE", "proportional")),
            fixed_qty: decimal_or("FIXED_QTY", "0"),
            proportional_ratio: decimal_or("PROPORTIONAL_RATIO", "0.001"),
            kelly_win_rate: decimal_or("KELLY_WIN_RATE", "0"),
            kelly_edge: decimal_or("KELLY_EDGE", "0"),
            kelly_multiplier: decimal_or("KELLY_MULTIPLIER", "0.5"),
            default_order_type: match var_or("DEFAULT_ORDER_TYPE", "market").to_lowercase().as_str() {
                "limit" => OrderType::Limit,
                _ => OrderType::Market,
            },
            strategy_version: var_or("STRATEGY_VERSION", "v1"),

            tif_seconds: parse_or("TIF_SECONDS", 30),
            order_poll_interval_sec: parse_or("ORDER_POLL_INTERVAL_SEC", 2),
            unknown_poll_interval_sec: parse_or("UNKNOWN_POLL_INTERVAL_SEC", 5),
            retry_budget_max_attempts: parse_or("RETRY_BUDGET_MAX_ATTEMPTS", 3),
            retry_budget_window_sec: parse_or("RETRY_BUDGET_WINDOW_SEC", 60),
            retry_budget_mode: SafetyMode::from_str_opt(&var_or("RETRY_BUDGET_MODE", "ARMED_SAFE"))
                .unwrap_or(SafetyMode::ArmedSafe),
            market_fallback_enabled: parse_or("MARKET_FALLBACK_ENABLED", true),
            market_fallback_threshold_pct: decimal_or("MARKET_FALLBACK_THRESHOLD_PCT", "0.5"),
            market_slippage_cap_pct: decimal_or("MARKET_SLIPPAGE_CAP_PCT", "0.005"),
            rate_limit_cooldown_sec: parse_or("RATE_LIMIT_COOLDOWN_SEC", 2),

            warn_threshold: decimal_or("WARN_THRESHOLD", "0.001"),
            critical_threshold: decimal_or("CRITICAL_THRESHOLD", "0.01"),
            snapshot_max_stale_ms: parse_or("SNAPSHOT_MAX_STALE_MS", 60_000),
            reconcile_interval_sec: parse_or("RECONCILE_INTERVAL_SEC", 30),
            auto_recovery_required_noncritical: parse_or("AUTO_RECOVERY_NONCRITICAL", 3),

            loop_idle_sleep_sec: parse_or("LOOP_IDLE_SLEEP_SEC", 1),
            loop_max_idle_sleep_sec: parse_or("LOOP_MAX_IDLE_SLEEP_SEC", 10),
            loop_active_sleep_sec: parse_or("LOOP_ACTIVE_SLEEP_SEC", 0),
            heartbeat_sec: parse_or("HEARTBEAT_SEC", 10),
            tick_warn_sec: parse_or("TICK_WARN_SEC", 30),
        })
    }

    /// Live mode cannot start without credentials or a leader to follow.
    /// Their absence is a startup failure, not a safety transition.
    pub fn validate(&self, mode: RunMode) -> anyhow::Result<()> {
        if self.symbol_map.is_empty() {
            anyhow::bail!("SYMBOL_MAP must contain at least one coin:symbol pair");
        }
        if mode == RunMode::Live {
            if self.leader_wallet.is_empty() {
                anyhow::bail!("LEADER_WALLET must be set in live mode");
            }
            if self.binance_api_key.is_none() || self.binance_api_secret.is_none() {
                anyhow::bail!("BINANCE_API_KEY and BINANCE_API_SECRET must be set in live mode");
            }
        }
        Ok(())
    }

    /// Stable hash of the non-secret configuration, compared against the
    /// persisted hash at startup.
    pub fn config_hash(&self) -> String {
        let mut symbol_pairs: Vec<String> = self
            .symbol_map
            .iter()
            .map(|(coin, symbol)| format!("{coin}:{symbol}"))
            .collect();
        symbol_pairs.sort();
        let snapshot = serde_json::json!({
            "config_version": self.config_version,
            "leader_rest_url": self.leader_rest_url,
            "leader_ws_url": self.leader_ws_url,
            "symbol_map": symbol_pairs,
            "backfill_window_ms": self.backfill_window_ms,
            "cursor_overlap_ms": self.cursor_overlap_ms,
            "dedup_ttl_ms": self.dedup_ttl_ms,
            "binance_base_url": self.binance_base_url,
            "max_stale_ms": self.max_stale_ms,
            "max_future_ms": self.max_future_ms,
            "replay_policy": format!("{:?}", self.replay_policy),
            "slippage_cap_pct": self.slippage_cap_pct.to_string(),
            "sizing_mode": self.sizing_mode.to_string(),
            "fixed_qty": self.fixed_qty.to_string(),
            "proportional_ratio": self.proportional_ratio.to_string(),
            "default_order_type": self.default_order_type.to_string(),
            "strategy_version": self.strategy_version,
            "tif_seconds": self.tif_seconds,
            "retry_budget_max_attempts": self.retry_budget_max_attempts,
            "retry_budget_window_sec": self.retry_budget_window_sec,
            "market_fallback_threshold_pct": self.market_fallback_threshold_pct.to_string(),
            "market_slippage_cap_pct": self.market_slippage_cap_pct.to_string(),
            "warn_threshold": self.warn_threshold.to_string(),
            "critical_threshold": self.critical_threshold.to_string(),
            "snapshot_max_stale_ms": self.snapshot_max_stale_ms,
        });
        let digest = Sha256::digest(snapshot.to_string().as_bytes());
        hex::encode(digest)
    }

    // -- component config views --------------------------------------------

    pub fn ingest_config(&self) -> IngestConfig {
        IngestConfig {
            backfill_window_ms: self.backfill_window_ms,
            cursor_overlap_ms: self.cursor_overlap_ms,
            maintenance_skip_gap: self.maintenance_skip_gap,
            dedup_ttl_ms: self.dedup_ttl_ms,
            symbol_map: self.symbol_map.clone(),
        }
    }

    pub fn hyperliquid_config(&self) -> HyperliquidConfig {
        HyperliquidConfig {
            rest_url: self.leader_rest_url.clone(),
            ws_url: self.leader_ws_url.clone(),
            target_wallet: self.leader_wallet.clone(),
            request_timeout_ms: self.request_timeout_ms,
            retry: RetryPolicy::default(),
            rate_limit: RateLimitPolicy::default(),
        }
    }

    pub fn binance_config(&self) -> BinanceConfig {
        BinanceConfig {
            base_url: self.binance_base_url.clone(),
            api_key: self.binance_api_key.clone().unwrap_or_default(),
            api_secret: self.binance_api_secret.clone().unwrap_or_default(),
            request_timeout_ms: self.request_timeout_ms,
            recv_window_ms: self.recv_window_ms,
            exchange_info_ttl_sec: self.exchange_info_ttl_sec,
            retry: RetryPolicy::default(),
            rate_limit: RateLimitPolicy::default(),
        }
    }

    pub fn decision_config(&self) -> DecisionConfig {
        DecisionConfig {
            max_stale_ms: self.max_stale_ms,
            max_future_ms: self.max_future_ms,
            replay_policy: self.replay_policy,
            price_max_stale_ms: self.price_max_stale_ms,
            price_fallback_enabled: self.price_fallback_enabled,
            price_fallback_max_stale_ms: self.price_fallback_max_stale_ms,
            price_failure_policy: self.price_failure_policy,
            slippage_cap_pct: self.slippage_cap_pct,
            filters_enabled: self.filters_enabled,
            blacklist_symbols: self.blacklist_symbols.clone(),
            sizing: SizingConfig {
                mode: self.sizing_mode,
                fixed_qty: self.fixed_qty,
                proportional_ratio: self.proportional_ratio,
                kelly_win_rate: self.kelly_win_rate,
                kelly_edge: self.kelly_edge,
                kelly_multiplier: self.kelly_multiplier,
            },
            default_order_type: self.default_order_type,
            limit_tif: TimeInForce::Gtc,
            strategy_version: self.strategy_version.clone(),
        }
    }

    pub fn execution_config(&self, mode: RunMode) -> ExecutionConfig {
        ExecutionConfig {
            tif_seconds: self.tif_seconds,
            order_poll_interval_sec: self.order_poll_interval_sec,
            unknown_poll_interval_sec: self.unknown_poll_interval_sec,
            retry_budget_max_attempts: self.retry_budget_max_attempts,
            retry_budget_window_sec: self.retry_budget_window_sec,
            retry_budget_mode: self.retry_budget_mode,
            market_fallback_enabled: self.market_fallback_enabled,
            market_fallback_threshold_pct: self.market_fallback_threshold_pct,
            market_slippage_cap_pct: self.market_slippage_cap_pct,
            rate_limit_cooldown_sec: self.rate_limit_cooldown_sec,
            suppress_venue_writes: mode != RunMode::Live,
        }
    }

    pub fn safety_config(&self) -> SafetyConfig {
        SafetyConfig {
            reconcile: ReconcileConfig {
                warn_threshold: self.warn_threshold,
                critical_threshold: self.critical_threshold,
                snapshot_max_stale_ms: self.snapshot_max_stale_ms,
            },
            auto_recovery_required_noncritical: self.auto_recovery_required_noncritical,
            adapter_health_window_ms: 60_000,
            maintenance_skip_allowed: self.maintenance_skip_gap,
        }
    }

    /// Execution-venue symbols being mirrored (the reconcile universe).
    pub fn venue_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.symbol_map.values().cloned().collect();
        symbols.sort();
        symbols.dedup();
        symbols
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_symbol_map() {
        let map = parse_symbol_map("BTC:BTCUSDT, ETH:ETHUSDT ,,BAD");
        assert_eq!(map.len(), 2);
        assert_eq!(map["BTC"], "BTCUSDT");
        assert_eq!(map["ETH"], "ETHUSDT");
    }

    #[test]
    fn test_run_mode_parse() {
        assert_eq!(RunMode::parse("live").unwrap(), RunMode::Live);
        assert_eq!(RunMode::parse("dry-run").unwrap(), RunMode::DryRun);
        assert_eq!(RunMode::parse("backfill-only").unwrap(), RunMode::BackfillOnly);
        assert!(RunMode::parse("other").is_err());
    }
}
