use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use sha2::Sha256;
use tokio::sync::RwLock;
use tokio::time::sleep;

use crate::decision::SymbolFilters;
use crate::ingestion::hyperliquid::{RateLimitPolicy, RateLimiter, RetryPolicy};
use crate::models::{
    normalize_execution_symbol, sanitize_client_order_id, OrderIntent, OrderStatus, OrderType,
    PriceSnapshot, PriceSource,
};

use super::{
    CancelOutcome, ExecutionVenue, PositionsSnapshot, SubmitOutcome, VenueError, VenueOrder,
};

type HmacSha256 = Hmac<Sha256>;

/// Venue error codes that mean the account cannot cover the order.
const INSUFFICIENT_BALANCE_CODES: [i64; 2] = [-2010, -2019];
/// Clock skew between our signature timestamp and the venue's clock.
const CLOCK_SKEW_CODE: i64 = -1021;

const TIME_SYNC_INTERVAL_MS: i64 = 300_000;

#[derive(Debug, Clone)]
pub struct BinanceConfig {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub request_timeout_ms: u64,
    pub recv_window_ms: u64,
    pub exchange_info_ttl_sec: u64,
    pub retry: RetryPolicy,
    pub rate_limit: RateLimitPolicy,
}

#[derive(Debug, Default)]
struct TimeSync {
    offset_ms: Option<i64>,
    last_sync_ms: i64,
}

#[derive(Debug, Default)]
struct FiltersCache {
    filters: HashMap<String, SymbolFilters>,
    fetched_at_ms: i64,
}

/// USDⓈ-M futures REST adapter. Signs requests with HMAC-SHA256 over the
/// query string, keeps a server-time offset for signing, and caches the
/// exchange-info filters.
pub struct BinanceVenue {
    http: reqwest::Client,
    config: BinanceConfig,
    limiter: RateLimiter,
    time_sync: RwLock<TimeSync>,
    filters_cache: RwLock<FiltersCache>,
}

impl BinanceVenue {
    pub fn new(config: BinanceConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1_000)))
            .build()?;
        let limiter = RateLimiter::new(config.rate_limit.clone());
        Ok(Self {
            http,
            config,
            limiter,
            time_sync: RwLock::new(TimeSync::default()),
            filters_cache: RwLock::new(FiltersCache::default()),
        })
    }

    fn wall_clock_ms() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    async fn signing_timestamp_ms(&self) -> i64 {
        let now = Self::wall_clock_ms();
        let sync = self.time_sync.read().await;
        now + sync.offset_ms.unwrap_or(0)
    }

    async fn sync_time(&self, force: bool) {
        let now = Self::wall_clock_ms();
        {
            let sync = self.time_sync.read().await;
            if !force && sync.offset_ms.is_some() && now - sync.last_sync_ms < TIME_SYNC_INTERVAL_MS
            {
                return;
            }
        }
        match Box::pin(self.request_once("GET", "/fapi/v1/time", Vec::new(), false)).await {
            Ok(payload) => {
                let server_time = payload
                    .get("serverTime")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(now);
                let mut sync = self.time_sync.write().await;
                sync.offset_ms = Some(server_time - now);
                sync.last_sync_ms = now;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Venue time sync failed");
            }
        }
    }

    /// One attempt against the venue. Signing appends timestamp, recvWindow,
    /// and the HMAC signature to the query string.
    async fn request_once(
        &self,
        method: &str,
        path: &str,
        mut params: Vec<(String, String)>,
        signed: bool,
    ) -> Result<serde_json::Value, VenueError> {
        if signed {
            Box::pin(self.sync_time(false)).await;
            params.push(("timestamp".into(), self.signing_timestamp_ms().await.to_string()));
            params.push(("recvWindow".into(), self.config.recv_window_ms.to_string()));
            let query = encode_params(&params);
            params.push(("signature".into(), sign(&query, &self.config.api_secret)));
        }
        let query = encode_params(&params);
        let url = format!("{}{}", self.config.base_url, path);

        let request = match method {
            "POST" => self
                .http
                .post(&url)
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(query),
            "DELETE" => self.http.delete(format!("{url}?{query}")),
            _ => self.http.get(if query.is_empty() {
                url
            } else {
                format!("{url}?{query}")
            }),
        };

        let response = request
            .header("X-MBX-APIKEY", &self.config.api_key)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    VenueError::Timeout
                } else {
                    VenueError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(VenueError::RateLimited);
        }
        let body = response
            .text()
            .await
            .map_err(|e| VenueError::Network(e.to_string()))?;
        let payload: serde_json::Value = serde_json::from_str(if body.is_empty() { "{}" } else { &body })
            .map_err(|e| VenueError::InvalidResponse(e.to_string()))?;

        if !status.is_success() {
            let code = payload.get("code").and_then(|v| v.as_i64()).unwrap_or(0);
            let message = payload
                .get("msg")
                .and_then(|v| v.as_str())
                .unwrap_or(&body)
                .to_string();
            return Err(VenueError::Api {
                code,
                message,
                status: status.as_u16(),
            });
        }
        // Some venue errors come back with HTTP 200 and an error body.
        if let (Some(code), Some(msg)) = (
            payload.get("code").and_then(|v| v.as_i64()),
            payload.get("msg").and_then(|v| v.as_str()),
        ) {
            if code != 0 && code != 200 {
                return Err(VenueError::Api {
                    code,
                    message: msg.to_string(),
                    status: status.as_u16(),
                });
            }
        }
        Ok(payload)
    }

    /// Retry wrapper: transient failures back off with jitter inside the
    /// configured budget; clock skew forces a time re-sync and a re-sign.
    async fn request(
        &self,
        method: &str,
        path: &str,
        params: Vec<(String, String)>,
        signed: bool,
    ) -> Result<serde_json::Value, VenueError> {
        if !self.limiter.allow().await {
            return Err(VenueError::RateLimited);
        }
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.request_once(method, path, params.clone(), signed).await {
                Ok(payload) => return Ok(payload),
                Err(VenueError::Api { code, message, status: _ })
                    if code == CLOCK_SKEW_CODE && attempt < max_attempts =>
                {
                    tracing::warn!(%message, "Venue clock skew, re-syncing time");
                    self.sync_time(true).await;
                    continue;
                }
                Err(e @ (VenueError::RateLimited | VenueError::Timeout | VenueError::Network(_)))
                    if attempt < max_attempts =>
                {
                    tracing::warn!(error = %e, attempt, path, "Venue request failed, retrying");
                    sleep(self.config.retry.next_delay(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn ensure_filters(&self) -> Result<HashMap<String, SymbolFilters>, VenueError> {
        let now = Self::wall_clock_ms();
        let ttl_ms = self.config.exchange_info_ttl_sec as i64 * 1_000;
        {
            let cache = self.filters_cache.read().await;
            if !cache.filters.is_empty() && (ttl_ms <= 0 || now - cache.fetched_at_ms < ttl_ms) {
                return Ok(cache.filters.clone());
            }
        }
        let payload = self
            .request("GET", "/fapi/v1/exchangeInfo", Vec::new(), false)
            .await?;
        let filters = parse_exchange_info(&payload);
        if filters.is_empty() {
            return Err(VenueError::InvalidResponse(
                "exchange info carried no symbol filters".into(),
            ));
        }
        let mut cache = self.filters_cache.write().await;
        cache.filters = filters.clone();
        cache.fetched_at_ms = now;
        Ok(filters)
    }
}

#[async_trait]
impl ExecutionVenue for BinanceVenue {
    async fn submit_order(
        &self,
        intent: &OrderIntent,
        client_order_id: &str,
    ) -> Result<SubmitOutcome, VenueError> {
        let params = build_order_params(intent, client_order_id);
        match self.request("POST", "/fapi/v1/order", params, true).await {
            Ok(payload) => Ok(SubmitOutcome::Accepted(order_from_payload(&payload))),
            Err(VenueError::Api { code, message, .. }) if is_duplicate_message(&message) => {
                tracing::info!(code, client_order_id, "Duplicate client id, adopting existing order");
                Ok(SubmitOutcome::DuplicateClientId)
            }
            Err(VenueError::Api { code, message, status }) => {
                if INSUFFICIENT_BALANCE_CODES.contains(&code) {
                    return Ok(SubmitOutcome::Rejected {
                        code: "INSUFFICIENT_BALANCE".into(),
                        message: format!("{code}:{message}"),
                    });
                }
                if status >= 500 {
                    return Err(VenueError::Api { code, message, status });
                }
                Ok(SubmitOutcome::Rejected {
                    code: "EXCHANGE_REJECTED".into(),
                    message: format!("{code}:{message}"),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn query_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<VenueOrder, VenueError> {
        let params = vec![
            ("symbol".to_string(), normalize_execution_symbol(symbol)),
            ("origClientOrderId".to_string(), client_order_id.to_string()),
        ];
        let payload = self.request("GET", "/fapi/v1/order", params, true).await?;
        Ok(order_from_payload(&payload))
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> Result<CancelOutcome, VenueError> {
        let params = vec![
            ("symbol".to_string(), normalize_execution_symbol(symbol)),
            ("origClientOrderId".to_string(), client_order_id.to_string()),
        ];
        match self.request("DELETE", "/fapi/v1/order", params, true).await {
            Ok(_) => Ok(CancelOutcome::Canceled),
            // -2011: unknown order (already gone or never arrived)
            Err(VenueError::Api { code: -2011, .. }) => Ok(CancelOutcome::NotFound),
            Err(e) => Err(e),
        }
    }

    async fn fetch_positions(&self, symbols: &[String]) -> Result<PositionsSnapshot, VenueError> {
        let payload = self
            .request("GET", "/fapi/v2/positionRisk", Vec::new(), true)
            .await?;
        let entries = payload
            .as_array()
            .ok_or_else(|| VenueError::InvalidResponse("positionRisk is not an array".into()))?;

        let wanted: Vec<String> = symbols.iter().map(|s| normalize_execution_symbol(s)).collect();
        let mut positions: HashMap<String, Decimal> = HashMap::new();
        let mut latest_update_ms = 0i64;
        for entry in entries {
            let Some(symbol) = entry.get("symbol").and_then(|v| v.as_str()) else {
                continue;
            };
            let symbol = normalize_execution_symbol(symbol);
            if !wanted.is_empty() && !wanted.contains(&symbol) {
                continue;
            }
            let amount = entry
                .get("positionAmt")
                .and_then(|v| v.as_str())
                .and_then(|s| Decimal::from_str(s).ok())
                .unwrap_or(Decimal::ZERO);
            let update_ms = entry.get("updateTime").and_then(|v| v.as_i64()).unwrap_or(0);
            latest_update_ms = latest_update_ms.max(update_ms);
            if amount.is_zero() {
                continue;
            }
            *positions.entry(symbol).or_insert(Decimal::ZERO) += amount;
        }
        Ok(PositionsSnapshot {
            positions,
            timestamp_ms: if latest_update_ms > 0 {
                latest_update_ms
            } else {
                Self::wall_clock_ms()
            },
        })
    }

    async fn fetch_mark_price(&self, symbol: &str) -> Result<PriceSnapshot, VenueError> {
        let params = vec![("symbol".to_string(), normalize_execution_symbol(symbol))];
        let payload = self
            .request("GET", "/fapi/v1/premiumIndex", params, false)
            .await?;
        let price = payload
            .get("markPrice")
            .and_then(|v| v.as_str())
            .and_then(|s| Decimal::from_str(s).ok())
            .ok_or_else(|| VenueError::InvalidResponse("premiumIndex missing markPrice".into()))?;
        let timestamp_ms = payload
            .get("time")
            .and_then(|v| v.as_i64())
            .unwrap_or_else(Self::wall_clock_ms);
        Ok(PriceSnapshot {
            price,
            timestamp_ms,
            source: PriceSource::Venue,
        })
    }

    async fn fetch_filters(&self, symbol: &str) -> Result<SymbolFilters, VenueError> {
        let filters = self.ensure_filters().await?;
        let key = normalize_execution_symbol(symbol);
        filters
            .get(&key)
            .copied()
            .ok_or_else(|| VenueError::InvalidResponse(format!("no filters for symbol {key}")))
    }

    async fn server_time(&self) -> Result<i64, VenueError> {
        let payload = self.request("GET", "/fapi/v1/time", Vec::new(), false).await?;
        payload
            .get("serverTime")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| VenueError::InvalidResponse("time endpoint missing serverTime".into()))
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

fn encode_params(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn sign(query: &str, secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(query.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn build_order_params(intent: &OrderIntent, client_order_id: &str) -> Vec<(String, String)> {
    let mut params = vec![
        ("symbol".to_string(), normalize_execution_symbol(&intent.symbol)),
        ("side".to_string(), intent.side.to_string()),
        ("type".to_string(), intent.order_type.to_string()),
        ("quantity".to_string(), intent.qty.to_string()),
        (
            "newClientOrderId".to_string(),
            sanitize_client_order_id(client_order_id),
        ),
        (
            "reduceOnly".to_string(),
            if intent.reduce_only { "true" } else { "false" }.to_string(),
        ),
    ];
    if let Some(price) = intent.price {
        params.push(("price".to_string(), price.to_string()));
    }
    if intent.order_type == OrderType::Limit {
        params.push(("timeInForce".to_string(), intent.time_in_force.to_string()));
    }
    params
}

fn map_exchange_status(raw: &str) -> OrderStatus {
    match raw.to_uppercase().as_str() {
        "NEW" => OrderStatus::Submitted,
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" => OrderStatus::Canceled,
        "EXPIRED" => OrderStatus::Expired,
        "REJECTED" => OrderStatus::Rejected,
        _ => OrderStatus::Unknown,
    }
}

fn order_from_payload(payload: &serde_json::Value) -> VenueOrder {
    let status = payload
        .get("status")
        .and_then(|v| v.as_str())
        .map(map_exchange_status)
        .unwrap_or(OrderStatus::Unknown);
    let exchange_order_id = payload.get("orderId").map(|v| v.to_string());
    let filled_qty = payload
        .get("executedQty")
        .and_then(|v| v.as_str())
        .and_then(|s| Decimal::from_str(s).ok())
        .unwrap_or(Decimal::ZERO);
    let avg_price = payload
        .get("avgPrice")
        .and_then(|v| v.as_str())
        .and_then(|s| Decimal::from_str(s).ok())
        .filter(|p| !p.is_zero());
    VenueOrder {
        status,
        exchange_order_id,
        filled_qty,
        avg_price,
    }
}

fn is_duplicate_message(message: &str) -> bool {
    let msg = message.to_lowercase();
    msg.contains("duplicate") || (msg.contains("client order id") && msg.contains("exists"))
}

fn parse_exchange_info(payload: &serde_json::Value) -> HashMap<String, SymbolFilters> {
    let mut parsed = HashMap::new();
    let Some(symbols) = payload.get("symbols").and_then(|v| v.as_array()) else {
        return parsed;
    };
    for entry in symbols {
        let Some(symbol) = entry.get("symbol").and_then(|v| v.as_str()) else {
            continue;
        };
        let mut filters = SymbolFilters {
            min_qty: Decimal::ZERO,
            step_size: Decimal::ZERO,
            min_notional: Decimal::ZERO,
            tick_size: Decimal::ZERO,
        };
        for filter in entry
            .get("filters")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
        {
            let get_dec = |key: &str| {
                filter
                    .get(key)
                    .and_then(|v| v.as_str())
                    .and_then(|s| Decimal::from_str(s).ok())
                    .unwrap_or(Decimal::ZERO)
            };
            match filter.get("filterType").and_then(|v| v.as_str()) {
                Some("LOT_SIZE") => {
                    filters.min_qty = get_dec("minQty");
                    filters.step_size = get_dec("stepSize");
                }
                Some("MIN_NOTIONAL") => {
                    filters.min_notional = if filter.get("notional").is_some() {
                        get_dec("notional")
                    } else {
                        get_dec("minNotional")
                    };
                }
                Some("PRICE_FILTER") => {
                    filters.tick_size = get_dec("tickSize");
                }
                _ => {}
            }
        }
        parsed.insert(normalize_execution_symbol(symbol), filters);
    }
    parsed
}
