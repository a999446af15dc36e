use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{interval, sleep};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::models::LeaderFill;

use super::LeaderSource;

const PING_INTERVAL: Duration = Duration::from_secs(25);
const BASE_RECONNECT_DELAY: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Retry / rate-limit policies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 2_000,
            jitter_ms: 100,
        }
    }
}

impl RetryPolicy {
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt - 1))
            .min(self.max_delay_ms);
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(delay + jitter)
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    pub max_requests: u32,
    pub per_seconds: u64,
    pub cooldown_seconds: u64,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_requests: 0,
            per_seconds: 1,
            cooldown_seconds: 0,
        }
    }
}

/// Sliding-window request limiter. Zero `max_requests` disables it.
#[derive(Debug)]
pub struct RateLimiter {
    policy: RateLimitPolicy,
    requests: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy,
            requests: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn allow(&self) -> bool {
        if self.policy.max_requests == 0 || self.policy.per_seconds == 0 {
            return true;
        }
        let mut requests = self.requests.lock().await;
        let window = Duration::from_secs(self.policy.per_seconds);
        let now = Instant::now();
        while requests
            .front()
            .map(|t| now.duration_since(*t) > window)
            .unwrap_or(false)
        {
            requests.pop_front();
        }
        if requests.len() >= self.policy.max_requests as usize {
            return false;
        }
        requests.push_back(now);
        true
    }
}

// ---------------------------------------------------------------------------
// REST client (backfill + polling fallback)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HyperliquidConfig {
    pub rest_url: String,
    pub ws_url: String,
    pub target_wallet: String,
    pub request_timeout_ms: u64,
    pub retry: RetryPolicy,
    pub rate_limit: RateLimitPolicy,
}

pub struct HyperliquidClient {
    http: reqwest::Client,
    config: HyperliquidConfig,
    limiter: RateLimiter,
}

impl HyperliquidClient {
    pub fn new(config: HyperliquidConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1_000)))
            .build()?;
        let limiter = RateLimiter::new(config.rate_limit.clone());
        Ok(Self {
            http,
            config,
            limiter,
        })
    }

    async fn post_fills(&self, since_ms: i64, until_ms: i64) -> anyhow::Result<Vec<LeaderFill>> {
        let payload = json!({
            "type": "userFillsByTime",
            "user": self.config.target_wallet,
            "startTime": since_ms,
            "endTime": until_ms,
            "aggregateByTime": false,
        });

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let response = self
                .http
                .post(&self.config.rest_url)
                .json(&payload)
                .send()
                .await;
            match response {
                Ok(resp) if resp.status().is_success() => {
                    return Ok(resp.json::<Vec<LeaderFill>>().await?);
                }
                Ok(resp) => {
                    let status = resp.status();
                    if attempt >= self.config.retry.max_attempts.max(1) {
                        anyhow::bail!("leader fills request failed with status {status}");
                    }
                    tracing::warn!(%status, attempt, "Leader fills request failed, retrying");
                }
                Err(e) => {
                    if attempt >= self.config.retry.max_attempts.max(1) {
                        return Err(e.into());
                    }
                    tracing::warn!(error = %e, attempt, "Leader fills request error, retrying");
                }
            }
            sleep(self.config.retry.next_delay(attempt)).await;
        }
    }
}

#[async_trait]
impl LeaderSource for HyperliquidClient {
    /// Fetch every fill in `[since_ms, until_ms)`, paginating backwards:
    /// the endpoint returns the most recent page, so the window shrinks from
    /// the top until the oldest returned fill falls at or before `since_ms`.
    async fn fetch_fills(&self, since_ms: i64, until_ms: i64) -> anyhow::Result<Vec<LeaderFill>> {
        if self.config.target_wallet.is_empty() {
            anyhow::bail!("leader wallet not configured");
        }
        if !self.limiter.allow().await {
            anyhow::bail!("leader source rate limit exceeded");
        }

        let mut fills: Vec<LeaderFill> = Vec::new();
        let mut end_time = until_ms;
        while end_time >= since_ms {
            let batch = self.post_fills(since_ms, end_time).await?;
            if batch.is_empty() {
                break;
            }
            let oldest = batch.iter().map(|f| f.time_ms).min().unwrap_or(since_ms);
            fills.extend(batch);
            if oldest <= since_ms {
                break;
            }
            end_time = oldest - 1;
        }
        Ok(fills)
    }
}

// ---------------------------------------------------------------------------
// Fill stream (WS subscription with auto-reconnect)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WsEnvelope {
    channel: Option<String>,
    data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WsUserFills {
    #[serde(rename = "isSnapshot")]
    is_snapshot: Option<bool>,
    #[serde(default)]
    fills: Vec<LeaderFill>,
}

fn subscribe_message(wallet: &str) -> String {
    json!({
        "method": "subscribe",
        "subscription": {
            "type": "userFills",
            "user": wallet,
            "aggregateByTime": false,
        }
    })
    .to_string()
}

/// Run the leader fill stream until shutdown. Reconnects with exponential
/// backoff; parsed fills are handed to the coordinator over `tx`. Snapshot
/// frames duplicate what backfill already covers and are skipped.
pub async fn run_fill_stream(
    ws_url: String,
    wallet: String,
    max_reconnect_delay: Duration,
    tx: mpsc::Sender<LeaderFill>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }
        tracing::info!(url = %ws_url, "Connecting to leader fill stream...");

        match connect_async(&ws_url).await {
            Ok((ws_stream, _response)) => {
                tracing::info!("Leader fill stream connected");
                attempt = 0;

                let (mut write, mut read) = ws_stream.split();
                if let Err(e) = write
                    .send(Message::Text(subscribe_message(&wallet).into()))
                    .await
                {
                    tracing::error!(error = %e, "Failed to send fill subscription");
                }

                let mut ping_timer = interval(PING_INTERVAL);
                ping_timer.tick().await; // consume the immediate first tick

                loop {
                    tokio::select! {
                        msg = read.next() => {
                            match msg {
                                Some(Ok(Message::Text(text))) => {
                                    handle_stream_message(text.as_ref(), &tx).await;
                                }
                                Some(Ok(Message::Ping(data))) => {
                                    if let Err(e) = write.send(Message::Pong(data)).await {
                                        tracing::warn!(error = %e, "Failed to send pong");
                                        break;
                                    }
                                }
                                Some(Ok(Message::Close(_))) => {
                                    tracing::warn!("Leader stream sent close frame");
                                    break;
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    tracing::error!(error = %e, "Leader stream read error");
                                    break;
                                }
                                None => {
                                    tracing::warn!("Leader stream ended");
                                    break;
                                }
                            }
                        }
                        _ = ping_timer.tick() => {
                            if let Err(e) = write.send(Message::Ping(vec![].into())).await {
                                tracing::warn!(error = %e, "Failed to send ping");
                                break;
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                tracing::info!("Leader stream shutting down");
                                return;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Leader stream connection failed");
            }
        }

        let delay = (BASE_RECONNECT_DELAY * 2u32.saturating_pow(attempt)).min(max_reconnect_delay);
        attempt = attempt.saturating_add(1);
        tracing::info!(delay_secs = delay.as_secs(), attempt, "Reconnecting leader stream...");
        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

async fn handle_stream_message(text: &str, tx: &mpsc::Sender<LeaderFill>) {
    let Ok(envelope) = serde_json::from_str::<WsEnvelope>(text) else {
        tracing::trace!(raw = %text, "Non-JSON stream frame");
        return;
    };
    if envelope.channel.as_deref() != Some("userFills") {
        return;
    }
    let Some(data) = envelope.data else {
        return;
    };
    let Ok(fills) = serde_json::from_value::<WsUserFills>(data) else {
        tracing::warn!("Unparseable userFills frame");
        metrics::counter!("ingest_poison_frames_total").increment(1);
        return;
    };
    if fills.is_snapshot.unwrap_or(false) {
        return;
    }
    for fill in fills.fills {
        metrics::counter!("fills_streamed_total").increment(1);
        if let Err(e) = tx.send(fill).await {
            tracing::error!(error = %e, "Failed to enqueue streamed fill");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 500,
            jitter_ms: 0,
        };
        assert_eq!(policy.next_delay(1), Duration::from_millis(100));
        assert_eq!(policy.next_delay(2), Duration::from_millis(200));
        assert_eq!(policy.next_delay(3), Duration::from_millis(400));
        assert_eq!(policy.next_delay(4), Duration::from_millis(500));
        assert_eq!(policy.next_delay(10), Duration::from_millis(500));
    }

    #[test]
    fn test_retry_delay_jitter_bounded() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter_ms: 50,
        };
        for _ in 0..20 {
            let d = policy.next_delay(1);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn test_rate_limiter_disabled_when_zero() {
        let limiter = RateLimiter::new(RateLimitPolicy::default());
        for _ in 0..100 {
            assert!(limiter.allow().await);
        }
    }

    #[tokio::test]
    async fn test_rate_limiter_blocks_over_budget() {
        let limiter = RateLimiter::new(RateLimitPolicy {
            max_requests: 2,
            per_seconds: 60,
            cooldown_seconds: 1,
        });
        assert!(limiter.allow().await);
        assert!(limiter.allow().await);
        assert!(!limiter.allow().await);
    }

    #[test]
    fn test_stream_fill_frame_parses() {
        let raw = r#"{
            "channel": "userFills",
            "data": {
                "isSnapshot": false,
                "user": "0xwallet",
                "fills": [
                    {"coin": "BTC", "px": "43250.1", "sz": "0.02", "side": "B",
                     "time": 1700000000000, "startPosition": "1.5",
                     "hash": "0xabc", "tid": 12}
                ]
            }
        }"#;
        let envelope: WsEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.channel.as_deref(), Some("userFills"));
        let fills: WsUserFills = serde_json::from_value(envelope.data.unwrap()).unwrap();
        assert_eq!(fills.fills.len(), 1);
        assert_eq!(fills.fills[0].coin, "BTC");
        assert_eq!(fills.fills[0].tid, Some(12));
    }
}
