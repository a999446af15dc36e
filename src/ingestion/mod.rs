pub mod aggregator;
pub mod coordinator;
pub mod hyperliquid;

use async_trait::async_trait;

use crate::models::LeaderFill;

/// Pull-based fill source for backfill and polling fallback. Returns fills
/// in the half-open window `[since_ms, until_ms)`.
#[async_trait]
pub trait LeaderSource: Send + Sync {
    async fn fetch_fills(&self, since_ms: i64, until_ms: i64) -> anyhow::Result<Vec<LeaderFill>>;
}
