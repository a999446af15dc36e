use serde::{Deserialize, Serialize};

/// A single atomic match reported by the leader venue, as delivered by both
/// the fill stream and the REST backfill endpoint. Numeric fields arrive as
/// strings on the wire; the aggregator parses them and skips poison values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderFill {
    /// Transaction hash shared by every fill of one leader order.
    #[serde(rename = "hash")]
    pub tx_hash: Option<String>,
    /// Per-transaction fill index.
    pub tid: Option<i64>,
    pub coin: String,
    /// "B" (buy) or "A" (ask/sell).
    pub side: Option<String>,
    #[serde(rename = "sz")]
    pub size: Option<String>,
    /// Leader's net position before this fill.
    #[serde(rename = "startPosition")]
    pub start_position: Option<String>,
    #[serde(rename = "time")]
    pub time_ms: i64,
    pub px: Option<String>,
}

impl LeaderFill {
    /// Dedup key fallback for fills the venue reports without a tx hash.
    pub fn tx_hash_or_tid(&self) -> String {
        match &self.tx_hash {
            Some(hash) if !hash.is_empty() => hash.clone(),
            _ => format!("tid-{}", self.tid.unwrap_or(0)),
        }
    }
}
