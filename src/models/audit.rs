use serde::{Deserialize, Serialize};

/// Append-only audit entry. Every safety transition writes one of these
/// before the stored mode changes, so the log is a strict superset of
/// externally visible state changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub category: String,
    pub entity_id: String,
    pub from_state: Option<String>,
    pub to_state: String,
    pub reason_code: String,
    pub reason_message: String,
    pub timestamp_ms: i64,
    pub metadata: Option<serde_json::Value>,
}

pub mod category {
    pub const SAFETY: &str = "safety";
    pub const ORDER: &str = "order";
    pub const INGEST: &str = "ingest";
    pub const CONFIG: &str = "config";
    pub const DECISION: &str = "decision";
}

impl AuditRecord {
    pub fn new(
        category: &str,
        entity_id: &str,
        from_state: Option<&str>,
        to_state: &str,
        reason_code: &str,
        reason_message: &str,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            category: category.to_string(),
            entity_id: entity_id.to_string(),
            from_state: from_state.map(str::to_string),
            to_state: to_state.to_string(),
            reason_code: reason_code.to_string(),
            reason_message: reason_message.to_string(),
            timestamp_ms,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
