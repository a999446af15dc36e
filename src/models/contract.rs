use rand::RngCore;
use thiserror::Error;

/// Wire contract version stamped on every event, intent, and result.
/// Consumers reject a different major, or a producer minor above their own.
pub const CONTRACT_VERSION: &str = "1.0";

const CLIENT_ORDER_ID_MAX_LEN: usize = 36;

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("invalid contract version: {0}")]
    InvalidVersion(String),

    #[error("contract version mismatch: producer={producer} consumer={consumer}")]
    Incompatible { producer: String, consumer: String },

    #[error("invalid correlation_id: {0}")]
    InvalidCorrelationId(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContractVersion {
    pub major: u32,
    pub minor: u32,
}

impl ContractVersion {
    pub fn parse(raw: &str) -> Result<Self, ContractError> {
        let mut parts = raw.split('.');
        let (major, minor) = match (parts.next(), parts.next(), parts.next()) {
            (Some(major), Some(minor), None) => (major, minor),
            _ => return Err(ContractError::InvalidVersion(raw.to_string())),
        };
        let major = major
            .parse()
            .map_err(|_| ContractError::InvalidVersion(raw.to_string()))?;
        let minor = minor
            .parse()
            .map_err(|_| ContractError::InvalidVersion(raw.to_string()))?;
        Ok(Self { major, minor })
    }

    pub fn is_compatible_with(&self, consumer: &ContractVersion) -> bool {
        self.major == consumer.major && self.minor <= consumer.minor
    }
}

pub fn current_contract_version() -> ContractVersion {
    ContractVersion::parse(CONTRACT_VERSION).expect("built-in contract version is well-formed")
}

/// Reject input whose contract major differs from ours, or whose minor
/// exceeds ours.
pub fn assert_contract_version(producer: &str) -> Result<(), ContractError> {
    let parsed = ContractVersion::parse(producer)?;
    if !parsed.is_compatible_with(&current_contract_version()) {
        return Err(ContractError::Incompatible {
            producer: producer.to_string(),
            consumer: CONTRACT_VERSION.to_string(),
        });
    }
    Ok(())
}

/// `hl-{tx_hash}-{event_index}-{symbol_normalized}[-{role}]`.
/// The role suffix is only used for FLIP splits (`close` / `open`).
pub fn correlation_id(tx_hash: &str, event_index: i64, symbol: &str, role: Option<&str>) -> String {
    let base = format!("hl-{tx_hash}-{event_index}-{}", normalize_symbol(symbol));
    match role {
        Some(role) => format!("{base}-{role}"),
        None => base,
    }
}

/// Normalized symbol form used inside correlation ids.
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.replace('-', "_")
}

/// Symbol form the execution venue expects (no separators).
pub fn normalize_execution_symbol(symbol: &str) -> String {
    symbol.replace(['-', '_'], "")
}

/// Extract `(tx_hash, event_index)` back out of a correlation id.
pub fn parse_correlation_id(correlation_id: &str) -> Result<(String, i64), ContractError> {
    let parts: Vec<&str> = correlation_id.split('-').collect();
    if parts.len() < 4 || parts[0] != "hl" {
        return Err(ContractError::InvalidCorrelationId(
            correlation_id.to_string(),
        ));
    }
    let event_index = parts[2]
        .parse()
        .map_err(|_| ContractError::InvalidCorrelationId(correlation_id.to_string()))?;
    Ok((parts[1].to_string(), event_index))
}

/// Trim a correlation id down to the venue's client-order-id charset and
/// length. Truncation keeps the tail (the most distinguishing part) behind
/// an `hl-` prefix.
pub fn sanitize_client_order_id(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if cleaned.len() <= CLIENT_ORDER_ID_MAX_LEN {
        return cleaned;
    }
    let tail = &cleaned[cleaned.len() - (CLIENT_ORDER_ID_MAX_LEN - 3)..];
    format!("hl-{tail}")
}

/// Fresh nonce for market-fallback client ids.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
