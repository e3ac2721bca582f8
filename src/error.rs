//! Error taxonomy for the bridge-out validator
//!
//! Components return [`BridgeOutError`] so callers can tell transient I/O,
//! validation failures, fatal configuration problems and cancellation apart.
//! "Not ready yet" outcomes (threshold not met, already confirmed) are never
//! errors; they are returned as booleans or outcome enums.

use thiserror::Error;

pub type Result<T, E = BridgeOutError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum BridgeOutError {
    /// Contract read/write or JSON-RPC failure
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Signature relay transport failure
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Receipt not found for transaction {tx_hash} after {waited_secs}s")]
    ReceiptNotFound { tx_hash: String, waited_secs: u64 },

    #[error("Transaction {tx_hash} reverted")]
    Reverted { tx_hash: String },

    #[error("Signature length mismatch: expected {expected} bytes, got {got}")]
    SignatureLength { expected: usize, got: usize },

    /// A malformed request; terminal for that request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Local signing failed; cannot be caused by network conditions
    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("context canceled")]
    Cancelled,
}

impl BridgeOutError {
    /// Errors that must abort the process rather than be retried
    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeOutError::Signing(_) | BridgeOutError::Config(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, BridgeOutError::Cancelled)
    }

    /// Short label used for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeOutError::Rpc(_) => "rpc",
            BridgeOutError::Http(_) => "http",
            BridgeOutError::ReceiptNotFound { .. } => "receipt_not_found",
            BridgeOutError::Reverted { .. } => "reverted",
            BridgeOutError::SignatureLength { .. } => "signature_length",
            BridgeOutError::InvalidRequest(_) => "invalid_request",
            BridgeOutError::Signing(_) => "signing",
            BridgeOutError::Config(_) => "config",
            BridgeOutError::Storage(_) => "storage",
            BridgeOutError::Cancelled => "cancelled",
        }
    }
}

impl From<sqlx::Error> for BridgeOutError {
    fn from(e: sqlx::Error) -> Self {
        BridgeOutError::Storage(e.to_string())
    }
}

impl From<reqwest::Error> for BridgeOutError {
    fn from(e: reqwest::Error) -> Self {
        BridgeOutError::Http(e.to_string())
    }
}
