//! Signature relay to the collector
//!
//! Wire types for `POST /submit-signature` are shared with the collector's
//! HTTP handler in [`crate::server`].

use std::str::FromStr;
use std::time::Duration;

use alloy::primitives::{Address, Bytes, U256};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BridgeOutError, Result};
use crate::types::{DestinationChain, UnlockEvent};

/// Bridge-out entry as carried over HTTP. Fields are strings so that
/// malformed values reach field-level validation instead of failing
/// deserialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPayload {
    #[serde(default)]
    pub sequence_number: String,
    #[serde(default)]
    pub recipient: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub amount: String,
    #[serde(default)]
    pub chain: u64,
}

impl EntryPayload {
    pub fn from_event(event: &UnlockEvent) -> Self {
        Self {
            sequence_number: event.sequence_number.to_string(),
            recipient: format!("0x{}", hex::encode(&event.recipient)),
            token: event.token.to_string(),
            amount: event.amount.to_string(),
            chain: u64::from(event.chain.as_u8()),
        }
    }

    /// Validate every field and build the domain event. The error names the
    /// first offending field.
    pub fn to_event(&self) -> std::result::Result<UnlockEvent, String> {
        let sequence_number = U256::from_str(&self.sequence_number)
            .map_err(|_| "invalid sequence_number".to_string())?;
        if sequence_number.is_zero() {
            return Err("sequence_number must be positive".to_string());
        }

        let recipient = parse_hex(&self.recipient).ok_or("invalid recipient")?;
        if recipient.is_empty() {
            return Err("recipient must not be empty".to_string());
        }

        let token = Address::from_str(&self.token).map_err(|_| "invalid token".to_string())?;

        let amount =
            U256::from_str(&self.amount).map_err(|_| "invalid amount".to_string())?;
        if amount.is_zero() {
            return Err("amount must be positive".to_string());
        }

        let chain = u8::try_from(self.chain)
            .ok()
            .and_then(|c| DestinationChain::try_from(c).ok())
            .ok_or("chain out of range")?;

        Ok(UnlockEvent {
            sequence_number,
            recipient: Bytes::from(recipient),
            token,
            amount,
            chain,
            source_block: 0,
        })
    }
}

/// Decode a `0x`-prefixed hex string; `None` without the prefix or on bad hex
pub fn parse_hex(value: &str) -> Option<Vec<u8>> {
    value
        .strip_prefix("0x")
        .and_then(|digits| hex::decode(digits).ok())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitSignatureRequest {
    #[serde(default)]
    pub entry: Option<EntryPayload>,
    #[serde(default)]
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitSignatureResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Delivers this validator's signature for an unlock to the collector
#[async_trait]
pub trait SignatureRelay: Send + Sync {
    async fn relay(&self, event: &UnlockEvent, signature: &[u8]) -> Result<()>;
}

/// reqwest-backed [`SignatureRelay`]
pub struct HttpSignatureRelay {
    client: Client,
    endpoint: String,
}

impl HttpSignatureRelay {
    pub fn new(collector_url: &str) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/submit-signature", collector_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl SignatureRelay for HttpSignatureRelay {
    async fn relay(&self, event: &UnlockEvent, signature: &[u8]) -> Result<()> {
        let request = SubmitSignatureRequest {
            entry: Some(EntryPayload::from_event(event)),
            signature: format!("0x{}", hex::encode(signature)),
        };

        let response = self.client.post(&self.endpoint).json(&request).send().await?;
        let status = response.status();
        if status == StatusCode::ACCEPTED {
            debug!(
                sequence_number = %event.sequence_number,
                endpoint = %self.endpoint,
                "Signature accepted by collector"
            );
            return Ok(());
        }

        let reason = response
            .json::<SubmitSignatureResponse>()
            .await
            .ok()
            .and_then(|body| body.error)
            .unwrap_or_else(|| status.to_string());

        // The collector rejected the request itself; resending cannot help
        if status.is_client_error() {
            return Err(BridgeOutError::InvalidRequest(reason));
        }
        Err(BridgeOutError::Http(format!("collector returned {}: {}", status, reason)))
    }
}
