use std::str::FromStr;

use alloy::primitives::{Address, Bytes, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::{BridgeOutError, Result};
use crate::types::{DestinationChain, EntryStatus, UnlockEvent};

// Sequence numbers and amounts are NUMERIC(78,0) in the database. They are
// bound as text and cast with `$n::NUMERIC`, and read back with `::TEXT`.

/// A bridge-out entry as stored by the collector
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BridgeOutEntryRow {
    pub sequence_number: String,
    pub recipient: Vec<u8>,
    pub token: String,
    pub amount: String,
    pub chain: i16,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BridgeOutEntryRow {
    pub fn status(&self) -> Result<EntryStatus> {
        self.status.parse().map_err(BridgeOutError::Storage)
    }

    pub fn to_event(&self) -> Result<UnlockEvent> {
        let corrupt =
            |field: &str| BridgeOutError::Storage(format!("corrupt {} in stored entry", field));

        let chain = u8::try_from(self.chain)
            .ok()
            .and_then(|c| DestinationChain::try_from(c).ok())
            .ok_or_else(|| corrupt("chain"))?;

        Ok(UnlockEvent {
            sequence_number: U256::from_str(&self.sequence_number)
                .map_err(|_| corrupt("sequence_number"))?,
            recipient: Bytes::from(self.recipient.clone()),
            token: Address::from_str(&self.token).map_err(|_| corrupt("token"))?,
            amount: U256::from_str(&self.amount).map_err(|_| corrupt("amount"))?,
            chain,
            source_block: 0,
        })
    }
}

/// A validator signature as stored by the collector
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SignatureRow {
    pub id: i64,
    pub sequence_number: String,
    pub validator: String,
    pub signature: Vec<u8>,
    pub created_at: DateTime<Utc>,
}
