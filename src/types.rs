//! Domain types shared by the queue, executors and finality tracking

use alloy::primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Validator identity assigned by the bridge contract (1..N, 0 = not a validator)
pub type ValidatorId = u8;

/// Length of an (r, s, v) ECDSA signature
pub const SIGNATURE_LENGTH: usize = 65;

/// Destination chain tag carried by an unlock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DestinationChain {
    Ethereum = 0,
    Bitcoin = 1,
}

impl DestinationChain {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationChain::Ethereum => "ethereum",
            DestinationChain::Bitcoin => "bitcoin",
        }
    }
}

impl TryFrom<u8> for DestinationChain {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DestinationChain::Ethereum),
            1 => Ok(DestinationChain::Bitcoin),
            other => Err(other),
        }
    }
}

impl fmt::Display for DestinationChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A withdrawal observed on the source chain. Immutable once observed and
/// uniquely identified by `sequence_number`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockEvent {
    pub sequence_number: U256,
    pub recipient: Bytes,
    pub token: Address,
    pub amount: U256,
    pub chain: DestinationChain,
    /// Source-chain block the event was observed in
    pub source_block: u64,
}

/// A submitted withdrawal awaiting finality.
///
/// `scheduled_at_height` stays `None` until the finality loop first observes
/// the entry and is never reset afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalityCheckEntry {
    pub attestation_key: B256,
    pub event: UnlockEvent,
    pub scheduled_at_height: Option<u64>,
}

impl FinalityCheckEntry {
    pub fn new(attestation_key: B256, event: UnlockEvent) -> Self {
        Self {
            attestation_key,
            event,
            scheduled_at_height: None,
        }
    }
}

/// Collector-side processing status of a stored bridge-out entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Processed,
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Processed => "processed",
            EntryStatus::Failed => "failed",
        }
    }
}

impl FromStr for EntryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EntryStatus::Pending),
            "processed" => Ok(EntryStatus::Processed),
            "failed" => Ok(EntryStatus::Failed),
            other => Err(format!("unknown entry status: {}", other)),
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
