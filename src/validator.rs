//! Attestation validation
//!
//! Decides whether this validator still needs to act on a withdrawal: the
//! bridge may already have confirmed it, or this validator's bit may already
//! be set in the attestation bitmap. Also provides the settlement checks the
//! finality loop uses to decide whether a submitted withdrawal is still
//! pending on-chain.

use std::sync::Arc;

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use tracing::debug;

use crate::bridge::BridgeContract;
use crate::codec::attestation_key;
use crate::error::Result;
use crate::types::{DestinationChain, FinalityCheckEntry, UnlockEvent, ValidatorId};

/// Whether an event belongs to the withdrawal type this process handles.
/// Only events for a different destination chain are ineligible.
pub fn is_eligible(event: &UnlockEvent, target: DestinationChain) -> bool {
    event.chain == target
}

/// Whether bit `validator_id` is set in an attestation bitmap
pub fn bit_is_set(bitmap: U256, validator_id: ValidatorId) -> bool {
    bitmap.bit(usize::from(validator_id))
}

pub struct AttestationValidator {
    bridge: Arc<dyn BridgeContract>,
    address: Address,
}

impl AttestationValidator {
    pub fn new(bridge: Arc<dyn BridgeContract>, address: Address) -> Self {
        Self { bridge, address }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// This validator's ID as assigned by the bridge (0 if not registered)
    pub async fn validator_id(&self) -> Result<ValidatorId> {
        self.bridge.validator_id(self.address).await
    }

    /// `true` if the withdrawal is already confirmed on-chain or this
    /// validator has already attested it. Contract read errors propagate.
    pub async fn is_confirmed(&self, event: &UnlockEvent) -> Result<bool> {
        if self.bridge.confirmed_unlocks(event.sequence_number).await? {
            debug!(
                sequence_number = %event.sequence_number,
                "Unlock already confirmed on-chain"
            );
            return Ok(true);
        }

        let key = attestation_key(event);
        let bitmap = self.bridge.attestations(key).await?;
        let id = self.validator_id().await?;
        let attested = bit_is_set(bitmap, id);

        debug!(
            sequence_number = %event.sequence_number,
            attestation_key = %key,
            validator_id = id,
            attested,
            "Checked attestation bitmap"
        );

        Ok(attested)
    }

    /// `true` while the bridge still lists the withdrawal's BTC payout as
    /// outstanding
    pub async fn is_withdrawal_pending(&self, event: &UnlockEvent) -> Result<bool> {
        self.bridge
            .pending_btc_withdrawals(attestation_key(event))
            .await
    }
}

/// On-chain "is this submission still outstanding" check used after finality
#[async_trait]
pub trait SettlementCheck: Send + Sync {
    async fn is_pending(&self, entry: &FinalityCheckEntry) -> Result<bool>;
}

/// An attestation is pending until it is confirmed or carries our bit
#[async_trait]
impl SettlementCheck for AttestationValidator {
    async fn is_pending(&self, entry: &FinalityCheckEntry) -> Result<bool> {
        Ok(!self.is_confirmed(&entry.event).await?)
    }
}

/// A withdrawal is pending until its attestation is confirmed and the bridge
/// no longer lists its BTC payout in `pendingBTCWithdrawals`
pub struct BtcWithdrawalSettlement {
    validator: Arc<AttestationValidator>,
}

impl BtcWithdrawalSettlement {
    pub fn new(validator: Arc<AttestationValidator>) -> Self {
        Self { validator }
    }
}

#[async_trait]
impl SettlementCheck for BtcWithdrawalSettlement {
    async fn is_pending(&self, entry: &FinalityCheckEntry) -> Result<bool> {
        if !self.validator.is_confirmed(&entry.event).await? {
            return Ok(true);
        }
        self.validator.is_withdrawal_pending(&entry.event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{unlock_event, MockBridge};
    use crate::types::FinalityCheckEntry;

    const VALIDATOR: Address = Address::repeat_byte(0x11);

    #[test]
    fn test_only_other_chains_are_ineligible() {
        let btc = unlock_event(1);
        assert!(is_eligible(&btc, DestinationChain::Bitcoin));

        let mut eth = unlock_event(2);
        eth.chain = DestinationChain::Ethereum;
        assert!(!is_eligible(&eth, DestinationChain::Bitcoin));
        assert!(is_eligible(&eth, DestinationChain::Ethereum));
    }

    #[test]
    fn test_bit_is_set() {
        let bitmap = U256::from(0b1010u64);
        assert!(!bit_is_set(bitmap, 0));
        assert!(bit_is_set(bitmap, 1));
        assert!(!bit_is_set(bitmap, 2));
        assert!(bit_is_set(bitmap, 3));
        assert!(!bit_is_set(bitmap, 255));
    }

    #[tokio::test]
    async fn test_confirmed_short_circuits() {
        let bridge = Arc::new(MockBridge::new());
        bridge.set_confirmed(U256::from(1u64), true);
        let validator = AttestationValidator::new(bridge.clone(), VALIDATOR);

        assert!(validator.is_confirmed(&unlock_event(1)).await.unwrap());
        assert_eq!(bridge.attestation_reads(), 0);
    }

    #[tokio::test]
    async fn test_own_bit_set_counts_as_confirmed() {
        let bridge = Arc::new(MockBridge::new());
        bridge.set_validator_id(VALIDATOR, 2);
        let event = unlock_event(1);
        bridge.set_bitmap(attestation_key(&event), U256::from(0b100u64));

        let validator = AttestationValidator::new(bridge.clone(), VALIDATOR);
        assert!(validator.is_confirmed(&event).await.unwrap());
    }

    #[tokio::test]
    async fn test_other_bits_do_not_count() {
        let bridge = Arc::new(MockBridge::new());
        bridge.set_validator_id(VALIDATOR, 1);
        let event = unlock_event(1);
        bridge.set_bitmap(attestation_key(&event), U256::from(0b100u64));

        let validator = AttestationValidator::new(bridge.clone(), VALIDATOR);
        assert!(!validator.is_confirmed(&event).await.unwrap());
        assert_eq!(bridge.attestation_reads(), 1);
    }

    #[tokio::test]
    async fn test_read_errors_propagate() {
        let bridge = Arc::new(MockBridge::new());
        bridge.fail_reads(true);
        let validator = AttestationValidator::new(bridge, VALIDATOR);

        let err = validator.is_confirmed(&unlock_event(1)).await.unwrap_err();
        assert_eq!(err.kind(), "rpc");
    }

    #[tokio::test]
    async fn test_attestation_settlement_is_inverse_of_confirmed() {
        let bridge = Arc::new(MockBridge::new());
        let event = unlock_event(4);
        let entry = FinalityCheckEntry::new(attestation_key(&event), event.clone());
        let validator = AttestationValidator::new(bridge.clone(), VALIDATOR);

        assert!(validator.is_pending(&entry).await.unwrap());
        bridge.set_confirmed(event.sequence_number, true);
        assert!(!validator.is_pending(&entry).await.unwrap());
    }

    #[tokio::test]
    async fn test_btc_settlement_reads_pending_withdrawals() {
        let bridge = Arc::new(MockBridge::new());
        let event = unlock_event(5);
        let key = attestation_key(&event);
        let entry = FinalityCheckEntry::new(key, event.clone());
        let validator = Arc::new(AttestationValidator::new(bridge.clone(), VALIDATOR));
        let settlement = BtcWithdrawalSettlement::new(validator);

        // unattested withdrawals stay pending regardless of the payout flag
        assert!(settlement.is_pending(&entry).await.unwrap());

        bridge.set_confirmed(event.sequence_number, true);
        bridge.set_pending_withdrawal(key, true);
        assert!(settlement.is_pending(&entry).await.unwrap());

        bridge.set_pending_withdrawal(key, false);
        assert!(!settlement.is_pending(&entry).await.unwrap());
    }
}
