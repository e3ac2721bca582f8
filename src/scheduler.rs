//! Leaderless submission scheduling
//!
//! Every validator derives the same pseudo-random ordering of validator IDs
//! from a withdrawal's sequence number, then waits `position × step` before
//! submitting. The first-ranked validator submits immediately; the others act
//! as fallbacks if it does not.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, U256};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing::{debug, warn};

use crate::bridge::BridgeContract;
use crate::types::{UnlockEvent, ValidatorId};

/// Default delay between consecutive ranks
pub const DEFAULT_STEP_DELAY: Duration = Duration::from_secs(60);

/// Shuffle validator IDs `1..=count` with the given random source
pub fn order_with_rng<R: Rng + ?Sized>(count: u64, rng: &mut R) -> Vec<ValidatorId> {
    let count = count.min(u64::from(ValidatorId::MAX)) as ValidatorId;
    let mut ids: Vec<ValidatorId> = (1..=count).collect();
    ids.shuffle(rng);
    ids
}

/// Deterministic ordering for a withdrawal, seeded by its sequence number
pub fn submission_order(count: u64, sequence_number: U256) -> Vec<ValidatorId> {
    let mut rng = ChaCha20Rng::from_seed(sequence_number.to_be_bytes::<32>());
    order_with_rng(count, &mut rng)
}

pub struct SubmissionScheduler {
    bridge: Arc<dyn BridgeContract>,
    address: Address,
    step: Duration,
}

impl SubmissionScheduler {
    pub fn new(bridge: Arc<dyn BridgeContract>, address: Address, step: Duration) -> Self {
        Self {
            bridge,
            address,
            step,
        }
    }

    /// How long this validator waits before submitting. Fails open: any read
    /// failure, an empty validator set or an unranked validator yields zero.
    pub async fn submission_delay(&self, event: &UnlockEvent) -> Duration {
        let count = match self.bridge.bridge_validators_count().await {
            Ok(0) => return Duration::ZERO,
            Ok(count) => count,
            Err(e) => {
                warn!(
                    sequence_number = %event.sequence_number,
                    error = %e,
                    "Failed to read validator count, submitting without delay"
                );
                return Duration::ZERO;
            }
        };

        let id = match self.bridge.validator_id(self.address).await {
            Ok(id) => id,
            Err(e) => {
                warn!(
                    sequence_number = %event.sequence_number,
                    error = %e,
                    "Failed to resolve validator ID, submitting without delay"
                );
                return Duration::ZERO;
            }
        };

        let order = submission_order(count, event.sequence_number);
        let Some(position) = order.iter().position(|v| *v == id) else {
            debug!(
                sequence_number = %event.sequence_number,
                validator_id = id,
                "Validator not in submission order"
            );
            return Duration::ZERO;
        };

        let delay = self.step * position as u32;
        debug!(
            sequence_number = %event.sequence_number,
            validator_id = id,
            position,
            delay_secs = delay.as_secs(),
            "Computed submission delay"
        );
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{unlock_event, MockBridge};
    use rand::rngs::mock::StepRng;
    use std::collections::HashSet;

    const VALIDATOR: Address = Address::repeat_byte(0x22);

    #[test]
    fn test_fixed_source_gives_exact_order() {
        // an all-zero source always picks index 0 for the swap partner
        let mut rng = StepRng::new(0, 0);
        assert_eq!(order_with_rng(4, &mut rng), vec![2, 3, 4, 1]);
    }

    #[test]
    fn test_same_sequence_same_order() {
        let seq = U256::from(42u64);
        assert_eq!(submission_order(10, seq), submission_order(10, seq));
    }

    #[test]
    fn test_different_sequences_differ() {
        let orders: HashSet<Vec<ValidatorId>> = (1u64..=50)
            .map(|seq| submission_order(16, U256::from(seq)))
            .collect();
        assert_eq!(orders.len(), 50);
    }

    #[test]
    fn test_order_is_permutation() {
        let mut order = submission_order(7, U256::from(99u64));
        order.sort_unstable();
        assert_eq!(order, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_empty_set() {
        assert!(submission_order(0, U256::from(1u64)).is_empty());
    }

    #[tokio::test]
    async fn test_zero_validators_means_no_delay() {
        let bridge = Arc::new(MockBridge::new());
        bridge.set_validators_count(0);
        let scheduler = SubmissionScheduler::new(bridge, VALIDATOR, DEFAULT_STEP_DELAY);
        assert_eq!(
            scheduler.submission_delay(&unlock_event(1)).await,
            Duration::ZERO
        );
    }

    #[tokio::test]
    async fn test_read_failure_fails_open() {
        let bridge = Arc::new(MockBridge::new());
        bridge.set_validators_count(5);
        bridge.fail_reads(true);
        let scheduler = SubmissionScheduler::new(bridge, VALIDATOR, DEFAULT_STEP_DELAY);
        assert_eq!(
            scheduler.submission_delay(&unlock_event(1)).await,
            Duration::ZERO
        );
    }

    #[tokio::test]
    async fn test_unknown_validator_has_no_delay() {
        let bridge = Arc::new(MockBridge::new());
        bridge.set_validators_count(5);
        // unregistered validators resolve to ID 0, which is never ranked
        let scheduler = SubmissionScheduler::new(bridge, VALIDATOR, DEFAULT_STEP_DELAY);
        assert_eq!(
            scheduler.submission_delay(&unlock_event(1)).await,
            Duration::ZERO
        );
    }

    #[tokio::test]
    async fn test_delay_follows_rank() {
        let bridge = Arc::new(MockBridge::new());
        bridge.set_validators_count(5);
        let event = unlock_event(1234);
        let order = submission_order(5, event.sequence_number);

        for (position, id) in order.iter().enumerate() {
            bridge.set_validator_id(VALIDATOR, *id);
            let scheduler =
                SubmissionScheduler::new(bridge.clone(), VALIDATOR, Duration::from_secs(60));
            assert_eq!(
                scheduler.submission_delay(&event).await,
                Duration::from_secs(60 * position as u64)
            );
        }
    }

    #[tokio::test]
    async fn test_single_validator_submits_immediately() {
        let bridge = Arc::new(MockBridge::new());
        bridge.set_validators_count(1);
        bridge.set_validator_id(VALIDATOR, 1);
        let scheduler = SubmissionScheduler::new(bridge, VALIDATOR, DEFAULT_STEP_DELAY);
        assert_eq!(
            scheduler.submission_delay(&unlock_event(1)).await,
            Duration::ZERO
        );
    }
}
