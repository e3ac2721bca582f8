//! Individual on-chain submission
//!
//! Drives one bridge write through `Idle → Priced → Submitted → Confirmed`.
//! Any error leaves the machine in its current stage and is returned to the
//! caller, which retries the whole submission with fresh pricing and nonce.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::B256;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::{BridgeCall, TransactionSender, TxParams};
use crate::error::{BridgeOutError, Result};
use crate::types::UnlockEvent;

pub const DEFAULT_RECEIPT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Suggested gas price plus 20%, floored
pub fn adjust_gas_price(price: u128) -> u128 {
    price + price / 5
}

/// Estimated gas plus 10%, floored
pub fn adjust_gas_limit(limit: u64) -> u64 {
    limit + limit / 10
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionState {
    Idle,
    Priced(TxParams),
    Submitted { tx_hash: B256 },
    Confirmed { tx_hash: B256 },
}

impl SubmissionState {
    pub fn name(&self) -> &'static str {
        match self {
            SubmissionState::Idle => "idle",
            SubmissionState::Priced(_) => "priced",
            SubmissionState::Submitted { .. } => "submitted",
            SubmissionState::Confirmed { .. } => "confirmed",
        }
    }
}

pub struct IndividualAttestationExecutor {
    sender: Arc<dyn TransactionSender>,
    receipt_timeout: Duration,
    poll_interval: Duration,
}

impl IndividualAttestationExecutor {
    pub fn new(
        sender: Arc<dyn TransactionSender>,
        receipt_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            sender,
            receipt_timeout,
            poll_interval,
        }
    }

    /// Submit `attestBridgeOut` for an unlock and wait for a successful receipt
    pub async fn send(&self, cancel: &CancellationToken, event: &UnlockEvent) -> Result<B256> {
        self.send_call(cancel, &BridgeCall::AttestBridgeOut(event.clone()))
            .await
    }

    /// Drive any bridge write to a successful receipt
    pub async fn send_call(&self, cancel: &CancellationToken, call: &BridgeCall) -> Result<B256> {
        let sequence_number = call.event().sequence_number;
        let mut state = SubmissionState::Idle;

        loop {
            let stage = state.name();
            state = match self.advance(cancel, call, state).await {
                Ok(SubmissionState::Confirmed { tx_hash }) => {
                    info!(
                        method = call.name(),
                        sequence_number = %sequence_number,
                        tx_hash = %tx_hash,
                        "Bridge transaction confirmed"
                    );
                    return Ok(tx_hash);
                }
                Ok(next) => {
                    debug!(
                        method = call.name(),
                        sequence_number = %sequence_number,
                        from = stage,
                        to = next.name(),
                        "Submission state transition"
                    );
                    next
                }
                Err(e) => {
                    warn!(
                        method = call.name(),
                        sequence_number = %sequence_number,
                        stage,
                        error = %e,
                        "Bridge transaction failed"
                    );
                    return Err(e);
                }
            };
        }
    }

    async fn advance(
        &self,
        cancel: &CancellationToken,
        call: &BridgeCall,
        state: SubmissionState,
    ) -> Result<SubmissionState> {
        match state {
            SubmissionState::Idle => Ok(SubmissionState::Priced(self.price(call).await?)),
            SubmissionState::Priced(params) => {
                let tx_hash = self.sender.send(call, &params).await?;
                info!(
                    method = call.name(),
                    sequence_number = %call.event().sequence_number,
                    tx_hash = %tx_hash,
                    nonce = params.nonce,
                    "Bridge transaction submitted"
                );
                Ok(SubmissionState::Submitted { tx_hash })
            }
            SubmissionState::Submitted { tx_hash } => {
                self.wait_for_receipt(cancel, tx_hash).await?;
                Ok(SubmissionState::Confirmed { tx_hash })
            }
            SubmissionState::Confirmed { .. } => Ok(state),
        }
    }

    async fn price(&self, call: &BridgeCall) -> Result<TxParams> {
        let gas_price = adjust_gas_price(self.sender.gas_price().await?);
        let nonce = self.sender.pending_nonce().await?;
        let gas_limit = adjust_gas_limit(self.sender.estimate_gas(call).await?);

        Ok(TxParams {
            nonce,
            gas_price,
            gas_limit,
        })
    }

    async fn wait_for_receipt(&self, cancel: &CancellationToken, tx_hash: B256) -> Result<()> {
        let deadline = Instant::now() + self.receipt_timeout;

        loop {
            match self.sender.receipt_status(tx_hash).await {
                Ok(Some(true)) => return Ok(()),
                Ok(Some(false)) => {
                    return Err(BridgeOutError::Reverted {
                        tx_hash: tx_hash.to_string(),
                    })
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(tx_hash = %tx_hash, error = %e, "Receipt query failed, polling again");
                }
            }

            if Instant::now() >= deadline {
                return Err(BridgeOutError::ReceiptNotFound {
                    tx_hash: tx_hash.to_string(),
                    waited_secs: self.receipt_timeout.as_secs(),
                });
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(BridgeOutError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BtcWallet, MainUtxo};
    use crate::testing::{unlock_event, MockSender, ReceiptBehavior};
    use alloy::primitives::Address;

    fn executor(sender: Arc<MockSender>) -> IndividualAttestationExecutor {
        IndividualAttestationExecutor::new(
            sender,
            DEFAULT_RECEIPT_TIMEOUT,
            DEFAULT_RECEIPT_POLL_INTERVAL,
        )
    }

    #[test]
    fn test_gas_adjustments_floor() {
        assert_eq!(adjust_gas_price(1_000_000_007), 1_200_000_008);
        assert_eq!(adjust_gas_price(4), 4);
        assert_eq!(adjust_gas_limit(200_005), 220_005);
        assert_eq!(adjust_gas_limit(9), 9);
    }

    #[tokio::test]
    async fn test_successful_submission_uses_adjusted_params() {
        let sender = Arc::new(MockSender::new(Address::repeat_byte(0x01)));
        sender.set_gas_price(10_000_000_000);
        sender.set_gas_estimate(100_000);

        let tx_hash = executor(sender.clone())
            .send(&CancellationToken::new(), &unlock_event(1))
            .await
            .unwrap();

        let sent = sender.sent();
        assert_eq!(sent.len(), 1);
        let (call, params) = &sent[0];
        assert_eq!(call, &BridgeCall::AttestBridgeOut(unlock_event(1)));
        assert_eq!(params.gas_price, 12_000_000_000);
        assert_eq!(params.gas_limit, 110_000);
        assert_eq!(params.nonce, 0);
        assert_ne!(tx_hash, B256::ZERO);
    }

    #[tokio::test]
    async fn test_reverted_receipt() {
        let sender = Arc::new(MockSender::new(Address::repeat_byte(0x01)));
        sender.set_receipt(ReceiptBehavior::Reverted);

        let err = executor(sender)
            .send(&CancellationToken::new(), &unlock_event(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "reverted");
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_receipt_times_out() {
        let sender = Arc::new(MockSender::new(Address::repeat_byte(0x01)));
        sender.set_receipt(ReceiptBehavior::Missing);
        let started = Instant::now();

        let err = executor(sender.clone())
            .send(&CancellationToken::new(), &unlock_event(1))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BridgeOutError::ReceiptNotFound { waited_secs: 60, .. }
        ));
        assert_eq!(started.elapsed(), Duration::from_secs(60));
        assert!(sender.receipt_polls() >= 60);
    }

    #[tokio::test]
    async fn test_send_error_is_returned() {
        let sender = Arc::new(MockSender::new(Address::repeat_byte(0x01)));
        sender.fail_next_send("nonce too low");

        let err = executor(sender.clone())
            .send(&CancellationToken::new(), &unlock_event(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "rpc");
        assert!(sender.sent().is_empty());
        assert_eq!(sender.receipt_polls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_waiting_for_receipt() {
        let sender = Arc::new(MockSender::new(Address::repeat_byte(0x01)));
        sender.set_receipt(ReceiptBehavior::Missing);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let err = executor(sender)
            .send(&cancel, &unlock_event(1))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_withdraw_btc_goes_through_same_pipeline() {
        let sender = Arc::new(MockSender::new(Address::repeat_byte(0x01)));
        let wallet = BtcWallet {
            pubkey_hash: [0x42; 20],
            main_utxo: MainUtxo {
                tx_hash: B256::repeat_byte(0x07),
                output_index: 1,
                value: 50_000,
            },
        };
        let call = wallet.withdraw_call(&unlock_event(3));

        executor(sender.clone())
            .send_call(&CancellationToken::new(), &call)
            .await
            .unwrap();
        assert_eq!(sender.sent()[0].0.name(), "withdrawBTC");
    }
}
