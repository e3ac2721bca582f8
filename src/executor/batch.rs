//! Batch attestation through a collector
//!
//! The validator signs the chain-bound attestation off-chain, relays the
//! signature to the collector, then watches for on-chain confirmation:
//!
//! `SigningPayload → AwaitingRelay → AwaitingConfirmation → Confirmed | TimedOut | Canceled`
//!
//! The whole run is bounded by one deadline.

use std::sync::Arc;
use std::time::Duration;

use alloy::signers::local::PrivateKeySigner;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::BridgeContract;
use crate::codec::sign_attestation;
use crate::error::{BridgeOutError, Result};
use crate::relay::SignatureRelay;
use crate::types::UnlockEvent;

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Overall bound on one `try_attest` run
    pub deadline: Duration,
    pub relay_retry_interval: Duration,
    pub confirmation_poll_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(300),
            relay_retry_interval: Duration::from_secs(5),
            confirmation_poll_interval: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchState {
    SigningPayload,
    AwaitingRelay { signature: Vec<u8> },
    AwaitingConfirmation,
    Confirmed,
    TimedOut,
    Canceled,
}

impl BatchState {
    pub fn name(&self) -> &'static str {
        match self {
            BatchState::SigningPayload => "signing_payload",
            BatchState::AwaitingRelay { .. } => "awaiting_relay",
            BatchState::AwaitingConfirmation => "awaiting_confirmation",
            BatchState::Confirmed => "confirmed",
            BatchState::TimedOut => "timed_out",
            BatchState::Canceled => "canceled",
        }
    }
}

/// What a timed wait ended with
enum Wake {
    Tick,
    Deadline,
    Canceled,
}

async fn wait(cancel: &CancellationToken, deadline: Instant, interval: Duration) -> Wake {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Wake::Canceled,
        _ = tokio::time::sleep_until(deadline) => Wake::Deadline,
        _ = tokio::time::sleep(interval) => Wake::Tick,
    }
}

pub struct BatchAttestationOrchestrator {
    signer: PrivateKeySigner,
    chain_id: u64,
    relay: Arc<dyn SignatureRelay>,
    bridge: Arc<dyn BridgeContract>,
    config: BatchConfig,
}

impl BatchAttestationOrchestrator {
    pub fn new(
        signer: PrivateKeySigner,
        chain_id: u64,
        relay: Arc<dyn SignatureRelay>,
        bridge: Arc<dyn BridgeContract>,
        config: BatchConfig,
    ) -> Self {
        Self {
            signer,
            chain_id,
            relay,
            bridge,
            config,
        }
    }

    /// Sign, relay and wait for confirmation.
    ///
    /// `Ok(true)` once confirmed on-chain, `Ok(false)` if the deadline
    /// elapsed first, `Err(Cancelled)` on cancellation. Signing failures
    /// are returned as fatal [`BridgeOutError::Signing`]; a collector
    /// rejecting the request is returned as [`BridgeOutError::InvalidRequest`].
    pub async fn try_attest(&self, cancel: &CancellationToken, event: &UnlockEvent) -> Result<bool> {
        let deadline = Instant::now() + self.config.deadline;
        let mut state = BatchState::SigningPayload;

        loop {
            let terminal = matches!(state, BatchState::Confirmed | BatchState::TimedOut);
            if cancel.is_cancelled() && !terminal {
                state = BatchState::Canceled;
            }

            let from = state.name();
            state = match state {
                BatchState::SigningPayload => {
                    let signature = sign_attestation(&self.signer, event, self.chain_id)?;
                    BatchState::AwaitingRelay { signature }
                }
                BatchState::AwaitingRelay { signature } => {
                    self.relay_until_delivered(cancel, deadline, event, &signature)
                        .await?
                }
                BatchState::AwaitingConfirmation => {
                    self.poll_confirmation(cancel, deadline, event).await
                }
                BatchState::Confirmed => {
                    info!(
                        sequence_number = %event.sequence_number,
                        "Batch attestation confirmed on-chain"
                    );
                    return Ok(true);
                }
                BatchState::TimedOut => {
                    warn!(
                        sequence_number = %event.sequence_number,
                        deadline_secs = self.config.deadline.as_secs(),
                        "Batch attestation deadline elapsed"
                    );
                    return Ok(false);
                }
                BatchState::Canceled => {
                    debug!(sequence_number = %event.sequence_number, "Batch attestation canceled");
                    return Err(BridgeOutError::Cancelled);
                }
            };

            debug!(
                sequence_number = %event.sequence_number,
                from,
                to = state.name(),
                "Batch state transition"
            );
        }
    }

    async fn relay_until_delivered(
        &self,
        cancel: &CancellationToken,
        deadline: Instant,
        event: &UnlockEvent,
        signature: &[u8],
    ) -> Result<BatchState> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(BatchState::Canceled),
                _ = tokio::time::sleep_until(deadline) => return Ok(BatchState::TimedOut),
                result = self.relay.relay(event, signature) => result,
            };

            match result {
                Ok(()) => {
                    info!(
                        sequence_number = %event.sequence_number,
                        attempt,
                        "Signature relayed to collector"
                    );
                    return Ok(BatchState::AwaitingConfirmation);
                }
                Err(e @ BridgeOutError::InvalidRequest(_)) => {
                    warn!(
                        sequence_number = %event.sequence_number,
                        error = %e,
                        "Collector rejected signature"
                    );
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        sequence_number = %event.sequence_number,
                        attempt,
                        error = %e,
                        "Signature relay failed, will retry"
                    );
                }
            }

            match wait(cancel, deadline, self.config.relay_retry_interval).await {
                Wake::Tick => {}
                Wake::Deadline => return Ok(BatchState::TimedOut),
                Wake::Canceled => return Ok(BatchState::Canceled),
            }
        }
    }

    async fn poll_confirmation(
        &self,
        cancel: &CancellationToken,
        deadline: Instant,
        event: &UnlockEvent,
    ) -> BatchState {
        loop {
            match self.bridge.confirmed_unlocks(event.sequence_number).await {
                Ok(true) => return BatchState::Confirmed,
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        sequence_number = %event.sequence_number,
                        error = %e,
                        "Confirmation check failed, will retry"
                    );
                }
            }

            match wait(cancel, deadline, self.config.confirmation_poll_interval).await {
                Wake::Tick => {}
                Wake::Deadline => return BatchState::TimedOut,
                Wake::Canceled => return BatchState::Canceled,
            }
        }
    }
}
