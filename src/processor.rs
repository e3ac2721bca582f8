//! Submission processing
//!
//! Drains the withdrawal queue on a fixed interval and handles each event in
//! its own task: wait out the scheduler delay, skip work already done on-chain,
//! submit through the configured path, and hand successful submissions to the
//! finality checker.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use alloy::primitives::{B256, U256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bridge::BtcWallet;
use crate::error::{BridgeOutError, Result};
use crate::executor::{
    retry_with_backoff, BatchAttestationOrchestrator, IndividualAttestationExecutor, RetryConfig,
};
use crate::finality::FinalityChecker;
use crate::metrics::Metrics;
use crate::queue::WithdrawalQueue;
use crate::scheduler::SubmissionScheduler;
use crate::types::{DestinationChain, UnlockEvent};
use crate::validator::{is_eligible, AttestationValidator};

pub const DEFAULT_QUEUE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How attestations reach the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionMode {
    /// One `attestBridgeOut` transaction per validator
    Individual,
    /// Signatures relayed to a collector that submits them together
    Batch,
}

impl SubmissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionMode::Individual => "individual",
            SubmissionMode::Batch => "batch",
        }
    }
}

impl fmt::Display for SubmissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubmissionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "individual" => Ok(SubmissionMode::Individual),
            "batch" => Ok(SubmissionMode::Batch),
            other => Err(format!(
                "unknown submission mode '{}', expected 'individual' or 'batch'",
                other
            )),
        }
    }
}

pub enum Submitter {
    Individual(IndividualAttestationExecutor),
    Batch(BatchAttestationOrchestrator),
}

impl Submitter {
    pub fn mode(&self) -> SubmissionMode {
        match self {
            Submitter::Individual(_) => SubmissionMode::Individual,
            Submitter::Batch(_) => SubmissionMode::Batch,
        }
    }
}

/// Submits `withdrawBTC` for confirmed withdrawals whose payout is still
/// outstanding on the bridge
pub struct BtcWithdrawal {
    wallet: BtcWallet,
    executor: IndividualAttestationExecutor,
}

impl BtcWithdrawal {
    pub fn new(wallet: BtcWallet, executor: IndividualAttestationExecutor) -> Self {
        Self { wallet, executor }
    }
}

/// How one event was handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Destination chain is not served by this process
    Ineligible,
    AlreadyConfirmed,
    /// Accepted on-chain and handed to the finality checker
    Submitted { tx_hash: Option<B256> },
    /// Put back on the queue for a later pass
    Requeued,
    /// Gave up after the bounded attempts
    Failed,
}

struct InFlightGuard {
    set: Arc<StdMutex<HashSet<U256>>>,
    sequence_number: U256,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|p| p.into_inner());
        set.remove(&self.sequence_number);
    }
}

pub struct SubmissionProcessor {
    queue: Arc<WithdrawalQueue>,
    validator: Arc<AttestationValidator>,
    scheduler: SubmissionScheduler,
    submitter: Submitter,
    finality: Arc<FinalityChecker>,
    retry: RetryConfig,
    metrics: Arc<Metrics>,
    poll_interval: Duration,
    btc_withdrawal: Option<BtcWithdrawal>,
    in_flight: Arc<StdMutex<HashSet<U256>>>,
}

impl SubmissionProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<WithdrawalQueue>,
        validator: Arc<AttestationValidator>,
        scheduler: SubmissionScheduler,
        submitter: Submitter,
        finality: Arc<FinalityChecker>,
        retry: RetryConfig,
        metrics: Arc<Metrics>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            validator,
            scheduler,
            submitter,
            finality,
            retry,
            metrics,
            poll_interval,
            btc_withdrawal: None,
            in_flight: Arc::new(StdMutex::new(HashSet::new())),
        }
    }

    /// Also pay out confirmed withdrawals from `withdrawal`'s wallet
    pub fn with_btc_withdrawal(mut self, withdrawal: BtcWithdrawal) -> Self {
        self.btc_withdrawal = Some(withdrawal);
        self
    }

    fn claim(&self, sequence_number: U256) -> Option<InFlightGuard> {
        let mut set = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        if !set.insert(sequence_number) {
            return None;
        }
        Some(InFlightGuard {
            set: self.in_flight.clone(),
            sequence_number,
        })
    }

    async fn requeue(&self, event: UnlockEvent, reason: &str) -> ProcessOutcome {
        info!(
            sequence_number = %event.sequence_number,
            reason,
            "Re-queueing withdrawal"
        );
        self.queue.requeue(event).await;
        ProcessOutcome::Requeued
    }

    /// Handle one dequeued event.
    ///
    /// Errors returned here are fatal or cancellation; every other failure
    /// is resolved into a [`ProcessOutcome`]. A cancelled event is re-queued
    /// before the error is returned.
    pub async fn process_event(
        &self,
        cancel: &CancellationToken,
        event: UnlockEvent,
    ) -> Result<ProcessOutcome> {
        let sequence_number = event.sequence_number;

        if !is_eligible(&event, DestinationChain::Bitcoin) {
            debug!(
                sequence_number = %sequence_number,
                chain = %event.chain,
                "Skipping withdrawal for other chain"
            );
            return Ok(ProcessOutcome::Ineligible);
        }

        let delay = self.scheduler.submission_delay(&event).await;
        if !delay.is_zero() {
            debug!(
                sequence_number = %sequence_number,
                delay_secs = delay.as_secs(),
                "Waiting for submission slot"
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.requeue(event, "cancelled during delay").await;
                    return Err(BridgeOutError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        match self.validator.is_confirmed(&event).await {
            Ok(true) => {
                if let Some(withdrawal) = &self.btc_withdrawal {
                    return self.submit_withdrawal(cancel, withdrawal, event).await;
                }
                self.metrics.attestations_skipped_total.inc();
                info!(
                    sequence_number = %sequence_number,
                    "Withdrawal already attested, skipping"
                );
                return Ok(ProcessOutcome::AlreadyConfirmed);
            }
            Ok(false) => {}
            Err(e) => {
                self.metrics.record_error("skip_check", e.kind());
                warn!(
                    sequence_number = %sequence_number,
                    error = %e,
                    "Confirmation check failed"
                );
                return Ok(self.requeue(event, "confirmation check failed").await);
            }
        }

        match &self.submitter {
            Submitter::Individual(executor) => {
                self.submit_individual(cancel, executor, event).await
            }
            Submitter::Batch(orchestrator) => self.submit_batch(cancel, orchestrator, event).await,
        }
    }

    async fn submit_individual(
        &self,
        cancel: &CancellationToken,
        executor: &IndividualAttestationExecutor,
        event: UnlockEvent,
    ) -> Result<ProcessOutcome> {
        let sequence_number = event.sequence_number;
        let label = format!("attestBridgeOut({})", sequence_number);

        let result = retry_with_backoff(&self.retry, cancel, &label, |attempt| {
            let event = &event;
            async move {
                // another validator may have finished while we backed off
                if attempt > 1 && self.validator.is_confirmed(event).await? {
                    return Ok(None);
                }
                executor.send(cancel, event).await.map(Some)
            }
        })
        .await;

        match result {
            Ok(Some(tx_hash)) => {
                self.metrics.record_attestation("individual", "success");
                self.finality.track(event).await;
                Ok(ProcessOutcome::Submitted {
                    tx_hash: Some(tx_hash),
                })
            }
            Ok(None) => {
                self.metrics.attestations_skipped_total.inc();
                info!(
                    sequence_number = %sequence_number,
                    "Withdrawal attested while retrying, stopping"
                );
                Ok(ProcessOutcome::AlreadyConfirmed)
            }
            Err(e) => self.fail(event, "individual", e).await,
        }
    }

    async fn submit_batch(
        &self,
        cancel: &CancellationToken,
        orchestrator: &BatchAttestationOrchestrator,
        event: UnlockEvent,
    ) -> Result<ProcessOutcome> {
        match orchestrator.try_attest(cancel, &event).await {
            Ok(true) => {
                self.metrics.record_attestation("batch", "success");
                self.finality.track(event).await;
                Ok(ProcessOutcome::Submitted { tx_hash: None })
            }
            Ok(false) => {
                self.metrics.record_attestation("batch", "timed_out");
                Ok(self.requeue(event, "batch deadline elapsed").await)
            }
            Err(e) => self.fail(event, "batch", e).await,
        }
    }

    async fn submit_withdrawal(
        &self,
        cancel: &CancellationToken,
        withdrawal: &BtcWithdrawal,
        event: UnlockEvent,
    ) -> Result<ProcessOutcome> {
        let sequence_number = event.sequence_number;

        match self.validator.is_withdrawal_pending(&event).await {
            Ok(true) => {}
            Ok(false) => {
                self.metrics.attestations_skipped_total.inc();
                info!(
                    sequence_number = %sequence_number,
                    "Withdrawal attested and paid out, skipping"
                );
                return Ok(ProcessOutcome::AlreadyConfirmed);
            }
            Err(e) => {
                self.metrics.record_error("withdrawal_check", e.kind());
                warn!(
                    sequence_number = %sequence_number,
                    error = %e,
                    "BTC withdrawal check failed"
                );
                return Ok(self.requeue(event, "withdrawal check failed").await);
            }
        }

        let call = withdrawal.wallet.withdraw_call(&event);
        let label = format!("withdrawBTC({})", sequence_number);

        let result = retry_with_backoff(&self.retry, cancel, &label, |attempt| {
            let event = &event;
            let call = &call;
            async move {
                if attempt > 1 && !self.validator.is_withdrawal_pending(event).await? {
                    return Ok(None);
                }
                withdrawal.executor.send_call(cancel, call).await.map(Some)
            }
        })
        .await;

        match result {
            Ok(Some(tx_hash)) => {
                self.metrics.record_attestation("withdrawal", "success");
                self.finality.track(event).await;
                Ok(ProcessOutcome::Submitted {
                    tx_hash: Some(tx_hash),
                })
            }
            Ok(None) => {
                self.metrics.attestations_skipped_total.inc();
                info!(
                    sequence_number = %sequence_number,
                    "Withdrawal paid out while retrying, stopping"
                );
                Ok(ProcessOutcome::AlreadyConfirmed)
            }
            Err(e) => self.fail(event, "withdrawal", e).await,
        }
    }

    async fn fail(
        &self,
        event: UnlockEvent,
        path: &str,
        e: BridgeOutError,
    ) -> Result<ProcessOutcome> {
        if e.is_cancelled() {
            self.requeue(event, "cancelled").await;
            return Err(e);
        }

        self.metrics.record_error(path, e.kind());
        if e.is_fatal() {
            return Err(e);
        }

        self.metrics.record_attestation(path, "failed");
        error!(
            sequence_number = %event.sequence_number,
            stage = path,
            error = %e,
            "Withdrawal attestation permanently failed"
        );
        Ok(ProcessOutcome::Failed)
    }

    /// Drain the queue every poll interval until `cancel` fires. A fatal
    /// error in any event task cancels `cancel`.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            mode = %self.submitter.mode(),
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Submission processor started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            for event in self.queue.drain().await {
                let sequence_number = event.sequence_number;
                let Some(guard) = self.claim(sequence_number) else {
                    // the running task may already have put it back itself
                    debug!(sequence_number = %sequence_number, "Withdrawal already in flight");
                    self.queue.requeue(event).await;
                    continue;
                };

                let processor = self.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    match processor.process_event(&cancel, event).await {
                        Ok(outcome) => {
                            debug!(sequence_number = %sequence_number, outcome = ?outcome, "Withdrawal processed");
                        }
                        Err(e) if e.is_fatal() => {
                            error!(
                                sequence_number = %sequence_number,
                                error = %e,
                                "Fatal error in submission processor, shutting down"
                            );
                            cancel.cancel();
                        }
                        Err(e) => {
                            debug!(sequence_number = %sequence_number, error = %e, "Withdrawal processing stopped");
                        }
                    }
                });
            }
        }

        info!("Submission processor stopped");
    }
}
