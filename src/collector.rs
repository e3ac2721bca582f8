//! Collector-side batch submission
//!
//! The collector stores, per sequence number, the signatures validators relay
//! to it. Once the contract's attestation threshold is met it submits one
//! `attestBridgeOutWithSignatures` transaction carrying exactly `threshold`
//! signatures in collection order.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bridge::{BridgeCall, BridgeContract};
use crate::error::{BridgeOutError, Result};
use crate::executor::{retry_with_backoff, IndividualAttestationExecutor, RetryConfig};
use crate::finality::FinalityChecker;
use crate::metrics::Metrics;
use crate::types::{EntryStatus, UnlockEvent, SIGNATURE_LENGTH};

/// Join signatures into one byte string, rejecting any that is not 65 bytes
pub fn concatenate_signatures(signatures: &[Vec<u8>]) -> Result<Bytes> {
    let mut combined = Vec::with_capacity(signatures.len() * SIGNATURE_LENGTH);
    for signature in signatures {
        if signature.len() != SIGNATURE_LENGTH {
            return Err(BridgeOutError::SignatureLength {
                expected: SIGNATURE_LENGTH,
                got: signature.len(),
            });
        }
        combined.extend_from_slice(signature);
    }
    Ok(Bytes::from(combined))
}

/// Split a concatenated signature string back into 65-byte signatures
pub fn split_signatures(combined: &[u8]) -> Result<Vec<Vec<u8>>> {
    if combined.len() % SIGNATURE_LENGTH != 0 {
        return Err(BridgeOutError::SignatureLength {
            expected: SIGNATURE_LENGTH,
            got: combined.len() % SIGNATURE_LENGTH,
        });
    }
    Ok(combined
        .chunks(SIGNATURE_LENGTH)
        .map(|chunk| chunk.to_vec())
        .collect())
}

/// Persistence for relayed entries and signatures.
///
/// Inserts are optimistic: a conflicting row that already exists counts as
/// success, and the `bool` reports whether a new row was written.
#[async_trait]
pub trait SignatureStore: Send + Sync {
    async fn save_entry(&self, event: &UnlockEvent) -> Result<bool>;

    async fn load_entry(&self, sequence_number: U256) -> Result<Option<UnlockEvent>>;

    async fn entry_status(&self, sequence_number: U256) -> Result<Option<EntryStatus>>;

    async fn set_status(&self, sequence_number: U256, status: EntryStatus) -> Result<()>;

    async fn save_signature(
        &self,
        sequence_number: U256,
        validator: Address,
        signature: &[u8],
    ) -> Result<bool>;

    /// Signatures for an entry in the order they were collected
    async fn load_signatures(&self, sequence_number: U256) -> Result<Vec<Vec<u8>>>;
}

#[derive(Default)]
struct StoredEntries {
    entries: HashMap<U256, (UnlockEvent, EntryStatus)>,
    signatures: HashMap<U256, Vec<(Address, Vec<u8>)>>,
}

/// Process-local [`SignatureStore`], used when no database is configured
#[derive(Default)]
pub struct MemorySignatureStore {
    inner: Mutex<StoredEntries>,
}

impl MemorySignatureStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SignatureStore for MemorySignatureStore {
    async fn save_entry(&self, event: &UnlockEvent) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.entries.contains_key(&event.sequence_number) {
            return Ok(false);
        }
        inner
            .entries
            .insert(event.sequence_number, (event.clone(), EntryStatus::Pending));
        Ok(true)
    }

    async fn load_entry(&self, sequence_number: U256) -> Result<Option<UnlockEvent>> {
        let inner = self.inner.lock().await;
        Ok(inner.entries.get(&sequence_number).map(|(e, _)| e.clone()))
    }

    async fn entry_status(&self, sequence_number: U256) -> Result<Option<EntryStatus>> {
        let inner = self.inner.lock().await;
        Ok(inner.entries.get(&sequence_number).map(|(_, s)| *s))
    }

    async fn set_status(&self, sequence_number: U256, status: EntryStatus) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some((_, current)) = inner.entries.get_mut(&sequence_number) {
            *current = status;
        }
        Ok(())
    }

    async fn save_signature(
        &self,
        sequence_number: U256,
        validator: Address,
        signature: &[u8],
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let signatures = inner.signatures.entry(sequence_number).or_default();
        if signatures.iter().any(|(v, _)| *v == validator) {
            return Ok(false);
        }
        signatures.push((validator, signature.to_vec()));
        Ok(true)
    }

    async fn load_signatures(&self, sequence_number: U256) -> Result<Vec<Vec<u8>>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .signatures
            .get(&sequence_number)
            .map(|s| s.iter().map(|(_, sig)| sig.clone()).collect())
            .unwrap_or_default())
    }
}

/// What a submission request ended with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Not enough signatures yet
    BelowThreshold { collected: usize, threshold: u64 },
    Submitted { tx_hash: B256 },
    /// Another submitter confirmed the unlock first
    ConfirmedElsewhere,
    AlreadyProcessed,
    /// A submission for this sequence number is already running
    InFlight,
    UnknownEntry,
}

/// Removes a sequence number from the in-flight set when dropped
struct InFlightGuard<'a> {
    set: &'a StdMutex<HashSet<U256>>,
    sequence_number: U256,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|p| p.into_inner());
        set.remove(&self.sequence_number);
    }
}

pub struct BatchSubmitter {
    store: Arc<dyn SignatureStore>,
    bridge: Arc<dyn BridgeContract>,
    executor: Arc<IndividualAttestationExecutor>,
    finality: Arc<FinalityChecker>,
    retry: RetryConfig,
    metrics: Arc<Metrics>,
    in_flight: StdMutex<HashSet<U256>>,
}

impl BatchSubmitter {
    pub fn new(
        store: Arc<dyn SignatureStore>,
        bridge: Arc<dyn BridgeContract>,
        executor: Arc<IndividualAttestationExecutor>,
        finality: Arc<FinalityChecker>,
        retry: RetryConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            bridge,
            executor,
            finality,
            retry,
            metrics,
            in_flight: StdMutex::new(HashSet::new()),
        }
    }

    fn claim(&self, sequence_number: U256) -> Option<InFlightGuard<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        if !set.insert(sequence_number) {
            return None;
        }
        Some(InFlightGuard {
            set: &self.in_flight,
            sequence_number,
        })
    }

    /// Submit the collected signatures for an entry if the threshold is met
    pub async fn try_submit(
        &self,
        cancel: &CancellationToken,
        sequence_number: U256,
    ) -> Result<SubmitOutcome> {
        let Some(_guard) = self.claim(sequence_number) else {
            debug!(sequence_number = %sequence_number, "Batch submission already in flight");
            return Ok(SubmitOutcome::InFlight);
        };

        let Some(event) = self.store.load_entry(sequence_number).await? else {
            return Ok(SubmitOutcome::UnknownEntry);
        };
        if self.store.entry_status(sequence_number).await? == Some(EntryStatus::Processed) {
            return Ok(SubmitOutcome::AlreadyProcessed);
        }

        let threshold = self.bridge.attestation_threshold().await?;
        let mut signatures = self.store.load_signatures(sequence_number).await?;
        if threshold == 0 || (signatures.len() as u64) < threshold {
            debug!(
                sequence_number = %sequence_number,
                collected = signatures.len(),
                threshold,
                "Waiting for more signatures"
            );
            return Ok(SubmitOutcome::BelowThreshold {
                collected: signatures.len(),
                threshold,
            });
        }

        // The threshold may have dropped since the signatures were collected
        signatures.truncate(threshold as usize);
        let combined = concatenate_signatures(&signatures).inspect_err(|e| {
            error!(
                sequence_number = %sequence_number,
                stage = "concatenate",
                error = %e,
                "Malformed stored signature, aborting batch"
            );
        })?;

        let call = BridgeCall::AttestBridgeOutWithSignatures {
            event: event.clone(),
            signatures: combined,
        };
        let label = format!("attestBridgeOutWithSignatures({})", sequence_number);

        let result = retry_with_backoff(&self.retry, cancel, &label, |attempt| {
            let call = &call;
            async move {
                if self.bridge.confirmed_unlocks(sequence_number).await? {
                    return Ok(SubmitOutcome::ConfirmedElsewhere);
                }
                debug!(
                    sequence_number = %sequence_number,
                    attempt,
                    signatures = threshold,
                    "Submitting batch attestation"
                );
                let tx_hash = self.executor.send_call(cancel, call).await?;
                Ok(SubmitOutcome::Submitted { tx_hash })
            }
        })
        .await;

        match result {
            Ok(outcome) => {
                self.finality.track(event).await;
                if let Err(store_err) = self
                    .store
                    .set_status(sequence_number, EntryStatus::Processed)
                    .await
                {
                    self.metrics.record_error("collector", store_err.kind());
                    warn!(
                        sequence_number = %sequence_number,
                        error = %store_err,
                        "Failed to record processed status"
                    );
                }
                let label = match outcome {
                    SubmitOutcome::ConfirmedElsewhere => "confirmed_elsewhere",
                    _ => "success",
                };
                self.metrics.record_attestation("collector", label);
                info!(
                    sequence_number = %sequence_number,
                    outcome = ?outcome,
                    "Batch attestation processed"
                );
                Ok(outcome)
            }
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                self.metrics.record_attestation("collector", "failed");
                self.metrics.record_error("collector", e.kind());
                error!(
                    sequence_number = %sequence_number,
                    stage = "submit",
                    error = %e,
                    "Batch attestation permanently failed"
                );
                if let Err(store_err) = self
                    .store
                    .set_status(sequence_number, EntryStatus::Failed)
                    .await
                {
                    warn!(
                        sequence_number = %sequence_number,
                        error = %store_err,
                        "Failed to record failed status"
                    );
                }
                Err(e)
            }
        }
    }

    /// Submit on every notification until `cancel` fires
    pub async fn run(self: Arc<Self>, mut notifications: mpsc::Receiver<U256>, cancel: CancellationToken) {
        info!("Batch submitter started");

        loop {
            let sequence_number = tokio::select! {
                _ = cancel.cancelled() => break,
                next = notifications.recv() => match next {
                    Some(sequence_number) => sequence_number,
                    None => break,
                },
            };

            let submitter = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                match submitter.try_submit(&cancel, sequence_number).await {
                    Ok(_) => {}
                    Err(e) if e.is_fatal() => {
                        error!(error = %e, "Fatal error in batch submitter, shutting down");
                        cancel.cancel();
                    }
                    Err(e) => {
                        debug!(sequence_number = %sequence_number, error = %e, "Batch submission ended with error");
                    }
                }
            });
        }

        info!("Batch submitter stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::individual::{DEFAULT_RECEIPT_POLL_INTERVAL, DEFAULT_RECEIPT_TIMEOUT};
    use crate::queue::WithdrawalQueue;
    use crate::testing::{unlock_event, MockBridge, MockSender};
    use crate::validator::AttestationValidator;

    fn signature(byte: u8) -> Vec<u8> {
        vec![byte; SIGNATURE_LENGTH]
    }

    struct Fixture {
        store: Arc<MemorySignatureStore>,
        bridge: Arc<MockBridge>,
        sender: Arc<MockSender>,
        finality: Arc<FinalityChecker>,
        submitter: BatchSubmitter,
    }

    fn fixture() -> Fixture {
        let metrics = Arc::new(Metrics::new());
        let store = Arc::new(MemorySignatureStore::new());
        let bridge = Arc::new(MockBridge::new());
        let sender = Arc::new(MockSender::new(Address::repeat_byte(0x44)));
        let executor = Arc::new(IndividualAttestationExecutor::new(
            sender.clone(),
            DEFAULT_RECEIPT_TIMEOUT,
            DEFAULT_RECEIPT_POLL_INTERVAL,
        ));
        let queue = Arc::new(WithdrawalQueue::new(metrics.clone()));
        let validator = Arc::new(AttestationValidator::new(
            bridge.clone(),
            Address::repeat_byte(0x44),
        ));
        let finality = Arc::new(FinalityChecker::new(queue, validator, metrics.clone()));
        let submitter = BatchSubmitter::new(
            store.clone(),
            bridge.clone(),
            executor,
            finality.clone(),
            RetryConfig::default(),
            metrics,
        );
        Fixture {
            store,
            bridge,
            sender,
            finality,
            submitter,
        }
    }

    async fn collect(store: &MemorySignatureStore, event: &UnlockEvent, signatures: &[Vec<u8>]) {
        store.save_entry(event).await.unwrap();
        for (i, sig) in signatures.iter().enumerate() {
            store
                .save_signature(event.sequence_number, Address::repeat_byte(i as u8 + 1), sig)
                .await
                .unwrap();
        }
    }

    #[test]
    fn test_concatenation_round_trip() {
        let signatures = vec![signature(1), signature(2), signature(3)];
        let combined = concatenate_signatures(&signatures).unwrap();
        assert_eq!(combined.len(), 3 * SIGNATURE_LENGTH);
        assert_eq!(split_signatures(&combined).unwrap(), signatures);
    }

    #[test]
    fn test_short_signature_rejected() {
        let err = concatenate_signatures(&[signature(1), vec![2; 64]]).unwrap_err();
        assert!(matches!(
            err,
            BridgeOutError::SignatureLength {
                expected: 65,
                got: 64
            }
        ));
        assert!(split_signatures(&[0u8; 130 + 1]).is_err());
    }

    #[tokio::test]
    async fn test_optimistic_inserts() {
        let store = MemorySignatureStore::new();
        let event = unlock_event(1);
        assert!(store.save_entry(&event).await.unwrap());
        assert!(!store.save_entry(&event).await.unwrap());

        let validator = Address::repeat_byte(9);
        assert!(store
            .save_signature(event.sequence_number, validator, &signature(1))
            .await
            .unwrap());
        assert!(!store
            .save_signature(event.sequence_number, validator, &signature(2))
            .await
            .unwrap());
        assert_eq!(
            store.load_signatures(event.sequence_number).await.unwrap(),
            vec![signature(1)]
        );
    }

    #[tokio::test]
    async fn test_below_threshold_does_not_submit() {
        let f = fixture();
        f.bridge.set_threshold(3);
        let event = unlock_event(1);
        collect(&f.store, &event, &[signature(1), signature(2)]).await;

        let outcome = f
            .submitter
            .try_submit(&CancellationToken::new(), event.sequence_number)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            SubmitOutcome::BelowThreshold {
                collected: 2,
                threshold: 3
            }
        );
        assert!(f.sender.sent().is_empty());
    }

    #[tokio::test]
    async fn test_submits_exactly_threshold_in_collection_order() {
        let f = fixture();
        f.bridge.set_threshold(3);
        let event = unlock_event(2);
        let signatures: Vec<Vec<u8>> = (1..=5).map(signature).collect();
        collect(&f.store, &event, &signatures).await;

        let outcome = f
            .submitter
            .try_submit(&CancellationToken::new(), event.sequence_number)
            .await
            .unwrap();
        assert!(matches!(outcome, SubmitOutcome::Submitted { .. }));

        let sent = f.sender.sent();
        assert_eq!(sent.len(), 1);
        match &sent[0].0 {
            BridgeCall::AttestBridgeOutWithSignatures {
                event: sent_event,
                signatures: combined,
            } => {
                assert_eq!(sent_event, &event);
                assert_eq!(split_signatures(combined).unwrap(), signatures[..3].to_vec());
            }
            other => panic!("unexpected call {:?}", other),
        }

        assert_eq!(
            f.store.entry_status(event.sequence_number).await.unwrap(),
            Some(EntryStatus::Processed)
        );
        assert_eq!(f.finality.tracked_count().await, 1);
    }

    #[tokio::test]
    async fn test_malformed_signature_aborts_before_submission() {
        let f = fixture();
        f.bridge.set_threshold(2);
        let event = unlock_event(3);
        collect(&f.store, &event, &[signature(1), vec![2; 64]]).await;

        let err = f
            .submitter
            .try_submit(&CancellationToken::new(), event.sequence_number)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "signature_length");
        assert!(f.sender.sent().is_empty());
        assert_eq!(f.bridge.confirmed_reads(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_when_confirmed_elsewhere() {
        let f = fixture();
        f.bridge.set_threshold(1);
        let event = unlock_event(4);
        collect(&f.store, &event, &[signature(1)]).await;
        f.sender.fail_next_send("connection reset");

        let bridge = f.bridge.clone();
        let seq = event.sequence_number;
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            bridge.set_confirmed(seq, true);
        });

        let outcome = f
            .submitter
            .try_submit(&CancellationToken::new(), event.sequence_number)
            .await
            .unwrap();

        assert_eq!(outcome, SubmitOutcome::ConfirmedElsewhere);
        assert!(f.sender.sent().is_empty());
        assert_eq!(
            f.store.entry_status(event.sequence_number).await.unwrap(),
            Some(EntryStatus::Processed)
        );
    }

    #[tokio::test]
    async fn test_processed_entry_is_not_resubmitted() {
        let f = fixture();
        f.bridge.set_threshold(1);
        let event = unlock_event(5);
        collect(&f.store, &event, &[signature(1)]).await;
        f.store
            .set_status(event.sequence_number, EntryStatus::Processed)
            .await
            .unwrap();

        let outcome = f
            .submitter
            .try_submit(&CancellationToken::new(), event.sequence_number)
            .await
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::AlreadyProcessed);
        assert_eq!(f.bridge.threshold_reads(), 0);
    }

    #[tokio::test]
    async fn test_in_flight_guard() {
        let f = fixture();
        let seq = U256::from(6u64);
        let guard = f.submitter.claim(seq);
        assert!(guard.is_some());

        let outcome = f
            .submitter
            .try_submit(&CancellationToken::new(), seq)
            .await
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::InFlight);

        drop(guard);
        let outcome = f
            .submitter
            .try_submit(&CancellationToken::new(), seq)
            .await
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::UnknownEntry);
    }
    /// Memory store whose status writes fail
    struct StatusWriteFails(MemorySignatureStore);

    #[async_trait]
    impl SignatureStore for StatusWriteFails {
        async fn save_entry(&self, event: &UnlockEvent) -> Result<bool> {
            self.0.save_entry(event).await
        }

        async fn load_entry(&self, sequence_number: U256) -> Result<Option<UnlockEvent>> {
            self.0.load_entry(sequence_number).await
        }

        async fn entry_status(&self, sequence_number: U256) -> Result<Option<EntryStatus>> {
            self.0.entry_status(sequence_number).await
        }

        async fn set_status(&self, _sequence_number: U256, _status: EntryStatus) -> Result<()> {
            Err(BridgeOutError::Storage("connection closed".to_string()))
        }

        async fn save_signature(
            &self,
            sequence_number: U256,
            validator: Address,
            signature: &[u8],
        ) -> Result<bool> {
            self.0
                .save_signature(sequence_number, validator, signature)
                .await
        }

        async fn load_signatures(&self, sequence_number: U256) -> Result<Vec<Vec<u8>>> {
            self.0.load_signatures(sequence_number).await
        }
    }

    #[tokio::test]
    async fn test_landed_submission_is_tracked_when_status_write_fails() {
        let f = fixture();
        f.bridge.set_threshold(1);
        let event = unlock_event(7);
        let store = StatusWriteFails(MemorySignatureStore::new());
        collect(&store.0, &event, &[signature(1)]).await;

        let submitter = BatchSubmitter::new(
            Arc::new(store),
            f.bridge.clone(),
            Arc::new(IndividualAttestationExecutor::new(
                f.sender.clone(),
                DEFAULT_RECEIPT_TIMEOUT,
                DEFAULT_RECEIPT_POLL_INTERVAL,
            )),
            f.finality.clone(),
            RetryConfig::default(),
            Arc::new(Metrics::new()),
        );

        let outcome = submitter
            .try_submit(&CancellationToken::new(), event.sequence_number)
            .await
            .unwrap();

        assert!(matches!(outcome, SubmitOutcome::Submitted { .. }));
        assert_eq!(f.sender.sent().len(), 1);
        assert_eq!(f.finality.tracked_count().await, 1);
    }
}
