//! In-memory doubles for the chain and relay seams
//!
//! Used by unit tests and by the integration tests in `tests/`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::bridge::{
    finalized_height_stream, BridgeCall, BridgeContract, ChainView, TransactionSender, TxParams,
};
use crate::error::{BridgeOutError, Result};
use crate::relay::SignatureRelay;
use crate::types::{DestinationChain, UnlockEvent, ValidatorId};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Bitcoin-bound unlock with fixed recipient, token and amount
pub fn unlock_event(sequence_number: u64) -> UnlockEvent {
    UnlockEvent {
        sequence_number: U256::from(sequence_number),
        recipient: Bytes::from(vec![0x00, 0x14, 0xab, 0xcd]),
        token: Address::repeat_byte(0xb7),
        amount: U256::from(1000u64),
        chain: DestinationChain::Bitcoin,
        source_block: 100 + sequence_number,
    }
}

#[derive(Default)]
struct BridgeState {
    confirmed: HashMap<U256, bool>,
    bitmaps: HashMap<B256, U256>,
    validator_ids: HashMap<Address, ValidatorId>,
    validators_count: u64,
    threshold: u64,
    pending_withdrawals: HashMap<B256, bool>,
    fail_reads: bool,
}

/// Configurable [`BridgeContract`] with read counters
#[derive(Default)]
pub struct MockBridge {
    state: Mutex<BridgeState>,
    confirmed_reads: AtomicUsize,
    attestation_reads: AtomicUsize,
    threshold_reads: AtomicUsize,
}

impl MockBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_confirmed(&self, sequence_number: U256, confirmed: bool) {
        lock(&self.state).confirmed.insert(sequence_number, confirmed);
    }

    pub fn set_bitmap(&self, key: B256, bitmap: U256) {
        lock(&self.state).bitmaps.insert(key, bitmap);
    }

    pub fn set_validator_id(&self, validator: Address, id: ValidatorId) {
        lock(&self.state).validator_ids.insert(validator, id);
    }

    pub fn set_validators_count(&self, count: u64) {
        lock(&self.state).validators_count = count;
    }

    pub fn set_threshold(&self, threshold: u64) {
        lock(&self.state).threshold = threshold;
    }

    pub fn set_pending_withdrawal(&self, key: B256, pending: bool) {
        lock(&self.state).pending_withdrawals.insert(key, pending);
    }

    /// Make every read return an RPC error
    pub fn fail_reads(&self, fail: bool) {
        lock(&self.state).fail_reads = fail;
    }

    pub fn confirmed_reads(&self) -> usize {
        self.confirmed_reads.load(Ordering::SeqCst)
    }

    pub fn attestation_reads(&self) -> usize {
        self.attestation_reads.load(Ordering::SeqCst)
    }

    pub fn threshold_reads(&self) -> usize {
        self.threshold_reads.load(Ordering::SeqCst)
    }

    fn read<T>(&self, f: impl FnOnce(&BridgeState) -> T) -> Result<T> {
        let state = lock(&self.state);
        if state.fail_reads {
            return Err(BridgeOutError::Rpc("connection refused".to_string()));
        }
        Ok(f(&state))
    }
}

#[async_trait]
impl BridgeContract for MockBridge {
    async fn confirmed_unlocks(&self, sequence_number: U256) -> Result<bool> {
        self.confirmed_reads.fetch_add(1, Ordering::SeqCst);
        self.read(|s| s.confirmed.get(&sequence_number).copied().unwrap_or(false))
    }

    async fn attestations(&self, attestation_key: B256) -> Result<U256> {
        self.attestation_reads.fetch_add(1, Ordering::SeqCst);
        self.read(|s| s.bitmaps.get(&attestation_key).copied().unwrap_or_default())
    }

    async fn validator_id(&self, validator: Address) -> Result<ValidatorId> {
        self.read(|s| s.validator_ids.get(&validator).copied().unwrap_or(0))
    }

    async fn bridge_validators_count(&self) -> Result<u64> {
        self.read(|s| s.validators_count)
    }

    async fn attestation_threshold(&self) -> Result<u64> {
        self.threshold_reads.fetch_add(1, Ordering::SeqCst);
        self.read(|s| s.threshold)
    }

    async fn pending_btc_withdrawals(&self, entry_hash: B256) -> Result<bool> {
        self.read(|s| {
            s.pending_withdrawals
                .get(&entry_hash)
                .copied()
                .unwrap_or(false)
        })
    }
}

/// What a [`MockSender`] reports for a sent transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptBehavior {
    Success,
    Reverted,
    /// The transaction is never mined
    Missing,
}

struct SenderState {
    gas_price: u128,
    gas_estimate: u64,
    nonce: u64,
    receipt: ReceiptBehavior,
    send_failures: VecDeque<String>,
    sent: Vec<(BridgeCall, TxParams)>,
    confirm_on_success: Option<Arc<MockBridge>>,
}

/// Recording [`TransactionSender`]
pub struct MockSender {
    address: Address,
    state: Mutex<SenderState>,
    receipt_polls: AtomicUsize,
}

impl MockSender {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            state: Mutex::new(SenderState {
                gas_price: 1_000_000_000,
                gas_estimate: 200_000,
                nonce: 0,
                receipt: ReceiptBehavior::Success,
                send_failures: VecDeque::new(),
                sent: Vec::new(),
                confirm_on_success: None,
            }),
            receipt_polls: AtomicUsize::new(0),
        }
    }

    pub fn set_gas_price(&self, gas_price: u128) {
        lock(&self.state).gas_price = gas_price;
    }

    pub fn set_gas_estimate(&self, gas: u64) {
        lock(&self.state).gas_estimate = gas;
    }

    pub fn set_receipt(&self, receipt: ReceiptBehavior) {
        lock(&self.state).receipt = receipt;
    }

    /// Fail the next `send` with the given error message
    pub fn fail_next_send(&self, message: &str) {
        lock(&self.state).send_failures.push_back(message.to_string());
    }

    /// Mark the unlock confirmed on `bridge` whenever a sent transaction succeeds
    pub fn confirm_on_success(&self, bridge: Arc<MockBridge>) {
        lock(&self.state).confirm_on_success = Some(bridge);
    }

    pub fn sent(&self) -> Vec<(BridgeCall, TxParams)> {
        lock(&self.state).sent.clone()
    }

    pub fn receipt_polls(&self) -> usize {
        self.receipt_polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransactionSender for MockSender {
    fn sender_address(&self) -> Address {
        self.address
    }

    async fn gas_price(&self) -> Result<u128> {
        Ok(lock(&self.state).gas_price)
    }

    async fn pending_nonce(&self) -> Result<u64> {
        Ok(lock(&self.state).nonce)
    }

    async fn estimate_gas(&self, _call: &BridgeCall) -> Result<u64> {
        Ok(lock(&self.state).gas_estimate)
    }

    async fn send(&self, call: &BridgeCall, params: &TxParams) -> Result<B256> {
        let mut state = lock(&self.state);
        if let Some(message) = state.send_failures.pop_front() {
            return Err(BridgeOutError::Rpc(message));
        }
        state.sent.push((call.clone(), *params));
        state.nonce += 1;
        Ok(B256::left_padding_from(&(state.sent.len() as u64).to_be_bytes()))
    }

    async fn receipt_status(&self, tx_hash: B256) -> Result<Option<bool>> {
        self.receipt_polls.fetch_add(1, Ordering::SeqCst);
        let state = lock(&self.state);
        let mut index = [0u8; 8];
        index.copy_from_slice(&tx_hash.0[24..]);
        let index = u64::from_be_bytes(index) as usize;
        match state.receipt {
            ReceiptBehavior::Success => {
                if let (Some(bridge), Some((call, _))) = (
                    state.confirm_on_success.as_ref(),
                    index.checked_sub(1).and_then(|i| state.sent.get(i)),
                ) {
                    bridge.set_confirmed(call.event().sequence_number, true);
                }
                Ok(Some(true))
            }
            ReceiptBehavior::Reverted => Ok(Some(false)),
            ReceiptBehavior::Missing => Ok(None),
        }
    }
}

/// [`ChainView`] whose finalized height is set by the test
#[derive(Clone)]
pub struct MockChainView {
    height: Arc<AtomicU64>,
    poll_interval: Duration,
}

impl Default for MockChainView {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChainView {
    pub fn new() -> Self {
        Self {
            height: Arc::new(AtomicU64::new(0)),
            poll_interval: Duration::from_millis(10),
        }
    }

    pub fn set_finalized(&self, height: u64) {
        self.height.store(height, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChainView for MockChainView {
    async fn finalized_block(&self) -> Result<u64> {
        Ok(self.height.load(Ordering::SeqCst))
    }

    fn watch_blocks(&self, cancel: CancellationToken) -> BoxStream<'static, u64> {
        finalized_height_stream(self.clone(), self.poll_interval, cancel).boxed()
    }
}

#[derive(Default)]
struct RelayState {
    failures: usize,
    relayed: Vec<(UnlockEvent, Vec<u8>)>,
    confirm_on_relay: Option<Arc<MockBridge>>,
}

/// Recording [`SignatureRelay`]
#[derive(Default)]
pub struct MockRelay {
    state: Mutex<RelayState>,
    attempts: AtomicUsize,
}

impl MockRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` relay attempts with an HTTP error
    pub fn fail_times(&self, n: usize) {
        lock(&self.state).failures = n;
    }

    /// Mark the unlock confirmed on `bridge` once a signature is delivered
    pub fn confirm_on_relay(&self, bridge: Arc<MockBridge>) {
        lock(&self.state).confirm_on_relay = Some(bridge);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn relayed(&self) -> Vec<(UnlockEvent, Vec<u8>)> {
        lock(&self.state).relayed.clone()
    }
}

#[async_trait]
impl SignatureRelay for MockRelay {
    async fn relay(&self, event: &UnlockEvent, signature: &[u8]) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let mut state = lock(&self.state);
        if state.failures > 0 {
            state.failures -= 1;
            return Err(BridgeOutError::Http("collector unavailable".to_string()));
        }
        state.relayed.push((event.clone(), signature.to_vec()));
        if let Some(bridge) = state.confirm_on_relay.as_ref() {
            bridge.set_confirmed(event.sequence_number, true);
        }
        Ok(())
    }
}
