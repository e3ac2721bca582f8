//! Source-chain watcher for `AssetsUnlocked` events
//!
//! Scans finalized source-chain blocks in order and feeds every Bitcoin-bound
//! unlock that Ethereum has not yet confirmed into the withdrawal queue.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{Filter, Log};
use alloy::sol_types::SolEvent;
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bridge::BridgeContract;
use crate::contracts::AssetsBridge;
use crate::error::{BridgeOutError, Result};
use crate::metrics::Metrics;
use crate::queue::WithdrawalQueue;
use crate::types::{DestinationChain, UnlockEvent};
use crate::validator::is_eligible;

/// Largest block range requested per `eth_getLogs` call
pub const MAX_BLOCK_RANGE: u64 = 1_000;

/// Decode an `AssetsUnlocked` log
pub fn event_from_log(log: &Log) -> Result<UnlockEvent> {
    let decoded = log
        .log_decode::<AssetsBridge::AssetsUnlocked>()
        .map_err(|e| BridgeOutError::InvalidRequest(format!("undecodable unlock log: {}", e)))?;
    let unlock = decoded.inner.data;

    let chain = DestinationChain::try_from(unlock.chain).map_err(|c| {
        BridgeOutError::InvalidRequest(format!("unknown destination chain {}", c))
    })?;

    Ok(UnlockEvent {
        sequence_number: unlock.unlockSequenceNumber,
        recipient: unlock.recipient,
        token: unlock.token,
        amount: unlock.amount,
        chain,
        source_block: log.block_number.unwrap_or_default(),
    })
}

/// Where unlock events come from
#[async_trait]
pub trait UnlockSource: Send + Sync {
    /// Highest block considered final on the source chain
    async fn finalized_block(&self) -> Result<u64>;

    /// Unlock events in `[from_block, to_block]`, in log order
    async fn unlock_events(&self, from_block: u64, to_block: u64) -> Result<Vec<UnlockEvent>>;
}

/// alloy-backed [`UnlockSource`]
pub struct EvmUnlockSource {
    provider: RootProvider<Http<Client>>,
    contract_address: Address,
    finality_blocks: u64,
}

impl EvmUnlockSource {
    pub fn new(rpc_url: &str, contract_address: &str, finality_blocks: u64) -> Result<Self> {
        let url = rpc_url
            .parse()
            .map_err(|e| BridgeOutError::Config(format!("Invalid source RPC URL: {}", e)))?;
        let contract_address = Address::from_str(contract_address).map_err(|e| {
            BridgeOutError::Config(format!("Invalid source bridge address: {}", e))
        })?;

        Ok(Self {
            provider: ProviderBuilder::new().on_http(url),
            contract_address,
            finality_blocks,
        })
    }
}

#[async_trait]
impl UnlockSource for EvmUnlockSource {
    async fn finalized_block(&self) -> Result<u64> {
        let head = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| BridgeOutError::Rpc(format!("eth_blockNumber: {}", e)))?;
        Ok(head.saturating_sub(self.finality_blocks))
    }

    async fn unlock_events(&self, from_block: u64, to_block: u64) -> Result<Vec<UnlockEvent>> {
        let filter = Filter::new()
            .address(self.contract_address)
            .event_signature(AssetsBridge::AssetsUnlocked::SIGNATURE_HASH)
            .from_block(from_block)
            .to_block(to_block);

        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| BridgeOutError::Rpc(format!("eth_getLogs: {}", e)))?;

        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            match event_from_log(&log) {
                Ok(event) => events.push(event),
                Err(e) => {
                    error!(
                        tx_hash = ?log.transaction_hash,
                        log_index = ?log.log_index,
                        error = %e,
                        "Failed to parse unlock log"
                    );
                }
            }
        }
        Ok(events)
    }
}

pub struct UnlockWatcher {
    source: Arc<dyn UnlockSource>,
    bridge: Arc<dyn BridgeContract>,
    queue: Arc<WithdrawalQueue>,
    metrics: Arc<Metrics>,
    next_block: u64,
    poll_interval: Duration,
}

impl UnlockWatcher {
    pub fn new(
        source: Arc<dyn UnlockSource>,
        bridge: Arc<dyn BridgeContract>,
        queue: Arc<WithdrawalQueue>,
        metrics: Arc<Metrics>,
        start_block: u64,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source,
            bridge,
            queue,
            metrics,
            next_block: start_block,
            poll_interval,
        }
    }

    /// Next source block that will be scanned
    pub fn next_block(&self) -> u64 {
        self.next_block
    }

    /// Enqueue the events that still need an Ethereum attestation. Returns
    /// how many were enqueued.
    ///
    /// A failed confirmation read enqueues the event anyway; the processor
    /// re-checks before submitting.
    pub async fn process_events(&self, events: Vec<UnlockEvent>) -> usize {
        let mut enqueued = 0;
        for event in events {
            if !is_eligible(&event, DestinationChain::Bitcoin) {
                debug!(
                    sequence_number = %event.sequence_number,
                    chain = %event.chain,
                    "Ignoring unlock for other chain"
                );
                continue;
            }

            match self.bridge.confirmed_unlocks(event.sequence_number).await {
                Ok(true) => {
                    debug!(
                        sequence_number = %event.sequence_number,
                        "Unlock already confirmed"
                    );
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    self.metrics.record_error("watcher", e.kind());
                    warn!(
                        sequence_number = %event.sequence_number,
                        error = %e,
                        "Confirmation check failed, enqueueing anyway"
                    );
                }
            }

            let sequence_number = event.sequence_number;
            let source_block = event.source_block;
            if self.queue.enqueue(event).await {
                enqueued += 1;
                info!(
                    sequence_number = %sequence_number,
                    source_block,
                    "New unlock detected"
                );
            }
        }
        enqueued
    }

    /// Scan every finalized block not yet processed. The scan position only
    /// advances past ranges that were read successfully.
    pub async fn poll_once(&mut self) -> Result<usize> {
        let finalized = self.source.finalized_block().await?;
        let mut enqueued = 0;

        while self.next_block <= finalized {
            let from_block = self.next_block;
            let to_block = finalized.min(from_block.saturating_add(MAX_BLOCK_RANGE - 1));

            debug!(from_block, to_block, "Scanning source blocks");
            let events = self.source.unlock_events(from_block, to_block).await?;
            enqueued += self.process_events(events).await;
            self.next_block = to_block + 1;
        }

        Ok(enqueued)
    }

    /// Run until `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(start_block = self.next_block, "Unlock watcher started");

        loop {
            if let Err(e) = self.poll_once().await {
                self.metrics.record_error("watcher", e.kind());
                warn!(
                    next_block = self.next_block,
                    error = %e,
                    "Source chain poll failed, will retry"
                );
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!("Unlock watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{unlock_event, MockBridge};
    use alloy::primitives::{Bytes, U256};
    use std::sync::Mutex;

    fn unlock_log(event: &UnlockEvent) -> Log {
        let data = AssetsBridge::AssetsUnlocked {
            unlockSequenceNumber: event.sequence_number,
            recipient: event.recipient.clone(),
            token: event.token,
            amount: event.amount,
            chain: event.chain.as_u8(),
        }
        .encode_log_data();

        Log {
            inner: alloy::primitives::Log {
                address: Address::repeat_byte(0x55),
                data,
            },
            block_number: Some(event.source_block),
            ..Default::default()
        }
    }

    #[test]
    fn test_event_from_log() {
        let event = unlock_event(7);
        assert_eq!(event_from_log(&unlock_log(&event)).unwrap(), event);
    }

    #[test]
    fn test_unknown_chain_is_rejected() {
        let mut log = unlock_log(&unlock_event(7));
        let data = AssetsBridge::AssetsUnlocked {
            unlockSequenceNumber: U256::from(7u64),
            recipient: Bytes::from(vec![1]),
            token: Address::ZERO,
            amount: U256::from(1u64),
            chain: 9,
        }
        .encode_log_data();
        log.inner.data = data;

        assert_eq!(event_from_log(&log).unwrap_err().kind(), "invalid_request");
    }

    #[derive(Default)]
    struct MockSource {
        finalized: Mutex<u64>,
        events: Mutex<Vec<UnlockEvent>>,
        ranges: Mutex<Vec<(u64, u64)>>,
    }

    #[async_trait]
    impl UnlockSource for MockSource {
        async fn finalized_block(&self) -> Result<u64> {
            Ok(*self.finalized.lock().unwrap())
        }

        async fn unlock_events(&self, from_block: u64, to_block: u64) -> Result<Vec<UnlockEvent>> {
            self.ranges.lock().unwrap().push((from_block, to_block));
            Ok(self
                .events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| (from_block..=to_block).contains(&e.source_block))
                .cloned()
                .collect())
        }
    }

    struct Fixture {
        source: Arc<MockSource>,
        bridge: Arc<MockBridge>,
        queue: Arc<WithdrawalQueue>,
        watcher: UnlockWatcher,
    }

    fn fixture(start_block: u64) -> Fixture {
        let metrics = Arc::new(Metrics::new());
        let source = Arc::new(MockSource::default());
        let bridge = Arc::new(MockBridge::new());
        let queue = Arc::new(WithdrawalQueue::new(metrics.clone()));
        let watcher = UnlockWatcher::new(
            source.clone(),
            bridge.clone(),
            queue.clone(),
            metrics,
            start_block,
            Duration::from_secs(1),
        );
        Fixture {
            source,
            bridge,
            queue,
            watcher,
        }
    }

    #[tokio::test]
    async fn test_filters_other_chains_and_confirmed() {
        let f = fixture(0);
        let mut ethereum = unlock_event(1);
        ethereum.chain = DestinationChain::Ethereum;
        let confirmed = unlock_event(2);
        f.bridge.set_confirmed(confirmed.sequence_number, true);
        let pending = unlock_event(3);

        let enqueued = f
            .watcher
            .process_events(vec![ethereum, confirmed, pending.clone()])
            .await;

        assert_eq!(enqueued, 1);
        assert_eq!(f.queue.snapshot().await, vec![pending]);
    }

    #[tokio::test]
    async fn test_read_error_still_enqueues() {
        let f = fixture(0);
        f.bridge.fail_reads(true);
        assert_eq!(f.watcher.process_events(vec![unlock_event(1)]).await, 1);
    }

    #[tokio::test]
    async fn test_poll_scans_up_to_finalized_once() {
        let mut f = fixture(100);
        *f.source.events.lock().unwrap() = vec![unlock_event(1), unlock_event(5)];
        *f.source.finalized.lock().unwrap() = 103;

        assert_eq!(f.watcher.poll_once().await.unwrap(), 1);
        assert_eq!(f.watcher.next_block(), 104);
        assert_eq!(f.queue.len().await, 1);

        // nothing new finalized: no range requested
        assert_eq!(f.watcher.poll_once().await.unwrap(), 0);
        assert_eq!(f.source.ranges.lock().unwrap().len(), 1);

        *f.source.finalized.lock().unwrap() = 110;
        assert_eq!(f.watcher.poll_once().await.unwrap(), 1);
        assert_eq!(f.source.ranges.lock().unwrap()[1], (104, 110));
    }

    #[tokio::test]
    async fn test_large_gap_is_split() {
        let mut f = fixture(0);
        *f.source.finalized.lock().unwrap() = 2_500;

        f.watcher.poll_once().await.unwrap();

        assert_eq!(
            *f.source.ranges.lock().unwrap(),
            vec![(0, 999), (1_000, 1_999), (2_000, 2_500)]
        );
    }
}
