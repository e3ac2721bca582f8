//! Post-submission finality tracking
//!
//! Every accepted submission is tracked until a finalized block shows it
//! settled. Work per finalized block is split in two phases: entries are
//! scheduled and collected under the lock, then checked on-chain without it.
//! Entries still pending are handed back to the withdrawal queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use alloy::primitives::B256;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::ChainView;
use crate::codec::attestation_key;
use crate::metrics::Metrics;
use crate::queue::WithdrawalQueue;
use crate::types::{FinalityCheckEntry, UnlockEvent};
use crate::validator::SettlementCheck;

/// Outcome of one finalized-block pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FinalityReport {
    pub checked: usize,
    pub settled: usize,
    pub requeued: usize,
    pub errors: usize,
}

pub struct FinalityChecker {
    entries: Mutex<HashMap<B256, FinalityCheckEntry>>,
    queue: Arc<WithdrawalQueue>,
    settlement: Arc<dyn SettlementCheck>,
    metrics: Arc<Metrics>,
    last_finalized: AtomicU64,
}

impl FinalityChecker {
    pub fn new(
        queue: Arc<WithdrawalQueue>,
        settlement: Arc<dyn SettlementCheck>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            queue,
            settlement,
            metrics,
            last_finalized: AtomicU64::new(0),
        }
    }

    /// Start tracking a submitted withdrawal. An entry already tracked under
    /// the same attestation key is kept as is, including its scheduled height.
    pub async fn track(&self, event: UnlockEvent) -> bool {
        let key = attestation_key(&event);
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, FinalityCheckEntry::new(key, event));
        self.metrics.finality_tracked.set(entries.len() as i64);
        true
    }

    pub async fn tracked_count(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn entry(&self, key: &B256) -> Option<FinalityCheckEntry> {
        self.entries.lock().await.get(key).cloned()
    }

    /// Last finalized height processed, 0 before the first block
    pub fn last_finalized_block(&self) -> u64 {
        self.last_finalized.load(Ordering::SeqCst)
    }

    /// Process one finalized block
    pub async fn on_finalized_block(&self, height: u64) -> FinalityReport {
        self.last_finalized.store(height, Ordering::SeqCst);
        self.metrics.last_finalized_block.set(height as i64);

        let due: Vec<FinalityCheckEntry> = {
            let mut entries = self.entries.lock().await;
            for entry in entries.values_mut() {
                if entry.scheduled_at_height.is_none() {
                    entry.scheduled_at_height = Some(height);
                }
            }
            entries
                .values()
                .filter(|e| e.scheduled_at_height.is_some_and(|h| h <= height))
                .cloned()
                .collect()
        };

        let mut report = FinalityReport {
            checked: due.len(),
            ..Default::default()
        };

        for entry in due {
            let sequence_number = entry.event.sequence_number;
            match self.settlement.is_pending(&entry).await {
                Err(e) => {
                    report.errors += 1;
                    self.metrics.record_error("finality", e.kind());
                    warn!(
                        sequence_number = %sequence_number,
                        attestation_key = %entry.attestation_key,
                        error = %e,
                        "Finality check failed, will retry on next finalized block"
                    );
                }
                Ok(false) => {
                    self.remove(&entry.attestation_key).await;
                    report.settled += 1;
                    self.metrics.finality_settled_total.inc();
                    info!(
                        sequence_number = %sequence_number,
                        height,
                        "Withdrawal settled after finality"
                    );
                }
                Ok(true) => {
                    self.remove(&entry.attestation_key).await;
                    self.queue.requeue(entry.event).await;
                    report.requeued += 1;
                    self.metrics.finality_requeued_total.inc();
                    warn!(
                        sequence_number = %sequence_number,
                        height,
                        "Withdrawal still pending after finality, re-queued"
                    );
                }
            }
        }

        report
    }

    async fn remove(&self, key: &B256) {
        let mut entries = self.entries.lock().await;
        entries.remove(key);
        self.metrics.finality_tracked.set(entries.len() as i64);
    }

    /// Run until `cancel` fires, processing each new finalized block
    pub async fn run(&self, chain: Arc<dyn ChainView>, cancel: CancellationToken) {
        info!("Finality checker started");
        let mut blocks = chain.watch_blocks(cancel.clone());

        while let Some(height) = blocks.next().await {
            let report = self.on_finalized_block(height).await;
            if report.checked > 0 {
                info!(
                    height,
                    checked = report.checked,
                    settled = report.settled,
                    requeued = report.requeued,
                    errors = report.errors,
                    "Finality pass complete"
                );
            } else {
                debug!(height, "Finalized block, nothing due");
            }
        }

        info!("Finality checker stopped");
    }
}
