//! Prometheus metrics for the bridge-out validator
//!
//! A single [`Metrics`] value owns its registry and is handed to every
//! component at construction, so tests can build isolated instances.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

pub struct Metrics {
    pub events_enqueued_total: IntCounter,
    pub events_requeued_total: IntCounter,
    pub queue_depth: IntGauge,
    /// Attestation submissions by path (`individual`/`batch`/`collector`) and outcome
    pub attestations_total: IntCounterVec,
    /// Withdrawals skipped because they were already confirmed or attested
    pub attestations_skipped_total: IntCounter,
    pub finality_tracked: IntGauge,
    pub finality_settled_total: IntCounter,
    pub finality_requeued_total: IntCounter,
    pub last_finalized_block: IntGauge,
    pub signatures_received_total: IntCounter,
    pub signatures_rejected_total: IntCounterVec,
    pub errors_total: IntCounterVec,
    pub registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let events_enqueued_total = IntCounter::new(
            "bridge_out_events_enqueued_total",
            "Total number of unlock events added to the pending queue",
        )
        .expect("constant metric name is valid");

        let events_requeued_total = IntCounter::new(
            "bridge_out_events_requeued_total",
            "Total number of unlock events put back into the pending queue",
        )
        .expect("constant metric name is valid");

        let queue_depth = IntGauge::new(
            "bridge_out_queue_depth",
            "Number of unlock events waiting in the pending queue",
        )
        .expect("constant metric name is valid");

        let attestations_total = IntCounterVec::new(
            Opts::new(
                "bridge_out_attestations_total",
                "Attestation submissions by path and outcome",
            ),
            &["path", "outcome"],
        )
        .expect("constant metric name is valid");

        let attestations_skipped_total = IntCounter::new(
            "bridge_out_attestations_skipped_total",
            "Withdrawals skipped because they were already confirmed or attested",
        )
        .expect("constant metric name is valid");

        let finality_tracked = IntGauge::new(
            "bridge_out_finality_tracked",
            "Submitted withdrawals awaiting a finality check",
        )
        .expect("constant metric name is valid");

        let finality_settled_total = IntCounter::new(
            "bridge_out_finality_settled_total",
            "Withdrawals confirmed settled by the finality checker",
        )
        .expect("constant metric name is valid");

        let finality_requeued_total = IntCounter::new(
            "bridge_out_finality_requeued_total",
            "Withdrawals re-queued because they were still pending after finality",
        )
        .expect("constant metric name is valid");

        let last_finalized_block = IntGauge::new(
            "bridge_out_last_finalized_block",
            "Last finalized Ethereum block observed",
        )
        .expect("constant metric name is valid");

        let signatures_received_total = IntCounter::new(
            "bridge_out_signatures_received_total",
            "Validator signatures accepted by the collector",
        )
        .expect("constant metric name is valid");

        let signatures_rejected_total = IntCounterVec::new(
            Opts::new(
                "bridge_out_signatures_rejected_total",
                "Validator signatures rejected by the collector, by reason",
            ),
            &["reason"],
        )
        .expect("constant metric name is valid");

        let errors_total = IntCounterVec::new(
            Opts::new("bridge_out_errors_total", "Errors by stage and kind"),
            &["stage", "kind"],
        )
        .expect("constant metric name is valid");

        // Names are unique constants and registration happens once per instance
        registry
            .register(Box::new(events_enqueued_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(events_requeued_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(queue_depth.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(attestations_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(attestations_skipped_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(finality_tracked.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(finality_settled_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(finality_requeued_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(last_finalized_block.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(signatures_received_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(signatures_rejected_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(errors_total.clone()))
            .expect("metric registration must not be called twice");

        Self {
            events_enqueued_total,
            events_requeued_total,
            queue_depth,
            attestations_total,
            attestations_skipped_total,
            finality_tracked,
            finality_settled_total,
            finality_requeued_total,
            last_finalized_block,
            signatures_received_total,
            signatures_rejected_total,
            errors_total,
            registry,
        }
    }

    /// Record an attestation outcome for a submission path
    pub fn record_attestation(&self, path: &str, outcome: &str) {
        self.attestations_total
            .with_label_values(&[path, outcome])
            .inc();
    }

    pub fn record_error(&self, stage: &str, kind: &str) {
        self.errors_total.with_label_values(&[stage, kind]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instances_are_isolated() {
        let a = Metrics::new();
        let b = Metrics::new();
        a.events_enqueued_total.inc();
        assert_eq!(a.events_enqueued_total.get(), 1);
        assert_eq!(b.events_enqueued_total.get(), 0);
    }

    #[test]
    fn test_record_attestation_labels() {
        let metrics = Metrics::new();
        metrics.record_attestation("individual", "success");
        metrics.record_attestation("individual", "success");
        metrics.record_attestation("batch", "timeout");
        assert_eq!(
            metrics
                .attestations_total
                .with_label_values(&["individual", "success"])
                .get(),
            2
        );
        assert_eq!(
            metrics
                .attestations_total
                .with_label_values(&["batch", "timeout"])
                .get(),
            1
        );
    }

    #[test]
    fn test_registry_gathers_all_families() {
        let metrics = Metrics::new();
        metrics.record_error("finality", "rpc");
        let families = metrics.registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "bridge_out_errors_total"));
    }
}
