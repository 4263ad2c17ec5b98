//! Metrics for reconciliation passes
//!
//! - `reconciliation_classifications_total{classification}` - Examined records by outcome
//! - `reconciliation_failures_total` - Payments whose examination errored
//! - `reconciliation_deferred_credits_total` - Credits applied by reconciliation
//! - `reconciliation_pass_duration_seconds` - Histogram of pass latencies

use balance_ledger::Classification;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct ReconciliationMetrics {
    /// Records by classification
    pub classifications_total: IntCounterVec,

    /// Failed examinations
    pub failures_total: IntCounter,

    /// Deferred credits
    pub deferred_credits_total: IntCounter,

    /// Pass duration histogram
    pub pass_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl ReconciliationMetrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let classifications_total = IntCounterVec::new(
            Opts::new(
                "reconciliation_classifications_total",
                "Reconciliation outcomes by classification",
            ),
            &["classification"],
        )?;
        registry.register(Box::new(classifications_total.clone()))?;

        let failures_total = IntCounter::new(
            "reconciliation_failures_total",
            "Payments whose examination failed",
        )?;
        registry.register(Box::new(failures_total.clone()))?;

        let deferred_credits_total = IntCounter::new(
            "reconciliation_deferred_credits_total",
            "Credits applied by reconciliation",
        )?;
        registry.register(Box::new(deferred_credits_total.clone()))?;

        let pass_duration = Histogram::with_opts(
            HistogramOpts::new(
                "reconciliation_pass_duration_seconds",
                "Histogram of reconciliation pass latencies",
            )
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]),
        )?;
        registry.register(Box::new(pass_duration.clone()))?;

        Ok(Self {
            classifications_total,
            failures_total,
            deferred_credits_total,
            pass_duration,
            registry,
        })
    }

    /// Record one classification
    pub fn record_classification(&self, classification: Classification) {
        self.classifications_total
            .with_label_values(&[classification.code()])
            .inc();
    }

    /// Count for one classification
    pub fn classification_count(&self, classification: Classification) -> u64 {
        self.classifications_total
            .with_label_values(&[classification.code()])
            .get()
    }
}

impl Default for ReconciliationMetrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_counter() {
        let metrics = ReconciliationMetrics::new().unwrap();
        metrics.record_classification(Classification::Discrepancy);
        metrics.record_classification(Classification::Discrepancy);

        assert_eq!(metrics.classification_count(Classification::Discrepancy), 2);
        assert_eq!(metrics.classification_count(Classification::Matched), 0);
    }

    #[test]
    fn test_instances_do_not_share_registry() {
        let a = ReconciliationMetrics::new().unwrap();
        let b = ReconciliationMetrics::new().unwrap();
        a.failures_total.inc();

        assert_eq!(a.failures_total.get(), 1);
        assert_eq!(b.failures_total.get(), 0);
    }
}
