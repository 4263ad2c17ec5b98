//! Metrics collection for observability
//!
//! Prometheus metrics for monitoring the ledger. Every collector is registered
//! only in the instance registry, so several ledgers can coexist in one process.
//!
//! # Metrics
//!
//! - `ledger_entries_total{direction}` - Ledger entries written
//! - `ledger_rejections_total{reason}` - Credits/debits rejected before writing
//! - `ledger_overdrafts_total` - Debits that took a balance below zero
//! - `ledger_conflict_retries_total` - Transactions retried after a lock conflict
//! - `ledger_transaction_duration_seconds` - Histogram of transaction latencies

use crate::types::Direction;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Entries written, by direction
    pub entries_total: IntCounterVec,

    /// Rejections, by reason
    pub rejections_total: IntCounterVec,

    /// Overdraft debits
    pub overdrafts_total: IntCounter,

    /// Conflict retries
    pub conflict_retries_total: IntCounter,

    /// Transaction duration histogram
    pub transaction_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let entries_total = IntCounterVec::new(
            Opts::new("ledger_entries_total", "Ledger entries written"),
            &["direction"],
        )?;
        registry.register(Box::new(entries_total.clone()))?;

        let rejections_total = IntCounterVec::new(
            Opts::new(
                "ledger_rejections_total",
                "Credits and debits rejected before writing",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(rejections_total.clone()))?;

        let overdrafts_total = IntCounter::new(
            "ledger_overdrafts_total",
            "Debits that took a balance below zero",
        )?;
        registry.register(Box::new(overdrafts_total.clone()))?;

        let conflict_retries_total = IntCounter::new(
            "ledger_conflict_retries_total",
            "Transactions retried after a lock conflict",
        )?;
        registry.register(Box::new(conflict_retries_total.clone()))?;

        let transaction_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ledger_transaction_duration_seconds",
                "Histogram of transaction latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(transaction_duration.clone()))?;

        Ok(Self {
            entries_total,
            rejections_total,
            overdrafts_total,
            conflict_retries_total,
            transaction_duration,
            registry,
        })
    }

    /// Record a written entry
    pub fn record_entry(&self, direction: Direction, overdraft: bool) {
        self.entries_total
            .with_label_values(&[&direction.to_string()])
            .inc();
        if overdraft {
            self.overdrafts_total.inc();
        }
    }

    /// Record a rejected mutation
    pub fn record_rejection(&self, reason: &str) {
        self.rejections_total.with_label_values(&[reason]).inc();
    }

    /// Record a conflict retry
    pub fn record_conflict_retry(&self) {
        self.conflict_retries_total.inc();
    }

    /// Record transaction duration
    pub fn record_transaction_duration(&self, duration_seconds: f64) {
        self.transaction_duration.observe(duration_seconds);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.overdrafts_total.get(), 0);
        assert_eq!(metrics.conflict_retries_total.get(), 0);
    }

    #[test]
    fn test_two_instances_do_not_collide() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.record_conflict_retry();
        assert_eq!(a.conflict_retries_total.get(), 1);
        assert_eq!(b.conflict_retries_total.get(), 0);
    }

    #[test]
    fn test_record_entry() {
        let metrics = Metrics::new().unwrap();
        metrics.record_entry(Direction::Credit, false);
        metrics.record_entry(Direction::Debit, true);

        assert_eq!(metrics.entries_total.with_label_values(&["credit"]).get(), 1);
        assert_eq!(metrics.entries_total.with_label_values(&["debit"]).get(), 1);
        assert_eq!(metrics.overdrafts_total.get(), 1);
    }

    #[test]
    fn test_record_rejection() {
        let metrics = Metrics::new().unwrap();
        metrics.record_rejection("insufficient_balance");
        assert_eq!(
            metrics
                .rejections_total
                .with_label_values(&["insufficient_balance"])
                .get(),
            1
        );
    }
}
