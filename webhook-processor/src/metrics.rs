//! Metrics for webhook processing
//!
//! - `webhook_outcomes_total{outcome}` - Deliveries by outcome
//! - `webhook_handler_duration_seconds` - Histogram of handler transaction latencies

use prometheus::{Histogram, HistogramOpts, IntCounterVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct WebhookMetrics {
    /// Deliveries by outcome
    pub outcomes_total: IntCounterVec,

    /// Handler duration histogram
    pub handler_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl WebhookMetrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let outcomes_total = IntCounterVec::new(
            Opts::new("webhook_outcomes_total", "Webhook deliveries by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(outcomes_total.clone()))?;

        let handler_duration = Histogram::with_opts(
            HistogramOpts::new(
                "webhook_handler_duration_seconds",
                "Histogram of handler transaction latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(handler_duration.clone()))?;

        Ok(Self {
            outcomes_total,
            handler_duration,
            registry,
        })
    }

    /// Record one delivery outcome
    pub fn record_outcome(&self, outcome: &str) {
        self.outcomes_total.with_label_values(&[outcome]).inc();
    }

    /// Count for one outcome
    pub fn outcome_count(&self, outcome: &str) -> u64 {
        self.outcomes_total.with_label_values(&[outcome]).get()
    }
}

impl Default for WebhookMetrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics")
    }
}
