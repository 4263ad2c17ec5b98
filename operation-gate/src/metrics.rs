//! Metrics for the operation gate
//!
//! - `gate_decisions_total{decision}` - Checks by outcome ("allowed" or a denial code)
//! - `gate_executions_total{result}` - Executions by result
//! - `gate_execute_duration_seconds` - Histogram of execute latencies

use prometheus::{Histogram, HistogramOpts, IntCounterVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct GateMetrics {
    /// Decisions by outcome
    pub decisions_total: IntCounterVec,

    /// Executions by result
    pub executions_total: IntCounterVec,

    /// Execute duration histogram
    pub execute_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl GateMetrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let decisions_total = IntCounterVec::new(
            Opts::new("gate_decisions_total", "Gate checks by decision"),
            &["decision"],
        )?;
        registry.register(Box::new(decisions_total.clone()))?;

        let executions_total = IntCounterVec::new(
            Opts::new("gate_executions_total", "Gate executions by result"),
            &["result"],
        )?;
        registry.register(Box::new(executions_total.clone()))?;

        let execute_duration = Histogram::with_opts(
            HistogramOpts::new(
                "gate_execute_duration_seconds",
                "Histogram of execute latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(execute_duration.clone()))?;

        Ok(Self {
            decisions_total,
            executions_total,
            execute_duration,
            registry,
        })
    }

    /// Record one decision
    pub fn record_decision(&self, decision: &str) {
        self.decisions_total.with_label_values(&[decision]).inc();
    }

    /// Record one execution result
    pub fn record_execution(&self, result: &str) {
        self.executions_total.with_label_values(&[result]).inc();
    }

    /// Count for one decision
    pub fn decision_count(&self, decision: &str) -> u64 {
        self.decisions_total.with_label_values(&[decision]).get()
    }
}

impl Default for GateMetrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics")
    }
}
