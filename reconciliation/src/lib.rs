//! Reconciliation Engine
//!
//! Periodic batch comparison of internal Payments against the gateway's own
//! transaction list for an explicit `[from, to)` window. The caller owns the
//! schedule; the engine holds no state about when it last ran beyond the
//! Reconciliation Records it persists.
//!
//! Outcomes per payment: `matched`, `discrepancy` (amount, wins over status),
//! `manual_review` (status only), `internal_only`. Gateway records with no
//! internal payment are `gateway_only` and alert-only: nothing is ever
//! credited or reversed on their account.

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod classify;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod sinks;

// Re-exports
pub use classify::{classify, Verdict};
pub use config::{GatewayConfig, ReconciliationConfig};
pub use engine::{ReconciliationEngine, ReconciliationMode, ReconciliationReport};
pub use error::{Error, Result};
pub use gateway::{fetch_all, GatewayClient, HttpGatewayClient, Page, TimeWindow};
pub use metrics::ReconciliationMetrics;
pub use sinks::{
    Alert, AlertSink, ReconciliationSummary, ReportSink, Severity, TracingAlertSink,
    TracingReportSink,
};
