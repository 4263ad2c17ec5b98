//! Alerting and reporting hooks

use async_trait::async_trait;
use balance_ledger::Currency;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{error, info, warn};

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational
    Info,
    /// Needs an operator eventually
    Warning,
    /// Needs an operator now
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Operator-facing alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Machine-readable type ("reconciliation_discrepancy", ...)
    pub alert_type: String,
    /// Severity
    pub severity: Severity,
    /// One-line title
    pub title: String,
    /// Human-readable message
    pub message: String,
    /// Structured details
    pub structured_data: serde_json::Value,
}

impl Alert {
    /// Build an alert
    pub fn new(
        alert_type: impl Into<String>,
        severity: Severity,
        title: impl Into<String>,
        message: impl Into<String>,
        structured_data: serde_json::Value,
    ) -> Self {
        Self {
            alert_type: alert_type.into(),
            severity,
            title: title.into(),
            message: message.into(),
            structured_data,
        }
    }
}

/// Periodic summary for downstream reporting
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationSummary {
    /// Window start
    pub from: Option<DateTime<Utc>>,
    /// Window end
    pub to: Option<DateTime<Utc>>,
    /// Payments examined
    pub total_payments: u64,
    /// Matched payments
    pub matched: u64,
    /// Amount discrepancies
    pub discrepancies: u64,
    /// Gateway volume of matched payments, per currency
    pub volume: BTreeMap<Currency, Decimal>,
    /// Gateway fees of matched payments, per currency
    pub fees: BTreeMap<Currency, Decimal>,
}

impl ReconciliationSummary {
    /// Add one matched gateway amount and fee
    pub fn add_volume(&mut self, currency: Currency, amount: Decimal, fee: Decimal) {
        *self.volume.entry(currency).or_insert(Decimal::ZERO) += amount;
        *self.fees.entry(currency).or_insert(Decimal::ZERO) += fee;
    }
}

/// Receives operator alerts
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Deliver one alert
    async fn send(&self, alert: Alert) -> anyhow::Result<()>;
}

/// Receives pass summaries
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Deliver one summary
    async fn publish(&self, summary: ReconciliationSummary) -> anyhow::Result<()>;
}

/// Writes alerts to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn send(&self, alert: Alert) -> anyhow::Result<()> {
        match alert.severity {
            Severity::Critical => error!(
                alert_type = %alert.alert_type,
                data = %alert.structured_data,
                "{}: {}",
                alert.title,
                alert.message
            ),
            Severity::Warning => warn!(
                alert_type = %alert.alert_type,
                data = %alert.structured_data,
                "{}: {}",
                alert.title,
                alert.message
            ),
            Severity::Info => info!(
                alert_type = %alert.alert_type,
                data = %alert.structured_data,
                "{}: {}",
                alert.title,
                alert.message
            ),
        }
        Ok(())
    }
}

/// Writes summaries to the log as JSON
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReportSink;

#[async_trait]
impl ReportSink for TracingReportSink {
    async fn publish(&self, summary: ReconciliationSummary) -> anyhow::Result<()> {
        let json = serde_json::to_string(&summary)?;
        info!(summary = %json, "Reconciliation summary");
        Ok(())
    }
}
