//! Reconciliation Engine
//!
//! Compares internal Payments against the gateway's own records over a closed
//! window `[from, to)`. Each examined payment is classified, persisted as one
//! Reconciliation Record and, when the internal status lagged the gateway,
//! corrected in the same transaction. Nothing is ever reversed or credited on
//! the strength of a gateway-only record.

use crate::classify::{classify, Verdict};
use crate::config::ReconciliationConfig;
use crate::error::{Error, Result};
use crate::gateway::{fetch_all, GatewayClient, TimeWindow};
use crate::metrics::ReconciliationMetrics;
use crate::sinks::{
    Alert, AlertSink, ReconciliationSummary, ReportSink, Severity, TracingAlertSink,
    TracingReportSink,
};
use balance_ledger::{
    BalanceLedger, Classification, EntryReference, GatewayTransaction, LedgerRequest, Payment,
    PaymentStatus, PaymentType, ReconciliationRecord,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Which internal payments a pass examines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconciliationMode {
    /// Succeeded payments only
    Standard,
    /// Also payments still pending or processing, to catch lagging statuses
    Daily,
}

impl ReconciliationMode {
    fn examines(&self, status: PaymentStatus) -> bool {
        match self {
            ReconciliationMode::Standard => status == PaymentStatus::Succeeded,
            ReconciliationMode::Daily => matches!(
                status,
                PaymentStatus::Succeeded | PaymentStatus::Pending | PaymentStatus::Processing
            ),
        }
    }
}

/// Result of one pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    /// Report ID
    pub report_id: Uuid,
    /// Window start (inclusive)
    pub from: DateTime<Utc>,
    /// Window end (exclusive)
    pub to: DateTime<Utc>,
    /// Mode
    pub mode: ReconciliationMode,
    /// Payments that received a Reconciliation Record
    pub examined: u64,
    /// `matched`
    pub matched: u64,
    /// `discrepancy`
    pub discrepancies: u64,
    /// `manual_review`
    pub manual_review: u64,
    /// `internal_only`
    pub internal_only: u64,
    /// `gateway_only` (alert only, nothing persisted)
    pub gateway_only: u64,
    /// Payments whose examination failed
    pub failures: u64,
    /// Internal statuses moved to match the gateway
    pub status_corrections: u64,
    /// Credits applied because the internal status lagged
    pub deferred_credits: u64,
    /// Gateway fetched and every payment examined
    pub complete: bool,
    /// Error details, one per failure
    pub errors: Vec<String>,
    /// Aggregates for the report sink
    pub summary: ReconciliationSummary,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time
    pub finished_at: Option<DateTime<Utc>>,
}

impl ReconciliationReport {
    fn new(window: &TimeWindow, mode: ReconciliationMode) -> Self {
        Self {
            report_id: Uuid::now_v7(),
            from: window.from,
            to: window.to,
            mode,
            examined: 0,
            matched: 0,
            discrepancies: 0,
            manual_review: 0,
            internal_only: 0,
            gateway_only: 0,
            failures: 0,
            status_corrections: 0,
            deferred_credits: 0,
            complete: false,
            errors: Vec::new(),
            summary: ReconciliationSummary {
                from: Some(window.from),
                to: Some(window.to),
                ..ReconciliationSummary::default()
            },
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Count for one classification
    pub fn count(&self, classification: Classification) -> u64 {
        match classification {
            Classification::Matched => self.matched,
            Classification::Discrepancy => self.discrepancies,
            Classification::ManualReview => self.manual_review,
            Classification::InternalOnly => self.internal_only,
            Classification::GatewayOnly => self.gateway_only,
        }
    }

    fn tally(&mut self, classification: Classification) {
        match classification {
            Classification::Matched => self.matched += 1,
            Classification::Discrepancy => self.discrepancies += 1,
            Classification::ManualReview => self.manual_review += 1,
            Classification::InternalOnly => self.internal_only += 1,
            Classification::GatewayOnly => self.gateway_only += 1,
        }
    }

    fn fail(&mut self, detail: String) {
        self.failures += 1;
        self.errors.push(detail);
    }
}

/// What one payment's transaction did
#[derive(Debug)]
struct Examined {
    verdict: Verdict,
    corrected: bool,
    deferred_credit: bool,
}

/// Reconciliation engine
pub struct ReconciliationEngine {
    ledger: Arc<BalanceLedger>,
    gateway: Arc<dyn GatewayClient>,
    alerts: Arc<dyn AlertSink>,
    reports: Arc<dyn ReportSink>,
    config: ReconciliationConfig,
    metrics: ReconciliationMetrics,
}

impl fmt::Debug for ReconciliationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconciliationEngine")
            .field("provider", &self.config.provider)
            .field("tolerance", &self.config.amount_tolerance_minor_units)
            .finish_non_exhaustive()
    }
}

impl ReconciliationEngine {
    /// Engine with log-based alert and report sinks
    pub fn new(
        ledger: Arc<BalanceLedger>,
        gateway: Arc<dyn GatewayClient>,
        config: ReconciliationConfig,
    ) -> Result<Self> {
        let metrics = ReconciliationMetrics::new()
            .map_err(|e| Error::Config(format!("Failed to create metrics: {}", e)))?;

        Ok(Self {
            ledger,
            gateway,
            alerts: Arc::new(TracingAlertSink),
            reports: Arc::new(TracingReportSink),
            config,
            metrics,
        })
    }

    /// Replace the alert sink
    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    /// Replace the report sink
    pub fn with_report_sink(mut self, reports: Arc<dyn ReportSink>) -> Self {
        self.reports = reports;
        self
    }

    /// Metrics collector
    pub fn metrics(&self) -> &ReconciliationMetrics {
        &self.metrics
    }

    /// Run one pass over `[window.from, window.to)`
    pub async fn reconcile(
        &self,
        window: TimeWindow,
        mode: ReconciliationMode,
    ) -> Result<ReconciliationReport> {
        let window = TimeWindow::new(window.from, window.to)?;
        let start = Instant::now();
        let mut report = ReconciliationReport::new(&window, mode);

        info!(
            report_id = %report.report_id,
            from = %window.from.to_rfc3339(),
            to = %window.to.to_rfc3339(),
            ?mode,
            "Starting reconciliation"
        );

        let candidates = self.candidates(&window, mode)?;
        debug!(count = candidates.len(), "Internal payments to examine");

        let gateway_records = match fetch_all(self.gateway.as_ref(), &window).await {
            Ok(records) => records,
            Err(e) => {
                error!(report_id = %report.report_id, error = %e, "Gateway fetch failed, pass incomplete");
                report.errors.push(e.to_string());
                report.finished_at = Some(Utc::now());
                self.alert(Alert::new(
                    "reconciliation_incomplete",
                    Severity::Critical,
                    "Reconciliation incomplete",
                    format!("Gateway records could not be fetched: {}", e),
                    json!({
                        "report_id": report.report_id,
                        "from": window.from,
                        "to": window.to,
                        "error": e.to_string(),
                    }),
                ))
                .await;
                self.metrics.pass_duration.observe(start.elapsed().as_secs_f64());
                return Ok(report);
            }
        };

        let mut gateway_by_reference: HashMap<String, GatewayTransaction> = gateway_records
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();

        for payment in &candidates {
            let reference = payment.external_reference_id.as_deref().unwrap_or_default();
            let counterpart = gateway_by_reference.remove(reference);

            match self.examine(payment, counterpart.as_ref()).await {
                Ok(Some(examined)) => self.record(&mut report, payment, counterpart.as_ref(), examined).await,
                Ok(None) => debug!(payment_id = %payment.payment_id, "Already reconciled, skipping"),
                Err(e) => {
                    self.metrics.failures_total.inc();
                    error!(payment_id = %payment.payment_id, error = %e, "Failed to reconcile payment");
                    report.fail(format!("payment {}: {}", payment.payment_id, e));
                }
            }
        }

        let mut leftovers: Vec<_> = gateway_by_reference.into_values().collect();
        leftovers.sort_by(|a, b| a.id.cmp(&b.id));
        for record in leftovers {
            match self
                .ledger
                .payment_by_reference(&self.config.provider, &record.id)
            {
                // Known internally; outside this pass's selection
                Ok(Some(_)) => continue,
                Ok(None) => self.gateway_only(&mut report, &record).await,
                Err(e) => {
                    self.metrics.failures_total.inc();
                    report.fail(format!("gateway record {}: {}", record.id, e));
                }
            }
        }

        report.complete = report.failures == 0;
        report.summary.total_payments = report.examined;
        report.summary.matched = report.matched;
        report.summary.discrepancies = report.discrepancies;
        report.finished_at = Some(Utc::now());

        if report.failures > 0 {
            self.alert(Alert::new(
                "reconciliation_failures",
                Severity::Warning,
                "Reconciliation finished with failures",
                format!("{} record(s) could not be reconciled", report.failures),
                json!({
                    "report_id": report.report_id,
                    "failures": report.failures,
                    "errors": report.errors,
                }),
            ))
            .await;
        }

        if let Err(e) = self.reports.publish(report.summary.clone()).await {
            error!(report_id = %report.report_id, error = %e, "Report sink failed");
        }

        self.metrics.pass_duration.observe(start.elapsed().as_secs_f64());

        info!(
            report_id = %report.report_id,
            examined = report.examined,
            matched = report.matched,
            discrepancies = report.discrepancies,
            manual_review = report.manual_review,
            internal_only = report.internal_only,
            gateway_only = report.gateway_only,
            failures = report.failures,
            status_corrections = report.status_corrections,
            deferred_credits = report.deferred_credits,
            "Reconciliation completed"
        );

        Ok(report)
    }

    /// [`Self::reconcile`], raising a critical alert when the pass errors
    pub async fn run_scheduled(
        &self,
        window: TimeWindow,
        mode: ReconciliationMode,
    ) -> Result<ReconciliationReport> {
        match self.reconcile(window, mode).await {
            Ok(report) => Ok(report),
            Err(e) => {
                error!(error = %e, "Scheduled reconciliation failed");
                self.alert(Alert::new(
                    "reconciliation_task_failed",
                    Severity::Critical,
                    "Scheduled reconciliation failed",
                    e.to_string(),
                    json!({
                        "from": window.from,
                        "to": window.to,
                        "mode": mode,
                    }),
                ))
                .await;
                Err(e)
            }
        }
    }

    /// Payments in the window with a reference, not yet reconciled
    fn candidates(&self, window: &TimeWindow, mode: ReconciliationMode) -> Result<Vec<Payment>> {
        let mut selected = Vec::new();

        for payment in self.ledger.payments_created_between(window.from, window.to)? {
            if payment.provider != self.config.provider
                || payment.external_reference_id.is_none()
                || !mode.examines(payment.status)
            {
                continue;
            }
            if !self.ledger.reconciliation_records(payment.payment_id)?.is_empty() {
                continue;
            }
            selected.push(payment);
        }

        Ok(selected)
    }

    /// Classify, correct and persist one payment in a single transaction.
    /// `None` when a concurrent pass already recorded it.
    async fn examine(
        &self,
        snapshot: &Payment,
        counterpart: Option<&GatewayTransaction>,
    ) -> Result<Option<Examined>> {
        let payment_id = snapshot.payment_id;
        let tolerance = self.config.amount_tolerance_minor_units;

        self.ledger
            .transact(|tx| -> Result<Option<Examined>> {
                let mut payment = tx
                    .payment(payment_id)?
                    .ok_or_else(|| balance_ledger::Error::PaymentNotFound(payment_id.to_string()))?;

                if tx.has_reconciliation_record(payment_id)? {
                    return Ok(None);
                }

                let verdict = classify(&payment, counterpart, tolerance);
                let mut corrected = false;
                let mut deferred_credit = false;

                if let Some(next) = verdict.status_correction {
                    if payment.status.can_transition_to(next) {
                        tx.set_payment_status(&mut payment, next)?;
                        corrected = true;
                    }

                    if next == PaymentStatus::Succeeded
                        && payment.payment_type == PaymentType::Prepaid
                        && !tx.has_credit_for_payment(payment_id)?
                    {
                        let request = LedgerRequest::new(
                            payment.user_id,
                            payment.currency,
                            payment.amount,
                            "prepaid top-up (reconciliation)",
                        )
                        .with_reference(EntryReference::Payment(payment_id));
                        tx.credit(&request)?;
                        deferred_credit = true;
                    }
                }

                let record = ReconciliationRecord {
                    record_id: Uuid::now_v7(),
                    payment_id,
                    external_transaction_id: counterpart.map(|r| r.id.clone()),
                    gateway_amount: counterpart.and_then(GatewayTransaction::amount_decimal),
                    gateway_fee: counterpart.and_then(GatewayTransaction::fee_decimal),
                    status: verdict.classification.record_status(),
                    classification: verdict.classification,
                    notes: verdict.notes.clone(),
                    gateway_snapshot: counterpart.cloned(),
                    reconciled_at: Utc::now(),
                    reconciled_by: None,
                };
                tx.put_reconciliation_record(&record)?;

                Ok(Some(Examined {
                    verdict,
                    corrected,
                    deferred_credit,
                }))
            })
            .await
    }

    async fn record(
        &self,
        report: &mut ReconciliationReport,
        payment: &Payment,
        counterpart: Option<&GatewayTransaction>,
        examined: Examined,
    ) {
        let classification = examined.verdict.classification;

        report.examined += 1;
        report.tally(classification);
        self.metrics.record_classification(classification);

        if examined.corrected {
            report.status_corrections += 1;
        }
        if examined.deferred_credit {
            report.deferred_credits += 1;
            self.metrics.deferred_credits_total.inc();
            info!(
                payment_id = %payment.payment_id,
                user_id = %payment.user_id,
                amount = %payment.amount,
                currency = %payment.currency,
                "Deferred credit applied"
            );
        }

        if classification == Classification::Matched {
            if let Some(record) = counterpart {
                if let (Some(currency), Some(amount), Some(fee)) =
                    (record.currency(), record.amount_decimal(), record.fee_decimal())
                {
                    report.summary.add_volume(currency, amount, fee);
                }
            }
        }

        if !classification.requires_alert() {
            debug!(
                payment_id = %payment.payment_id,
                classification = %classification,
                notes = %examined.verdict.notes,
                "Payment reconciled"
            );
            return;
        }

        warn!(
            payment_id = %payment.payment_id,
            user_id = %payment.user_id,
            classification = %classification,
            notes = %examined.verdict.notes,
            "Reconciliation mismatch"
        );

        self.alert(Alert::new(
            format!("reconciliation_{}", classification.code()),
            Severity::Warning,
            format!("Payment {}", classification.code()),
            examined.verdict.notes.clone(),
            json!({
                "payment_id": payment.payment_id,
                "user_id": payment.user_id.0,
                "external_reference_id": payment.external_reference_id,
                "classification": classification.code(),
                "internal_amount": payment.amount.to_string(),
                "internal_status": payment.status.code(),
                "currency": payment.currency.code(),
                "gateway_amount": counterpart.and_then(GatewayTransaction::amount_decimal).map(|a| a.to_string()),
                "gateway_status": counterpart.map(|r| r.status.clone()),
            }),
        ))
        .await;
    }

    async fn gateway_only(&self, report: &mut ReconciliationReport, record: &GatewayTransaction) {
        report.tally(Classification::GatewayOnly);
        self.metrics.record_classification(Classification::GatewayOnly);

        warn!(
            external_transaction_id = %record.id,
            amount = record.amount,
            currency = %record.currency,
            status = %record.status,
            "Gateway record with no internal payment"
        );

        self.alert(Alert::new(
            "reconciliation_gateway_only",
            Severity::Warning,
            "Gateway record with no internal payment",
            format!(
                "Gateway transaction {} ({} {} minor units, {}) was never recorded internally; manual review required",
                record.id, record.currency, record.amount, record.status
            ),
            json!({
                "external_transaction_id": record.id,
                "amount_minor_units": record.amount,
                "currency": record.currency,
                "status": record.status,
                "created_at": record.created_at,
                "classification": Classification::GatewayOnly.code(),
            }),
        ))
        .await;
    }

    /// Deliver an alert; sink failures are logged, never propagated
    async fn alert(&self, alert: Alert) {
        let alert_type = alert.alert_type.clone();
        if let Err(e) = self.alerts.send(alert).await {
            error!(alert_type = %alert_type, error = %e, "Alert sink failed");
        }
    }
}
