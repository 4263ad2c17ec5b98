//! Reconciliation passes against a real ledger and an in-memory gateway

use async_trait::async_trait;
use balance_ledger::{
    BalanceLedger, Classification, Config, Currency, Direction, EntryReference, GatewayTransaction,
    LedgerRequest, NewPayment, Payment, PaymentStatus, PaymentType, UserId,
};
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use reconciliation::{
    Alert, AlertSink, Error, GatewayClient, Page, ReconciliationConfig, ReconciliationEngine,
    ReconciliationMode, ReconciliationSummary, ReportSink, Severity, TimeWindow,
};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Serves fixed records two per page
#[derive(Default)]
struct MockGateway {
    records: Mutex<Vec<GatewayTransaction>>,
    down: AtomicBool,
}

impl MockGateway {
    fn add(&self, id: &str, amount: i64, status: &str) {
        self.records.lock().push(GatewayTransaction {
            id: id.to_string(),
            amount,
            currency: "brl".to_string(),
            status: status.to_string(),
            created_at: Utc::now(),
            fee: 50,
        });
    }
}

#[async_trait]
impl GatewayClient for MockGateway {
    async fn list_transactions(
        &self,
        window: &TimeWindow,
        cursor: Option<&str>,
    ) -> reconciliation::Result<Page> {
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::GatewayUnavailable("connection refused".to_string()));
        }

        let mut records: Vec<_> = self
            .records
            .lock()
            .iter()
            .filter(|r| window.contains(r.created_at))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));

        let start = match cursor {
            Some(cursor) => records
                .iter()
                .position(|r| r.id == cursor)
                .map_or(records.len(), |i| i + 1),
            None => 0,
        };
        let data: Vec<_> = records.iter().skip(start).take(2).cloned().collect();
        let has_more = start + data.len() < records.len();

        Ok(Page {
            next_cursor: data.last().map(|r| r.id.clone()),
            data,
            has_more,
        })
    }
}

#[derive(Default)]
struct RecordingAlerts {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlerts {
    fn types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.alerts.lock().iter().map(|a| a.alert_type.clone()).collect();
        types.sort();
        types
    }
}

#[async_trait]
impl AlertSink for RecordingAlerts {
    async fn send(&self, alert: Alert) -> anyhow::Result<()> {
        self.alerts.lock().push(alert);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingReports {
    summaries: Mutex<Vec<ReconciliationSummary>>,
}

#[async_trait]
impl ReportSink for RecordingReports {
    async fn publish(&self, summary: ReconciliationSummary) -> anyhow::Result<()> {
        self.summaries.lock().push(summary);
        Ok(())
    }
}

struct Fixture {
    ledger: Arc<BalanceLedger>,
    gateway: Arc<MockGateway>,
    alerts: Arc<RecordingAlerts>,
    reports: Arc<RecordingReports>,
    engine: ReconciliationEngine,
    _temp: TempDir,
}

fn fixture() -> Fixture {
    let temp = TempDir::new().unwrap();
    let mut config = Config::default();
    config.data_dir = temp.path().to_path_buf();
    let ledger = Arc::new(BalanceLedger::open(config).unwrap());

    let gateway = Arc::new(MockGateway::default());
    let alerts = Arc::new(RecordingAlerts::default());
    let reports = Arc::new(RecordingReports::default());

    let engine = ReconciliationEngine::new(
        ledger.clone(),
        gateway.clone(),
        ReconciliationConfig::default(),
    )
    .unwrap()
    .with_alert_sink(alerts.clone())
    .with_report_sink(reports.clone());

    Fixture {
        ledger,
        gateway,
        alerts,
        reports,
        engine,
        _temp: temp,
    }
}

fn window_around_now() -> TimeWindow {
    let now = Utc::now();
    TimeWindow::new(now - Duration::hours(1), now + Duration::hours(1)).unwrap()
}

async fn payment(
    ledger: &BalanceLedger,
    reference: &str,
    cents: i64,
    payment_type: PaymentType,
    status: PaymentStatus,
) -> Payment {
    let mut new = NewPayment::pending(
        UserId(1),
        "stripe",
        reference,
        payment_type,
        Decimal::new(cents, 2),
        Currency::BRL,
    );
    new.status = status;
    ledger.register_payment(new).await.unwrap()
}

fn classification_of(ledger: &BalanceLedger, payment: &Payment) -> Classification {
    let records = ledger.reconciliation_records(payment.payment_id).unwrap();
    assert_eq!(records.len(), 1);
    records[0].classification
}

#[tokio::test]
async fn test_classifies_every_case() {
    let f = fixture();
    let succeeded = PaymentStatus::Succeeded;

    let matched = payment(&f.ledger, "pi_a", 10000, PaymentType::Prepaid, succeeded).await;
    let discrepancy = payment(&f.ledger, "pi_b", 10050, PaymentType::Prepaid, succeeded).await;
    let review = payment(&f.ledger, "pi_c", 10000, PaymentType::Prepaid, succeeded).await;
    let internal_only = payment(&f.ledger, "pi_d", 10000, PaymentType::Prepaid, succeeded).await;

    f.gateway.add("pi_a", 10000, "succeeded");
    f.gateway.add("pi_b", 10000, "succeeded");
    f.gateway.add("pi_c", 10000, "failed");
    f.gateway.add("pi_e", 2500, "succeeded");

    let report = f
        .engine
        .reconcile(window_around_now(), ReconciliationMode::Standard)
        .await
        .unwrap();

    assert!(report.complete);
    assert_eq!(report.examined, 4);
    assert_eq!(report.matched, 1);
    assert_eq!(report.discrepancies, 1);
    assert_eq!(report.manual_review, 1);
    assert_eq!(report.internal_only, 1);
    assert_eq!(report.gateway_only, 1);

    assert_eq!(classification_of(&f.ledger, &matched), Classification::Matched);
    assert_eq!(classification_of(&f.ledger, &discrepancy), Classification::Discrepancy);
    assert_eq!(classification_of(&f.ledger, &review), Classification::ManualReview);
    assert_eq!(classification_of(&f.ledger, &internal_only), Classification::InternalOnly);

    // No ledger effects in either direction
    assert_eq!(f.ledger.balance(UserId(1), Currency::BRL).unwrap().amount, Decimal::ZERO);
    assert_eq!(f.ledger.payment(internal_only.payment_id).unwrap().status, succeeded);

    assert_eq!(
        f.alerts.types(),
        vec![
            "reconciliation_discrepancy",
            "reconciliation_gateway_only",
            "reconciliation_internal_only",
        ]
    );

    let summaries = f.reports.summaries.lock();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].total_payments, 4);
    assert_eq!(summaries[0].matched, 1);
    assert_eq!(summaries[0].discrepancies, 1);
    assert_eq!(summaries[0].volume[&Currency::BRL], Decimal::new(10000, 2));
    assert_eq!(summaries[0].fees[&Currency::BRL], Decimal::new(50, 2));

    assert_eq!(
        f.engine.metrics().classification_count(Classification::GatewayOnly),
        1
    );
}

#[tokio::test]
async fn test_reconciled_payments_are_not_examined_again() {
    let f = fixture();
    payment(&f.ledger, "pi_a", 10000, PaymentType::Prepaid, PaymentStatus::Succeeded).await;
    f.gateway.add("pi_a", 10000, "succeeded");

    let first = f
        .engine
        .reconcile(window_around_now(), ReconciliationMode::Standard)
        .await
        .unwrap();
    let second = f
        .engine
        .reconcile(window_around_now(), ReconciliationMode::Standard)
        .await
        .unwrap();

    assert_eq!(first.examined, 1);
    assert_eq!(second.examined, 0);
    // Known internally, so not reported as gateway-only
    assert_eq!(second.gateway_only, 0);
    assert!(f.alerts.types().is_empty());
}

#[tokio::test]
async fn test_deferred_credit_applied_once_across_overlapping_windows() {
    let f = fixture();
    let pending = payment(&f.ledger, "pi_lag", 5000, PaymentType::Prepaid, PaymentStatus::Pending).await;
    f.gateway.add("pi_lag", 5000, "succeeded");

    let now = Utc::now();
    let first_window = TimeWindow::new(now - Duration::hours(2), now + Duration::hours(1)).unwrap();
    let second_window = TimeWindow::new(now - Duration::hours(1), now + Duration::hours(2)).unwrap();

    let first = f
        .engine
        .reconcile(first_window, ReconciliationMode::Daily)
        .await
        .unwrap();
    let second = f
        .engine
        .reconcile(second_window, ReconciliationMode::Daily)
        .await
        .unwrap();

    assert_eq!(first.matched, 1);
    assert_eq!(first.status_corrections, 1);
    assert_eq!(first.deferred_credits, 1);
    assert_eq!(second.deferred_credits, 0);

    let entries = f.ledger.entries_for_payment(pending.payment_id).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].direction, Direction::Credit);
    assert_eq!(f.ledger.balance(UserId(1), Currency::BRL).unwrap().amount, Decimal::new(5000, 2));
    assert_eq!(
        f.ledger.payment(pending.payment_id).unwrap().status,
        PaymentStatus::Succeeded
    );
}

#[tokio::test]
async fn test_standard_mode_leaves_pending_payments_alone() {
    let f = fixture();
    let pending = payment(&f.ledger, "pi_lag", 5000, PaymentType::Prepaid, PaymentStatus::Pending).await;
    f.gateway.add("pi_lag", 5000, "succeeded");

    let report = f
        .engine
        .reconcile(window_around_now(), ReconciliationMode::Standard)
        .await
        .unwrap();

    assert_eq!(report.examined, 0);
    assert_eq!(report.gateway_only, 0);
    assert_eq!(f.ledger.payment(pending.payment_id).unwrap().status, PaymentStatus::Pending);
    assert!(f.ledger.entries_for_payment(pending.payment_id).unwrap().is_empty());
}

#[tokio::test]
async fn test_existing_credit_blocks_deferred_credit() {
    let f = fixture();
    let pending = payment(&f.ledger, "pi_lag", 5000, PaymentType::Prepaid, PaymentStatus::Pending).await;
    f.ledger
        .credit(
            LedgerRequest::new(UserId(1), Currency::BRL, Decimal::new(5000, 2), "prepaid top-up")
                .with_reference(EntryReference::Payment(pending.payment_id)),
        )
        .await
        .unwrap();
    f.gateway.add("pi_lag", 5000, "succeeded");

    let report = f
        .engine
        .reconcile(window_around_now(), ReconciliationMode::Daily)
        .await
        .unwrap();

    assert_eq!(report.status_corrections, 1);
    assert_eq!(report.deferred_credits, 0);
    assert_eq!(f.ledger.entries_for_payment(pending.payment_id).unwrap().len(), 1);
    assert_eq!(f.ledger.balance(UserId(1), Currency::BRL).unwrap().amount, Decimal::new(5000, 2));
}

#[tokio::test]
async fn test_lagging_subscription_is_corrected_without_credit() {
    let f = fixture();
    let invoice = payment(
        &f.ledger,
        "in_1",
        2990,
        PaymentType::Subscription,
        PaymentStatus::Pending,
    )
    .await;
    f.gateway.add("in_1", 2990, "paid");

    let report = f
        .engine
        .reconcile(window_around_now(), ReconciliationMode::Daily)
        .await
        .unwrap();

    assert_eq!(report.status_corrections, 1);
    assert_eq!(report.deferred_credits, 0);
    assert_eq!(f.ledger.payment(invoice.payment_id).unwrap().status, PaymentStatus::Succeeded);
    assert!(f.ledger.entries_for_payment(invoice.payment_id).unwrap().is_empty());
}

#[tokio::test]
async fn test_gateway_outage_marks_pass_incomplete() {
    let f = fixture();
    let paid = payment(&f.ledger, "pi_a", 10000, PaymentType::Prepaid, PaymentStatus::Succeeded).await;
    f.gateway.down.store(true, Ordering::SeqCst);

    let report = f
        .engine
        .reconcile(window_around_now(), ReconciliationMode::Standard)
        .await
        .unwrap();

    assert!(!report.complete);
    assert_eq!(report.examined, 0);
    assert!(f.ledger.reconciliation_records(paid.payment_id).unwrap().is_empty());

    let alerts = f.alerts.alerts.lock();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, "reconciliation_incomplete");
    assert_eq!(alerts[0].severity, Severity::Critical);
}

#[tokio::test]
async fn test_scheduled_run_alerts_on_error() {
    let f = fixture();
    let now = Utc::now();
    let empty = TimeWindow { from: now, to: now };

    let result = f
        .engine
        .run_scheduled(empty, ReconciliationMode::Standard)
        .await;

    assert!(matches!(result, Err(Error::InvalidWindow(_))));
    assert_eq!(f.alerts.types(), vec!["reconciliation_task_failed"]);
}

#[tokio::test]
async fn test_payments_outside_window_are_ignored() {
    let f = fixture();
    payment(&f.ledger, "pi_a", 10000, PaymentType::Prepaid, PaymentStatus::Succeeded).await;

    let now = Utc::now();
    let past = TimeWindow::new(now - Duration::days(2), now - Duration::days(1)).unwrap();
    let report = f
        .engine
        .reconcile(past, ReconciliationMode::Standard)
        .await
        .unwrap();

    assert!(report.complete);
    assert_eq!(report.examined, 0);
    assert_eq!(report.internal_only, 0);
}

struct UnreachableSinks;

#[async_trait]
impl AlertSink for UnreachableSinks {
    async fn send(&self, _alert: Alert) -> anyhow::Result<()> {
        anyhow::bail!("pager endpoint unreachable")
    }
}

#[async_trait]
impl ReportSink for UnreachableSinks {
    async fn publish(&self, _summary: ReconciliationSummary) -> anyhow::Result<()> {
        anyhow::bail!("report store unreachable")
    }
}

#[tokio::test]
async fn test_sink_failures_do_not_fail_the_pass() {
    let f = fixture();
    let sinks = Arc::new(UnreachableSinks);
    let engine = ReconciliationEngine::new(
        f.ledger.clone(),
        f.gateway.clone(),
        ReconciliationConfig::default(),
    )
    .unwrap()
    .with_alert_sink(sinks.clone())
    .with_report_sink(sinks);

    let off = payment(&f.ledger, "pi_b", 10000, PaymentType::Prepaid, PaymentStatus::Succeeded).await;
    f.gateway.add("pi_b", 10050, "succeeded");
    f.gateway.add("pi_z", 2000, "succeeded");

    let report = engine
        .reconcile(window_around_now(), ReconciliationMode::Standard)
        .await
        .unwrap();

    assert!(report.complete);
    assert_eq!(report.discrepancies, 1);
    assert_eq!(report.gateway_only, 1);
    assert_eq!(classification_of(&f.ledger, &off), Classification::Discrepancy);
}
