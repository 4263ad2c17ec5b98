//! Webhook processing against a real ledger

use async_trait::async_trait;
use balance_ledger::{
    AffiliateHook, BalanceLedger, Config, Currency, NewPayment, PaymentStatus, PaymentType,
    UserId, WebhookEvent, WebhookStatus,
};
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::Arc;
use tempfile::TempDir;
use webhook_processor::{
    Error, ProcessOutcome, WebhookConfig, WebhookDelivery, WebhookProcessor, UNHANDLED_NOTE,
};

struct Fixture {
    ledger: Arc<BalanceLedger>,
    processor: WebhookProcessor,
    _temp: TempDir,
}

fn fixture() -> Fixture {
    let temp = TempDir::new().unwrap();
    let mut config = Config::default();
    config.data_dir = temp.path().to_path_buf();
    let ledger = Arc::new(BalanceLedger::open(config).unwrap());
    let processor = WebhookProcessor::new(ledger.clone(), WebhookConfig::default()).unwrap();

    Fixture {
        ledger,
        processor,
        _temp: temp,
    }
}

fn event(event_id: &str, event_type: &str, object: serde_json::Value) -> WebhookDelivery {
    let body = serde_json::json!({
        "id": event_id,
        "type": event_type,
        "data": { "object": object },
    });
    WebhookDelivery::from_event_body("stripe", &body.to_string()).unwrap()
}

async fn register_prepaid(ledger: &BalanceLedger, user: u64, reference: &str, cents: i64) {
    ledger
        .register_payment(NewPayment::pending(
            UserId(user),
            "stripe",
            reference,
            PaymentType::Prepaid,
            Decimal::new(cents, 2),
            Currency::BRL,
        ))
        .await
        .unwrap();
}

#[derive(Default)]
struct RecordingAffiliate {
    calls: Mutex<Vec<(UserId, Decimal, Currency)>>,
    fail: bool,
}

#[async_trait]
impl AffiliateHook for RecordingAffiliate {
    async fn on_profit(&self, user: UserId, profit: Decimal, currency: Currency) -> anyhow::Result<()> {
        self.calls.lock().push((user, profit, currency));
        if self.fail {
            anyhow::bail!("affiliate service unavailable");
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_duplicate_delivery_credits_once() {
    let f = fixture();
    register_prepaid(&f.ledger, 1, "pi_1", 10000).await;

    let delivery = event(
        "evt_1",
        "payment_intent.succeeded",
        serde_json::json!({ "id": "pi_1", "amount": 10000, "currency": "brl" }),
    );

    let first = f.processor.process(delivery.clone()).await.unwrap();
    assert!(matches!(first, ProcessOutcome::Processed { .. }), "{:?}", first);

    let second = f.processor.process(delivery).await.unwrap();
    assert_eq!(
        second,
        ProcessOutcome::Duplicate {
            status: WebhookStatus::Processed
        }
    );

    let entries = f.ledger.entries(UserId(1), Currency::BRL).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].amount, Decimal::from(100));

    let logged = f.processor.event("stripe", "evt_1").unwrap().unwrap();
    assert_eq!(logged.status, WebhookStatus::Processed);
    assert_eq!(logged.attempts, 1);
    assert!(logged.processed_at.is_some());

    let payment = f.ledger.payment_by_reference("stripe", "pi_1").unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Succeeded);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicate_deliveries_credit_once() {
    let f = fixture();
    register_prepaid(&f.ledger, 2, "pi_race", 5000).await;
    let processor = Arc::new(f.processor);

    let delivery = event(
        "evt_race",
        "payment_intent.succeeded",
        serde_json::json!({ "id": "pi_race", "amount": 5000, "currency": "brl" }),
    );

    let mut handles = Vec::new();
    for _ in 0..8 {
        let processor = processor.clone();
        let delivery = delivery.clone();
        handles.push(tokio::spawn(async move { processor.process(delivery).await }));
    }

    let mut processed = 0;
    for handle in handles {
        if let ProcessOutcome::Processed { .. } = handle.await.unwrap().unwrap() {
            processed += 1;
        }
    }

    assert_eq!(processed, 1);
    assert_eq!(f.ledger.entries(UserId(2), Currency::BRL).unwrap().len(), 1);
    assert_eq!(
        f.ledger.balance(UserId(2), Currency::BRL).unwrap().amount,
        Decimal::from(50)
    );
}

#[tokio::test]
async fn test_checkout_session_creates_payment_on_first_sighting() {
    let f = fixture();

    let outcome = f
        .processor
        .process(event(
            "evt_cs",
            "checkout.session.completed",
            serde_json::json!({
                "id": "cs_1",
                "payment_intent": "pi_cs",
                "amount_total": 2500,
                "currency": "usd",
                "metadata": { "user_id": "7", "payment_type": "prepaid" },
            }),
        ))
        .await
        .unwrap();
    assert!(matches!(outcome, ProcessOutcome::Processed { .. }));

    let payment = f.ledger.payment_by_reference("stripe", "pi_cs").unwrap().unwrap();
    assert_eq!(payment.user_id, UserId(7));
    assert_eq!(payment.status, PaymentStatus::Succeeded);
    assert_eq!(
        f.ledger.balance(UserId(7), Currency::USD).unwrap().amount,
        Decimal::new(2500, 2)
    );

    // The intent event for the same payment arrives later
    let later = f
        .processor
        .process(event(
            "evt_pi",
            "payment_intent.succeeded",
            serde_json::json!({ "id": "pi_cs", "amount": 2500, "currency": "usd" }),
        ))
        .await
        .unwrap();
    assert!(matches!(later, ProcessOutcome::Ignored { .. }));
    assert_eq!(f.ledger.entries(UserId(7), Currency::USD).unwrap().len(), 1);
}

#[tokio::test]
async fn test_unhandled_event_type_is_ignored() {
    let f = fixture();

    let outcome = f
        .processor
        .process(WebhookDelivery::new(
            "stripe",
            "customer.created",
            "evt_cust",
            r#"{"anything":"goes"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ProcessOutcome::Ignored {
            note: UNHANDLED_NOTE.to_string()
        }
    );

    let logged = f.processor.event("stripe", "evt_cust").unwrap().unwrap();
    assert_eq!(logged.status, WebhookStatus::Ignored);
    assert_eq!(logged.processing_notes.as_deref(), Some(UNHANDLED_NOTE));
}

#[tokio::test]
async fn test_failed_event_is_not_retried_until_replayed() {
    let f = fixture();
    let delivery = event(
        "evt_unknown",
        "payment_intent.succeeded",
        serde_json::json!({ "id": "pi_later", "amount": 4000, "currency": "brl" }),
    );

    let outcome = f.processor.process(delivery.clone()).await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::Failed { .. }));

    let logged = f.processor.event("stripe", "evt_unknown").unwrap().unwrap();
    assert_eq!(logged.status, WebhookStatus::Failed);
    assert!(logged.processing_notes.unwrap().contains("pi_later"));

    // Redelivery does not retry
    let redelivered = f.processor.process(delivery).await.unwrap();
    assert!(matches!(redelivered, ProcessOutcome::PreviouslyFailed { .. }));
    assert_eq!(f.processor.failed_events().unwrap().len(), 1);

    // Operator registers the payment and replays
    register_prepaid(&f.ledger, 3, "pi_later", 4000).await;
    let replayed = f.processor.replay("stripe", "evt_unknown").await.unwrap();
    assert!(matches!(replayed, ProcessOutcome::Processed { .. }));
    assert_eq!(
        f.ledger.balance(UserId(3), Currency::BRL).unwrap().amount,
        Decimal::from(40)
    );

    let logged = f.processor.event("stripe", "evt_unknown").unwrap().unwrap();
    assert_eq!(logged.attempts, 2);

    // Processed events cannot be replayed
    let again = f.processor.replay("stripe", "evt_unknown").await;
    assert!(matches!(again, Err(Error::NotReplayable { .. })));
}

#[tokio::test]
async fn test_malformed_payload_marks_event_failed() {
    let f = fixture();

    let outcome = f
        .processor
        .process(WebhookDelivery::new(
            "stripe",
            "payment_intent.succeeded",
            "evt_bad",
            "{not json",
        ))
        .await
        .unwrap();
    assert!(matches!(outcome, ProcessOutcome::Failed { .. }));
    assert_eq!(f.processor.metrics().outcome_count("failed"), 1);
}

#[tokio::test]
async fn test_out_of_order_processing_after_success_is_ignored() {
    let f = fixture();
    register_prepaid(&f.ledger, 4, "pi_ooo", 1000).await;

    f.processor
        .process(event(
            "evt_ok",
            "payment_intent.succeeded",
            serde_json::json!({ "id": "pi_ooo", "amount": 1000, "currency": "brl" }),
        ))
        .await
        .unwrap();

    let late = f
        .processor
        .process(event(
            "evt_late",
            "payment_intent.processing",
            serde_json::json!({ "id": "pi_ooo", "amount": 1000, "currency": "brl" }),
        ))
        .await
        .unwrap();
    assert!(matches!(late, ProcessOutcome::Ignored { .. }));

    let payment = f.ledger.payment_by_reference("stripe", "pi_ooo").unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Succeeded);
}

#[tokio::test]
async fn test_payment_failure_then_success() {
    let f = fixture();
    register_prepaid(&f.ledger, 5, "pi_retry", 3000).await;

    let failed = f
        .processor
        .process(event(
            "evt_fail",
            "payment_intent.payment_failed",
            serde_json::json!({ "id": "pi_retry", "amount": 3000, "currency": "brl" }),
        ))
        .await
        .unwrap();
    assert!(matches!(failed, ProcessOutcome::Processed { .. }));
    assert_eq!(
        f.ledger.payment_by_reference("stripe", "pi_retry").unwrap().unwrap().status,
        PaymentStatus::Failed
    );
    assert!(f.ledger.entries(UserId(5), Currency::BRL).unwrap().is_empty());

    f.processor
        .process(event(
            "evt_succeed",
            "payment_intent.succeeded",
            serde_json::json!({ "id": "pi_retry", "amount": 3000, "currency": "brl" }),
        ))
        .await
        .unwrap();
    assert_eq!(
        f.ledger.balance(UserId(5), Currency::BRL).unwrap().amount,
        Decimal::from(30)
    );
}

#[tokio::test]
async fn test_refund_debits_with_override() {
    let f = fixture();
    register_prepaid(&f.ledger, 6, "pi_refund", 10000).await;

    f.processor
        .process(event(
            "evt_paid",
            "payment_intent.succeeded",
            serde_json::json!({ "id": "pi_refund", "amount": 10000, "currency": "brl" }),
        ))
        .await
        .unwrap();

    // User spent most of it before the refund arrived
    f.ledger
        .debit(balance_ledger::LedgerRequest::new(
            UserId(6),
            Currency::BRL,
            Decimal::from(80),
            "trade-open",
        ))
        .await
        .unwrap();

    let refund = event(
        "evt_refund",
        "charge.refunded",
        serde_json::json!({
            "id": "ch_1",
            "payment_intent": "pi_refund",
            "amount": 10000,
            "amount_refunded": 10000,
            "currency": "brl",
        }),
    );
    let outcome = f.processor.process(refund).await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::Processed { .. }), "{:?}", outcome);

    let balance = f.ledger.balance(UserId(6), Currency::BRL).unwrap();
    assert_eq!(balance.amount, Decimal::from(-80));

    let refund_payment = f.ledger.payment_by_reference("stripe", "ch_1").unwrap().unwrap();
    assert_eq!(refund_payment.payment_type, PaymentType::Refund);
    assert_eq!(refund_payment.status, PaymentStatus::Succeeded);

    let entries = f.ledger.entries(UserId(6), Currency::BRL).unwrap();
    assert!(entries.last().unwrap().overdraft);
}

#[tokio::test]
async fn test_invoice_paid_fires_affiliate_hook_after_commit() {
    let f = fixture();
    let affiliate = Arc::new(RecordingAffiliate {
        fail: true,
        ..Default::default()
    });
    let processor = f.processor.with_affiliate_hook(affiliate.clone());

    let outcome = processor
        .process(event(
            "evt_inv",
            "invoice.paid",
            serde_json::json!({
                "id": "in_1",
                "amount_paid": 4990,
                "currency": "usd",
                "metadata": { "user_id": "8" },
            }),
        ))
        .await
        .unwrap();

    // Hook failure does not undo the commit
    assert!(matches!(outcome, ProcessOutcome::Processed { .. }));
    assert_eq!(
        affiliate.calls.lock().as_slice(),
        &[(UserId(8), Decimal::new(4990, 2), Currency::USD)]
    );

    let payment = f.ledger.payment_by_reference("stripe", "in_1").unwrap().unwrap();
    assert_eq!(payment.payment_type, PaymentType::Subscription);
    assert_eq!(payment.status, PaymentStatus::Succeeded);

    // Subscriptions never touch the prepaid balance
    assert!(f.ledger.entries(UserId(8), Currency::USD).unwrap().is_empty());
}

#[tokio::test]
async fn test_stuck_processing_event_is_reported_not_retried() {
    let f = fixture();
    let stuck_at = Utc::now() - chrono::Duration::minutes(30);

    f.ledger
        .transact(|tx| -> balance_ledger::Result<()> {
            tx.put_webhook_event(&WebhookEvent {
                provider: "stripe".to_string(),
                external_event_id: "evt_stuck".to_string(),
                event_type: "payment_intent.succeeded".to_string(),
                payload: r#"{"id":"pi_stuck"}"#.to_string(),
                status: WebhookStatus::Processing,
                processing_notes: None,
                attempts: 1,
                received_at: stuck_at,
                updated_at: stuck_at,
                processed_at: None,
            })
        })
        .await
        .unwrap();

    let redelivered = f
        .processor
        .process(WebhookDelivery::new(
            "stripe",
            "payment_intent.succeeded",
            "evt_stuck",
            r#"{"id":"pi_stuck"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(redelivered, ProcessOutcome::InFlight);

    let stale = f.processor.stale_processing(Utc::now()).unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].external_event_id, "evt_stuck");

    // Not stale relative to a moment right after it got stuck
    let fresh = f
        .processor
        .stale_processing(stuck_at + chrono::Duration::seconds(10))
        .unwrap();
    assert!(fresh.is_empty());
}

#[tokio::test]
async fn test_oversized_payload_rejected() {
    let temp = TempDir::new().unwrap();
    let mut config = Config::default();
    config.data_dir = temp.path().to_path_buf();
    let ledger = Arc::new(BalanceLedger::open(config).unwrap());

    let processor = WebhookProcessor::new(
        ledger.clone(),
        WebhookConfig {
            max_payload_bytes: 16,
            ..Default::default()
        },
    )
    .unwrap();

    let result = processor
        .process(WebhookDelivery::new(
            "stripe",
            "payment_intent.succeeded",
            "evt_big",
            "x".repeat(17),
        ))
        .await;
    assert!(matches!(result, Err(Error::PayloadTooLarge { size: 17, max: 16 })));
    assert!(ledger.webhook_event("stripe", "evt_big").unwrap().is_none());
}
