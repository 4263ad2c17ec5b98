//! Payment-versus-gateway classification
//!
//! Pure and storage-free. Amount (or currency) disagreement always wins over a
//! status disagreement.

use balance_ledger::{Classification, GatewayTransaction, Payment, PaymentStatus};
use rust_decimal::Decimal;

/// Outcome of comparing one internal Payment with its gateway counterpart
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// Classification to persist
    pub classification: Classification,
    /// Human-readable explanation
    pub notes: String,
    /// Status the internal Payment should be moved to (lag correction)
    pub status_correction: Option<PaymentStatus>,
}

impl Verdict {
    fn new(classification: Classification, notes: impl Into<String>) -> Self {
        Self {
            classification,
            notes: notes.into(),
            status_correction: None,
        }
    }
}

/// Classify one internal Payment against the gateway record sharing its reference
pub fn classify(
    payment: &Payment,
    gateway: Option<&GatewayTransaction>,
    tolerance_minor_units: i64,
) -> Verdict {
    let record = match gateway {
        Some(record) => record,
        None => {
            return Verdict::new(
                Classification::InternalOnly,
                "no gateway record for this payment",
            )
        }
    };

    let gateway_amount = match (record.currency(), record.amount_decimal()) {
        (Some(currency), Some(amount)) if currency == payment.currency => amount,
        _ => {
            return Verdict::new(
                Classification::Discrepancy,
                format!(
                    "currency mismatch: internal {}, gateway {}",
                    payment.currency, record.currency
                ),
            )
        }
    };

    let tolerance = payment.currency.minor_unit() * Decimal::from(tolerance_minor_units);
    let difference = (payment.amount - gateway_amount).abs();
    if difference > tolerance {
        return Verdict::new(
            Classification::Discrepancy,
            format!(
                "amount mismatch: internal {}, gateway {} (difference {})",
                payment.amount, gateway_amount, difference
            ),
        );
    }

    let gateway_status = match PaymentStatus::from_gateway(&record.status) {
        Some(status) => status,
        None => {
            return Verdict::new(
                Classification::ManualReview,
                format!("unknown gateway status '{}'", record.status),
            )
        }
    };

    if gateway_status == payment.status {
        return Verdict::new(Classification::Matched, "amount and status agree");
    }

    // Internal side still in flight and the gateway has moved on.
    if !payment.status.is_settled() && payment.status.can_transition_to(gateway_status) {
        return Verdict {
            classification: Classification::Matched,
            notes: format!(
                "status corrected: internal {}, gateway {}",
                payment.status, gateway_status
            ),
            status_correction: Some(gateway_status),
        };
    }

    Verdict::new(
        Classification::ManualReview,
        format!(
            "status mismatch: internal {}, gateway {}",
            payment.status, gateway_status
        ),
    )
}
