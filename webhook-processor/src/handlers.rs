//! Event handlers and the dispatch table
//!
//! Every handler has the same signature and runs inside the transaction that
//! also writes the event's terminal status. Anything a handler does to the
//! ledger or to a Payment therefore commits together with the event outcome,
//! or not at all.

use crate::{delivery::GatewayObject, Error, Result};
use balance_ledger::{
    DebitOptions, EntryReference, LedgerRequest, LedgerTxn, NewPayment, Payment, PaymentStatus,
    PaymentType, PostCommit, UserId, WebhookStatus,
};
use chrono::Utc;
use std::collections::HashMap;
use std::fmt;

/// Note recorded for event types without a handler
pub const UNHANDLED_NOTE: &str = "unhandled event type";

/// What a handler sees
#[derive(Debug)]
pub struct HandlerContext<'a> {
    /// Gateway name
    pub provider: &'a str,
    /// Event type string
    pub event_type: &'a str,
    /// Event ID
    pub event_id: &'a str,
    /// Parsed gateway object
    pub object: &'a GatewayObject,
}

/// Handler result, committed together with the event's terminal status
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOutcome {
    /// `Processed` or `Ignored`
    pub status: WebhookStatus,
    /// Human-readable description of what happened
    pub note: String,
    /// Side effects to run after commit
    pub post_commit: Vec<PostCommit>,
}

impl HandlerOutcome {
    /// Event produced effects
    pub fn processed(note: impl Into<String>) -> Self {
        Self {
            status: WebhookStatus::Processed,
            note: note.into(),
            post_commit: Vec::new(),
        }
    }

    /// Nothing to do
    pub fn ignored(note: impl Into<String>) -> Self {
        Self {
            status: WebhookStatus::Ignored,
            note: note.into(),
            post_commit: Vec::new(),
        }
    }

    /// Queue a post-commit side effect
    pub fn then(mut self, effect: PostCommit) -> Self {
        self.post_commit.push(effect);
        self
    }
}

/// Uniform handler signature
pub type Handler = fn(&mut LedgerTxn<'_>, &HandlerContext<'_>) -> Result<HandlerOutcome>;

/// Maps event type strings to handlers
#[derive(Clone)]
pub struct DispatchTable {
    handlers: HashMap<&'static str, Handler>,
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("DispatchTable").field("event_types", &types).finish()
    }
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl DispatchTable {
    /// Empty table: every event is unhandled
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Handlers for the Stripe payment events the ledger cares about
    pub fn standard() -> Self {
        let mut table = Self::empty();
        table.register("checkout.session.completed", payment_succeeded);
        table.register("payment_intent.succeeded", payment_succeeded);
        table.register("payment_intent.processing", payment_processing);
        table.register("payment_intent.payment_failed", payment_failed);
        table.register("invoice.paid", invoice_paid);
        table.register("invoice.payment_failed", invoice_payment_failed);
        table.register("charge.refunded", charge_refunded);
        table
    }

    /// Add or replace a handler
    pub fn register(&mut self, event_type: &'static str, handler: Handler) {
        self.handlers.insert(event_type, handler);
    }

    /// Run the handler for the context's event type, or report it unhandled
    pub fn dispatch(
        &self,
        tx: &mut LedgerTxn<'_>,
        ctx: &HandlerContext<'_>,
    ) -> Result<HandlerOutcome> {
        match self.handlers.get(ctx.event_type) {
            Some(handler) => handler(tx, ctx),
            None => Ok(HandlerOutcome::ignored(UNHANDLED_NOTE)),
        }
    }

    /// Whether an event type has a handler
    pub fn handles(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }
}

/// Gateway reference the Payment is keyed by
fn payment_reference<'a>(ctx: &'a HandlerContext<'_>) -> &'a str {
    match ctx.event_type {
        // Sessions wrap a payment intent; the intent ID is what reconciliation sees
        "checkout.session.completed" => ctx
            .object
            .payment_intent
            .as_deref()
            .unwrap_or(ctx.object.id.as_str()),
        _ => ctx.object.id.as_str(),
    }
}

/// Locked lookup, creating the Payment from metadata on first sighting
fn find_or_create(
    tx: &mut LedgerTxn<'_>,
    ctx: &HandlerContext<'_>,
    reference: &str,
    default_type: PaymentType,
) -> Result<Payment> {
    if let Some(payment) = tx.payment_by_reference(ctx.provider, reference)? {
        return Ok(payment);
    }

    let object = ctx.object;
    let user_id = object
        .meta("user_id")
        .and_then(|id| id.parse::<u64>().ok())
        .map(UserId)
        .ok_or_else(|| Error::UnknownPayment(format!("{}:{}", ctx.provider, reference)))?;

    let payment_type = match object.meta("payment_type") {
        Some(code) => PaymentType::parse(code).ok_or_else(|| {
            Error::MalformedPayload(format!("{}: unknown payment_type {}", object.id, code))
        })?,
        None => default_type,
    };

    let mut new = NewPayment::pending(
        user_id,
        ctx.provider,
        reference,
        payment_type,
        object.charged_amount()?,
        object.currency()?,
    );
    new.metadata = object.metadata.clone();
    new.created_at = object.created_at();

    let payment = Payment::from_new(new, Utc::now());
    tx.insert_payment(&payment)?;

    tracing::info!(
        payment_id = %payment.payment_id,
        reference = reference,
        event_id = ctx.event_id,
        "Payment created from webhook"
    );

    Ok(payment)
}

fn mark_succeeded(
    tx: &mut LedgerTxn<'_>,
    ctx: &HandlerContext<'_>,
    default_type: PaymentType,
) -> Result<(Payment, Option<HandlerOutcome>)> {
    let reference = payment_reference(ctx);
    let mut payment = find_or_create(tx, ctx, reference, default_type)?;

    if payment.status == PaymentStatus::Succeeded {
        let note = format!("payment {} already succeeded", reference);
        return Ok((payment, Some(HandlerOutcome::ignored(note))));
    }

    tx.set_payment_status(&mut payment, PaymentStatus::Succeeded)?;
    Ok((payment, None))
}

/// `checkout.session.completed`, `payment_intent.succeeded`
fn payment_succeeded(tx: &mut LedgerTxn<'_>, ctx: &HandlerContext<'_>) -> Result<HandlerOutcome> {
    let (payment, skipped) = mark_succeeded(tx, ctx, PaymentType::Prepaid)?;
    if let Some(outcome) = skipped {
        return Ok(outcome);
    }

    let mut note = format!("payment {} succeeded", payment_reference(ctx));

    if payment.payment_type == PaymentType::Prepaid && !tx.has_credit_for_payment(payment.payment_id)? {
        let entry = tx.credit(
            &LedgerRequest::new(
                payment.user_id,
                payment.currency,
                payment.amount,
                "prepaid top-up",
            )
            .with_reference(EntryReference::Payment(payment.payment_id)),
        )?;
        note.push_str(&format!(
            "; credited {} {} (balance {})",
            entry.amount, entry.currency, entry.balance_after
        ));
    }

    if let Ok(reported) = ctx.object.charged_amount() {
        if reported != payment.amount {
            note.push_str(&format!(
                "; gateway reported {} against recorded {}",
                reported, payment.amount
            ));
        }
    }

    Ok(HandlerOutcome::processed(note))
}

/// Status-only transitions; stale or out-of-order updates are ignored
fn transition(
    tx: &mut LedgerTxn<'_>,
    ctx: &HandlerContext<'_>,
    next: PaymentStatus,
    default_type: PaymentType,
) -> Result<HandlerOutcome> {
    let reference = payment_reference(ctx);
    let mut payment = find_or_create(tx, ctx, reference, default_type)?;

    if !payment.status.can_transition_to(next) {
        return Ok(HandlerOutcome::ignored(format!(
            "stale status update for {}: {} -> {}",
            reference, payment.status, next
        )));
    }

    let previous = payment.status;
    tx.set_payment_status(&mut payment, next)?;
    Ok(HandlerOutcome::processed(format!(
        "payment {} {} -> {}",
        reference, previous, next
    )))
}

/// `payment_intent.processing`
fn payment_processing(tx: &mut LedgerTxn<'_>, ctx: &HandlerContext<'_>) -> Result<HandlerOutcome> {
    transition(tx, ctx, PaymentStatus::Processing, PaymentType::Prepaid)
}

/// `payment_intent.payment_failed`
fn payment_failed(tx: &mut LedgerTxn<'_>, ctx: &HandlerContext<'_>) -> Result<HandlerOutcome> {
    transition(tx, ctx, PaymentStatus::Failed, PaymentType::Prepaid)
}

/// `invoice.paid`: subscription revenue, profit-bearing for affiliates
fn invoice_paid(tx: &mut LedgerTxn<'_>, ctx: &HandlerContext<'_>) -> Result<HandlerOutcome> {
    let (payment, skipped) = mark_succeeded(tx, ctx, PaymentType::Subscription)?;
    if let Some(outcome) = skipped {
        return Ok(outcome);
    }

    Ok(HandlerOutcome::processed(format!(
        "invoice {} paid ({} {})",
        ctx.object.id, payment.amount, payment.currency
    ))
    .then(PostCommit::AffiliateCommission {
        user_id: payment.user_id,
        profit: payment.amount,
        currency: payment.currency,
    }))
}

/// `invoice.payment_failed`
fn invoice_payment_failed(tx: &mut LedgerTxn<'_>, ctx: &HandlerContext<'_>) -> Result<HandlerOutcome> {
    transition(tx, ctx, PaymentStatus::Failed, PaymentType::Subscription)
}

/// `charge.refunded`: record a refund Payment and take the money back
fn charge_refunded(tx: &mut LedgerTxn<'_>, ctx: &HandlerContext<'_>) -> Result<HandlerOutcome> {
    let object = ctx.object;
    let original_reference = object.payment_intent.as_deref().ok_or_else(|| {
        Error::MalformedPayload(format!("{}: charge without payment_intent", object.id))
    })?;

    let original = tx
        .payment_by_reference(ctx.provider, original_reference)?
        .ok_or_else(|| Error::UnknownPayment(format!("{}:{}", ctx.provider, original_reference)))?;

    if tx.payment_by_reference(ctx.provider, &object.id)?.is_some() {
        return Ok(HandlerOutcome::ignored(format!(
            "refund for charge {} already recorded",
            object.id
        )));
    }

    let amount = object.refunded_amount()?;
    let currency = object.currency()?;
    if currency != original.currency {
        return Err(Error::MalformedPayload(format!(
            "{}: refund currency {} differs from payment currency {}",
            object.id, currency, original.currency
        )));
    }

    let mut new = NewPayment::pending(
        original.user_id,
        ctx.provider,
        object.id.as_str(),
        PaymentType::Refund,
        amount,
        currency,
    );
    new.status = PaymentStatus::Succeeded;
    new.metadata
        .insert("refunded_payment_id".to_string(), original.payment_id.to_string());
    new.created_at = object.created_at();

    let refund = Payment::from_new(new, Utc::now());
    tx.insert_payment(&refund)?;

    let mut note = format!("refund of {} {} for {}", amount, currency, original_reference);

    // Only prepaid top-ups ever reached the balance
    if original.payment_type == PaymentType::Prepaid && amount > rust_decimal::Decimal::ZERO {
        let entry = tx.debit(
            &LedgerRequest::new(original.user_id, currency, amount, "refund")
                .with_reference(EntryReference::Payment(refund.payment_id)),
            DebitOptions::allow_negative(),
        )?;
        note.push_str(&format!("; debited (balance {})", entry.balance_after));
    }

    Ok(HandlerOutcome::processed(note))
}
