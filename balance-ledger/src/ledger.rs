//! Balance Ledger: atomic credit/debit over the Ledger Store
//!
//! Every mutation runs inside [`BalanceLedger::transact`], which opens a
//! bounded pessimistic transaction, runs the caller's closure against it and
//! commits. Lock conflicts are retried transparently a bounded number of times.
//!
//! # Example
//!
//! ```no_run
//! use balance_ledger::{BalanceLedger, Config, Currency, LedgerRequest, UserId};
//! use rust_decimal::Decimal;
//!
//! #[tokio::main]
//! async fn main() -> balance_ledger::Result<()> {
//!     let ledger = BalanceLedger::open(Config::default())?;
//!
//!     let user = UserId(1);
//!     ledger
//!         .credit(LedgerRequest::new(user, Currency::BRL, Decimal::from(100), "deposit"))
//!         .await?;
//!     let entry = ledger
//!         .debit(LedgerRequest::new(user, Currency::BRL, Decimal::from(30), "trade-open"))
//!         .await?;
//!     assert_eq!(entry.balance_after, Decimal::from(70));
//!
//!     Ok(())
//! }
//! ```

use crate::{
    crypto::{seal_entry, verify_chain, GENESIS_HASH},
    storage::{LedgerTxn, Storage},
    types::{
        Balance, Currency, DebitOptions, Direction, LedgerEntry, LedgerRequest, NewPayment,
        Payment, PaymentStatus, ReconciliationRecord, UserId, WebhookEvent, WebhookStatus,
    },
    Config, Error, Metrics, Result, TxnError,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Upper bound for the conflict retry delay
const MAX_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Main ledger interface
#[derive(Debug)]
pub struct BalanceLedger {
    storage: Storage,
    config: Config,
    metrics: Metrics,
}

impl BalanceLedger {
    /// Open ledger with configuration
    pub fn open(config: Config) -> Result<Self> {
        let storage = Storage::open(&config)?;
        let metrics = Metrics::new().map_err(|e| Error::Other(e.to_string()))?;

        Ok(Self {
            storage,
            config,
            metrics,
        })
    }

    /// Configuration in use
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Run `f` in one atomic transaction, retrying on lock conflicts.
    ///
    /// The closure may run more than once and must not have side effects
    /// outside the transaction. Anything it writes through the [`LedgerTxn`]
    /// commits together or not at all.
    ///
    /// Row-lock waits (up to `lock_timeout_ms` per attempt) are synchronous.
    /// On a multi-thread runtime each attempt runs under
    /// [`tokio::task::block_in_place`] so other tasks move off the waiting
    /// worker; on a current-thread runtime the wait blocks the runtime.
    pub async fn transact<T, E, F>(&self, mut f: F) -> std::result::Result<T, E>
    where
        T: Send,
        E: TxnError + fmt::Display,
        F: FnMut(&mut LedgerTxn<'_>) -> std::result::Result<T, E> + Send,
    {
        let tx_config = &self.config.transactions;
        let mut attempts = 0u32;
        let mut delay = Duration::from_millis(tx_config.retry_backoff_ms);

        loop {
            attempts += 1;

            let start = Instant::now();
            let result = run_blocking(|| self.run_once(&mut f));
            self.metrics
                .record_transaction_duration(start.elapsed().as_secs_f64());

            let err = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let retryable = err.ledger_error().map_or(false, Error::is_retryable);
            if !retryable || attempts > tx_config.max_conflict_retries {
                match err.ledger_error() {
                    Some(Error::InvalidAmount(_)) => self.metrics.record_rejection("invalid_amount"),
                    Some(Error::InsufficientBalance { .. }) => {
                        self.metrics.record_rejection("insufficient_balance")
                    }
                    _ => {}
                }
                return Err(err);
            }

            self.metrics.record_conflict_retry();
            warn!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Ledger transaction conflict, retrying"
            );
            tokio::time::sleep(delay).await;

            // Exponential backoff
            delay = (delay * 2).min(MAX_RETRY_DELAY);
        }
    }

    /// Single attempt; the rocksdb transaction never outlives this call
    fn run_once<T, E, F>(&self, f: &mut F) -> std::result::Result<T, E>
    where
        E: TxnError,
        F: FnMut(&mut LedgerTxn<'_>) -> std::result::Result<T, E>,
    {
        let mut txn = self.storage.begin();
        let value = f(&mut txn)?;
        let written = txn.take_written();
        txn.commit()?;

        for entry in &written {
            self.metrics.record_entry(entry.direction, entry.overdraft);
            info!(
                user_id = %entry.user_id,
                currency = %entry.currency,
                direction = %entry.direction,
                amount = %entry.amount,
                balance_before = %entry.balance_before,
                balance_after = %entry.balance_after,
                sequence = entry.sequence,
                "Ledger entry committed"
            );
        }

        Ok(value)
    }

    /// Credit a balance, returning the written entry
    pub async fn credit(&self, request: LedgerRequest) -> Result<LedgerEntry> {
        self.transact(|tx| tx.credit(&request)).await
    }

    /// Debit a balance, failing with `InsufficientBalance` if it would go negative
    pub async fn debit(&self, request: LedgerRequest) -> Result<LedgerEntry> {
        self.debit_with(request, DebitOptions::default()).await
    }

    /// Debit with explicit options (e.g. the negative-balance override)
    pub async fn debit_with(
        &self,
        request: LedgerRequest,
        options: DebitOptions,
    ) -> Result<LedgerEntry> {
        self.transact(|tx| tx.debit(&request, options)).await
    }

    /// Current balance snapshot (zero if never touched)
    pub fn balance(&self, user_id: UserId, currency: Currency) -> Result<Balance> {
        Ok(self
            .storage
            .get_balance(user_id, currency)?
            .unwrap_or_else(|| Balance::zero(user_id, currency)))
    }

    /// All entries for a balance, in sequence order
    pub fn entries(&self, user_id: UserId, currency: Currency) -> Result<Vec<LedgerEntry>> {
        self.storage.entries_for(user_id, currency)
    }

    /// Entries referencing a payment
    pub fn entries_for_payment(&self, payment_id: Uuid) -> Result<Vec<LedgerEntry>> {
        self.storage.entries_for_payment(payment_id)
    }

    /// Register a payment on gateway-initiated checkout
    pub async fn register_payment(&self, new: NewPayment) -> Result<Payment> {
        let payment = self
            .transact(|tx| -> Result<Payment> {
                let payment = Payment::from_new(new.clone(), Utc::now());
                tx.insert_payment(&payment)?;
                Ok(payment)
            })
            .await?;

        info!(
            payment_id = %payment.payment_id,
            user_id = %payment.user_id,
            provider = %payment.provider,
            reference = ?payment.external_reference_id,
            status = %payment.status,
            "Payment registered"
        );

        Ok(payment)
    }

    /// Payment by internal ID
    pub fn payment(&self, payment_id: Uuid) -> Result<Payment> {
        self.storage
            .get_payment(payment_id)?
            .ok_or_else(|| Error::PaymentNotFound(payment_id.to_string()))
    }

    /// Payment by gateway reference
    pub fn payment_by_reference(
        &self,
        provider: &str,
        external_reference_id: &str,
    ) -> Result<Option<Payment>> {
        self.storage
            .find_payment_by_reference(provider, external_reference_id)
    }

    /// Payments created in `[from, to)`
    pub fn payments_created_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Payment>> {
        self.storage.payments_created_between(from, to)
    }

    /// Webhook event by idempotency key
    pub fn webhook_event(&self, provider: &str, external_event_id: &str) -> Result<Option<WebhookEvent>> {
        self.storage.get_webhook_event(provider, external_event_id)
    }

    /// Webhook events in a given status
    pub fn webhook_events_with_status(&self, status: WebhookStatus) -> Result<Vec<WebhookEvent>> {
        self.storage.webhook_events_with_status(status)
    }

    /// Reconciliation records for a payment
    pub fn reconciliation_records(&self, payment_id: Uuid) -> Result<Vec<ReconciliationRecord>> {
        self.storage.reconciliation_records_for(payment_id)
    }

    /// Replay the entry chain of one balance and check it against the balance row
    pub fn audit(&self, user_id: UserId, currency: Currency) -> Result<AuditReport> {
        let balance = self.balance(user_id, currency)?;
        let entries = self.storage.entries_for(user_id, currency)?;

        let mut issues = Vec::new();

        let head = match verify_chain(&entries) {
            Ok(head) => head,
            Err(e) => {
                issues.push(e.to_string());
                entries.last().map(|e| e.entry_hash).unwrap_or(GENESIS_HASH)
            }
        };

        let mut running = Decimal::ZERO;
        for entry in &entries {
            if entry.balance_before != running {
                issues.push(format!(
                    "entry {} starts at {}, previous balance was {}",
                    entry.sequence, entry.balance_before, running
                ));
            }
            if !entry.is_arithmetic_consistent() {
                issues.push(format!("entry {} arithmetic mismatch", entry.sequence));
            }
            if entry.overdraft != (entry.balance_after < Decimal::ZERO) && entry.direction == Direction::Debit {
                issues.push(format!("entry {} overdraft flag mismatch", entry.sequence));
            }
            running = entry.balance_after;
        }

        if running != balance.amount {
            issues.push(format!(
                "replayed balance {} differs from stored {}",
                running, balance.amount
            ));
        }
        if entries.len() as u64 != balance.entry_count {
            issues.push(format!(
                "{} entries found, balance row counts {}",
                entries.len(),
                balance.entry_count
            ));
        }
        if head != balance.last_entry_hash {
            issues.push("chain head differs from balance row".to_string());
        }

        let report = AuditReport {
            user_id,
            currency,
            entry_count: entries.len() as u64,
            stored_balance: balance.amount,
            replayed_balance: running,
            head_hash: hex::encode(head),
            issues,
        };

        if report.is_consistent() {
            debug!(user_id = %user_id, currency = %currency, entries = report.entry_count, "Audit passed");
        } else {
            warn!(
                user_id = %user_id,
                currency = %currency,
                issues = ?report.issues,
                "Audit found inconsistencies"
            );
        }

        Ok(report)
    }
}

/// Result of [`BalanceLedger::audit`]
#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    /// Audited user
    pub user_id: UserId,
    /// Audited currency
    pub currency: Currency,
    /// Entries replayed
    pub entry_count: u64,
    /// Amount on the balance row
    pub stored_balance: Decimal,
    /// `balance_after` of the last entry (zero when there are none)
    pub replayed_balance: Decimal,
    /// Hex hash of the last entry
    pub head_hash: String,
    /// Everything that did not check out
    pub issues: Vec<String>,
}

impl AuditReport {
    /// No issues found
    pub fn is_consistent(&self) -> bool {
        self.issues.is_empty()
    }
}

fn validate_amount(amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(Error::InvalidAmount(amount));
    }
    Ok(())
}

/// Balance mutations and payment lifecycle inside a transaction
impl LedgerTxn<'_> {
    /// Credit inside this transaction
    pub fn credit(&mut self, request: &LedgerRequest) -> Result<LedgerEntry> {
        validate_amount(request.amount)?;

        let balance = self.lock_balance(request.user_id, request.currency)?;
        let after = balance.amount + request.amount;
        self.append(balance, Direction::Credit, request, after, false)
    }

    /// Debit inside this transaction
    pub fn debit(&mut self, request: &LedgerRequest, options: DebitOptions) -> Result<LedgerEntry> {
        validate_amount(request.amount)?;

        let balance = self.lock_balance(request.user_id, request.currency)?;
        if balance.amount < request.amount && !options.allow_negative {
            return Err(Error::InsufficientBalance {
                available: balance.amount,
                requested: request.amount,
            });
        }

        let after = balance.amount - request.amount;
        let overdraft = after < Decimal::ZERO;
        if overdraft {
            warn!(
                user_id = %request.user_id,
                currency = %request.currency,
                amount = %request.amount,
                balance_after = %after,
                "Debit takes balance below zero (override)"
            );
        }

        self.append(balance, Direction::Debit, request, after, overdraft)
    }

    /// Current balance with the row locked for the rest of the transaction
    pub fn balance(&self, user_id: UserId, currency: Currency) -> Result<Balance> {
        self.lock_balance(user_id, currency)
    }

    fn append(
        &mut self,
        mut balance: Balance,
        direction: Direction,
        request: &LedgerRequest,
        after: Decimal,
        overdraft: bool,
    ) -> Result<LedgerEntry> {
        let now = Utc::now();

        let mut entry = LedgerEntry {
            entry_id: Uuid::now_v7(),
            user_id: request.user_id,
            currency: request.currency,
            direction,
            amount: request.amount,
            balance_before: balance.amount,
            balance_after: after,
            reference: request.reference.clone(),
            description: request.description.clone(),
            overdraft,
            sequence: balance.entry_count + 1,
            prev_hash: balance.last_entry_hash,
            entry_hash: [0u8; 32],
            created_at: now,
        };
        seal_entry(&mut entry)?;

        balance.amount = after;
        balance.last_transaction_at = Some(now);
        balance.entry_count = entry.sequence;
        balance.last_entry_hash = entry.entry_hash;

        self.write_balance_and_entry(&balance, &entry)?;
        Ok(entry)
    }

    /// Move a payment to `next`, enforcing the lifecycle
    pub fn set_payment_status(&mut self, payment: &mut Payment, next: PaymentStatus) -> Result<()> {
        if !payment.status.can_transition_to(next) {
            return Err(Error::InvalidTransition(format!(
                "payment {}: {} -> {}",
                payment.payment_id, payment.status, next
            )));
        }

        payment.status = next;
        payment.updated_at = Utc::now();
        self.update_payment(payment)
    }
}

/// Run a synchronous storage call, yielding the worker when the runtime allows it
fn run_blocking<R>(f: impl FnOnce() -> R) -> R {
    use tokio::runtime::{Handle, RuntimeFlavor};

    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}
