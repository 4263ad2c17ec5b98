//! Operation Gate
//!
//! Check order (first failure wins): operator flag, minimum operation size,
//! balance already below the minimum, balance after the operation below the
//! minimum, open-operation cap. `execute` repeats the whole check inside the
//! transaction that debits, against the locked balance.

use crate::config::GateConfig;
use crate::error::{Error, Result};
use crate::metrics::GateMetrics;
use crate::settings::{OperatorSettingsSource, UserSettings};
use balance_ledger::{
    AffiliateHook, BalanceLedger, Currency, DebitOptions, EntryReference, LedgerEntry,
    LedgerRequest, NoopAffiliateHook, PostCommit, UserId,
};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Why an operation was refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum DenialReason {
    /// Operator flagged the user non-operable
    NotOperable,
    /// Amount below the smallest allowed operation
    BelowMinimumOperationSize {
        /// Configured minimum
        minimum: Decimal,
    },
    /// Balance is already below the minimum to operate
    BalanceBelowMinimum {
        /// Current balance
        balance: Decimal,
        /// Required minimum
        minimum: Decimal,
    },
    /// Balance after the operation would drop below the minimum
    WouldFallBelowMinimum {
        /// Projected balance
        balance_after: Decimal,
        /// Required minimum
        minimum: Decimal,
    },
    /// User already holds the maximum number of open operations
    ConcurrencyCapReached {
        /// Open operations
        open: u32,
        /// Cap
        cap: u32,
    },
}

impl DenialReason {
    /// Stable reason code, safe to show to users
    pub fn code(&self) -> &'static str {
        match self {
            DenialReason::NotOperable => "not_operable",
            DenialReason::BelowMinimumOperationSize { .. } => "below_minimum_operation_size",
            DenialReason::BalanceBelowMinimum { .. } => "balance_below_minimum",
            DenialReason::WouldFallBelowMinimum { .. } => "would_fall_below_minimum",
            DenialReason::ConcurrencyCapReached { .. } => "concurrency_cap_reached",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenialReason::NotOperable => write!(f, "user is not allowed to operate"),
            DenialReason::BelowMinimumOperationSize { minimum } => {
                write!(f, "amount is below the minimum operation size {}", minimum)
            }
            DenialReason::BalanceBelowMinimum { balance, minimum } => {
                write!(f, "balance {} is below minimum {}", balance, minimum)
            }
            DenialReason::WouldFallBelowMinimum {
                balance_after,
                minimum,
            } => write!(
                f,
                "would fall below minimum: balance after {} < {}",
                balance_after, minimum
            ),
            DenialReason::ConcurrencyCapReached { open, cap } => {
                write!(f, "{} of {} concurrent operations already open", open, cap)
            }
        }
    }
}

/// Result of a `can_operate` check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationAuthorization {
    /// Whether the operation may proceed
    pub allowed: bool,
    /// First failing check, when denied
    pub reason: Option<DenialReason>,
    /// Balance the check saw
    pub balance: Decimal,
    /// Effective minimum balance to operate
    pub minimum_required: Decimal,
    /// Projected balance after the operation
    pub balance_after: Decimal,
}

/// Effective minimum: user override, then the user's per-currency minimum, then the configured default
pub fn minimum_required(config: &GateConfig, currency: Currency, settings: &UserSettings) -> Decimal {
    settings
        .override_minimum
        .or(settings.minimum_balance)
        .unwrap_or_else(|| config.default_minimum_for(currency))
}

/// Pure gate decision
///
/// A zero amount is an eligibility probe and skips the operation-size check.
pub fn evaluate(
    config: &GateConfig,
    currency: Currency,
    amount: Decimal,
    balance: Decimal,
    settings: &UserSettings,
) -> OperationAuthorization {
    let minimum = minimum_required(config, currency, settings);
    let balance_after = balance - amount;

    let reason = if !settings.operable {
        Some(DenialReason::NotOperable)
    } else if amount > Decimal::ZERO && amount < config.min_operation_size {
        Some(DenialReason::BelowMinimumOperationSize {
            minimum: config.min_operation_size,
        })
    } else if balance < minimum {
        Some(DenialReason::BalanceBelowMinimum { balance, minimum })
    } else if balance_after < minimum {
        Some(DenialReason::WouldFallBelowMinimum {
            balance_after,
            minimum,
        })
    } else if settings.open_operations >= config.max_concurrent_operations {
        Some(DenialReason::ConcurrencyCapReached {
            open: settings.open_operations,
            cap: config.max_concurrent_operations,
        })
    } else {
        None
    };

    OperationAuthorization {
        allowed: reason.is_none(),
        reason,
        balance,
        minimum_required: minimum,
        balance_after,
    }
}

/// A balance-consuming operation
#[derive(Debug, Clone)]
pub struct OperationRequest {
    /// Owner
    pub user_id: UserId,
    /// Currency
    pub currency: Currency,
    /// Amount to spend
    pub amount: Decimal,
    /// Caller's operation identifier (e.g. a trade ID)
    pub reference: String,
}

impl OperationRequest {
    /// Build a request
    pub fn new(
        user_id: UserId,
        currency: Currency,
        amount: Decimal,
        reference: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            currency,
            amount,
            reference: reference.into(),
        }
    }
}

/// Result of closing an operation
#[derive(Debug, Clone)]
pub struct CloseOutcome {
    /// Credit entry, `None` when nothing came back
    pub entry: Option<LedgerEntry>,
    /// `returned - stake`; negative on a loss
    pub profit: Decimal,
}

/// Operation gate
pub struct OperationGate {
    ledger: Arc<BalanceLedger>,
    settings: Arc<dyn OperatorSettingsSource>,
    affiliate: Arc<dyn AffiliateHook>,
    config: GateConfig,
    metrics: GateMetrics,
}

impl fmt::Debug for OperationGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationGate")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OperationGate {
    /// Gate with no affiliate hook
    pub fn new(
        ledger: Arc<BalanceLedger>,
        settings: Arc<dyn OperatorSettingsSource>,
        config: GateConfig,
    ) -> Result<Self> {
        let metrics = GateMetrics::new()
            .map_err(|e| Error::Config(format!("Failed to create metrics: {}", e)))?;

        Ok(Self {
            ledger,
            settings,
            affiliate: Arc::new(NoopAffiliateHook),
            config,
            metrics,
        })
    }

    /// Set the affiliate-commission hook fired on profitable closes
    pub fn with_affiliate_hook(mut self, affiliate: Arc<dyn AffiliateHook>) -> Self {
        self.affiliate = affiliate;
        self
    }

    /// Metrics collector
    pub fn metrics(&self) -> &GateMetrics {
        &self.metrics
    }

    /// Advisory check against the current balance
    pub fn can_operate(
        &self,
        user_id: UserId,
        amount: Decimal,
        currency: Currency,
    ) -> Result<OperationAuthorization> {
        if amount < Decimal::ZERO {
            return Err(balance_ledger::Error::InvalidAmount(amount).into());
        }

        let settings = self.settings.settings(user_id, currency)?;
        let balance = self.ledger.balance(user_id, currency)?.amount;
        let authorization = evaluate(&self.config, currency, amount, balance, &settings);

        self.log_decision(user_id, currency, amount, &authorization);
        Ok(authorization)
    }

    /// Re-check inside the debit transaction, then spend
    ///
    /// The entry's `balance_after` is the new balance. On any failure the
    /// operation slot taken for this call is given back.
    pub async fn execute(&self, request: &OperationRequest) -> Result<LedgerEntry> {
        let start = Instant::now();
        let (user_id, currency, amount) = (request.user_id, request.currency, request.amount);

        if amount <= Decimal::ZERO {
            self.metrics.record_execution("invalid_amount");
            return Err(balance_ledger::Error::InvalidAmount(amount).into());
        }

        let cap = self.config.max_concurrent_operations;
        let reserved = self
            .settings
            .try_reserve_slot(user_id, &request.reference, cap)
            .map_err(|e| {
                self.metrics.record_execution("failed");
                e
            })?;
        let open_before = match reserved {
            Some(open) => open,
            None => {
                // Report the earliest failing check; the cap when nothing else fails
                let authorization = self.can_operate(user_id, amount, currency)?;
                let reason = authorization
                    .reason
                    .unwrap_or(DenialReason::ConcurrencyCapReached { open: cap, cap });
                self.metrics.record_execution("denied");
                return Err(Error::Denied(reason));
            }
        };

        let ledger_request = LedgerRequest::new(user_id, currency, amount, "operation open")
            .with_reference(EntryReference::Operation(request.reference.clone()));
        let settings_source = self.settings.as_ref();
        let config = &self.config;

        let result = self
            .ledger
            .transact(|tx| -> Result<(LedgerEntry, OperationAuthorization)> {
                let mut settings = settings_source.settings(user_id, currency)?;
                settings.open_operations = open_before;

                let balance = tx.balance(user_id, currency)?.amount;
                let authorization = evaluate(config, currency, amount, balance, &settings);
                if let Some(reason) = &authorization.reason {
                    return Err(Error::Denied(reason.clone()));
                }

                let entry = tx.debit(&ledger_request, DebitOptions::default())?;
                Ok((entry, authorization))
            })
            .await;

        self.metrics
            .execute_duration
            .observe(start.elapsed().as_secs_f64());

        match result {
            Ok((entry, authorization)) => {
                self.log_decision(user_id, currency, amount, &authorization);
                self.metrics.record_execution("executed");
                info!(
                    user_id = %user_id,
                    currency = %currency,
                    amount = %amount,
                    reference = %request.reference,
                    balance_after = %entry.balance_after,
                    "Operation executed"
                );
                Ok(entry)
            }
            Err(e) => {
                self.release(user_id, &request.reference);

                match &e {
                    Error::Denied(reason) => {
                        self.metrics.record_decision(reason.code());
                        self.metrics.record_execution("denied");
                        warn!(
                            user_id = %user_id,
                            currency = %currency,
                            amount = %amount,
                            reason = reason.code(),
                            "Operation denied on re-check"
                        );
                    }
                    _ => {
                        self.metrics.record_execution("failed");
                        error!(
                            user_id = %user_id,
                            currency = %currency,
                            amount = %amount,
                            error = %e,
                            "Operation failed"
                        );
                    }
                }
                Err(e)
            }
        }
    }

    /// Credit back what an operation returned and free its slot
    ///
    /// Only an operation opened by [`OperationGate::execute`] and not yet
    /// closed can be closed; anything else fails with `OperationNotOpen`
    /// and credits nothing. If the credit fails the operation stays open so
    /// the close can be retried. A positive `returned - stake` fires the
    /// affiliate hook after commit.
    pub async fn close(
        &self,
        user_id: UserId,
        currency: Currency,
        stake: Decimal,
        returned: Decimal,
        reference: &str,
    ) -> Result<CloseOutcome> {
        if stake < Decimal::ZERO {
            return Err(balance_ledger::Error::InvalidAmount(stake).into());
        }
        if returned < Decimal::ZERO {
            return Err(balance_ledger::Error::InvalidAmount(returned).into());
        }

        if !self.settings.begin_close(user_id, reference)? {
            warn!(
                user_id = %user_id,
                reference = %reference,
                "Close for an operation that is not open"
            );
            return Err(Error::OperationNotOpen(reference.to_string()));
        }

        let entry = if returned > Decimal::ZERO {
            let request = LedgerRequest::new(user_id, currency, returned, "operation close")
                .with_reference(EntryReference::Operation(reference.to_string()));
            match self.ledger.credit(request).await {
                Ok(entry) => Some(entry),
                Err(e) => {
                    if let Err(abort_error) = self.settings.abort_close(user_id, reference) {
                        error!(
                            user_id = %user_id,
                            reference = %reference,
                            error = %abort_error,
                            "Failed to reopen operation after close failure"
                        );
                    }
                    error!(
                        user_id = %user_id,
                        reference = %reference,
                        error = %e,
                        "Operation close credit failed, operation left open"
                    );
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        self.release(user_id, reference);

        let profit = returned - stake;
        info!(
            user_id = %user_id,
            currency = %currency,
            stake = %stake,
            returned = %returned,
            profit = %profit,
            reference = %reference,
            "Operation closed"
        );

        if profit > Decimal::ZERO {
            PostCommit::AffiliateCommission {
                user_id,
                profit,
                currency,
            }
            .run(self.affiliate.as_ref())
            .await;
        }

        Ok(CloseOutcome { entry, profit })
    }

    fn release(&self, user_id: UserId, reference: &str) {
        match self.settings.release_slot(user_id, reference) {
            Ok(true) => {}
            Ok(false) => warn!(
                user_id = %user_id,
                reference = %reference,
                "Operation slot already released"
            ),
            Err(e) => error!(
                user_id = %user_id,
                reference = %reference,
                error = %e,
                "Failed to release operation slot"
            ),
        }
    }

    fn log_decision(
        &self,
        user_id: UserId,
        currency: Currency,
        amount: Decimal,
        authorization: &OperationAuthorization,
    ) {
        match &authorization.reason {
            None => {
                self.metrics.record_decision("allowed");
                info!(
                    user_id = %user_id,
                    currency = %currency,
                    amount = %amount,
                    balance = %authorization.balance,
                    minimum_required = %authorization.minimum_required,
                    "Operation check passed"
                );
            }
            Some(reason) => {
                self.metrics.record_decision(reason.code());
                warn!(
                    user_id = %user_id,
                    currency = %currency,
                    amount = %amount,
                    balance = %authorization.balance,
                    minimum_required = %authorization.minimum_required,
                    reason = reason.code(),
                    "Operation check denied"
                );
            }
        }
    }
}
