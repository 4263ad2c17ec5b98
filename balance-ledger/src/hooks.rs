//! Post-commit side effects
//!
//! Side effects run only after the ledger transaction that produced them has
//! committed. A failing side effect is logged and dropped; it never rolls back
//! or blocks the ledger mutation.

use crate::types::{Currency, UserId};
use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{error, info};

/// Affiliate-commission collaborator
#[async_trait]
pub trait AffiliateHook: Send + Sync {
    /// Called with the realized profit of a profitable close or paid invoice
    async fn on_profit(
        &self,
        user_id: UserId,
        profit: Decimal,
        currency: Currency,
    ) -> anyhow::Result<()>;
}

/// Hook that does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAffiliateHook;

#[async_trait]
impl AffiliateHook for NoopAffiliateHook {
    async fn on_profit(&self, _: UserId, _: Decimal, _: Currency) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Side effect queued inside a transaction, executed after commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostCommit {
    /// Compute affiliate commission on a profit
    AffiliateCommission {
        /// Profitable user
        user_id: UserId,
        /// Realized profit
        profit: Decimal,
        /// Currency of the profit
        currency: Currency,
    },
}

impl PostCommit {
    /// Execute the side effect, logging (never propagating) failures
    pub async fn run(&self, affiliate: &dyn AffiliateHook) {
        match self {
            PostCommit::AffiliateCommission {
                user_id,
                profit,
                currency,
            } => match affiliate.on_profit(*user_id, *profit, *currency).await {
                Ok(()) => info!(
                    user_id = %user_id,
                    profit = %profit,
                    currency = %currency,
                    "Affiliate commission hook invoked"
                ),
                Err(e) => error!(
                    user_id = %user_id,
                    profit = %profit,
                    currency = %currency,
                    error = %e,
                    "Affiliate commission hook failed"
                ),
            },
        }
    }
}

/// Run a batch of post-commit effects in order
pub async fn run_all(effects: &[PostCommit], affiliate: &dyn AffiliateHook) {
    for effect in effects {
        effect.run(affiliate).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<(UserId, Decimal, Currency)>>,
        fail: bool,
    }

    #[async_trait]
    impl AffiliateHook for Recording {
        async fn on_profit(&self, user: UserId, profit: Decimal, currency: Currency) -> anyhow::Result<()> {
            self.calls.lock().push((user, profit, currency));
            if self.fail {
                anyhow::bail!("affiliate service down");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_runs_affiliate_commission() {
        let hook = Recording::default();
        let effect = PostCommit::AffiliateCommission {
            user_id: UserId(3),
            profit: Decimal::new(1250, 2),
            currency: Currency::BRL,
        };

        run_all(&[effect], &hook).await;

        assert_eq!(
            hook.calls.lock().as_slice(),
            &[(UserId(3), Decimal::new(1250, 2), Currency::BRL)]
        );
    }

    #[tokio::test]
    async fn test_failure_is_swallowed() {
        let hook = Recording {
            fail: true,
            ..Default::default()
        };
        let effects = vec![
            PostCommit::AffiliateCommission {
                user_id: UserId(1),
                profit: Decimal::ONE,
                currency: Currency::USD,
            },
            PostCommit::AffiliateCommission {
                user_id: UserId(2),
                profit: Decimal::TWO,
                currency: Currency::USD,
            },
        ];

        // Both run even though the first fails
        run_all(&effects, &hook).await;
        assert_eq!(hook.calls.lock().len(), 2);
    }
}
