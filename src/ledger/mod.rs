//! Credit ledger: affordability checks, atomic debits, idempotent refunds.

pub mod account;

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::store::{CreditStore, DebitOutcome, StoreError};

pub use self::account::{Allocation, Balance, CreditAccount, Debit, Subscription};
pub use crate::store::RefundOutcome;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("insufficient credit: {required} required, {available} available")]
    Insufficient { required: u64, available: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Per-identity credit ledger.
///
/// All mutations go through a single atomic store operation; the ledger
/// itself holds no per-identity state and never retries a failed debit.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn CreditStore>,
}

impl Ledger {
    pub fn new(store: Arc<dyn CreditStore>) -> Self {
        Self { store }
    }

    /// Effective balance breakdown as of `now`.
    pub async fn balance(&self, identity: &str, now: u64) -> Result<Balance, LedgerError> {
        let account = self.store.load_account(identity, now).await?;
        Ok(account.balance(now))
    }

    /// Read-only affordability check. Never mutates state.
    pub async fn can_consume(&self, identity: &str, cost: u64, now: u64) -> Result<bool, LedgerError> {
        let balance = self.balance(identity, now).await?;
        let ok = balance.total >= cost;
        debug!(identity, cost, available = balance.total, ok, "Credit check");
        Ok(ok)
    }

    /// Like [`can_consume`](Self::can_consume) but reports the shortfall as
    /// an error.
    pub async fn ensure_affordable(&self, identity: &str, cost: u64, now: u64) -> Result<(), LedgerError> {
        let balance = self.balance(identity, now).await?;
        if balance.total < cost {
            return Err(LedgerError::Insufficient {
                required: cost,
                available: balance.total,
            });
        }
        Ok(())
    }

    /// Debit `cost` atomically. Fails with [`LedgerError::Insufficient`]
    /// if a concurrent winner drained the balance first.
    pub async fn consume(
        &self,
        identity: &str,
        cost: u64,
        attempt_id: &str,
        now: u64,
    ) -> Result<Debit, LedgerError> {
        match self
            .store
            .decrement_if_sufficient(identity, cost, attempt_id, now)
            .await?
        {
            DebitOutcome::Committed(debit) => {
                info!(
                    identity,
                    attempt_id,
                    amount = debit.amount,
                    balance_after = debit.balance_after,
                    "Credit consumed"
                );
                Ok(debit)
            }
            DebitOutcome::Insufficient { available } => {
                warn!(identity, attempt_id, cost, available, "Debit rejected at commit");
                Err(LedgerError::Insufficient {
                    required: cost,
                    available,
                })
            }
        }
    }

    /// Compensating refund for a committed attempt. Safe to replay.
    pub async fn refund(
        &self,
        identity: &str,
        amount: u64,
        attempt_id: &str,
    ) -> Result<RefundOutcome, LedgerError> {
        let outcome = self.store.refund(identity, amount, attempt_id).await?;
        match outcome {
            RefundOutcome::Applied { amount } => {
                info!(identity, attempt_id, amount, "Credit refunded");
            }
            RefundOutcome::AlreadyApplied => {
                debug!(identity, attempt_id, "Refund already applied");
            }
            RefundOutcome::UnknownAttempt => {
                warn!(identity, attempt_id, "Refund for unknown attempt ignored");
            }
        }
        Ok(outcome)
    }

    /// Add base credit.
    pub async fn grant(&self, identity: &str, amount: u64) -> Result<u64, LedgerError> {
        Ok(self.store.credit(identity, amount).await?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
