//! In-process store used as the fake in tests and for throwaway runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::ledger::account::{
    CreditAccount, DEFAULT_RENEWAL_PERIOD_SECS, Debit, Subscription, plan_refund,
};
use crate::store::{
    CounterKey, CreditStore, DebitOutcome, RateLimitStore, RefundOutcome, StoreError, StoreFuture,
};

#[derive(Default)]
struct State {
    accounts: HashMap<String, CreditAccount>,
    debits: HashMap<String, Debit>,
    refunds: HashMap<String, u64>,
    counters: HashMap<CounterKey, (u64, u64)>,
}

/// Store backed by a single mutex-guarded map set.
///
/// `set_failing(true)` makes every call return [`StoreError::Unavailable`],
/// which is how fail-closed paths are exercised.
pub struct MemoryStore {
    state: Mutex<State>,
    failing: AtomicBool,
    renewal_period_secs: u64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            failing: AtomicBool::new(false),
            renewal_period_secs: DEFAULT_RENEWAL_PERIOD_SECS,
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn put_subscription(&self, identity: &str, sub: Subscription) {
        let mut state = self.lock();
        let account = state
            .accounts
            .entry(identity.to_string())
            .or_insert_with(|| CreditAccount::empty(identity));
        account.subscriptions.retain(|s| s.id != sub.id);
        account.subscriptions.push(sub);
    }

    /// Number of committed debits, across all identities.
    pub fn debit_count(&self) -> usize {
        self.lock().debits.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store set to fail".into()));
        }
        Ok(())
    }
}

impl CreditStore for MemoryStore {
    fn load_account<'a>(&'a self, identity: &'a str, now: u64) -> StoreFuture<'a, CreditAccount> {
        Box::pin(async move {
            self.check()?;
            let mut account = self
                .lock()
                .accounts
                .get(identity)
                .cloned()
                .unwrap_or_else(|| CreditAccount::empty(identity));
            account.subscriptions.retain(|s| s.expires > now);
            account.renew_subscriptions(now, self.renewal_period_secs);
            Ok(account)
        })
    }

    fn decrement_if_sufficient<'a>(
        &'a self,
        identity: &'a str,
        amount: u64,
        attempt_id: &'a str,
        now: u64,
    ) -> StoreFuture<'a, DebitOutcome> {
        Box::pin(async move {
            self.check()?;
            let mut guard = self.lock();
            let state = &mut *guard;

            if let Some(existing) = state.debits.get(attempt_id) {
                return Ok(DebitOutcome::Committed(existing.clone()));
            }

            let account = state
                .accounts
                .entry(identity.to_string())
                .or_insert_with(|| CreditAccount::empty(identity));
            account.renew_subscriptions(now, self.renewal_period_secs);

            let Some(allocations) = account.plan_debit(amount, now) else {
                return Ok(DebitOutcome::Insufficient {
                    available: account.effective_balance(now),
                });
            };
            account.apply_debit(&allocations);

            let debit = Debit {
                attempt_id: attempt_id.to_string(),
                identity: identity.to_string(),
                amount,
                allocations,
                balance_after: account.effective_balance(now),
            };
            state.debits.insert(attempt_id.to_string(), debit.clone());
            Ok(DebitOutcome::Committed(debit))
        })
    }

    fn refund<'a>(
        &'a self,
        identity: &'a str,
        amount: u64,
        attempt_id: &'a str,
    ) -> StoreFuture<'a, RefundOutcome> {
        Box::pin(async move {
            self.check()?;
            let mut guard = self.lock();
            let state = &mut *guard;

            if state.refunds.contains_key(attempt_id) {
                return Ok(RefundOutcome::AlreadyApplied);
            }
            let Some(debit) = state.debits.get(attempt_id) else {
                return Ok(RefundOutcome::UnknownAttempt);
            };
            if debit.identity != identity {
                return Ok(RefundOutcome::UnknownAttempt);
            }

            let amount = amount.min(debit.amount);
            let restore = plan_refund(&debit.allocations, amount);
            if let Some(account) = state.accounts.get_mut(identity) {
                account.apply_refund(&restore);
            }
            state.refunds.insert(attempt_id.to_string(), amount);
            Ok(RefundOutcome::Applied { amount })
        })
    }

    fn credit<'a>(&'a self, identity: &'a str, amount: u64) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            self.check()?;
            let mut state = self.lock();
            let account = state
                .accounts
                .entry(identity.to_string())
                .or_insert_with(|| CreditAccount::empty(identity));
            account.base_credit = account.base_credit.saturating_add(amount);
            Ok(account.base_credit)
        })
    }
}

impl RateLimitStore for MemoryStore {
    fn increment_and_read<'a>(
        &'a self,
        key: &'a CounterKey,
        expires_at: u64,
    ) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            self.check()?;
            let mut state = self.lock();
            let entry = state.counters.entry(key.clone()).or_insert((0, expires_at));
            entry.0 += 1;
            Ok(entry.0)
        })
    }

    fn read<'a>(&'a self, key: &'a CounterKey) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            self.check()?;
            Ok(self.lock().counters.get(key).map_or(0, |(count, _)| *count))
        })
    }

    fn prune(&self, now: u64) -> StoreFuture<'_, usize> {
        Box::pin(async move {
            self.check()?;
            let mut state = self.lock();
            let before = state.counters.len();
            state.counters.retain(|_, (_, expires_at)| *expires_at > now);
            Ok(before - state.counters.len())
        })
    }
}
