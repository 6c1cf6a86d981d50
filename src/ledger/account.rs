//! Credit account model and the pure arithmetic over it.
//!
//! Nothing in here touches a store. The store implementations load an
//! account, run these functions inside their atomic section, and persist
//! the result.

use serde::{Deserialize, Serialize};

/// Length of one subscription billing period (30 days).
pub const DEFAULT_RENEWAL_PERIOD_SECS: u64 = 30 * 24 * 60 * 60;

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    /// Lower tiers are drawn first when two subscriptions expire together.
    pub plan_tier: u32,
    /// Credit remaining in the current period.
    pub credit: u64,
    /// Credit granted at each renewal. Zero means the subscription never
    /// renews.
    pub plan_allotment: u64,
    pub expires: u64,
    pub period_expires: u64,
}

impl Subscription {
    /// A subscription contributes to the balance only while both its
    /// overall and its period expiry are strictly in the future.
    pub fn is_active(&self, now: u64) -> bool {
        self.expires > now && self.period_expires > now
    }

    pub fn needs_renewal(&self, now: u64) -> bool {
        self.plan_allotment > 0 && self.expires > now && self.period_expires <= now
    }

    /// Start a fresh period: reset credit to the allotment and move the
    /// period boundary forward by whole periods until it lies past `now`,
    /// never beyond `expires`. Returns whether anything changed.
    pub fn renew(&mut self, now: u64, period_secs: u64) -> bool {
        if period_secs == 0 || !self.needs_renewal(now) {
            return false;
        }
        let behind = now - self.period_expires;
        let periods = behind / period_secs + 1;
        let next = self
            .period_expires
            .saturating_add(periods.saturating_mul(period_secs));
        self.period_expires = next.min(self.expires);
        self.credit = self.plan_allotment;
        true
    }
}

// ---------------------------------------------------------------------------
// Allocation / Debit / Balance
// ---------------------------------------------------------------------------

/// One slice of a debit, naming the credit source it was drawn from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Allocation {
    Subscription { id: String, amount: u64 },
    Base { amount: u64 },
}

impl Allocation {
    pub fn amount(&self) -> u64 {
        match self {
            Self::Subscription { amount, .. } | Self::Base { amount } => *amount,
        }
    }

    fn with_amount(&self, amount: u64) -> Self {
        match self {
            Self::Subscription { id, .. } => Self::Subscription {
                id: id.clone(),
                amount,
            },
            Self::Base { .. } => Self::Base { amount },
        }
    }
}

/// A committed debit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Debit {
    pub attempt_id: String,
    pub identity: String,
    pub amount: u64,
    pub allocations: Vec<Allocation>,
    /// Effective balance right after the debit was applied.
    pub balance_after: u64,
}

/// Effective balance broken down by source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub base: u64,
    pub subscriptions: u64,
    pub total: u64,
}

// ---------------------------------------------------------------------------
// CreditAccount
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditAccount {
    pub identity: String,
    pub base_credit: u64,
    pub subscriptions: Vec<Subscription>,
}

impl CreditAccount {
    pub fn empty(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            base_credit: 0,
            subscriptions: Vec::new(),
        }
    }

    pub fn balance(&self, now: u64) -> Balance {
        let subscriptions = self
            .subscriptions
            .iter()
            .filter(|s| s.is_active(now))
            .fold(0u64, |acc, s| acc.saturating_add(s.credit));
        Balance {
            base: self.base_credit,
            subscriptions,
            total: self.base_credit.saturating_add(subscriptions),
        }
    }

    pub fn effective_balance(&self, now: u64) -> u64 {
        self.balance(now).total
    }

    /// Renew every subscription whose period has lapsed. Returns the ids of
    /// the renewed subscriptions.
    pub fn renew_subscriptions(&mut self, now: u64, period_secs: u64) -> Vec<String> {
        self.subscriptions
            .iter_mut()
            .filter_map(|s| s.renew(now, period_secs).then(|| s.id.clone()))
            .collect()
    }

    /// Decide where `amount` is drawn from, or `None` if the account cannot
    /// cover it.
    ///
    /// Active subscriptions are used first, soonest expiry first (ties go to
    /// the lower tier, then the id), and base credit last.
    pub fn plan_debit(&self, amount: u64, now: u64) -> Option<Vec<Allocation>> {
        if self.effective_balance(now) < amount {
            return None;
        }

        let mut active: Vec<&Subscription> = self
            .subscriptions
            .iter()
            .filter(|s| s.is_active(now) && s.credit > 0)
            .collect();
        active.sort_by(|a, b| {
            a.expires
                .cmp(&b.expires)
                .then(a.plan_tier.cmp(&b.plan_tier))
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut remaining = amount;
        let mut allocations = Vec::new();
        for sub in active {
            if remaining == 0 {
                break;
            }
            let take = sub.credit.min(remaining);
            allocations.push(Allocation::Subscription {
                id: sub.id.clone(),
                amount: take,
            });
            remaining -= take;
        }
        if remaining > 0 {
            allocations.push(Allocation::Base { amount: remaining });
        }
        Some(allocations)
    }

    /// Subtract a planned debit. The plan must come from `plan_debit` on
    /// this same account state.
    pub fn apply_debit(&mut self, allocations: &[Allocation]) {
        for allocation in allocations {
            match allocation {
                Allocation::Base { amount } => {
                    self.base_credit = self.base_credit.saturating_sub(*amount);
                }
                Allocation::Subscription { id, amount } => {
                    if let Some(sub) = self.subscriptions.iter_mut().find(|s| &s.id == id) {
                        sub.credit = sub.credit.saturating_sub(*amount);
                    }
                }
            }
        }
    }

    /// Add refunded slices back to their sources.
    pub fn apply_refund(&mut self, allocations: &[Allocation]) {
        for allocation in allocations {
            match allocation {
                Allocation::Base { amount } => {
                    self.base_credit = self.base_credit.saturating_add(*amount);
                }
                Allocation::Subscription { id, amount } => {
                    if let Some(sub) = self.subscriptions.iter_mut().find(|s| &s.id == id) {
                        sub.credit = sub.credit.saturating_add(*amount);
                    }
                }
            }
        }
    }
}

/// Work out which sources get credit back when `amount` of a debit is
/// refunded. Slices are returned in reverse draw order, so base credit is
/// restored before subscription credit.
pub fn plan_refund(debited: &[Allocation], amount: u64) -> Vec<Allocation> {
    let mut remaining = amount;
    let mut restored = Vec::new();
    for allocation in debited.iter().rev() {
        if remaining == 0 {
            break;
        }
        let take = allocation.amount().min(remaining);
        if take > 0 {
            restored.push(allocation.with_amount(take));
            remaining -= take;
        }
    }
    restored
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
