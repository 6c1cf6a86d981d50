//! Store clients for cross-request coordination.
//!
//! Every piece of state shared between requests lives behind one of these
//! traits: the credit ledger and the admission counters. Handlers never
//! keep such state in process memory. The traits return boxed futures so
//! they can be used as `Arc<dyn CreditStore>` / `Arc<dyn RateLimitStore>`.

pub mod memory;
pub mod sqlite;

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::ledger::{CreditAccount, Debit};

pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteStore;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

// ---------------------------------------------------------------------------
// Credit store
// ---------------------------------------------------------------------------

/// Result of an atomic decrement-if-sufficient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebitOutcome {
    Committed(Debit),
    /// The balance at commit time could not cover the amount. Nothing was
    /// debited.
    Insufficient { available: u64 },
}

/// Result of a compensating refund.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RefundOutcome {
    Applied { amount: u64 },
    /// A refund for this attempt was already recorded.
    AlreadyApplied,
    /// No debit exists for this attempt (or it belongs to someone else).
    UnknownAttempt,
}

pub trait CreditStore: Send + Sync {
    /// Read-only snapshot of an account as of `now`, with lapsed
    /// subscription periods renewed in the returned view only. Unknown
    /// identities yield an empty account.
    fn load_account<'a>(&'a self, identity: &'a str, now: u64) -> StoreFuture<'a, CreditAccount>;

    /// Atomically debit `amount` if the effective balance covers it.
    ///
    /// Replaying an attempt id that already committed returns the original
    /// debit without charging again.
    fn decrement_if_sufficient<'a>(
        &'a self,
        identity: &'a str,
        amount: u64,
        attempt_id: &'a str,
        now: u64,
    ) -> StoreFuture<'a, DebitOutcome>;

    /// Atomically credit back up to `amount` of the debit recorded for
    /// `attempt_id`. At most one refund per attempt id is ever applied.
    fn refund<'a>(
        &'a self,
        identity: &'a str,
        amount: u64,
        attempt_id: &'a str,
    ) -> StoreFuture<'a, RefundOutcome>;

    /// Add to an identity's base credit, creating the account if needed.
    fn credit<'a>(&'a self, identity: &'a str, amount: u64) -> StoreFuture<'a, u64>;
}

// ---------------------------------------------------------------------------
// Rate limit store
// ---------------------------------------------------------------------------

/// Key of one admission counter bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub identity: String,
    pub tool: String,
    pub model: Option<String>,
    /// Start of the bucket, in epoch seconds.
    pub window_start: u64,
}

pub trait RateLimitStore: Send + Sync {
    /// Atomically increment the counter and return the new count. The
    /// bucket may be discarded once `expires_at` has passed.
    fn increment_and_read<'a>(&'a self, key: &'a CounterKey, expires_at: u64)
    -> StoreFuture<'a, u64>;

    /// Current count without incrementing. Missing buckets read as zero.
    fn read<'a>(&'a self, key: &'a CounterKey) -> StoreFuture<'a, u64>;

    /// Drop every bucket whose expiry is at or before `now`.
    fn prune(&self, now: u64) -> StoreFuture<'_, usize>;
}
