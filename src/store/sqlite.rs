//! SQLite-backed credit and rate-limit store.
//!
//! Every operation runs inside one transaction on the shared connection.
//! The connection mutex serializes writers, which is what makes
//! decrement-if-sufficient and refund atomic.

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, params};

use crate::db::Database;
use crate::ledger::account::{
    Allocation, CreditAccount, DEFAULT_RENEWAL_PERIOD_SECS, Debit, Subscription, plan_refund,
};
use crate::store::{
    CounterKey, CreditStore, DebitOutcome, RateLimitStore, RefundOutcome, StoreFuture,
};

#[derive(Clone)]
pub struct SqliteStore {
    db: Database,
    renewal_period_secs: u64,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            renewal_period_secs: DEFAULT_RENEWAL_PERIOD_SECS,
        }
    }

    pub fn with_renewal_period(mut self, secs: u64) -> Self {
        self.renewal_period_secs = secs;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Insert or replace a subscription. The account row is created if it
    /// does not exist yet.
    pub fn put_subscription(&self, identity: &str, sub: &Subscription) -> Result<(), rusqlite::Error> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT OR IGNORE INTO credit_accounts (identity, base_credit) VALUES (?1, 0)",
                params![identity],
            )?;
            tx.execute(
                "INSERT OR REPLACE INTO subscriptions \
                 (id, identity, plan_tier, credit, plan_allotment, expires, period_expires) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    sub.id,
                    identity,
                    sub.plan_tier,
                    to_sql_int(sub.credit)?,
                    to_sql_int(sub.plan_allotment)?,
                    to_sql_int(sub.expires)?,
                    to_sql_int(sub.period_expires)?,
                ],
            )?;
            tx.commit()
        })
    }

    /// Register an API key hash for an identity.
    pub fn put_api_key(&self, key_hash: &str, identity: &str, label: &str) -> Result<(), rusqlite::Error> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO api_keys (key_hash, identity, label) VALUES (?1, ?2, ?3)",
                params![key_hash, identity, label],
            )?;
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

fn to_sql_int(value: u64) -> Result<i64, rusqlite::Error> {
    i64::try_from(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn from_sql_int(value: i64, column: usize) -> Result<u64, rusqlite::Error> {
    u64::try_from(value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Integer, Box::new(e)))
}

fn read_account(conn: &Connection, identity: &str, now: u64) -> Result<CreditAccount, rusqlite::Error> {
    let base: Option<i64> = conn
        .query_row(
            "SELECT base_credit FROM credit_accounts WHERE identity = ?1",
            params![identity],
            |row| row.get(0),
        )
        .optional()?;

    let mut stmt = conn.prepare_cached(
        "SELECT id, plan_tier, credit, plan_allotment, expires, period_expires \
         FROM subscriptions WHERE identity = ?1 AND expires > ?2 ORDER BY id",
    )?;
    let subscriptions = stmt
        .query_map(params![identity, to_sql_int(now)?], |row| {
            Ok(Subscription {
                id: row.get(0)?,
                plan_tier: row.get(1)?,
                credit: from_sql_int(row.get(2)?, 2)?,
                plan_allotment: from_sql_int(row.get(3)?, 3)?,
                expires: from_sql_int(row.get(4)?, 4)?,
                period_expires: from_sql_int(row.get(5)?, 5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CreditAccount {
        identity: identity.to_string(),
        base_credit: base.map(|b| from_sql_int(b, 0)).transpose()?.unwrap_or(0),
        subscriptions,
    })
}

fn read_debit(conn: &Connection, attempt_id: &str) -> Result<Option<(String, u64, Vec<Allocation>)>, rusqlite::Error> {
    conn.query_row(
        "SELECT identity, amount, allocation FROM debits WHERE attempt_id = ?1",
        params![attempt_id],
        |row| {
            let identity: String = row.get(0)?;
            let amount = from_sql_int(row.get(1)?, 1)?;
            let raw: String = row.get(2)?;
            let allocations: Vec<Allocation> = serde_json::from_str(&raw)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
            Ok((identity, amount, allocations))
        },
    )
    .optional()
}

fn write_subscription_state(conn: &Connection, sub: &Subscription) -> Result<(), rusqlite::Error> {
    conn.prepare_cached("UPDATE subscriptions SET credit = ?1, period_expires = ?2 WHERE id = ?3")?
        .execute(params![to_sql_int(sub.credit)?, to_sql_int(sub.period_expires)?, sub.id])?;
    Ok(())
}

fn write_base_credit(conn: &Connection, identity: &str, base: u64) -> Result<(), rusqlite::Error> {
    conn.prepare_cached(
        "INSERT INTO credit_accounts (identity, base_credit) VALUES (?1, ?2) \
         ON CONFLICT(identity) DO UPDATE SET base_credit = excluded.base_credit",
    )?
    .execute(params![identity, to_sql_int(base)?])?;
    Ok(())
}

// ---------------------------------------------------------------------------
// CreditStore
// ---------------------------------------------------------------------------

impl CreditStore for SqliteStore {
    fn load_account<'a>(&'a self, identity: &'a str, now: u64) -> StoreFuture<'a, CreditAccount> {
        Box::pin(async move {
            let mut account = self.db.with_conn(|conn| read_account(conn, identity, now))?;
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
            let outcome = self.db.with_conn(|conn| {
                let tx = conn.unchecked_transaction()?;

                if let Some((owner, debited, allocations)) = read_debit(&tx, attempt_id)? {
                    let account = read_account(&tx, &owner, now)?;
                    return Ok(DebitOutcome::Committed(Debit {
                        attempt_id: attempt_id.to_string(),
                        identity: owner,
                        amount: debited,
                        allocations,
                        balance_after: account.effective_balance(now),
                    }));
                }

                let mut account = read_account(&tx, identity, now)?;
                let renewed = account.renew_subscriptions(now, self.renewal_period_secs);

                let Some(allocations) = account.plan_debit(amount, now) else {
                    // Renewals are real state transitions; keep them.
                    for sub in account.subscriptions.iter().filter(|s| renewed.contains(&s.id)) {
                        write_subscription_state(&tx, sub)?;
                    }
                    tx.commit()?;
                    return Ok(DebitOutcome::Insufficient {
                        available: account.effective_balance(now),
                    });
                };

                account.apply_debit(&allocations);

                for sub in &account.subscriptions {
                    let touched = allocations.iter().any(|a| {
                        matches!(a, Allocation::Subscription { id, .. } if *id == sub.id)
                    });
                    if touched || renewed.contains(&sub.id) {
                        write_subscription_state(&tx, sub)?;
                    }
                }
                if allocations.iter().any(|a| matches!(a, Allocation::Base { .. })) {
                    write_base_credit(&tx, identity, account.base_credit)?;
                }

                let encoded = serde_json::to_string(&allocations)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                tx.execute(
                    "INSERT INTO debits (attempt_id, identity, amount, allocation) VALUES (?1, ?2, ?3, ?4)",
                    params![attempt_id, identity, to_sql_int(amount)?, encoded],
                )?;
                tx.commit()?;

                Ok(DebitOutcome::Committed(Debit {
                    attempt_id: attempt_id.to_string(),
                    identity: identity.to_string(),
                    amount,
                    allocations,
                    balance_after: account.effective_balance(now),
                }))
            })?;
            Ok(outcome)
        })
    }

    fn refund<'a>(
        &'a self,
        identity: &'a str,
        amount: u64,
        attempt_id: &'a str,
    ) -> StoreFuture<'a, RefundOutcome> {
        Box::pin(async move {
            let outcome = self.db.with_conn(|conn| {
                let tx = conn.unchecked_transaction()?;

                let already: Option<i64> = tx
                    .query_row(
                        "SELECT amount FROM refunds WHERE attempt_id = ?1",
                        params![attempt_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if already.is_some() {
                    return Ok(RefundOutcome::AlreadyApplied);
                }

                let Some((owner, debited, allocations)) = read_debit(&tx, attempt_id)? else {
                    return Ok(RefundOutcome::UnknownAttempt);
                };
                if owner != identity {
                    return Ok(RefundOutcome::UnknownAttempt);
                }

                let amount = amount.min(debited);
                for slice in plan_refund(&allocations, amount) {
                    match slice {
                        Allocation::Base { amount } => {
                            tx.execute(
                                "INSERT INTO credit_accounts (identity, base_credit) VALUES (?1, ?2) \
                                 ON CONFLICT(identity) DO UPDATE SET base_credit = base_credit + excluded.base_credit",
                                params![identity, to_sql_int(amount)?],
                            )?;
                        }
                        Allocation::Subscription { id, amount } => {
                            tx.execute(
                                "UPDATE subscriptions SET credit = credit + ?1 WHERE id = ?2",
                                params![to_sql_int(amount)?, id],
                            )?;
                        }
                    }
                }

                tx.execute(
                    "INSERT INTO refunds (attempt_id, identity, amount) VALUES (?1, ?2, ?3)",
                    params![attempt_id, identity, to_sql_int(amount)?],
                )?;
                tx.commit()?;
                Ok(RefundOutcome::Applied { amount })
            })?;
            Ok(outcome)
        })
    }

    fn credit<'a>(&'a self, identity: &'a str, amount: u64) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let base: i64 = self.db.with_conn(|conn| {
                conn.query_row(
                    "INSERT INTO credit_accounts (identity, base_credit) VALUES (?1, ?2) \
                     ON CONFLICT(identity) DO UPDATE SET base_credit = base_credit + excluded.base_credit \
                     RETURNING base_credit",
                    params![identity, to_sql_int(amount)?],
                    |row| row.get(0),
                )
            })?;
            Ok(from_sql_int(base, 0)?)
        })
    }
}

// ---------------------------------------------------------------------------
// RateLimitStore
// ---------------------------------------------------------------------------

impl RateLimitStore for SqliteStore {
    fn increment_and_read<'a>(&'a self, key: &'a CounterKey, expires_at: u64) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let count: i64 = self.db.with_conn(|conn| {
                conn.prepare_cached(
                    "INSERT INTO rate_limit_counters (identity, tool, model, window_start, count, expires_at) \
                     VALUES (?1, ?2, ?3, ?4, 1, ?5) \
                     ON CONFLICT(identity, tool, model, window_start) DO UPDATE SET count = count + 1 \
                     RETURNING count",
                )?
                .query_row(
                    params![
                        key.identity,
                        key.tool,
                        key.model.as_deref().unwrap_or(""),
                        to_sql_int(key.window_start)?,
                        to_sql_int(expires_at)?,
                    ],
                    |row| row.get(0),
                )
            })?;
            Ok(from_sql_int(count, 0)?)
        })
    }

    fn read<'a>(&'a self, key: &'a CounterKey) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let count: Option<i64> = self.db.with_conn(|conn| {
                conn.prepare_cached(
                    "SELECT count FROM rate_limit_counters \
                     WHERE identity = ?1 AND tool = ?2 AND model = ?3 AND window_start = ?4",
                )?
                .query_row(
                    params![
                        key.identity,
                        key.tool,
                        key.model.as_deref().unwrap_or(""),
                        to_sql_int(key.window_start)?,
                    ],
                    |row| row.get(0),
                )
                .optional()
            })?;
            Ok(count.map(|c| from_sql_int(c, 0)).transpose()?.unwrap_or(0))
        })
    }

    fn prune(&self, now: u64) -> StoreFuture<'_, usize> {
        Box::pin(async move {
            let removed = self.db.with_conn(|conn| {
                conn.execute(
                    "DELETE FROM rate_limit_counters WHERE expires_at <= ?1",
                    params![to_sql_int(now)?],
                )
            })?;
            Ok(removed)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
