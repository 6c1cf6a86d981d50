use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Thread-safe database handle wrapping a SQLite connection.
///
/// All writers share the one connection, so anything executed inside a
/// single `with_conn` call is serialized against every other caller.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the database at the given path with WAL mode.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Execute a closure with access to the database connection.
    ///
    /// A poisoned mutex is recovered rather than propagated: SQLite rolls
    /// back any transaction left open by the panicking holder.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, rusqlite::Error>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&conn)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })?;
        Ok(())
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS credit_accounts (
    identity    TEXT PRIMARY KEY,
    base_credit INTEGER NOT NULL DEFAULT 0 CHECK (base_credit >= 0),
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS subscriptions (
    id              TEXT PRIMARY KEY,
    identity        TEXT NOT NULL REFERENCES credit_accounts(identity) ON DELETE CASCADE,
    plan_tier       INTEGER NOT NULL DEFAULT 0,
    credit          INTEGER NOT NULL DEFAULT 0 CHECK (credit >= 0),
    plan_allotment  INTEGER NOT NULL DEFAULT 0 CHECK (plan_allotment >= 0),
    expires         INTEGER NOT NULL,
    period_expires  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_subscriptions_identity ON subscriptions(identity);

CREATE TABLE IF NOT EXISTS debits (
    attempt_id  TEXT PRIMARY KEY,
    identity    TEXT NOT NULL,
    amount      INTEGER NOT NULL CHECK (amount >= 0),
    allocation  TEXT NOT NULL,
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_debits_identity ON debits(identity);

CREATE TABLE IF NOT EXISTS refunds (
    attempt_id  TEXT PRIMARY KEY,
    identity    TEXT NOT NULL,
    amount      INTEGER NOT NULL CHECK (amount >= 0),
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS rate_limit_counters (
    identity    TEXT NOT NULL,
    tool        TEXT NOT NULL,
    model       TEXT NOT NULL DEFAULT '',
    window_start INTEGER NOT NULL,
    count       INTEGER NOT NULL DEFAULT 0,
    expires_at  INTEGER NOT NULL,
    PRIMARY KEY (identity, tool, model, window_start)
);
CREATE INDEX IF NOT EXISTS idx_rate_limit_expires ON rate_limit_counters(expires_at);

CREATE TABLE IF NOT EXISTS api_keys (
    key_hash    TEXT PRIMARY KEY,
    identity    TEXT NOT NULL,
    label       TEXT NOT NULL DEFAULT '',
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_api_keys_identity ON api_keys(identity);

CREATE TABLE IF NOT EXISTS generation_log (
    id          TEXT PRIMARY KEY,
    request_id  TEXT NOT NULL,
    identity    TEXT,
    tool        TEXT,
    model       TEXT,
    cost        INTEGER NOT NULL DEFAULT 0,
    result      TEXT NOT NULL CHECK (result IN ('FAILED', 'PARTIAL', 'SUCCEEDED')),
    error_code  TEXT,
    metadata    TEXT NOT NULL DEFAULT '{}',
    latency_ms  INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_generation_log_identity ON generation_log(identity);
CREATE INDEX IF NOT EXISTS idx_generation_log_created ON generation_log(created_at);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().unwrap();
        let tables: i64 = db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
                    [],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert_eq!(tables, 7);
    }

    fn columns(db: &Database, table: &str) -> Vec<String> {
        db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
            let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
            names.collect()
        })
        .unwrap()
    }

    #[test]
    fn test_schema_has_every_store_column() {
        let db = Database::open_in_memory().unwrap();
        let expected: &[(&str, &[&str])] = &[
            ("credit_accounts", &["identity", "base_credit"]),
            (
                "subscriptions",
                &["id", "identity", "plan_tier", "credit", "plan_allotment", "expires", "period_expires"],
            ),
            ("debits", &["attempt_id", "identity", "amount", "allocation"]),
            ("refunds", &["attempt_id", "identity", "amount"]),
            (
                "rate_limit_counters",
                &["identity", "tool", "model", "window_start", "count", "expires_at"],
            ),
            ("api_keys", &["key_hash", "identity", "label"]),
            (
                "generation_log",
                &[
                    "id", "request_id", "identity", "tool", "model", "cost", "result", "error_code",
                    "metadata", "latency_ms",
                ],
            ),
        ];
        for (table, wanted) in expected {
            let have = columns(&db, table);
            for column in *wanted {
                assert!(have.iter().any(|c| c == column), "{table}.{column} missing");
            }
        }
    }

    #[test]
    fn test_open_file_database_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("zapgate.db")).unwrap();
        let mode: String = db
            .with_conn(|conn| conn.query_row("PRAGMA journal_mode", [], |row| row.get(0)))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn test_negative_base_credit_rejected() {
        let db = Database::open_in_memory().unwrap();
        let result = db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO credit_accounts (identity, base_credit) VALUES ('u', -1)",
                [],
            )
        });
        assert!(result.is_err());
    }
}
