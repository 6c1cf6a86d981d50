use axum::http::HeaderMap;
use rusqlite::{OptionalExtension, params};

use crate::auth::{Identity, IdentityResolver, ResolveFuture, extract_bearer_token, hash_api_key};
use crate::db::Database;
use crate::error::AppError;

/// Trusts an identity header set by an authenticating proxy in front of
/// this service.
pub struct TrustedHeaderResolver {
    header: String,
}

impl TrustedHeaderResolver {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into().to_ascii_lowercase(),
        }
    }
}

impl IdentityResolver for TrustedHeaderResolver {
    fn resolve<'a>(&'a self, headers: &'a HeaderMap) -> ResolveFuture<'a> {
        Box::pin(async move {
            headers
                .get(self.header.as_str())
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(Identity::new)
                .ok_or_else(|| AppError::Unauthenticated(format!("Missing {} header", self.header)))
        })
    }
}

/// Resolves `Authorization: Bearer <key>` against hashed keys in the
/// `api_keys` table.
pub struct ApiKeyResolver {
    db: Database,
}

impl ApiKeyResolver {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl IdentityResolver for ApiKeyResolver {
    fn resolve<'a>(&'a self, headers: &'a HeaderMap) -> ResolveFuture<'a> {
        Box::pin(async move {
            let token = extract_bearer_token(headers)?;
            let hash = hash_api_key(&token);
            let identity: Option<String> = self.db.with_conn(|conn| {
                conn.query_row(
                    "SELECT identity FROM api_keys WHERE key_hash = ?1",
                    params![hash],
                    |row| row.get(0),
                )
                .optional()
            })?;
            identity
                .map(Identity::new)
                .ok_or_else(|| AppError::Unauthenticated("Invalid API key".to_string()))
        })
    }
}
