//! Caller identity resolution.
//!
//! Credential issuance lives elsewhere; this module only maps an incoming
//! request to the identity it acts for.

pub mod keys;
pub mod resolver;

use std::future::Future;
use std::pin::Pin;

use axum::http::HeaderMap;
use serde::Serialize;

use crate::error::AppError;

pub use self::keys::{extract_bearer_token, hash_api_key};
pub use self::resolver::{ApiKeyResolver, TrustedHeaderResolver};

/// Resolved caller, attached to the request context by the identity guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub id: String,
}

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

pub type ResolveFuture<'a> = Pin<Box<dyn Future<Output = Result<Identity, AppError>> + Send + 'a>>;

/// Maps request headers to an [`Identity`]. Failing to do so is always
/// [`AppError::Unauthenticated`].
pub trait IdentityResolver: Send + Sync {
    fn resolve<'a>(&'a self, headers: &'a HeaderMap) -> ResolveFuture<'a>;
}
