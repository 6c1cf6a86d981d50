//! Generation backends.
//!
//! A backend is one interchangeable downstream service able to produce a
//! unit of output for a tool. The orchestrator only sees the uniform
//! [`GenerationBackend`] contract; what a backend does with the payload is
//! its own business.

pub mod http;
pub mod retry;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::config::BackendConfig;
use crate::error::ErrorCode;

pub use self::http::HttpBackend;
pub use self::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// BackendError
// ---------------------------------------------------------------------------

/// How a single backend attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// Provider-side trouble. Worth trying the next backend.
    #[error("backend unavailable: {0}")]
    Transient(String),

    /// The input itself was refused. No other backend will do better.
    #[error("invalid generation request: {0}")]
    Invalid(String),

    /// Refused for a reason other than the input (auth, policy, ...).
    #[error("backend rejected request: {0}")]
    Rejected(String),
}

impl BackendError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Transient(_) => ErrorCode::BackendTransient,
            Self::Invalid(_) => ErrorCode::ValidationFailed,
            Self::Rejected(_) => ErrorCode::BackendTerminal,
        }
    }
}

// ---------------------------------------------------------------------------
// GenerationBackend trait
// ---------------------------------------------------------------------------

pub type BackendFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, BackendError>> + Send + 'a>>;

/// Uniform attempt contract. Async methods return boxed futures so the
/// trait can be used as `Arc<dyn GenerationBackend>`.
pub trait GenerationBackend: Send + Sync {
    fn id(&self) -> &str;

    /// Produce one unit of output. `model` is the backend's own name for it.
    fn attempt<'a>(&'a self, tool: &'a str, model: &'a str, payload: &'a Value) -> BackendFuture<'a>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Backends by id.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn GenerationBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an [`HttpBackend`] for every configured entry.
    pub fn from_config(configs: &[BackendConfig]) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        for cfg in configs {
            if registry.contains(&cfg.id) {
                anyhow::bail!("duplicate backend id: {}", cfg.id);
            }
            registry.register(Arc::new(HttpBackend::from_config(cfg)?));
        }
        Ok(registry)
    }

    pub fn register(&mut self, backend: Arc<dyn GenerationBackend>) {
        self.backends.insert(backend.id().to_string(), backend);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn GenerationBackend>> {
        self.backends.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.backends.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retriable() {
        assert!(BackendError::Transient("503".into()).is_retriable());
        assert!(!BackendError::Invalid("bad prompt".into()).is_retriable());
        assert!(!BackendError::Rejected("403".into()).is_retriable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(BackendError::Transient("x".into()).code(), ErrorCode::BackendTransient);
        assert_eq!(BackendError::Invalid("x".into()).code(), ErrorCode::ValidationFailed);
        assert_eq!(BackendError::Rejected("x".into()).code(), ErrorCode::BackendTerminal);
    }

    #[test]
    fn test_registry_from_config_rejects_duplicates() {
        let cfg = BackendConfig {
            id: "primary".into(),
            url: "http://127.0.0.1:1/generate".into(),
            api_key: None,
            headers: HashMap::new(),
            timeout_secs: 5,
        };
        let registry = BackendRegistry::from_config(std::slice::from_ref(&cfg)).unwrap();
        assert!(registry.contains("primary"));
        assert_eq!(registry.get("primary").unwrap().id(), "primary");
        assert!(registry.get("secondary").is_none());

        assert!(BackendRegistry::from_config(&[cfg.clone(), cfg]).is_err());
    }
}
