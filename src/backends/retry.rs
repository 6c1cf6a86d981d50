//! Attempt budget and backoff between fallback attempts.

use std::time::Duration;

use crate::backends::BackendError;
use crate::config::OrchestratorConfig;

// MARK: - Constants

const DEFAULT_MAX_ATTEMPTS: u32 = 3;

const DEFAULT_INITIAL_BACKOFF_MS: u64 = 250;

const DEFAULT_MAX_BACKOFF_MS: u64 = 4_000;

const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

// MARK: - Retry Policy

/// How many attempts one unit of work may make across its backend chain,
/// and how long to wait between them.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_backoff(mut self, duration: Duration) -> Self {
        self.initial_backoff_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_max_backoff(mut self, duration: Duration) -> Self {
        self.max_backoff_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Backoff before the retry that follows attempt number `attempt`
    /// (zero-based).
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let backoff_ms = (self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent))
            .min(self.max_backoff_ms as f64) as u64;

        Duration::from_millis(backoff_ms)
    }

    /// Whether a unit that has made `attempts` attempts, the last one
    /// failing with `error`, may try again.
    pub fn should_retry(&self, error: &BackendError, attempts: u32) -> bool {
        error.is_retriable() && attempts < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&OrchestratorConfig> for RetryPolicy {
    fn from(cfg: &OrchestratorConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            initial_backoff_ms: cfg.initial_backoff_ms,
            max_backoff_ms: cfg.max_backoff_ms,
            backoff_multiplier: cfg.backoff_multiplier,
        }
    }
}

// MARK: - Tests
