//! Admission control: per identity/tool/model request ceilings.
//!
//! Counters live in the [`RateLimitStore`]; every request increments its
//! bucket before the ceiling is compared, and the increment is kept even
//! when the request is rejected or fails later on.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::config::{AdmissionConfig, WindowKind};
use crate::error::AppError;
use crate::store::{CounterKey, RateLimitStore, StoreError};

/// An admitted request, with the counter reading that let it through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admitted {
    pub count: u64,
    pub ceiling: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("rate limit exceeded ({count} requests, ceiling {ceiling})")]
    Exceeded { count: u64, ceiling: u64 },

    /// The counter store could not be reached. Admission fails closed.
    #[error("admission store unavailable: {0}")]
    Store(#[from] StoreError),
}

impl From<AdmissionError> for AppError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::Exceeded { .. } => Self::RateLimitExceeded(err.to_string()),
            AdmissionError::Store(_) => {
                Self::RateLimitExceeded("admission temporarily unavailable".to_string())
            }
        }
    }
}

pub struct AdmissionController {
    store: Arc<dyn RateLimitStore>,
    config: AdmissionConfig,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn RateLimitStore>, config: AdmissionConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Most specific rule wins: tool+model, then tool, then the default.
    pub fn ceiling_for(&self, tool: &str, model: Option<&str>) -> u64 {
        let exact = model.and_then(|m| {
            self.config
                .rules
                .iter()
                .find(|r| r.tool == tool && r.model.as_deref() == Some(m))
        });
        let tool_wide = || {
            self.config
                .rules
                .iter()
                .find(|r| r.tool == tool && r.model.is_none())
        };
        exact
            .or_else(tool_wide)
            .map_or(self.config.default_ceiling, |r| r.ceiling)
    }

    fn window_secs(&self) -> u64 {
        self.config.window_secs.max(1)
    }

    /// Bucket key for the window containing `now`.
    pub fn counter_key(&self, identity: &str, tool: &str, model: Option<&str>, now: u64) -> CounterKey {
        let window = self.window_secs();
        CounterKey {
            identity: identity.to_string(),
            tool: tool.to_string(),
            model: model.map(str::to_string),
            window_start: now - now % window,
        }
    }

    /// Count this request and decide whether it may proceed.
    pub async fn admit(
        &self,
        identity: &str,
        tool: &str,
        model: Option<&str>,
        now: u64,
    ) -> Result<Admitted, AdmissionError> {
        let ceiling = self.ceiling_for(tool, model);
        if !self.config.enabled {
            return Ok(Admitted { count: 0, ceiling });
        }

        let window = self.window_secs();
        let key = self.counter_key(identity, tool, model, now);
        let expires_at = key.window_start.saturating_add(window.saturating_mul(2));

        let count = self
            .store
            .increment_and_read(&key, expires_at)
            .await
            .inspect_err(|e| error!(identity, tool, error = %e, "Admission store failed, rejecting"))?;

        let exceeded = match self.config.window {
            WindowKind::Fixed => count > ceiling,
            WindowKind::Sliding => {
                let previous = if key.window_start >= window {
                    let prev_key = CounterKey {
                        window_start: key.window_start - window,
                        ..key.clone()
                    };
                    self.store
                        .read(&prev_key)
                        .await
                        .inspect_err(|e| error!(identity, tool, error = %e, "Admission store failed, rejecting"))?
                } else {
                    0
                };
                let elapsed = now - key.window_start;
                let weighted = u128::from(count) * u128::from(window)
                    + u128::from(previous) * u128::from(window - elapsed);
                weighted > u128::from(ceiling) * u128::from(window)
            }
        };

        if exceeded {
            warn!(identity, tool, model, count, ceiling, "Rate limit exceeded");
            return Err(AdmissionError::Exceeded { count, ceiling });
        }

        debug!(identity, tool, model, count, ceiling, "Request admitted");
        Ok(Admitted { count, ceiling })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
