//! Request-scoped accounting log and the event it is flushed into.
//!
//! Every stage of a request writes into one [`GenerationLog`]. The pipeline
//! turns it into exactly one [`GenerationEvent`] in its finally phase and
//! hands that to the audit writer over an unbounded channel, so the flush
//! never waits on storage.

pub mod audit;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ErrorCode;

pub use self::audit::spawn_audit_logger;

/// Final outcome of a request as recorded for accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenerationResult {
    Failed,
    Partial,
    Succeeded,
}

impl GenerationResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Failed => "FAILED",
            Self::Partial => "PARTIAL",
            Self::Succeeded => "SUCCEEDED",
        }
    }
}

/// Mutable accumulator for one request. Fields are last-write-wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationLog {
    tool: Option<String>,
    model: Option<String>,
    cost: u64,
    result: Option<GenerationResult>,
    metadata: Map<String, Value>,
}

impl GenerationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tool(&mut self, tool: impl Into<String>) {
        self.tool = Some(tool.into());
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = Some(model.into());
    }

    pub fn set_cost(&mut self, cost: u64) {
        self.cost = cost;
    }

    pub fn set_result(&mut self, result: GenerationResult) {
        self.result = Some(result);
    }

    pub fn insert_meta(&mut self, key: &str, value: impl Into<Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    pub fn tool(&self) -> Option<&str> {
        self.tool.as_deref()
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn cost(&self) -> u64 {
        self.cost
    }

    pub fn result(&self) -> Option<GenerationResult> {
        self.result
    }

    pub fn meta(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Close the log. A request that ended in an error is always FAILED;
    /// one that never set a result but succeeded is SUCCEEDED.
    pub fn finish(
        self,
        request_id: impl Into<String>,
        identity: Option<String>,
        error: Option<ErrorCode>,
        latency_ms: u64,
    ) -> GenerationEvent {
        let result = match error {
            Some(_) => GenerationResult::Failed,
            None => self.result.unwrap_or(GenerationResult::Succeeded),
        };
        GenerationEvent {
            request_id: request_id.into(),
            identity,
            tool: self.tool,
            model: self.model,
            cost: self.cost,
            result,
            error_code: error,
            metadata: self.metadata,
            latency_ms,
        }
    }
}

/// One structured accounting event per completed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationEvent {
    pub request_id: String,
    pub identity: Option<String>,
    pub tool: Option<String>,
    pub model: Option<String>,
    pub cost: u64,
    pub result: GenerationResult,
    pub error_code: Option<ErrorCode>,
    pub metadata: Map<String, Value>,
    pub latency_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_write_wins() {
        let mut log = GenerationLog::new();
        log.set_model("backend-1/flux");
        log.set_cost(30);
        log.set_model("backend-2/flux");
        log.set_cost(35);
        assert_eq!(log.model(), Some("backend-2/flux"));
        assert_eq!(log.cost(), 35);
    }

    #[test]
    fn test_error_forces_failed() {
        let mut log = GenerationLog::new();
        log.set_result(GenerationResult::Succeeded);
        let event = log.finish("req-1", None, Some(ErrorCode::Internal), 5);
        assert_eq!(event.result, GenerationResult::Failed);
        assert_eq!(event.error_code, Some(ErrorCode::Internal));
    }

    #[test]
    fn test_default_result_is_succeeded() {
        let event = GenerationLog::new().finish("req-1", Some("alice".into()), None, 1);
        assert_eq!(event.result, GenerationResult::Succeeded);
        assert_eq!(event.cost, 0);
        assert_eq!(event.identity.as_deref(), Some("alice"));
    }

    #[test]
    fn test_partial_preserved() {
        let mut log = GenerationLog::new();
        log.set_result(GenerationResult::Partial);
        log.insert_meta("units_succeeded", 1);
        let event = log.finish("req-1", None, None, 1);
        assert_eq!(event.result, GenerationResult::Partial);
        assert_eq!(event.metadata["units_succeeded"], 1);
    }

    #[test]
    fn test_result_serializes_upper_case() {
        assert_eq!(
            serde_json::to_string(&GenerationResult::Partial).unwrap(),
            "\"PARTIAL\""
        );
        assert_eq!(GenerationResult::Failed.as_str(), "FAILED");
    }
}
