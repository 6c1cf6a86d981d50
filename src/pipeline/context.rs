use std::collections::HashMap;
use std::time::Instant;

use axum::body::Bytes;
use axum::http::HeaderMap;

use crate::auth::Identity;
use crate::orchestrator::{GenerationOutcome, GenerationRequest};
use crate::telemetry::GenerationLog;

/// A debit that has been committed during this request and must be handed
/// back if the request still ends in an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedDebit {
    pub identity: String,
    pub attempt_id: String,
    pub amount: u64,
}

/// Everything one request carries through the guard chain.
///
/// Slots are filled in order by the guards that own them: `identity` by
/// identity resolution, `model` by admission, `generation` by body
/// parsing, `outcome` and `committed` by execution. `log` is written by all
/// of them.
#[derive(Debug)]
pub struct RequestContext {
    pub request_id: String,
    /// Epoch seconds, read once when the request arrived.
    pub now: u64,
    pub started: Instant,
    pub headers: HeaderMap,
    pub query: HashMap<String, String>,
    pub tool: Option<String>,
    /// Catalog model the request was admitted under.
    pub model: Option<String>,
    pub body: Bytes,
    pub identity: Option<Identity>,
    pub generation: Option<GenerationRequest>,
    pub outcome: Option<GenerationOutcome>,
    pub committed: Option<CommittedDebit>,
    pub log: GenerationLog,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>, now: u64, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            request_id: request_id.into(),
            now,
            started: Instant::now(),
            headers,
            query: HashMap::new(),
            tool: None,
            model: None,
            body,
            identity: None,
            generation: None,
            outcome: None,
            committed: None,
            log: GenerationLog::new(),
        }
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        let tool = tool.into();
        self.log.set_tool(tool.clone());
        self.tool = Some(tool);
        self
    }

    pub fn with_query(mut self, query: HashMap<String, String>) -> Self {
        self.query = query;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn identity_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.id.as_str())
    }
}
