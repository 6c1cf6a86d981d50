//! Fallback execution: reserve, attempt across equivalent backends, and
//! commit credit only for work that actually succeeded.
//!
//! Reservation is a read-only affordability check. Nothing is debited
//! until at least one unit has produced output, and then only the cost of
//! the units that did.

pub mod catalog;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backends::{BackendError, BackendRegistry, RetryPolicy};
use crate::error::{AppError, ErrorCode};
use crate::ledger::Ledger;
use crate::telemetry::{GenerationLog, GenerationResult};

pub use self::catalog::{BackendTarget, CatalogError, ModelSpec, ToolCatalog, ToolSpec};

// ---------------------------------------------------------------------------
// Request / outcome types
// ---------------------------------------------------------------------------

/// Body of a generation call as sent by the client.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerationBody {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub count: Option<u32>,
    #[serde(default)]
    pub payload: Value,
}

/// A fully resolved generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub tool: String,
    pub model: String,
    pub count: u32,
    pub payload: Value,
}

/// Per-unit result returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitOutput {
    pub index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationOutcome {
    pub attempt_id: String,
    pub result: GenerationResult,
    pub charged: u64,
    pub outputs: Vec<UnitOutput>,
}

#[derive(Debug)]
struct AttemptRecord {
    /// Completion order across every unit of the request.
    seq: u64,
    backend: String,
    upstream_model: String,
    cost: u64,
    error: Option<ErrorCode>,
}

#[derive(Debug)]
struct UnitReport {
    index: u32,
    trail: Vec<AttemptRecord>,
    /// Output and the cost of the target that produced it.
    success: Option<(Value, u64)>,
    error: Option<BackendError>,
}

impl UnitReport {
    fn into_output(self) -> UnitOutput {
        let attempts = u32::try_from(self.trail.len()).unwrap_or(u32::MAX);
        let backend = self.trail.last().map(|a| a.backend.clone());
        match self.success {
            Some((output, _)) => UnitOutput {
                index: self.index,
                backend,
                attempts,
                output: Some(output),
                error: None,
            },
            None => UnitOutput {
                index: self.index,
                backend,
                attempts,
                output: None,
                error: Some(
                    self.error
                        .as_ref()
                        .map_or(ErrorCode::BackendTerminal, terminal_code),
                ),
            },
        }
    }
}

/// Code a unit's final error surfaces as. Exhausted retries are terminal.
fn terminal_code(err: &BackendError) -> ErrorCode {
    match err {
        BackendError::Invalid(_) => ErrorCode::ValidationFailed,
        BackendError::Transient(_) | BackendError::Rejected(_) => ErrorCode::BackendTerminal,
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Orchestrator {
    ledger: Ledger,
    registry: BackendRegistry,
    catalog: Arc<ToolCatalog>,
    policy: RetryPolicy,
}

impl Orchestrator {
    pub fn new(ledger: Ledger, registry: BackendRegistry, catalog: ToolCatalog, policy: RetryPolicy) -> Self {
        Self {
            ledger,
            registry,
            catalog: Arc::new(catalog),
            policy,
        }
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    /// Turn a client body into a resolved request for `tool`. `model` is
    /// the one admission already counted against, if any.
    pub fn resolve(
        &self,
        tool: &str,
        model: Option<&str>,
        body: GenerationBody,
    ) -> Result<GenerationRequest, AppError> {
        if let (Some(admitted), Some(requested)) = (model, body.model.as_deref()) {
            if admitted != requested {
                return Err(AppError::ValidationFailed(format!(
                    "Body model {requested} does not match requested model {admitted}"
                )));
            }
        }
        let (spec, model) = self
            .catalog
            .resolve(tool, model.or(body.model.as_deref()))?;
        let count = body.count.unwrap_or(1);
        if count == 0 || count > spec.max_count {
            return Err(AppError::ValidationFailed(format!(
                "count must be between 1 and {} for {tool}",
                spec.max_count
            )));
        }
        Ok(GenerationRequest {
            tool: spec.name.clone(),
            model: model.name.clone(),
            count,
            payload: body.payload,
        })
    }

    /// Reserve, attempt every unit through its fallback chain, then commit
    /// the cost of whatever succeeded under a fresh attempt id.
    pub async fn execute(
        &self,
        identity: &str,
        request: &GenerationRequest,
        log: &mut GenerationLog,
        now: u64,
    ) -> Result<GenerationOutcome, AppError> {
        let (_, model) = self.catalog.resolve(&request.tool, Some(&request.model))?;
        let attempt_id = uuid::Uuid::new_v4().to_string();
        log.set_model(&model.name);
        log.insert_meta("attempt_id", attempt_id.clone());
        log.insert_meta("units_requested", request.count);

        let reserve = model.max_unit_cost().saturating_mul(u64::from(request.count));
        self.ledger.ensure_affordable(identity, reserve, now).await?;
        debug!(identity, tool = %request.tool, model = %model.name, reserve, "Reserved");

        let sequence = AtomicU64::new(0);
        let reports = join_all((0..request.count).map(|index| {
            self.run_unit(index, &request.tool, model, &request.payload, &sequence)
        }))
        .await;

        // Units finish out of order; the log ends on the attempt that
        // completed last.
        let mut records: Vec<&AttemptRecord> = reports.iter().flat_map(|r| &r.trail).collect();
        records.sort_by_key(|r| r.seq);

        let mut attempts = 0usize;
        let mut errors = Vec::new();
        for record in records {
            attempts += 1;
            log.set_model(&record.upstream_model);
            log.set_cost(record.cost);
            log.insert_meta("backend", record.backend.clone());
            if let Some(code) = record.error {
                errors.push(Value::from(code.as_str()));
            }
        }
        log.insert_meta("attempts", attempts);
        if !errors.is_empty() {
            log.insert_meta("attempt_errors", errors);
        }

        let succeeded = reports.iter().filter(|r| r.success.is_some()).count();
        let charged: u64 = reports
            .iter()
            .filter_map(|r| r.success.as_ref().map(|(_, cost)| *cost))
            .sum();
        log.insert_meta("units_succeeded", succeeded);

        if succeeded == 0 {
            log.insert_meta("charged", 0);
            let invalid = reports
                .iter()
                .find_map(|r| match &r.error {
                    Some(BackendError::Invalid(msg)) => Some(msg.clone()),
                    _ => None,
                });
            if let Some(msg) = invalid {
                warn!(identity, tool = %request.tool, "Generation input rejected by backend");
                return Err(AppError::ValidationFailed(msg));
            }
            let last = reports
                .iter()
                .rev()
                .find_map(|r| r.error.as_ref().map(ToString::to_string))
                .unwrap_or_else(|| "no backend attempted".to_string());
            warn!(identity, tool = %request.tool, attempts, "All backends failed");
            return Err(AppError::BackendTerminal(last));
        }

        let debit = self.ledger.consume(identity, charged, &attempt_id, now).await?;
        log.set_cost(debit.amount);
        log.insert_meta("charged", debit.amount);

        let result = if succeeded == reports.len() {
            GenerationResult::Succeeded
        } else {
            GenerationResult::Partial
        };
        log.set_result(result);
        info!(
            identity,
            tool = %request.tool,
            attempt_id = %attempt_id,
            charged = debit.amount,
            units = succeeded,
            result = result.as_str(),
            "Generation committed"
        );

        Ok(GenerationOutcome {
            attempt_id,
            result,
            charged: debit.amount,
            outputs: reports.into_iter().map(UnitReport::into_output).collect(),
        })
    }

    /// Walk one unit down the chain until success, a terminal failure, or
    /// the attempt budget runs out.
    async fn run_unit(
        &self,
        index: u32,
        tool: &str,
        model: &ModelSpec,
        payload: &Value,
        sequence: &AtomicU64,
    ) -> UnitReport {
        let mut trail: Vec<AttemptRecord> = Vec::new();
        let mut last_error = None;

        for (position, target) in model.targets.iter().enumerate() {
            let attempt_no = u32::try_from(trail.len()).unwrap_or(u32::MAX);
            if attempt_no >= self.policy.max_attempts {
                break;
            }
            if attempt_no > 0 {
                tokio::time::sleep(self.policy.calculate_backoff(attempt_no - 1)).await;
            }

            let outcome = match self.registry.get(&target.backend) {
                Some(backend) => backend.attempt(tool, &target.upstream_model, payload).await,
                None => Err(BackendError::Transient(format!(
                    "backend {} is not registered",
                    target.backend
                ))),
            };
            trail.push(AttemptRecord {
                seq: sequence.fetch_add(1, Ordering::SeqCst),
                backend: target.backend.clone(),
                upstream_model: target.upstream_model.clone(),
                cost: target.cost,
                error: outcome.as_ref().err().map(BackendError::code),
            });

            match outcome {
                Ok(output) => {
                    debug!(unit = index, backend = %target.backend, attempt = attempt_no + 1, "Unit succeeded");
                    return UnitReport {
                        index,
                        trail,
                        success: Some((output, target.cost)),
                        error: None,
                    };
                }
                Err(err) => {
                    let has_next = position + 1 < model.targets.len();
                    let retry = has_next && self.policy.should_retry(&err, attempt_no + 1);
                    warn!(
                        unit = index,
                        backend = %target.backend,
                        attempt = attempt_no + 1,
                        retry,
                        error = %err,
                        "Backend attempt failed"
                    );
                    last_error = Some(err);
                    if !retry {
                        break;
                    }
                }
            }
        }

        UnitReport {
            index,
            trail,
            success: None,
            error: last_error,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{BackendFuture, GenerationBackend};
    use crate::config::{BackendTargetConfig, ModelConfig, ToolConfig};
    use crate::store::MemoryStore;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const NOW: u64 = 1_700_000_000;

    /// Replays a script of results, then keeps returning the fallback.
    struct Scripted {
        id: &'static str,
        script: Mutex<VecDeque<Result<Value, BackendError>>>,
        fallback: Result<Value, BackendError>,
        first_delay: Duration,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(id: &'static str, fallback: Result<Value, BackendError>) -> Arc<Self> {
            Self::scripted(id, Vec::new(), fallback)
        }

        fn scripted(
            id: &'static str,
            script: Vec<Result<Value, BackendError>>,
            fallback: Result<Value, BackendError>,
        ) -> Arc<Self> {
            Self::slow_first(id, script, fallback, Duration::ZERO)
        }

        /// Like `scripted`, but the very first call takes `first_delay`.
        fn slow_first(
            id: &'static str,
            script: Vec<Result<Value, BackendError>>,
            fallback: Result<Value, BackendError>,
            first_delay: Duration,
        ) -> Arc<Self> {
            Arc::new(Self {
                id,
                script: Mutex::new(script.into()),
                fallback,
                first_delay,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl GenerationBackend for Scripted {
        fn id(&self) -> &str {
            self.id
        }

        fn attempt<'a>(&'a self, _tool: &'a str, model: &'a str, _payload: &'a Value) -> BackendFuture<'a> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let delay = if n == 0 { self.first_delay } else { Duration::ZERO };
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());
            let model = model.to_string();
            Box::pin(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                next.map(|v| serde_json::json!({"model": model, "data": v}))
            })
        }
    }

    fn ok() -> Result<Value, BackendError> {
        Ok(Value::from("png"))
    }

    fn transient() -> Result<Value, BackendError> {
        Err(BackendError::Transient("503".into()))
    }

    struct Fixture {
        orchestrator: Orchestrator,
        store: Arc<MemoryStore>,
        ledger: Ledger,
    }

    fn fixture(
        backends: Vec<Arc<Scripted>>,
        chain: Vec<BackendTargetConfig>,
        policy: RetryPolicy,
    ) -> Fixture {
        let mut registry = BackendRegistry::new();
        for b in backends {
            registry.register(b);
        }
        let tool = ToolConfig {
            name: "image".into(),
            task: "text_to_image".into(),
            default_model: "flux".into(),
            max_count: 4,
            models: vec![ModelConfig {
                name: "flux".into(),
                cost: 30,
                backends: chain,
            }],
        };
        let catalog = ToolCatalog::from_config(&[tool], &registry).unwrap();
        let store = Arc::new(MemoryStore::new());
        let ledger = Ledger::new(store.clone());
        Fixture {
            orchestrator: Orchestrator::new(ledger.clone(), registry, catalog, policy),
            store,
            ledger,
        }
    }

    fn target(backend: &str) -> BackendTargetConfig {
        BackendTargetConfig {
            backend: backend.into(),
            model: Some(format!("{backend}-flux")),
            cost: None,
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new().with_initial_backoff(std::time::Duration::ZERO)
    }

    fn request(count: u32) -> GenerationRequest {
        GenerationRequest {
            tool: "image".into(),
            model: "flux".into(),
            count,
            payload: serde_json::json!({"prompt": "a fox"}),
        }
    }

    #[tokio::test]
    async fn test_retriable_then_success_debits_once_and_logs_second_backend() {
        let first = Scripted::new("primary", transient());
        let second = Scripted::new("secondary", ok());
        let f = fixture(
            vec![first.clone(), second.clone()],
            vec![target("primary"), target("secondary")],
            fast_policy(),
        );
        f.ledger.grant("alice", 100).await.unwrap();

        let mut log = GenerationLog::new();
        let outcome = f
            .orchestrator
            .execute("alice", &request(1), &mut log, NOW)
            .await
            .unwrap();

        assert_eq!(outcome.result, GenerationResult::Succeeded);
        assert_eq!(outcome.charged, 30);
        assert_eq!(outcome.outputs[0].backend.as_deref(), Some("secondary"));
        assert_eq!(outcome.outputs[0].attempts, 2);
        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 1);

        assert_eq!(f.store.debit_count(), 1);
        assert_eq!(f.ledger.balance("alice", NOW).await.unwrap().total, 70);

        assert_eq!(log.meta("backend"), Some(&Value::from("secondary")));
        assert_eq!(log.model(), Some("secondary-flux"));
        assert_eq!(log.cost(), 30);
        assert_eq!(log.meta("attempts"), Some(&Value::from(2)));
        assert_eq!(
            log.meta("attempt_errors"),
            Some(&serde_json::json!(["BACKEND_TRANSIENT"]))
        );
        assert_eq!(log.result(), Some(GenerationResult::Succeeded));
    }

    #[tokio::test]
    async fn test_exhausted_chain_is_terminal_without_debit() {
        let f = fixture(
            vec![Scripted::new("primary", transient()), Scripted::new("secondary", transient())],
            vec![target("primary"), target("secondary")],
            fast_policy(),
        );
        f.ledger.grant("alice", 100).await.unwrap();

        let mut log = GenerationLog::new();
        let err = f
            .orchestrator
            .execute("alice", &request(1), &mut log, NOW)
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::BackendTerminal);
        assert_eq!(f.store.debit_count(), 0);
        assert_eq!(f.ledger.balance("alice", NOW).await.unwrap().total, 100);
        assert_eq!(log.meta("backend"), Some(&Value::from("secondary")));
        assert_eq!(log.meta("charged"), Some(&Value::from(0)));
    }

    #[tokio::test]
    async fn test_invalid_input_stops_without_fallback() {
        let first = Scripted::new("primary", Err(BackendError::Invalid("prompt blocked".into())));
        let second = Scripted::new("secondary", ok());
        let f = fixture(
            vec![first.clone(), second.clone()],
            vec![target("primary"), target("secondary")],
            fast_policy(),
        );
        f.ledger.grant("alice", 100).await.unwrap();

        let err = f
            .orchestrator
            .execute("alice", &request(1), &mut GenerationLog::new(), NOW)
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::ValidationFailed);
        assert_eq!(second.calls(), 0);
        assert_eq!(f.store.debit_count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_is_terminal_without_fallback() {
        let second = Scripted::new("secondary", ok());
        let f = fixture(
            vec![Scripted::new("primary", Err(BackendError::Rejected("403".into()))), second.clone()],
            vec![target("primary"), target("secondary")],
            fast_policy(),
        );
        f.ledger.grant("alice", 100).await.unwrap();

        let err = f
            .orchestrator
            .execute("alice", &request(1), &mut GenerationLog::new(), NOW)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BackendTerminal);
        assert_eq!(second.calls(), 0);
    }

    #[tokio::test]
    async fn test_attempt_budget_caps_chain() {
        let third = Scripted::new("tertiary", ok());
        let f = fixture(
            vec![
                Scripted::new("primary", transient()),
                Scripted::new("secondary", transient()),
                third.clone(),
            ],
            vec![target("primary"), target("secondary"), target("tertiary")],
            fast_policy().with_max_attempts(2),
        );
        f.ledger.grant("alice", 100).await.unwrap();

        let err = f
            .orchestrator
            .execute("alice", &request(1), &mut GenerationLog::new(), NOW)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BackendTerminal);
        assert_eq!(third.calls(), 0);
    }

    #[tokio::test]
    async fn test_unaffordable_request_never_reaches_backend() {
        let primary = Scripted::new("primary", ok());
        let f = fixture(vec![primary.clone()], vec![target("primary")], fast_policy());
        f.ledger.grant("alice", 50).await.unwrap();

        let err = f
            .orchestrator
            .execute("alice", &request(2), &mut GenerationLog::new(), NOW)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::InsufficientCredit {
                required: 60,
                available: 50
            }
        ));
        assert_eq!(primary.calls(), 0);
        assert_eq!(f.store.debit_count(), 0);
    }

    #[tokio::test]
    async fn test_partial_success_charges_only_succeeded_units() {
        let primary = Scripted::scripted("primary", vec![ok(), ok()], transient());
        let f = fixture(
            vec![primary.clone()],
            vec![target("primary")],
            fast_policy().with_max_attempts(1),
        );
        f.ledger.grant("alice", 100).await.unwrap();

        let mut log = GenerationLog::new();
        let outcome = f
            .orchestrator
            .execute("alice", &request(3), &mut log, NOW)
            .await
            .unwrap();

        assert_eq!(outcome.result, GenerationResult::Partial);
        assert_eq!(outcome.charged, 60);
        assert_eq!(outcome.outputs.len(), 3);
        assert_eq!(outcome.outputs.iter().filter(|o| o.output.is_some()).count(), 2);
        assert_eq!(
            outcome.outputs.iter().filter_map(|o| o.error).collect::<Vec<_>>(),
            vec![ErrorCode::BackendTerminal]
        );
        assert_eq!(f.ledger.balance("alice", NOW).await.unwrap().total, 40);
        assert_eq!(log.cost(), 60);
        assert_eq!(log.meta("units_succeeded"), Some(&Value::from(2)));
        assert_eq!(log.result(), Some(GenerationResult::Partial));
    }

    #[tokio::test]
    async fn test_cost_override_applies_to_fallback_target() {
        let f = fixture(
            vec![Scripted::new("primary", transient()), Scripted::new("secondary", ok())],
            vec![
                target("primary"),
                BackendTargetConfig {
                    backend: "secondary".into(),
                    model: None,
                    cost: Some(20),
                },
            ],
            fast_policy(),
        );
        f.ledger.grant("alice", 100).await.unwrap();

        let mut log = GenerationLog::new();
        let outcome = f
            .orchestrator
            .execute("alice", &request(1), &mut log, NOW)
            .await
            .unwrap();
        assert_eq!(outcome.charged, 20);
        assert_eq!(log.model(), Some("flux"));
        assert_eq!(f.ledger.balance("alice", NOW).await.unwrap().total, 80);
    }

    #[tokio::test]
    async fn test_log_reports_backend_that_finished_last() {
        // Unit 0 is stuck on a slow primary while unit 1 fails over to the
        // secondary and finishes first.
        let first = Scripted::slow_first("primary", vec![ok(), transient()], ok(), Duration::from_millis(50));
        let second = Scripted::new("secondary", ok());
        let fx = fixture(
            vec![first, second],
            vec![target("primary"), target("secondary")],
            fast_policy(),
        );
        fx.ledger.grant("alice", 100).await.unwrap();

        let mut log = GenerationLog::new();
        let outcome = fx
            .orchestrator
            .execute("alice", &request(2), &mut log, NOW)
            .await
            .unwrap();
        assert_eq!(outcome.outputs[0].backend.as_deref(), Some("primary"));
        assert_eq!(outcome.outputs[1].backend.as_deref(), Some("secondary"));
        assert_eq!(outcome.charged, 60);
        assert_eq!(log.meta("backend"), Some(&Value::from("primary")));
        assert_eq!(log.model(), Some("primary-flux"));
        assert_eq!(log.meta("attempts"), Some(&Value::from(3)));
    }

    #[test]
    fn test_resolve_body() {
        let f = fixture(vec![Scripted::new("primary", ok())], vec![target("primary")], fast_policy());
        let o = &f.orchestrator;

        let req = o.resolve("image", None, GenerationBody::default()).unwrap();
        assert_eq!((req.model.as_str(), req.count), ("flux", 1));

        let body = GenerationBody {
            model: Some("flux".into()),
            count: Some(4),
            payload: Value::Null,
        };
        assert_eq!(o.resolve("image", Some("flux"), body).unwrap().count, 4);

        let too_many = GenerationBody {
            count: Some(5),
            ..GenerationBody::default()
        };
        assert!(matches!(o.resolve("image", None, too_many), Err(AppError::ValidationFailed(_))));

        let mismatch = GenerationBody {
            model: Some("sdxl".into()),
            ..GenerationBody::default()
        };
        assert!(matches!(
            o.resolve("image", Some("flux"), mismatch),
            Err(AppError::ValidationFailed(_))
        ));
    }
}
