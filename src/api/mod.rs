pub mod credits;
pub mod generate;
pub mod guards;
pub mod health;
pub mod refunds;

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;

use crate::AppState;
use crate::clock::Clock;
use crate::error::AppError;
use crate::pipeline::{Pipeline, RequestContext};

/// Header carrying the request id set by `SetRequestIdLayer`.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Build the full API router.
///
/// Route layout:
/// ```text
/// /health             GET   (no auth)
/// /v1/tools/{tool}    POST  identity, admission, body, execute
/// /v1/credits         GET   identity
/// /v1/refunds         POST  service token
/// ```
pub fn build_api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .with_state(state.clone())
        .merge(generate::router(&state))
        .merge(credits::router(&state))
        .merge(refunds::router(&state))
}

/// State handed to every pipeline-backed route.
#[derive(Clone)]
pub struct Endpoint {
    pipeline: Arc<Pipeline>,
    clock: Arc<dyn Clock>,
}

impl Endpoint {
    pub fn new(pipeline: Pipeline, clock: Arc<dyn Clock>) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            clock,
        }
    }

    /// Fresh context with this request's id and its single `now` snapshot.
    pub fn context(&self, headers: HeaderMap, body: Bytes) -> RequestContext {
        let request_id = headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        RequestContext::new(request_id, self.clock.now_epoch_seconds(), headers, body)
    }

    /// Run the pipeline on its own task. A client that disconnects drops
    /// only the wait; the chain, its backend calls and the finally phase
    /// still run to completion.
    pub async fn run(&self, ctx: RequestContext) -> Response {
        let pipeline = Arc::clone(&self.pipeline);
        let name = pipeline.name();
        match tokio::spawn(async move { pipeline.run(ctx).await }).await {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(pipeline = name, error = %err, "Pipeline task failed");
                AppError::Internal("request task failed".to_string()).into_response()
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Shared fixtures for endpoint tests.

    use super::*;
    use crate::backends::{BackendError, BackendFuture, BackendRegistry, GenerationBackend};
    use crate::clock::ManualClock;
    use crate::config::{AuthMode, BackendTargetConfig, Config, ModelConfig, ToolConfig};
    use crate::db::Database;
    use crate::telemetry::GenerationEvent;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    pub const NOW: u64 = 1_700_000_020;

    /// Fails the first `failures` calls with a transient error, then echoes.
    pub struct Flaky {
        pub id: &'static str,
        pub failures: usize,
        pub calls: AtomicUsize,
    }

    impl GenerationBackend for Flaky {
        fn id(&self) -> &str {
            self.id
        }

        fn attempt<'a>(&'a self, _tool: &'a str, model: &'a str, payload: &'a Value) -> BackendFuture<'a> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let failures = self.failures;
            Box::pin(async move {
                if n < failures {
                    Err(BackendError::Transient("upstream 503".into()))
                } else {
                    Ok(serde_json::json!({"model": model, "echo": payload}))
                }
            })
        }
    }

    pub struct Harness {
        pub app: Router,
        pub state: AppState,
        pub events: mpsc::UnboundedReceiver<GenerationEvent>,
    }

    impl Harness {
        pub fn drain(&mut self) -> Vec<GenerationEvent> {
            let mut out = Vec::new();
            while let Ok(e) = self.events.try_recv() {
                out.push(e);
            }
            out
        }
    }

    pub fn config(ceiling: u64) -> Config {
        let mut config = Config::default();
        config.auth.mode = AuthMode::TrustedHeader;
        config.auth.service_token = Some("svc-token".into());
        config.admission.default_ceiling = ceiling;
        config.orchestrator.initial_backoff_ms = 0;
        config.tools = vec![ToolConfig {
            name: "image".into(),
            task: "text_to_image".into(),
            default_model: "flux".into(),
            max_count: 4,
            models: vec![ModelConfig {
                name: "flux".into(),
                cost: 30,
                backends: vec![
                    BackendTargetConfig {
                        backend: "primary".into(),
                        model: None,
                        cost: None,
                    },
                    BackendTargetConfig {
                        backend: "secondary".into(),
                        model: Some("flux-dev".into()),
                        cost: None,
                    },
                ],
            }],
        }];
        config
    }

    /// App with two backends: `primary` fails `primary_failures` times.
    pub fn harness(config: Config, primary_failures: usize) -> Harness {
        let mut registry = BackendRegistry::new();
        registry.register(Arc::new(Flaky {
            id: "primary",
            failures: primary_failures,
            calls: AtomicUsize::new(0),
        }));
        registry.register(Arc::new(Flaky {
            id: "secondary",
            failures: 0,
            calls: AtomicUsize::new(0),
        }));
        harness_with(config, registry)
    }

    pub fn harness_with(config: Config, registry: BackendRegistry) -> Harness {
        let (tx, rx) = mpsc::unbounded_channel();
        let db = Database::open_in_memory().unwrap();
        let state = AppState::new(config, db, registry, Arc::new(ManualClock::new(NOW)), tx).unwrap();
        Harness {
            app: build_api_router(state.clone()),
            state,
            events: rx,
        }
    }

    pub async fn send(app: &Router, request: Request<Body>) -> (axum::http::StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }
}
