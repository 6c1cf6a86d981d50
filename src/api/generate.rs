use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};

use crate::AppState;
use crate::api::Endpoint;
use crate::api::guards::{Admit, ParseGenerationBody, ReserveAndExecute, ResolveIdentity};
use crate::error::AppError;
use crate::pipeline::{Handler, HandlerFuture, Pipeline, RequestContext};

pub fn router(state: &AppState) -> Router {
    let pipeline = Pipeline::builder("generate", state.audit_tx.clone())
        .guard(ResolveIdentity::new(state.identity.clone()))
        .guard(Admit::new(state.admission.clone(), state.orchestrator.clone()))
        .guard(ParseGenerationBody::new(state.orchestrator.clone()))
        .guard(ReserveAndExecute::new(state.orchestrator.clone()))
        .compensate_with(state.ledger.clone())
        .handler(RenderOutcome);

    Router::new()
        .route("/v1/tools/{tool}", post(generate))
        .with_state(Endpoint::new(pipeline, state.clock.clone()))
}

/// POST /v1/tools/{tool}
///
/// Body: `{"model"?, "count"?, "payload"}`. The model may also be chosen
/// with `?model=` or the `x-generation-model` header; the body value must
/// then agree with it.
async fn generate(
    State(endpoint): State<Endpoint>,
    Path(tool): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ctx = endpoint
        .context(headers, body)
        .with_tool(tool)
        .with_query(query);
    endpoint.run(ctx).await
}

struct RenderOutcome;

impl Handler for RenderOutcome {
    fn handle<'a>(&'a self, ctx: &'a mut RequestContext) -> HandlerFuture<'a> {
        Box::pin(async move {
            let outcome = ctx
                .outcome
                .take()
                .ok_or_else(|| AppError::Internal("no generation outcome".to_string()))?;
            Ok(Json(outcome).into_response())
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::api::test_support::*;
    use crate::error::ErrorCode;
    use crate::telemetry::GenerationResult;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;

    fn post(user: &str, body: serde_json::Value) -> Request<Body> {
        Request::post("/v1/tools/image")
            .header("x-user-id", user)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_fallback_success_charges_once() {
        let mut h = harness(config(10), 1);
        h.state.ledger.grant("alice", 100).await.unwrap();

        let (status, body) = send(&h.app, post("alice", json!({"payload": {"prompt": "owl"}}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "SUCCEEDED");
        assert_eq!(body["charged"], 30);
        assert_eq!(body["outputs"][0]["backend"], "secondary");
        assert_eq!(body["outputs"][0]["output"]["model"], "flux-dev");
        assert_eq!(h.state.ledger.balance("alice", NOW).await.unwrap().total, 70);

        let events = h.drain();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.result, GenerationResult::Succeeded);
        assert_eq!(event.tool.as_deref(), Some("image"));
        assert_eq!(event.model.as_deref(), Some("flux-dev"));
        assert_eq!(event.cost, 30);
        assert_eq!(event.metadata["backend"], "secondary");
        assert_eq!(event.metadata["attempt_id"], body["attempt_id"]);
    }

    #[tokio::test]
    async fn test_missing_identity_is_unauthenticated() {
        let mut h = harness(config(10), 0);
        let request = Request::post("/v1/tools/image").body(Body::empty()).unwrap();
        let (status, body) = send(&h.app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "UNAUTHENTICATED");

        let events = h.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].result, GenerationResult::Failed);
        assert!(events[0].identity.is_none());
    }

    #[tokio::test]
    async fn test_ceiling_plus_one_is_rate_limited() {
        let mut h = harness(config(2), 0);
        h.state.ledger.grant("alice", 1_000).await.unwrap();

        for _ in 0..2 {
            let (status, _) = send(&h.app, post("alice", json!({}))).await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, body) = send(&h.app, post("alice", json!({}))).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"]["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(h.state.ledger.balance("alice", NOW).await.unwrap().total, 940);

        let events = h.drain();
        let last = events.last().unwrap();
        assert_eq!(last.result, GenerationResult::Failed);
        assert_eq!(last.cost, 0);
        assert_eq!(last.error_code, Some(ErrorCode::RateLimitExceeded));
    }

    #[tokio::test]
    async fn test_insufficient_credit() {
        let h = harness(config(10), 0);
        h.state.ledger.grant("alice", 10).await.unwrap();
        let (status, body) = send(&h.app, post("alice", json!({}))).await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body["error"]["code"], "INSUFFICIENT_CREDIT");
    }

    #[tokio::test]
    async fn test_unknown_model_and_bad_body_are_validation_failures() {
        let h = harness(config(10), 0);
        h.state.ledger.grant("alice", 100).await.unwrap();

        let request = Request::post("/v1/tools/image?model=sdxl")
            .header("x-user-id", "alice")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&h.app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_FAILED");

        let request = Request::post("/v1/tools/image")
            .header("x-user-id", "alice")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, _) = send(&h.app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(h.state.ledger.balance("alice", NOW).await.unwrap().total, 100);
    }

    #[tokio::test]
    async fn test_all_backends_failing_is_terminal_without_debit() {
        let mut cfg = config(10);
        cfg.tools[0].models[0].backends.truncate(1);
        let h = harness(cfg, usize::MAX);
        h.state.ledger.grant("alice", 100).await.unwrap();

        let (status, body) = send(&h.app, post("alice", json!({}))).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["error"]["code"], "BACKEND_TERMINAL");
        assert_eq!(h.state.ledger.balance("alice", NOW).await.unwrap().total, 100);
    }
}
