use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::api::Endpoint;
use crate::api::guards::RequireServiceToken;
use crate::auth::Identity;
use crate::error::AppError;
use crate::ledger::{Ledger, RefundOutcome};
use crate::pipeline::{Handler, HandlerFuture, Pipeline, RequestContext};

pub fn router(state: &AppState) -> Router {
    let pipeline = Pipeline::builder("refunds", state.audit_tx.clone())
        .guard(RequireServiceToken::new(state.config.auth.service_token.as_deref()))
        .handler(ApplyRefund {
            ledger: state.ledger.clone(),
        });

    Router::new()
        .route("/v1/refunds", post(refund))
        .with_state(Endpoint::new(pipeline, state.clock.clone()))
}

/// Failure signal for an attempt that was charged but did not deliver.
/// Delivery is at-least-once; replays are absorbed by the ledger.
#[derive(Debug, Deserialize)]
struct RefundRequest {
    identity: String,
    attempt_id: String,
    amount: u64,
}

#[derive(Debug, Serialize)]
struct RefundResponse {
    attempt_id: String,
    #[serde(flatten)]
    outcome: RefundOutcome,
}

/// POST /v1/refunds
async fn refund(State(endpoint): State<Endpoint>, headers: HeaderMap, body: Bytes) -> Response {
    let ctx = endpoint.context(headers, body);
    endpoint.run(ctx).await
}

struct ApplyRefund {
    ledger: Ledger,
}

impl Handler for ApplyRefund {
    fn handle<'a>(&'a self, ctx: &'a mut RequestContext) -> HandlerFuture<'a> {
        Box::pin(async move {
            let req: RefundRequest = serde_json::from_slice(&ctx.body)?;
            if req.identity.is_empty() || req.attempt_id.is_empty() {
                return Err(AppError::ValidationFailed(
                    "identity and attempt_id are required".to_string(),
                ));
            }
            ctx.identity = Some(Identity::new(req.identity.clone()));
            ctx.log.insert_meta("attempt_id", req.attempt_id.clone());

            let outcome = self
                .ledger
                .refund(&req.identity, req.amount, &req.attempt_id)
                .await?;
            if let RefundOutcome::Applied { amount } = outcome {
                ctx.log.insert_meta("refunded", amount);
            }
            Ok(Json(RefundResponse {
                attempt_id: req.attempt_id,
                outcome,
            })
            .into_response())
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::api::test_support::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;

    fn refund(token: &str, body: serde_json::Value) -> Request<Body> {
        Request::post("/v1/refunds")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_refund_replay_applies_once() {
        let h = harness(config(10), 0);
        h.state.ledger.grant("alice", 100).await.unwrap();
        h.state.ledger.consume("alice", 30, "att-1", NOW).await.unwrap();

        let signal = json!({"identity": "alice", "attempt_id": "att-1", "amount": 30});
        let (status, body) = send(&h.app, refund("svc-token", signal.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "applied");
        assert_eq!(body["amount"], 30);

        let (status, body) = send(&h.app, refund("svc-token", signal)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "already_applied");
        assert_eq!(h.state.ledger.balance("alice", NOW).await.unwrap().total, 100);
    }

    #[tokio::test]
    async fn test_refund_requires_service_token() {
        let h = harness(config(10), 0);
        let signal = json!({"identity": "alice", "attempt_id": "att-1", "amount": 30});
        let (status, body) = send(&h.app, refund("user-key", signal)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "UNAUTHENTICATED");
    }

    #[tokio::test]
    async fn test_refund_unknown_attempt_changes_nothing() {
        let h = harness(config(10), 0);
        h.state.ledger.grant("alice", 50).await.unwrap();
        let signal = json!({"identity": "alice", "attempt_id": "never-charged", "amount": 30});
        let (status, body) = send(&h.app, refund("svc-token", signal)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "unknown_attempt");
        assert_eq!(h.state.ledger.balance("alice", NOW).await.unwrap().total, 50);
    }
}
