use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::AppState;
use crate::api::Endpoint;
use crate::api::guards::ResolveIdentity;
use crate::error::AppError;
use crate::ledger::{Balance, Ledger};
use crate::pipeline::{Handler, HandlerFuture, Pipeline, RequestContext};

pub fn router(state: &AppState) -> Router {
    let pipeline = Pipeline::builder("credits", state.audit_tx.clone())
        .guard(ResolveIdentity::new(state.identity.clone()))
        .handler(ShowBalance {
            ledger: state.ledger.clone(),
        });

    Router::new()
        .route("/v1/credits", get(credits))
        .with_state(Endpoint::new(pipeline, state.clock.clone()))
}

#[derive(Debug, Serialize)]
struct CreditsResponse {
    identity: String,
    #[serde(flatten)]
    balance: Balance,
}

/// GET /v1/credits
async fn credits(State(endpoint): State<Endpoint>, headers: HeaderMap) -> Response {
    let ctx = endpoint.context(headers, Bytes::new());
    endpoint.run(ctx).await
}

struct ShowBalance {
    ledger: Ledger,
}

impl Handler for ShowBalance {
    fn handle<'a>(&'a self, ctx: &'a mut RequestContext) -> HandlerFuture<'a> {
        Box::pin(async move {
            let identity = ctx
                .identity_id()
                .ok_or_else(|| AppError::Internal("identity not resolved".to_string()))?
                .to_string();
            let balance = self.ledger.balance(&identity, ctx.now).await?;
            Ok(Json(CreditsResponse { identity, balance }).into_response())
        })
    }
}
