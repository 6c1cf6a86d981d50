//! Reusable guards. Endpoints are assembled from these in order.

use std::sync::Arc;

use crate::admission::AdmissionController;
use crate::auth::{IdentityResolver, extract_bearer_token, hash_api_key};
use crate::error::AppError;
use crate::orchestrator::{GenerationBody, Orchestrator};
use crate::pipeline::{CommittedDebit, Flow, Guard, GuardFuture, RequestContext};

/// Header a client may use instead of the `model` query parameter.
pub const MODEL_HEADER: &str = "x-generation-model";

fn missing(slot: &str) -> AppError {
    AppError::Internal(format!("guard ran before {slot} was resolved"))
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

pub struct ResolveIdentity {
    resolver: Arc<dyn IdentityResolver>,
}

impl ResolveIdentity {
    pub fn new(resolver: Arc<dyn IdentityResolver>) -> Self {
        Self { resolver }
    }
}

impl Guard for ResolveIdentity {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn check<'a>(&'a self, ctx: &'a mut RequestContext) -> GuardFuture<'a> {
        Box::pin(async move {
            let identity = self.resolver.resolve(&ctx.headers).await?;
            ctx.identity = Some(identity);
            Ok(Flow::Continue)
        })
    }
}

/// Accepts only the configured service token. Used by endpoints that are
/// called by other services rather than by end users.
pub struct RequireServiceToken {
    token_hash: Option<String>,
}

impl RequireServiceToken {
    pub fn new(token: Option<&str>) -> Self {
        Self {
            token_hash: token.filter(|t| !t.is_empty()).map(hash_api_key),
        }
    }
}

impl Guard for RequireServiceToken {
    fn name(&self) -> &'static str {
        "service_token"
    }

    fn check<'a>(&'a self, ctx: &'a mut RequestContext) -> GuardFuture<'a> {
        Box::pin(async move {
            let Some(expected) = &self.token_hash else {
                return Err(AppError::Unauthenticated(
                    "Service endpoints are disabled".to_string(),
                ));
            };
            let token = extract_bearer_token(&ctx.headers)?;
            if hash_api_key(&token) != *expected {
                return Err(AppError::Unauthenticated("Invalid service token".to_string()));
            }
            Ok(Flow::Continue)
        })
    }
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

/// Picks the catalog model (query, header, or the tool default) and counts
/// the request against its ceiling.
pub struct Admit {
    admission: Arc<AdmissionController>,
    orchestrator: Orchestrator,
}

impl Admit {
    pub fn new(admission: Arc<AdmissionController>, orchestrator: Orchestrator) -> Self {
        Self {
            admission,
            orchestrator,
        }
    }
}

impl Guard for Admit {
    fn name(&self) -> &'static str {
        "admission"
    }

    fn check<'a>(&'a self, ctx: &'a mut RequestContext) -> GuardFuture<'a> {
        Box::pin(async move {
            let tool = ctx.tool.clone().ok_or_else(|| missing("tool"))?;
            let requested = ctx
                .query
                .get("model")
                .map(String::as_str)
                .or_else(|| ctx.header(MODEL_HEADER))
                .map(str::to_string);
            let (_, model) = self
                .orchestrator
                .catalog()
                .resolve(&tool, requested.as_deref())?;
            let model = model.name.clone();
            ctx.log.set_model(&model);
            ctx.model = Some(model.clone());

            let identity = ctx.identity_id().ok_or_else(|| missing("identity"))?.to_string();
            match self.admission.admit(&identity, &tool, Some(model.as_str()), ctx.now).await {
                Ok(admitted) => {
                    ctx.log.insert_meta("window_count", admitted.count);
                    Ok(Flow::Continue)
                }
                Err(err) => {
                    ctx.log.set_cost(0);
                    Err(err.into())
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

pub struct ParseGenerationBody {
    orchestrator: Orchestrator,
}

impl ParseGenerationBody {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }
}

impl Guard for ParseGenerationBody {
    fn name(&self) -> &'static str {
        "parse_body"
    }

    fn check<'a>(&'a self, ctx: &'a mut RequestContext) -> GuardFuture<'a> {
        Box::pin(async move {
            let tool = ctx.tool.clone().ok_or_else(|| missing("tool"))?;
            let body: GenerationBody = if ctx.body.is_empty() {
                GenerationBody::default()
            } else {
                serde_json::from_slice(&ctx.body)?
            };
            let request = self.orchestrator.resolve(&tool, ctx.model.as_deref(), body)?;
            ctx.generation = Some(request);
            Ok(Flow::Continue)
        })
    }
}

/// Runs the orchestrator and records the committed debit so the finally
/// phase can hand it back if anything after this point fails.
pub struct ReserveAndExecute {
    orchestrator: Orchestrator,
}

impl ReserveAndExecute {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }
}

impl Guard for ReserveAndExecute {
    fn name(&self) -> &'static str {
        "execute"
    }

    fn check<'a>(&'a self, ctx: &'a mut RequestContext) -> GuardFuture<'a> {
        Box::pin(async move {
            let identity = ctx
                .identity
                .as_ref()
                .map(|i| i.id.clone())
                .ok_or_else(|| missing("identity"))?;
            let request = ctx.generation.as_ref().ok_or_else(|| missing("request body"))?;

            let outcome = self
                .orchestrator
                .execute(&identity, request, &mut ctx.log, ctx.now)
                .await?;

            ctx.committed = Some(CommittedDebit {
                identity,
                attempt_id: outcome.attempt_id.clone(),
                amount: outcome.charged,
            });
            ctx.outcome = Some(outcome);
            Ok(Flow::Continue)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Identity, TrustedHeaderResolver};
    use axum::body::Bytes;
    use axum::http::{HeaderMap, HeaderValue, header};

    fn ctx(headers: HeaderMap) -> RequestContext {
        RequestContext::new("req-1", 1_700_000_000, headers, Bytes::new())
    }

    #[tokio::test]
    async fn test_resolve_identity_fills_slot() {
        let guard = ResolveIdentity::new(Arc::new(TrustedHeaderResolver::new("x-user-id")));
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_static("alice"));
        let mut ctx = ctx(headers);

        assert!(matches!(guard.check(&mut ctx).await, Ok(Flow::Continue)));
        assert_eq!(ctx.identity, Some(Identity::new("alice")));
    }

    #[tokio::test]
    async fn test_service_token_guard() {
        let guard = RequireServiceToken::new(Some("svc-secret"));
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer svc-secret"));
        assert!(guard.check(&mut ctx(headers)).await.is_ok());

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer nope"));
        assert!(matches!(
            guard.check(&mut ctx(headers)).await,
            Err(AppError::Unauthenticated(_))
        ));
    }

    #[tokio::test]
    async fn test_service_token_unset_disables_endpoint() {
        let guard = RequireServiceToken::new(None);
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer anything"));
        assert!(matches!(
            guard.check(&mut ctx(headers)).await,
            Err(AppError::Unauthenticated(_))
        ));
    }
}
