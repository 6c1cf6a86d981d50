//! Guard chain executor.
//!
//! An endpoint is an ordered list of [`Guard`]s plus a terminal
//! [`Handler`]. Guards run strictly in sequence; the first one that fails
//! or answers stops the chain. Whatever happens, including a panic, the
//! finally phase produces exactly one response and emits exactly one
//! [`GenerationEvent`].

pub mod context;

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::error::AppError;
use crate::ledger::{Ledger, RefundOutcome};
use crate::telemetry::GenerationEvent;

pub use self::context::{CommittedDebit, RequestContext};

/// What a guard decided.
#[derive(Debug)]
pub enum Flow {
    /// Hand the request to the next guard (or the handler).
    Continue,
    /// Stop here and send this response.
    Respond(Response),
}

pub type GuardFuture<'a> = Pin<Box<dyn Future<Output = Result<Flow, AppError>> + Send + 'a>>;
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<Response, AppError>> + Send + 'a>>;

/// One step of the chain. Returning `Err` short-circuits with the error's
/// response.
pub trait Guard: Send + Sync {
    fn name(&self) -> &'static str;

    fn check<'a>(&'a self, ctx: &'a mut RequestContext) -> GuardFuture<'a>;
}

/// Terminal business logic, run only when every guard continued.
pub trait Handler: Send + Sync {
    fn handle<'a>(&'a self, ctx: &'a mut RequestContext) -> HandlerFuture<'a>;
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct Pipeline {
    name: &'static str,
    guards: Vec<Arc<dyn Guard>>,
    handler: Arc<dyn Handler>,
    audit_tx: mpsc::UnboundedSender<GenerationEvent>,
    ledger: Option<Ledger>,
}

pub struct PipelineBuilder {
    name: &'static str,
    guards: Vec<Arc<dyn Guard>>,
    audit_tx: mpsc::UnboundedSender<GenerationEvent>,
    ledger: Option<Ledger>,
}

impl PipelineBuilder {
    pub fn guard(mut self, guard: impl Guard + 'static) -> Self {
        self.guards.push(Arc::new(guard));
        self
    }

    /// Ledger used to hand back a committed debit when the request still
    /// fails afterwards.
    pub fn compensate_with(mut self, ledger: Ledger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn handler(self, handler: impl Handler + 'static) -> Pipeline {
        Pipeline {
            name: self.name,
            guards: self.guards,
            handler: Arc::new(handler),
            audit_tx: self.audit_tx,
            ledger: self.ledger,
        }
    }
}

impl Pipeline {
    pub fn builder(
        name: &'static str,
        audit_tx: mpsc::UnboundedSender<GenerationEvent>,
    ) -> PipelineBuilder {
        PipelineBuilder {
            name,
            guards: Vec::new(),
            audit_tx,
            ledger: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Run the chain to completion. Never fails: every error, and every
    /// panic, becomes a response.
    pub async fn run(&self, mut ctx: RequestContext) -> Response {
        let outcome = AssertUnwindSafe(self.run_chain(&mut ctx))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(result) => result,
            Err(panic) => {
                error!(
                    pipeline = self.name,
                    request_id = %ctx.request_id,
                    panic = %panic_message(panic.as_ref()),
                    "Request handler panicked"
                );
                ctx.log.insert_meta("panic", true);
                Err(AppError::Internal("request handler panicked".to_string()))
            }
        };

        self.finish(ctx, result).await
    }

    async fn run_chain(&self, ctx: &mut RequestContext) -> Result<Response, AppError> {
        for guard in &self.guards {
            match guard.check(ctx).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Respond(response)) => {
                    debug!(pipeline = self.name, guard = guard.name(), "Guard answered");
                    return Ok(response);
                }
                Err(err) => {
                    debug!(pipeline = self.name, guard = guard.name(), error = %err, "Guard rejected");
                    return Err(err);
                }
            }
        }
        self.handler.handle(ctx).await
    }

    /// Finally phase: compensate, render, flush.
    async fn finish(&self, mut ctx: RequestContext, result: Result<Response, AppError>) -> Response {
        let error_code = result.as_ref().err().map(AppError::code);

        if error_code.is_some() {
            if let Some(committed) = ctx.committed.take() {
                let attempt_id = committed.attempt_id.clone();
                let compensated = AssertUnwindSafe(self.compensate(&mut ctx, committed))
                    .catch_unwind()
                    .await;
                if let Err(panic) = compensated {
                    error!(
                        pipeline = self.name,
                        attempt_id = %attempt_id,
                        panic = %panic_message(panic.as_ref()),
                        "Compensating refund panicked"
                    );
                    ctx.log.insert_meta("refund_error", "compensating refund panicked");
                }
            }
        }

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                ctx.log.insert_meta("error", err.to_string());
                err.into_response()
            }
        };

        ctx.log.insert_meta("pipeline", self.name);
        let latency_ms = u64::try_from(ctx.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let identity = ctx.identity.map(|i| i.id);
        let event = ctx.log.finish(ctx.request_id, identity, error_code, latency_ms);

        // Fire-and-forget: the writer persists it off the response path.
        if let Err(err) = self.audit_tx.send(event) {
            warn!(
                pipeline = self.name,
                request_id = %err.0.request_id,
                "Telemetry sink closed, event dropped"
            );
        }

        response
    }

    async fn compensate(&self, ctx: &mut RequestContext, committed: CommittedDebit) {
        let Some(ledger) = &self.ledger else {
            error!(
                pipeline = self.name,
                attempt_id = %committed.attempt_id,
                "Committed debit on failed request but no ledger to refund it"
            );
            return;
        };
        match ledger
            .refund(&committed.identity, committed.amount, &committed.attempt_id)
            .await
        {
            Ok(RefundOutcome::Applied { amount }) => {
                ctx.log.insert_meta("refunded", amount);
                ctx.log.set_cost(0);
            }
            Ok(other) => {
                warn!(attempt_id = %committed.attempt_id, outcome = ?other, "Compensating refund not applied");
            }
            Err(err) => {
                error!(attempt_id = %committed.attempt_id, error = %err, "Compensating refund failed");
                ctx.log.insert_meta("refund_error", err.to_string());
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
