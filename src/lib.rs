pub mod admission;
pub mod api;
pub mod auth;
pub mod backends;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod ledger;
pub mod orchestrator;
pub mod pipeline;
pub mod store;
pub mod telemetry;

use crate::admission::AdmissionController;
use crate::auth::{ApiKeyResolver, IdentityResolver, TrustedHeaderResolver};
use crate::backends::{BackendRegistry, RetryPolicy};
use crate::clock::Clock;
use crate::config::{AuthMode, Config};
use crate::db::Database;
use crate::ledger::Ledger;
use crate::orchestrator::{Orchestrator, ToolCatalog};
use crate::store::{RateLimitStore, SqliteStore};
use crate::telemetry::GenerationEvent;

use std::sync::Arc;

/// Shared application state accessible from all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub ledger: Ledger,
    pub admission: Arc<AdmissionController>,
    pub rate_limits: Arc<dyn RateLimitStore>,
    pub orchestrator: Orchestrator,
    pub identity: Arc<dyn IdentityResolver>,
    pub clock: Arc<dyn Clock>,
    pub audit_tx: tokio::sync::mpsc::UnboundedSender<GenerationEvent>,
}

impl AppState {
    /// Wire every component on top of one database. Fails if the tool
    /// catalog references a backend the registry does not have.
    pub fn new(
        config: Config,
        db: Database,
        registry: BackendRegistry,
        clock: Arc<dyn Clock>,
        audit_tx: tokio::sync::mpsc::UnboundedSender<GenerationEvent>,
    ) -> anyhow::Result<Self> {
        let store = Arc::new(
            SqliteStore::new(db.clone()).with_renewal_period(config.ledger.renewal_period_secs),
        );
        let ledger = Ledger::new(store.clone());
        let admission = Arc::new(AdmissionController::new(store.clone(), config.admission.clone()));

        let catalog = ToolCatalog::from_config(&config.tools, &registry)?;
        let orchestrator = Orchestrator::new(
            ledger.clone(),
            registry,
            catalog,
            RetryPolicy::from(&config.orchestrator),
        );

        let identity: Arc<dyn IdentityResolver> = match config.auth.mode {
            AuthMode::ApiKey => Arc::new(ApiKeyResolver::new(db.clone())),
            AuthMode::TrustedHeader => {
                Arc::new(TrustedHeaderResolver::new(config.auth.trusted_header.clone()))
            }
        };

        Ok(Self {
            config: Arc::new(config),
            db,
            ledger,
            admission,
            rate_limits: store,
            orchestrator,
            identity,
            clock,
            audit_tx,
        })
    }
}
