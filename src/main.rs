//! zapgate -- admission, metering and fallback execution for paid
//! generation requests.
//!
//! Entry point. Wires together:
//!   - Configuration loading
//!   - Database initialization
//!   - Backend registry and tool catalog
//!   - Audit writer for generation telemetry
//!   - HTTP server
//!   - Graceful shutdown on SIGTERM / SIGINT

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use zapgate::AppState;
use zapgate::api;
use zapgate::backends::BackendRegistry;
use zapgate::clock::{Clock, SystemClock};
use zapgate::config::Config;
use zapgate::db::Database;
use zapgate::telemetry::spawn_audit_logger;

/// How often expired admission counters are pruned.
const PRUNE_INTERVAL: Duration = Duration::from_secs(300);

/// Upper bound on waiting for the audit writer to drain at shutdown.
const AUDIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// CLI argument parsing (minimal, no clap dependency)
// ---------------------------------------------------------------------------

struct CliArgs {
    config_path: PathBuf,
}

fn parse_args() -> CliArgs {
    let mut args = std::env::args().skip(1);
    let mut config_path = PathBuf::from("zapgate.toml");

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                if let Some(path) = args.next() {
                    config_path = PathBuf::from(path);
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("zapgate {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                eprintln!("Run with --help for usage information.");
                std::process::exit(1);
            }
        }
    }

    CliArgs { config_path }
}

fn print_usage() {
    println!(
        "\
zapgate {version} -- gate for paid generation requests

USAGE:
    zapgate [OPTIONS]

OPTIONS:
    -c, --config <PATH>    Path to configuration file [default: zapgate.toml]
    -h, --help             Print this help message
    -V, --version          Print version information

ENVIRONMENT:
    RUST_LOG               Override log level (e.g. RUST_LOG=debug)
    ZAPGATE_CONFIG         Alternative to --config flag
",
        version = env!("CARGO_PKG_VERSION")
    );
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    // 1. Parse CLI arguments
    let cli = parse_args();

    let config_path = std::env::var("ZAPGATE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or(cli.config_path);

    // 2. Load configuration
    let config = Config::load(&config_path)?;

    // 3. Initialize tracing/logging
    init_tracing(&config);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "Starting zapgate"
    );
    for (key, env) in config.env_overrides.sorted() {
        tracing::info!(setting = key, env, "Setting overridden from environment");
    }

    // 4. Open database
    let db = Database::open(&config.database.path)?;
    tracing::info!(path = %config.database.path.display(), "Database opened");

    // 5. Backends
    let registry = BackendRegistry::from_config(&config.backends)?;
    tracing::info!(backends = registry.len(), tools = config.tools.len(), "Backends registered");
    if config.tools.is_empty() {
        tracing::warn!("No tools configured -- every generation request will be rejected");
    }
    if config.auth.service_token.is_none() {
        tracing::warn!("auth.service_token unset -- /v1/refunds is disabled");
    }

    // 6. Audit channel + background writer
    let (audit_tx, audit_rx) = tokio::sync::mpsc::unbounded_channel();
    let audit_handle = spawn_audit_logger(db.clone(), audit_rx);
    tracing::debug!("Audit logger spawned");

    // 7. Shared state
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let state = AppState::new(config.clone(), db, registry, clock.clone(), audit_tx)?;

    // 8. Periodic pruning of expired admission counters
    let rate_limits = state.rate_limits.clone();
    let prune_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(PRUNE_INTERVAL);
        loop {
            interval.tick().await;
            match rate_limits.prune(clock.now_epoch_seconds()).await {
                Ok(n) if n > 0 => {
                    tracing::debug!(removed = n, "Pruned expired admission counters");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Admission counter prune failed");
                }
                _ => {}
            }
        }
    });

    // 9. Build the router
    let app = build_app(state);

    // 10. Bind and serve
    let listen_addr = config.listen_addr();
    let listener = TcpListener::bind(&listen_addr).await?;
    tracing::info!(addr = %listen_addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 11. Cleanup. The router (and every audit sender it held) is gone
    // now, so the writer drains what is queued and exits.
    tracing::info!("Shutting down gracefully");
    prune_handle.abort();
    match tokio::time::timeout(AUDIT_DRAIN_TIMEOUT, audit_handle).await {
        Ok(_) => tracing::debug!("Audit log drained"),
        Err(_) => tracing::warn!("Audit log drain timed out, pending events dropped"),
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Router assembly
// ---------------------------------------------------------------------------

/// Build the application router with all middleware layers.
fn build_app(state: AppState) -> Router {
    let cors = build_cors_layer(&state.config);

    // -- Request ID layer (X-Request-ID) --------------------------------------
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    let trace = TraceLayer::new_for_http();

    api::build_api_router(state)
        .layer(propagate_id)
        .layer(trace)
        .layer(request_id)
        .layer(cors)
}

/// Build the CORS layer from config.
fn build_cors_layer(config: &Config) -> CorsLayer {
    if config.server.cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = config
            .server
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

// ---------------------------------------------------------------------------
// Tracing initialization
// ---------------------------------------------------------------------------

fn init_tracing(config: &Config) {
    // RUST_LOG env var takes precedence over config file
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &config.logging.level;
        EnvFilter::new(format!("zapgate={level},tower_http={level},warn"))
    });

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if config.logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

/// Wait for a shutdown signal (SIGTERM or SIGINT / Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C)");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
