use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::ledger::account::DEFAULT_RENEWAL_PERIOD_SECS;

// ---------------------------------------------------------------------------
// Environment override tracking
// ---------------------------------------------------------------------------

/// Tracks which configuration settings are overridden by environment variables.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    overrides: HashMap<String, String>,
}

impl EnvOverrides {
    /// Overridden setting keys (e.g. "server.host") and the env var that
    /// set each one, sorted by key.
    pub fn sorted(&self) -> Vec<(&str, &str)> {
        let mut pairs: Vec<_> = self
            .overrides
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        pairs.sort_unstable();
        pairs
    }

    fn record(&mut self, key: &str, env_var: &str) {
        self.overrides.insert(key.to_string(), env_var.to_string());
    }
}

// ---------------------------------------------------------------------------
// Main configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Downstream generation services, referenced by id from `tools`.
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub tools: Vec<ToolConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Env var overrides are not serialized to TOML.
    #[serde(skip)]
    pub env_overrides: EnvOverrides,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// `Authorization: Bearer <key>` looked up by hash in `api_keys`.
    #[default]
    ApiKey,
    /// Identity taken verbatim from a header set by an upstream proxy.
    TrustedHeader,
}

impl std::fmt::Display for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiKey => write!(f, "api_key"),
            Self::TrustedHeader => write!(f, "trusted_header"),
        }
    }
}

impl FromStr for AuthMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "api_key" | "apikey" => Ok(Self::ApiKey),
            "trusted_header" | "header" => Ok(Self::TrustedHeader),
            _ => Err(format!("Unknown auth mode: {s}")),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,
    #[serde(default = "default_trusted_header")]
    pub trusted_header: String,
    /// Bearer token accepted by the refund endpoint. Unset disables it.
    #[serde(default)]
    pub service_token: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::default(),
            trusted_header: default_trusted_header(),
            service_token: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    /// Counters reset at every `window_secs` boundary.
    #[default]
    Fixed,
    /// Current bucket plus the previous one, weighted by how much of it
    /// still overlaps the trailing window.
    Sliding,
}

impl std::fmt::Display for WindowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed => write!(f, "fixed"),
            Self::Sliding => write!(f, "sliding"),
        }
    }
}

impl FromStr for WindowKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "sliding" | "rolling" => Ok(Self::Sliding),
            _ => Err(format!("Unknown window kind: {s}")),
        }
    }
}

/// Ceiling override for one tool, or one model of a tool.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CeilingRule {
    pub tool: String,
    #[serde(default)]
    pub model: Option<String>,
    pub ceiling: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdmissionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub window: WindowKind,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Requests per window per (identity, tool, model) when no rule matches.
    #[serde(default = "default_ceiling")]
    pub default_ceiling: u64,
    #[serde(default)]
    pub rules: Vec<CeilingRule>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: WindowKind::default(),
            window_secs: default_window_secs(),
            default_ceiling: default_ceiling(),
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LedgerConfig {
    /// Length of one subscription credit period.
    #[serde(default = "default_renewal_period")]
    pub renewal_period_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            renewal_period_secs: default_renewal_period(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    /// Attempts per generated unit, summed over the whole backend chain.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

// ---------------------------------------------------------------------------
// Backends and tool catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BackendConfig {
    pub id: String,
    pub url: String,
    /// Sent as `Authorization: Bearer`.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ToolConfig {
    pub name: String,
    #[serde(default = "default_task")]
    pub task: String,
    pub default_model: String,
    #[serde(default = "default_max_count")]
    pub max_count: u32,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ModelConfig {
    pub name: String,
    /// Credits per generated unit.
    pub cost: u64,
    /// Equivalent backends, tried in order.
    #[serde(default)]
    pub backends: Vec<BackendTargetConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BackendTargetConfig {
    pub backend: String,
    /// Model name as the backend knows it. Defaults to the catalog name.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub cost: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Default value functions
// ---------------------------------------------------------------------------

const fn default_port() -> u16 {
    8480
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_db_path() -> PathBuf {
    PathBuf::from("zapgate.db")
}
fn default_trusted_header() -> String {
    "x-user-id".to_string()
}
const fn default_true() -> bool {
    true
}
const fn default_window_secs() -> u64 {
    60
}
const fn default_ceiling() -> u64 {
    30
}
const fn default_renewal_period() -> u64 {
    DEFAULT_RENEWAL_PERIOD_SECS
}
const fn default_max_attempts() -> u32 {
    3
}
const fn default_initial_backoff_ms() -> u64 {
    250
}
const fn default_max_backoff_ms() -> u64 {
    4_000
}
const fn default_backoff_multiplier() -> f64 {
    2.0
}
const fn default_backend_timeout() -> u64 {
    120
}
fn default_task() -> String {
    "generation".to_string()
}
const fn default_max_count() -> u32 {
    4
}
fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Config loading and env overrides
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a TOML file, then apply environment variable
    /// overrides. Any setting prefixed with `ZAPGATE_` takes precedence over
    /// the file value and is tracked in `env_overrides`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            config
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Apply environment variable overrides. The tool catalog and backend
    /// list are file-only.
    fn apply_env_overrides(&mut self) {
        let mut ov = EnvOverrides::default();

        macro_rules! env_str {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = val;
                    ov.record($key, $env);
                }
            };
        }
        macro_rules! env_bool {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
                    ov.record($key, $env);
                }
            };
        }
        macro_rules! env_parse {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    if let Ok(parsed) = val.parse() {
                        $field = parsed;
                        ov.record($key, $env);
                    }
                }
            };
        }
        macro_rules! env_path {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = PathBuf::from(val);
                    ov.record($key, $env);
                }
            };
        }
        macro_rules! env_opt_str {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = if val.is_empty() { None } else { Some(val) };
                    ov.record($key, $env);
                }
            };
        }

        // -- Server --
        env_str!("server.host", "ZAPGATE_SERVER_HOST", self.server.host);
        env_parse!("server.port", "ZAPGATE_SERVER_PORT", self.server.port);
        if let Ok(val) = std::env::var("ZAPGATE_SERVER_CORS_ORIGINS") {
            self.server.cors_origins = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            ov.record("server.cors_origins", "ZAPGATE_SERVER_CORS_ORIGINS");
        }

        // -- Database --
        env_path!("database.path", "ZAPGATE_DATABASE_PATH", self.database.path);

        // -- Auth --
        env_parse!("auth.mode", "ZAPGATE_AUTH_MODE", self.auth.mode);
        env_str!(
            "auth.trusted_header",
            "ZAPGATE_AUTH_TRUSTED_HEADER",
            self.auth.trusted_header
        );
        env_opt_str!(
            "auth.service_token",
            "ZAPGATE_AUTH_SERVICE_TOKEN",
            self.auth.service_token
        );

        // -- Admission --
        env_bool!(
            "admission.enabled",
            "ZAPGATE_ADMISSION_ENABLED",
            self.admission.enabled
        );
        env_parse!(
            "admission.window",
            "ZAPGATE_ADMISSION_WINDOW",
            self.admission.window
        );
        env_parse!(
            "admission.window_secs",
            "ZAPGATE_ADMISSION_WINDOW_SECS",
            self.admission.window_secs
        );
        env_parse!(
            "admission.default_ceiling",
            "ZAPGATE_ADMISSION_DEFAULT_CEILING",
            self.admission.default_ceiling
        );

        // -- Ledger --
        env_parse!(
            "ledger.renewal_period_secs",
            "ZAPGATE_LEDGER_RENEWAL_PERIOD_SECS",
            self.ledger.renewal_period_secs
        );

        // -- Orchestrator --
        env_parse!(
            "orchestrator.max_attempts",
            "ZAPGATE_ORCHESTRATOR_MAX_ATTEMPTS",
            self.orchestrator.max_attempts
        );
        env_parse!(
            "orchestrator.initial_backoff_ms",
            "ZAPGATE_ORCHESTRATOR_INITIAL_BACKOFF_MS",
            self.orchestrator.initial_backoff_ms
        );
        env_parse!(
            "orchestrator.max_backoff_ms",
            "ZAPGATE_ORCHESTRATOR_MAX_BACKOFF_MS",
            self.orchestrator.max_backoff_ms
        );

        // -- Logging --
        env_str!("logging.level", "ZAPGATE_LOG_LEVEL", self.logging.level);
        env_bool!("logging.json", "ZAPGATE_LOG_JSON", self.logging.json);

        self.env_overrides = ov;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
