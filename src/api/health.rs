use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: &'static str,
    pub database: bool,
    pub tools: Vec<ToolSummary>,
}

#[derive(Debug, Serialize)]
pub struct ToolSummary {
    pub name: String,
    pub task: String,
    pub default_model: String,
    pub models: Vec<ModelSummary>,
}

#[derive(Debug, Serialize)]
pub struct ModelSummary {
    pub name: String,
    pub cost: u64,
    pub backends: Vec<String>,
}

/// GET /health
///
/// Liveness plus the configured tool catalog. No authentication required.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let database = state
        .db
        .with_conn(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)))
        .is_ok();

    let tools = state
        .orchestrator
        .catalog()
        .tools()
        .map(|tool| ToolSummary {
            name: tool.name.clone(),
            task: tool.task.clone(),
            default_model: tool.default_model.clone(),
            models: tool
                .models
                .values()
                .map(|m| ModelSummary {
                    name: m.name.clone(),
                    cost: m.cost,
                    backends: m.targets.iter().map(|t| t.backend.clone()).collect(),
                })
                .collect(),
        })
        .collect();

    Json(HealthResponse {
        status: if database { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION"),
        database,
        tools,
    })
}
