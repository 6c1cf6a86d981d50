use std::collections::BTreeMap;

use serde::Serialize;

use crate::backends::BackendRegistry;
use crate::config::ToolConfig;
use crate::error::AppError;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("duplicate tool: {0}")]
    DuplicateTool(String),

    #[error("tool {tool}: duplicate model {model}")]
    DuplicateModel { tool: String, model: String },

    #[error("tool {tool}: default model {model} is not configured")]
    UnknownDefaultModel { tool: String, model: String },

    #[error("tool {tool}, model {model}: no backends configured")]
    EmptyChain { tool: String, model: String },

    #[error("tool {tool}, model {model}: unknown backend {backend}")]
    UnknownBackend {
        tool: String,
        model: String,
        backend: String,
    },
}

/// One link in a model's fallback chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendTarget {
    pub backend: String,
    /// The backend's own name for the model.
    pub upstream_model: String,
    /// Credits per unit when this target produces it.
    pub cost: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSpec {
    pub name: String,
    pub cost: u64,
    pub targets: Vec<BackendTarget>,
}

impl ModelSpec {
    /// Most any single unit can cost, whichever target produces it.
    pub fn max_unit_cost(&self) -> u64 {
        self.targets
            .iter()
            .map(|t| t.cost)
            .max()
            .unwrap_or(self.cost)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub task: String,
    pub default_model: String,
    pub max_count: u32,
    pub models: BTreeMap<String, ModelSpec>,
}

/// Static cost table and fallback chains, validated against the backend
/// registry once at startup.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: BTreeMap<String, ToolSpec>,
}

impl ToolCatalog {
    pub fn from_config(tools: &[ToolConfig], registry: &BackendRegistry) -> Result<Self, CatalogError> {
        let mut catalog = BTreeMap::new();
        for tool in tools {
            let mut models = BTreeMap::new();
            for model in &tool.models {
                if model.backends.is_empty() {
                    return Err(CatalogError::EmptyChain {
                        tool: tool.name.clone(),
                        model: model.name.clone(),
                    });
                }
                let mut targets = Vec::with_capacity(model.backends.len());
                for target in &model.backends {
                    if !registry.contains(&target.backend) {
                        return Err(CatalogError::UnknownBackend {
                            tool: tool.name.clone(),
                            model: model.name.clone(),
                            backend: target.backend.clone(),
                        });
                    }
                    targets.push(BackendTarget {
                        backend: target.backend.clone(),
                        upstream_model: target.model.clone().unwrap_or_else(|| model.name.clone()),
                        cost: target.cost.unwrap_or(model.cost),
                    });
                }
                let spec = ModelSpec {
                    name: model.name.clone(),
                    cost: model.cost,
                    targets,
                };
                if models.insert(model.name.clone(), spec).is_some() {
                    return Err(CatalogError::DuplicateModel {
                        tool: tool.name.clone(),
                        model: model.name.clone(),
                    });
                }
            }
            if !models.contains_key(&tool.default_model) {
                return Err(CatalogError::UnknownDefaultModel {
                    tool: tool.name.clone(),
                    model: tool.default_model.clone(),
                });
            }
            let spec = ToolSpec {
                name: tool.name.clone(),
                task: tool.task.clone(),
                default_model: tool.default_model.clone(),
                max_count: tool.max_count.max(1),
                models,
            };
            if catalog.insert(tool.name.clone(), spec).is_some() {
                return Err(CatalogError::DuplicateTool(tool.name.clone()));
            }
        }
        Ok(Self { tools: catalog })
    }

    pub fn tool(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    /// Look up a tool and model, falling back to the tool's default model.
    pub fn resolve(&self, tool: &str, model: Option<&str>) -> Result<(&ToolSpec, &ModelSpec), AppError> {
        let spec = self
            .tools
            .get(tool)
            .ok_or_else(|| AppError::ValidationFailed(format!("Unknown tool: {tool}")))?;
        let model_name = model.unwrap_or(&spec.default_model);
        let model = spec.models.get(model_name).ok_or_else(|| {
            AppError::ValidationFailed(format!("Unknown model for {tool}: {model_name}"))
        })?;
        Ok((spec, model))
    }

    pub fn tools(&self) -> impl Iterator<Item = &ToolSpec> {
        self.tools.values()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
