//! Explicit registries built at startup.
//!
//! Cells, tools, and pipeline stages dispatch through maps constructed from
//! a scanned spec directory plus built-ins registered by the runner; nothing
//! is discovered through process-wide side effects.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;

use crate::session::SessionDb;

use super::spec::{CascadeConfigError, CascadeSpec, CellSpec};

#[derive(Debug, Error, Diagnostic)]
pub enum ToolError {
    #[error("unknown tool: {name}")]
    #[diagnostic(
        code(windlass::tools::unknown),
        help("Tools must be registered before the cascade runs.")
    )]
    Unknown { name: String },

    #[error("tool {name} failed: {message}")]
    #[diagnostic(code(windlass::tools::failed))]
    Failed { name: String, message: String },

    #[error("invalid arguments for {name}: {message}")]
    #[diagnostic(code(windlass::tools::arguments))]
    Arguments { name: String, message: String },
}

/// A deterministic tool callable from an LLM turn loop.
#[async_trait]
pub trait DataTool: Send + Sync {
    fn name(&self) -> &str;

    /// OpenAI-style function schema advertised to the model.
    fn schema(&self) -> Value;

    async fn call(&self, args: Value, session_db: &SessionDb) -> Result<Value, ToolError>;
}

/// Tagged dispatch target for a tool name.
#[derive(Clone)]
pub enum ToolKind {
    /// A deterministic function.
    Deterministic(Arc<dyn DataTool>),
    /// A one-cell LLM tool described by a cell spec.
    Llm(Box<CellSpec>),
    /// A sub-cascade invoked by id; runs as a child session.
    Cascade(String),
}

/// Startup-constructed lookup maps for tools, cascades, and pipeline stages.
#[derive(Default)]
pub struct Registries {
    tools: FxHashMap<String, ToolKind>,
    cascades: FxHashMap<String, CascadeSpec>,
    stages: FxHashMap<String, String>,
}

impl Registries {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_tool(&mut self, name: impl Into<String>, kind: ToolKind) {
        self.tools.insert(name.into(), kind);
    }

    pub fn register_cascade(&mut self, spec: CascadeSpec) {
        self.cascades.insert(spec.cascade_id.clone(), spec);
    }

    /// Bind a pipeline stage keyword (`ANALYZE`, `FILTER`, ...) to a
    /// registered cascade.
    pub fn bind_stage(&mut self, stage: impl Into<String>, cascade_id: impl Into<String>) {
        self.stages
            .insert(stage.into().to_ascii_uppercase(), cascade_id.into());
    }

    /// Scan a directory for cascade spec files (`*.yaml`, `*.yml`,
    /// `*.json`) and register each.
    pub fn load_spec_dir(&mut self, dir: &Path) -> Result<usize, CascadeConfigError> {
        let mut loaded = 0;
        let entries = std::fs::read_dir(dir).map_err(|e| CascadeConfigError::Io {
            path: dir.display().to_string(),
            message: e.to_string(),
        })?;
        let mut paths: Vec<_> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| matches!(e, "yaml" | "yml" | "json"))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();
        for path in paths {
            let spec = CascadeSpec::from_path(&path)?;
            tracing::debug!(cascade_id = %spec.cascade_id, path = %path.display(), "registered cascade");
            self.register_cascade(spec);
            loaded += 1;
        }
        Ok(loaded)
    }

    #[must_use]
    pub fn tool(&self, name: &str) -> Option<&ToolKind> {
        self.tools.get(name)
    }

    #[must_use]
    pub fn cascade(&self, id: &str) -> Option<&CascadeSpec> {
        self.cascades.get(id)
    }

    #[must_use]
    pub fn stage_cascade(&self, stage: &str) -> Option<&CascadeSpec> {
        self.stages
            .get(&stage.to_ascii_uppercase())
            .and_then(|id| self.cascades.get(id))
    }

    #[must_use]
    pub fn tool_schemas(&self, allowed: &[String]) -> Vec<Value> {
        allowed
            .iter()
            .filter_map(|name| match self.tools.get(name) {
                Some(ToolKind::Deterministic(tool)) => Some(tool.schema()),
                Some(ToolKind::Llm(cell)) => Some(llm_tool_schema(name, cell)),
                Some(ToolKind::Cascade(_)) => Some(cascade_tool_schema(name)),
                None => None,
            })
            .collect()
    }

    #[must_use]
    pub fn cascade_ids(&self) -> Vec<&str> {
        self.cascades.keys().map(String::as_str).collect()
    }
}

fn llm_tool_schema(name: &str, cell: &CellSpec) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": name,
            "description": cell.instructions.clone().unwrap_or_default(),
            "parameters": {
                "type": "object",
                "properties": {"input": {"type": "string"}},
                "required": ["input"],
            },
        },
    })
}

fn cascade_tool_schema(name: &str) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": name,
            "description": format!("Run the {name} cascade with the given JSON arguments."),
            "parameters": {
                "type": "object",
                "properties": {"args": {"type": "object"}},
            },
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::spec::CascadeSpec;

    fn demo_spec(id: &str) -> CascadeSpec {
        CascadeSpec::from_yaml_str(&format!(
            "cascade_id: {id}\ncells:\n  - name: only\n    instructions: hi\n"
        ))
        .unwrap()
    }

    #[test]
    fn stage_binding_is_case_insensitive() {
        let mut registries = Registries::new();
        registries.register_cascade(demo_spec("analyze_impl"));
        registries.bind_stage("analyze", "analyze_impl");
        assert!(registries.stage_cascade("ANALYZE").is_some());
        assert!(registries.stage_cascade("Analyze").is_some());
        assert!(registries.stage_cascade("SPEAK").is_none());
    }

    #[test]
    fn tool_schemas_skip_unknown_names() {
        let registries = Registries::new();
        let schemas = registries.tool_schemas(&["missing".to_string()]);
        assert!(schemas.is_empty());
    }
}
