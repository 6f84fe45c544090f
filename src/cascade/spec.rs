//! Cascade spec files: the declarative description of a workflow.

use std::path::Path;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::agent::TokenBudget;
use crate::session::CheckpointKind;

use super::template::scan_refs;

#[derive(Debug, Error, Diagnostic)]
pub enum CascadeConfigError {
    #[error("cannot read cascade file {path}: {message}")]
    #[diagnostic(code(windlass::cascade::io))]
    Io { path: String, message: String },

    #[error("cannot parse cascade spec: {message}")]
    #[diagnostic(
        code(windlass::cascade::parse),
        help("Cascade specs are YAML or JSON documents with cascade_id and cells.")
    )]
    Parse { message: String },

    #[error("duplicate cell name: {name}")]
    #[diagnostic(code(windlass::cascade::duplicate_cell))]
    DuplicateCell { name: String },

    #[error("cell {name} must declare exactly one of `instructions` or `tool`")]
    #[diagnostic(code(windlass::cascade::cell_body))]
    CellBody { name: String },

    #[error("cell {cell} references unknown template root `{root}`")]
    #[diagnostic(
        code(windlass::cascade::template_root),
        help("Template roots are input, state, outputs, and memory.")
    )]
    UnknownRoot { cell: String, root: String },

    #[error("cell {cell} references `outputs.{target}` but no cell named {target} precedes it")]
    #[diagnostic(code(windlass::cascade::unknown_output))]
    UnknownOutput { cell: String, target: String },

    #[error("cell {cell} references undeclared input `{input}`")]
    #[diagnostic(code(windlass::cascade::unknown_input))]
    UnknownInput { cell: String, input: String },
}

/// How a cell's final text is validated and interpreted.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    Text,
    Json,
    SqlExecute,
    SqlStatement,
}

/// Ward failure handling.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WardMode {
    Blocking,
    Retry,
    Advisory,
}

impl Default for WardMode {
    fn default() -> Self {
        WardMode::Blocking
    }
}

/// Closed set of validator kinds a ward can run.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum WardCheck {
    NonEmpty,
    MinLength { min: usize },
    MaxLength { max: usize },
    Contains { needle: String },
    NotContains { needle: String },
    JsonObject,
    Matches { pattern: String },
    /// An LLM validator; the prompt receives the candidate text and must
    /// answer with a verdict JSON (`{"valid": bool, "reason": "..."}`).
    Llm { prompt: String },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WardSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mode: WardMode,
    #[serde(flatten)]
    pub check: WardCheck,
    #[serde(default = "default_ward_retries")]
    pub max_retries: u32,
}

fn default_ward_retries() -> u32 {
    2
}

impl WardSpec {
    #[must_use]
    pub fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            match &self.check {
                WardCheck::NonEmpty => "non_empty",
                WardCheck::MinLength { .. } => "min_length",
                WardCheck::MaxLength { .. } => "max_length",
                WardCheck::Contains { .. } => "contains",
                WardCheck::NotContains { .. } => "not_contains",
                WardCheck::JsonObject => "json_object",
                WardCheck::Matches { .. } => "matches",
                WardCheck::Llm { .. } => "llm_validator",
            }
            .to_string()
        })
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct WardsSpec {
    #[serde(default)]
    pub pre: Vec<WardSpec>,
    #[serde(default)]
    pub post: Vec<WardSpec>,
}

/// Action taken when a checkpoint times out.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    /// Continue with the configured default response.
    Continue,
    /// Treat the timeout as cancellation.
    Abort,
    /// Re-run the cell body and ask again.
    Retry,
}

impl Default for TimeoutAction {
    fn default() -> Self {
        TimeoutAction::Abort
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HumanInputSpec {
    #[serde(rename = "type", default = "default_checkpoint_kind")]
    pub kind: CheckpointKind,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub hint: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub on_timeout: TimeoutAction,
    /// Default response used by `on_timeout: continue`.
    #[serde(default)]
    pub default: Option<Value>,
}

fn default_checkpoint_kind() -> CheckpointKind {
    CheckpointKind::Confirmation
}

impl Default for HumanInputSpec {
    fn default() -> Self {
        Self {
            kind: default_checkpoint_kind(),
            title: None,
            hint: None,
            timeout_seconds: None,
            on_timeout: TimeoutAction::default(),
            default: None,
        }
    }
}

/// `human_input: true` is shorthand for a default confirmation checkpoint.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum HumanInput {
    Flag(bool),
    Config(HumanInputSpec),
}

impl HumanInput {
    #[must_use]
    pub fn config(&self) -> Option<HumanInputSpec> {
        match self {
            HumanInput::Flag(false) => None,
            HumanInput::Flag(true) => Some(HumanInputSpec::default()),
            HumanInput::Config(spec) => Some(spec.clone()),
        }
    }
}

/// Auto-fix for failed deterministic cell bodies.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AutoFixSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_fix_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub model: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_fix_attempts() -> u32 {
    3
}

impl Default for AutoFixSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_fix_attempts(),
            model: None,
        }
    }
}

/// One step of a cascade.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CellSpec {
    pub name: String,
    /// LLM cell prompt. Exactly one of `instructions`/`tool` is set.
    #[serde(default)]
    pub instructions: Option<String>,
    /// Deterministic executor identifier (`sql`, `python`, `js`, `clojure`,
    /// or a registered tool name).
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub inputs: FxHashMap<String, Value>,
    #[serde(default)]
    pub tools_allowed: Vec<String>,
    #[serde(default)]
    pub takes: Option<u32>,
    #[serde(default)]
    pub max_parallel_takes: Option<u32>,
    #[serde(default)]
    pub reforge_steps: Option<u32>,
    #[serde(default)]
    pub reforge_attempts: Option<u32>,
    #[serde(default)]
    pub wards: WardsSpec,
    #[serde(default)]
    pub human_input: Option<HumanInput>,
    #[serde(default)]
    pub output_mode: Option<OutputMode>,
    /// Named memory slot loaded before execution and stored after.
    #[serde(default)]
    pub memory: Option<String>,
    /// Prior cells whose last message feeds this cell's context; all prior
    /// cells when unset.
    #[serde(default)]
    pub context: Option<Vec<String>>,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub model: Option<String>,
    /// When set, the cell's output is also assigned into `state.<name>`.
    #[serde(default)]
    pub state_bind: Option<String>,
    #[serde(default)]
    pub auto_fix: Option<AutoFixSpec>,
    #[serde(default)]
    pub token_budget: Option<TokenBudget>,
    #[serde(default)]
    pub native_tools: bool,
    /// Set false to skip materializing the result as `_<cell>`.
    #[serde(default)]
    pub materialize: Option<bool>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Expected return type for `sql_execute` mode.
    #[serde(default)]
    pub return_type: Option<String>,
}

impl CellSpec {
    #[must_use]
    pub fn is_llm(&self) -> bool {
        self.instructions.is_some()
    }

    /// Take count; 1 unless soundings are requested.
    #[must_use]
    pub fn effective_takes(&self) -> u32 {
        self.takes.filter(|t| *t >= 2).unwrap_or(1)
    }

    /// Max turns: default 1, always at least 1 when tools are allowed.
    #[must_use]
    pub fn effective_max_turns(&self) -> u32 {
        let configured = self.max_turns.unwrap_or(1);
        if self.tools_allowed.is_empty() {
            configured.max(1)
        } else {
            configured.max(2)
        }
    }

    #[must_use]
    pub fn human_input_config(&self) -> Option<HumanInputSpec> {
        self.human_input.as_ref().and_then(HumanInput::config)
    }

    #[must_use]
    pub fn should_materialize(&self) -> bool {
        self.materialize.unwrap_or(true)
    }
}

/// A full cascade spec: ordered cells plus input schema.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CascadeSpec {
    pub cascade_id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub inputs_schema: FxHashMap<String, String>,
    pub cells: Vec<CellSpec>,
}

impl CascadeSpec {
    /// Load from a YAML or JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CascadeConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| CascadeConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let spec = if path.extension().map(|e| e == "json").unwrap_or(false) {
            Self::from_json_str(&raw)?
        } else {
            Self::from_yaml_str(&raw)?
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, CascadeConfigError> {
        serde_yaml::from_str(raw).map_err(|e| CascadeConfigError::Parse {
            message: e.to_string(),
        })
    }

    pub fn from_json_str(raw: &str) -> Result<Self, CascadeConfigError> {
        serde_json::from_str(raw).map_err(|e| CascadeConfigError::Parse {
            message: e.to_string(),
        })
    }

    #[must_use]
    pub fn cell(&self, name: &str) -> Option<&CellSpec> {
        self.cells.iter().find(|c| c.name == name)
    }

    #[must_use]
    pub fn cell_index(&self, name: &str) -> Option<usize> {
        self.cells.iter().position(|c| c.name == name)
    }

    /// Validate structure and template references before any execution:
    /// unique cell names, exactly one body per cell, and every template
    /// reference resolvable against declared inputs and preceding cells.
    pub fn validate(&self) -> Result<(), CascadeConfigError> {
        let mut seen: Vec<&str> = Vec::new();
        for (idx, cell) in self.cells.iter().enumerate() {
            if seen.contains(&cell.name.as_str()) {
                return Err(CascadeConfigError::DuplicateCell {
                    name: cell.name.clone(),
                });
            }
            if cell.instructions.is_some() == cell.tool.is_some() {
                return Err(CascadeConfigError::CellBody {
                    name: cell.name.clone(),
                });
            }

            let mut templates: Vec<&str> = Vec::new();
            if let Some(instructions) = &cell.instructions {
                templates.push(instructions);
            }
            for value in cell.inputs.values() {
                if let Value::String(s) = value {
                    templates.push(s);
                }
            }
            for template in templates {
                for reference in scan_refs(template) {
                    let mut parts = reference.splitn(2, '.');
                    let root = parts.next().unwrap_or_default();
                    let rest = parts.next();
                    match root {
                        "state" | "memory" => {}
                        "input" => {
                            if !self.inputs_schema.is_empty() {
                                let key = rest
                                    .map(|r| r.split('.').next().unwrap_or(r))
                                    .unwrap_or_default();
                                if !key.is_empty() && !self.inputs_schema.contains_key(key) {
                                    return Err(CascadeConfigError::UnknownInput {
                                        cell: cell.name.clone(),
                                        input: key.to_string(),
                                    });
                                }
                            }
                        }
                        "outputs" => {
                            let target = rest
                                .map(|r| r.split('.').next().unwrap_or(r))
                                .unwrap_or_default();
                            let precedes = self.cells[..idx].iter().any(|c| c.name == target);
                            if !precedes {
                                return Err(CascadeConfigError::UnknownOutput {
                                    cell: cell.name.clone(),
                                    target: target.to_string(),
                                });
                            }
                        }
                        other => {
                            return Err(CascadeConfigError::UnknownRoot {
                                cell: cell.name.clone(),
                                root: other.to_string(),
                            });
                        }
                    }
                }
            }
            seen.push(&cell.name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_CELL_YAML: &str = r#"
cascade_id: demo
description: two cells
inputs_schema:
  topic: what to write about
cells:
  - name: first
    instructions: "Write JSON about {{ input.topic }}"
    output_mode: json
  - name: second
    instructions: "Use {{ outputs.first.x }}"
"#;

    #[test]
    fn parse_and_validate_yaml() {
        let spec = CascadeSpec::from_yaml_str(TWO_CELL_YAML).unwrap();
        spec.validate().unwrap();
        assert_eq!(spec.cascade_id, "demo");
        assert_eq!(spec.cells.len(), 2);
        assert!(spec.cells[0].is_llm());
        assert_eq!(spec.cells[0].output_mode, Some(OutputMode::Json));
    }

    #[test]
    fn forward_output_reference_is_rejected() {
        let raw = r#"
cascade_id: bad
cells:
  - name: first
    instructions: "Needs {{ outputs.second.x }}"
  - name: second
    instructions: "hi"
"#;
        let spec = CascadeSpec::from_yaml_str(raw).unwrap();
        assert!(matches!(
            spec.validate(),
            Err(CascadeConfigError::UnknownOutput { .. })
        ));
    }

    #[test]
    fn unknown_input_is_rejected() {
        let raw = r#"
cascade_id: bad
inputs_schema:
  topic: t
cells:
  - name: first
    instructions: "Needs {{ input.missing }}"
"#;
        let spec = CascadeSpec::from_yaml_str(raw).unwrap();
        assert!(matches!(
            spec.validate(),
            Err(CascadeConfigError::UnknownInput { .. })
        ));
    }

    #[test]
    fn cell_needs_exactly_one_body() {
        let raw = r#"
cascade_id: bad
cells:
  - name: first
    instructions: "hi"
    tool: sql
"#;
        let spec = CascadeSpec::from_yaml_str(raw).unwrap();
        assert!(matches!(
            spec.validate(),
            Err(CascadeConfigError::CellBody { .. })
        ));
    }

    #[test]
    fn human_input_flag_shorthand() {
        let raw = r#"
cascade_id: demo
cells:
  - name: ask
    instructions: "hi"
    human_input: true
"#;
        let spec = CascadeSpec::from_yaml_str(raw).unwrap();
        let config = spec.cells[0].human_input_config().unwrap();
        assert_eq!(config.kind, CheckpointKind::Confirmation);
    }

    #[test]
    fn turn_floor_with_tools() {
        let mut cell = CascadeSpec::from_yaml_str(TWO_CELL_YAML).unwrap().cells[0].clone();
        assert_eq!(cell.effective_max_turns(), 1);
        cell.tools_allowed = vec!["run_sql".to_string()];
        assert!(cell.effective_max_turns() >= 2);
        assert_eq!(cell.effective_takes(), 1);
        cell.takes = Some(3);
        assert_eq!(cell.effective_takes(), 3);
    }
}
