//! The SQL UDF bridge.
//!
//! Scans user SQL for `rvbbit(...)` / `windlass_udf(...)` /
//! `rvbbit_cascade(...)` calls, rewrites the query so the call arguments
//! come back as probe columns, runs one cascade per distinct argument tuple
//! (through a structure-aware cache), and substitutes the results into the
//! result frame. Trailing `THEN <STAGE>` segments run the pipeline.

use std::sync::Arc;

use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::cascade::spec::{CascadeSpec, CellSpec};
use crate::echo::{EchoError, LogRow, LogWriter, NodeType};
use crate::frame::{Frame, INLINE_CELL_LIMIT};
use crate::runner::{CascadeRunner, RunOptions, RunnerError};
use crate::session::db::SessionDbError;
use crate::session::SessionDb;

use super::pipeline::{parse_pipeline, PipelineError, PipelineStage};
use super::structure::{make_cache_key, structure_mode_inputs};

/// UDF identifiers recognized inside user SQL.
const UDF_NAMES: [&str; 3] = ["rvbbit", "windlass_udf", "rvbbit_cascade"];

#[derive(Debug, Error, Diagnostic)]
pub enum BridgeError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    SessionDb(#[from] SessionDbError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Echo(#[from] EchoError),

    #[error("cascade execution failed: {0}")]
    #[diagnostic(code(windlass::bridge::runner))]
    Runner(Box<RunnerError>),

    #[error("{name} expects {expected} arguments, got {got}")]
    #[diagnostic(code(windlass::bridge::arity))]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("unknown cascade: {id}")]
    #[diagnostic(code(windlass::bridge::unknown_cascade))]
    UnknownCascade { id: String },
}

impl From<RunnerError> for BridgeError {
    fn from(err: RunnerError) -> Self {
        BridgeError::Runner(Box::new(err))
    }
}

/// One UDF call found in user SQL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UdfCall {
    pub name: String,
    /// Raw SQL expressions, split at top-level commas.
    pub args: Vec<String>,
    /// Byte span of the call expression.
    pub start: usize,
    pub end: usize,
    /// Optional `AS alias` following the call; `span_end` covers it.
    pub alias: Option<String>,
    pub span_end: usize,
}

#[derive(Clone)]
struct CacheEntry {
    value: Value,
    provider_request_id: Option<String>,
}

/// Embeds cascade calls in SQL. One bridge owns one session DB; each
/// `execute` is one SQL statement with its own caller id.
pub struct SqlBridge {
    runner: Arc<CascadeRunner>,
    session_db: SessionDb,
    session_id: String,
    cache: RwLock<FxHashMap<String, CacheEntry>>,
    structure_keys: Vec<String>,
}

impl SqlBridge {
    /// Open a bridge with its own session database.
    pub async fn open(runner: Arc<CascadeRunner>) -> Result<Self, BridgeError> {
        let session_id = format!("sqlbridge-{}", Uuid::new_v4());
        let config = runner.config();
        let session_db = SessionDb::open(
            &config.sessions_dir(),
            &config.artifacts_dir(),
            &session_id,
        )
        .await?;
        Ok(Self {
            runner,
            session_db,
            session_id,
            cache: RwLock::new(FxHashMap::default()),
            structure_keys: Vec::new(),
        })
    }

    /// Mark argument names whose cache digest uses the JSON shape instead of
    /// the content.
    #[must_use]
    pub fn with_structure_keys(mut self, keys: Vec<String>) -> Self {
        self.structure_keys = keys;
        self
    }

    #[must_use]
    pub fn session_db(&self) -> &SessionDb {
        &self.session_db
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Execute one user SQL statement, including UDF calls and pipeline
    /// stages. Returns the final frame.
    pub async fn execute(&self, sql: &str) -> Result<Frame, BridgeError> {
        let caller_id = Uuid::new_v4().to_string();
        let (base, stages) = parse_pipeline(sql)?;
        let mut frame = self.execute_base(&base, &caller_id).await?;

        let mut prior_stage = "base_query".to_string();
        for (index, stage) in stages.iter().enumerate() {
            frame = self
                .run_stage(index, stage, frame, &prior_stage, &caller_id)
                .await?;
            if let Some(table) = &stage.into {
                self.session_db.create_table(table, &frame).await?;
            }
            prior_stage = stage.keyword.clone();
        }
        Ok(frame)
    }

    async fn execute_base(&self, sql: &str, caller_id: &str) -> Result<Frame, BridgeError> {
        let calls = scan_udf_calls(sql);
        if calls.is_empty() {
            return Ok(self.session_db.query(sql).await?);
        }

        // Probe rewrite: each call's arguments become projected columns so
        // one query yields the per-row inputs for every call site.
        let mut probe = String::with_capacity(sql.len());
        let mut cursor = 0usize;
        for (i, call) in calls.iter().enumerate() {
            probe.push_str(&sql[cursor..call.start]);
            let projections: Vec<String> = call
                .args
                .iter()
                .enumerate()
                .map(|(j, arg)| format!("({arg}) AS __udf{i}_{j}"))
                .collect();
            probe.push_str(&projections.join(", "));
            cursor = call.span_end;
        }
        probe.push_str(&sql[cursor..]);
        let probe_frame = self.session_db.query(&probe).await?;

        // Run each call per row through the cache.
        let mut results: Vec<Vec<Value>> = Vec::with_capacity(calls.len());
        for (i, call) in calls.iter().enumerate() {
            let arg_columns: Vec<usize> = (0..call.args.len())
                .map(|j| {
                    probe_frame
                        .column_index(&format!("__udf{i}_{j}"))
                        .unwrap_or(usize::MAX)
                })
                .collect();
            let mut column = Vec::with_capacity(probe_frame.len());
            for row in &probe_frame.rows {
                let args: Vec<Value> = arg_columns
                    .iter()
                    .map(|idx| row.get(*idx).cloned().unwrap_or(Value::Null))
                    .collect();
                column.push(self.run_udf(&call.name, &args, caller_id).await?);
            }
            results.push(column);
        }

        // Assemble: arg columns collapse into one result column per call.
        enum Source {
            Probe(usize),
            Call(usize),
        }
        let mut out = Frame::default();
        let mut sources: Vec<Source> = Vec::new();
        for (idx, name) in probe_frame.columns.iter().enumerate() {
            if let Some((i, j)) = parse_probe_column(name) {
                if j == 0 {
                    let call = &calls[i];
                    out.columns
                        .push(call.alias.clone().unwrap_or_else(|| call.name.clone()));
                    sources.push(Source::Call(i));
                }
            } else {
                out.columns.push(name.clone());
                sources.push(Source::Probe(idx));
            }
        }
        for (row_idx, row) in probe_frame.rows.iter().enumerate() {
            let mut out_row = Vec::with_capacity(sources.len());
            for source in &sources {
                out_row.push(match source {
                    Source::Probe(idx) => row.get(*idx).cloned().unwrap_or(Value::Null),
                    Source::Call(i) => results[*i][row_idx].clone(),
                });
            }
            out.rows.push(out_row);
        }
        Ok(out)
    }

    /// Run one UDF invocation through the cache. Hits log a
    /// `quartermaster_result` row carrying the original request id under the
    /// current caller, so per-caller aggregations reconstruct the cost of
    /// each SQL statement.
    async fn run_udf(
        &self,
        name: &str,
        args: &[Value],
        caller_id: &str,
    ) -> Result<Value, BridgeError> {
        let arg_map = self.arg_map(name, args)?;
        let key = make_cache_key(name, &arg_map, &self.structure_keys);

        if let Some(entry) = self.cache.read().get(&key).cloned() {
            let mut row = LogRow::new(&self.session_id, NodeType::QuartermasterResult, "structure")
                .with_content(entry.value.clone())
                .with_metadata(serde_json::json!({"cache_key": key, "function": name}))
                .with_caller(caller_id.to_string());
            row.provider_request_id = entry.provider_request_id.clone();
            let trace = row.trace_id.clone();
            self.runner.store().append(row).await?;
            // The hit row shares the original request id; reconciling it
            // keeps cost identical across every row with that id.
            if let Some(request_id) = &entry.provider_request_id {
                self.runner.enqueue_cost(&self.session_id, &trace, request_id);
            }
            return Ok(entry.value);
        }

        let opts = RunOptions {
            caller_id: Some(caller_id.to_string()),
            ..Default::default()
        };
        let outcome = match name {
            "rvbbit" | "windlass_udf" => {
                let instructions = arg_map["instructions"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                let spec = scalar_udf_spec(&instructions);
                let input = serde_json::json!({"value": arg_map["input"]});
                self.runner.run(&spec, input, opts).await?
            }
            _ => {
                let cascade_ref = arg_map
                    .get("cascade")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let mut call_args = arg_map.clone();
                call_args.remove("cascade");
                // Structure mode: the cascade sees the JSON shape, not the
                // row's data.
                let prepared = if self.structure_keys.is_empty() {
                    call_args
                } else {
                    structure_mode_inputs(&call_args, &self.structure_keys)
                };
                let cascade_args = prepared.get("args").cloned().unwrap_or(Value::Null);
                if self.runner.registries().cascade(&cascade_ref).is_some() {
                    self.runner
                        .run_by_id(&cascade_ref, cascade_args, opts)
                        .await?
                } else if std::path::Path::new(&cascade_ref).is_file() {
                    let spec = CascadeSpec::from_path(&cascade_ref)
                        .map_err(RunnerError::from)
                        .map_err(BridgeError::from)?;
                    self.runner.run(&spec, cascade_args, opts).await?
                } else {
                    return Err(BridgeError::UnknownCascade { id: cascade_ref });
                }
            }
        };

        // The child run's last provider request id rides along in the cache
        // so later hits still account to the original call.
        let provider_request_id = self
            .runner
            .store()
            .rows_for_session(&outcome.session_id)
            .await?
            .iter()
            .rev()
            .find_map(|row| row.provider_request_id.clone());

        let value = outcome.final_output;
        self.cache.write().insert(
            key,
            CacheEntry {
                value: value.clone(),
                provider_request_id,
            },
        );
        Ok(value)
    }

    fn arg_map(
        &self,
        name: &str,
        args: &[Value],
    ) -> Result<serde_json::Map<String, Value>, BridgeError> {
        if args.len() != 2 {
            return Err(BridgeError::Arity {
                name: name.to_string(),
                expected: 2,
                got: args.len(),
            });
        }
        let mut map = serde_json::Map::new();
        match name {
            "rvbbit" | "windlass_udf" => {
                map.insert("instructions".to_string(), args[0].clone());
                map.insert("input".to_string(), args[1].clone());
            }
            _ => {
                map.insert("cascade".to_string(), args[0].clone());
                let parsed = match &args[1] {
                    Value::String(raw) => {
                        serde_json::from_str(raw).unwrap_or_else(|_| args[1].clone())
                    }
                    other => other.clone(),
                };
                map.insert("args".to_string(), parsed);
            }
        }
        Ok(map)
    }

    async fn run_stage(
        &self,
        index: usize,
        stage: &PipelineStage,
        frame: Frame,
        prior_stage: &str,
        caller_id: &str,
    ) -> Result<Frame, BridgeError> {
        let spec = self
            .runner
            .registries()
            .stage_cascade(&stage.keyword)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownStage {
                index,
                keyword: stage.keyword.clone(),
            })?;

        // Small frames ride inline; large ones go through a file under the
        // session artifacts directory.
        let data = if frame.cell_count() <= INLINE_CELL_LIMIT {
            Value::Array(frame.to_records())
        } else {
            let path = self
                .session_db
                .artifacts_dir()
                .join(format!("stage_{index}.json"));
            let records = Value::Array(frame.to_records());
            tokio::fs::write(&path, records.to_string())
                .await
                .map_err(|e| PipelineError::StageFailed {
                    index,
                    keyword: stage.keyword.clone(),
                    message: format!("write stage frame: {e}"),
                })?;
            serde_json::json!({"file": path.display().to_string()})
        };

        let input = serde_json::json!({
            "data": data,
            "question": stage.arg,
            "stage": stage.keyword,
            "prior_stage": prior_stage,
        });
        let opts = RunOptions {
            caller_id: Some(caller_id.to_string()),
            ..Default::default()
        };
        let outcome = self
            .runner
            .run(&spec, input, opts)
            .await
            .map_err(|e| PipelineError::StageFailed {
                index,
                keyword: stage.keyword.clone(),
                message: e.to_string(),
            })?;

        deserialize_stage_output(&outcome.final_output, index, &stage.keyword).await
    }
}

/// Stage output: a row list, the `data` field of a dict, or a path to a
/// serialized frame file.
async fn deserialize_stage_output(
    value: &Value,
    index: usize,
    keyword: &str,
) -> Result<Frame, BridgeError> {
    match value {
        Value::Array(items) => Ok(Frame::from_records(items)),
        Value::Object(map) => {
            if let Some(Value::Array(items)) = map.get("data") {
                Ok(Frame::from_records(items))
            } else {
                Ok(Frame::from_records(std::slice::from_ref(value)))
            }
        }
        Value::String(raw) => {
            let trimmed = raw.trim();
            if trimmed.ends_with(".json") && std::path::Path::new(trimmed).is_file() {
                let contents = tokio::fs::read_to_string(trimmed).await.map_err(|e| {
                    PipelineError::StageFailed {
                        index,
                        keyword: keyword.to_string(),
                        message: format!("read stage file: {e}"),
                    }
                })?;
                let parsed: Value =
                    serde_json::from_str(&contents).map_err(|e| PipelineError::StageFailed {
                        index,
                        keyword: keyword.to_string(),
                        message: format!("parse stage file: {e}"),
                    })?;
                match parsed {
                    Value::Array(items) => Ok(Frame::from_records(&items)),
                    other => Ok(Frame::coerce(&other)),
                }
            } else if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(trimmed) {
                Ok(Frame::from_records(&items))
            } else {
                Ok(Frame::coerce(value))
            }
        }
        other => Ok(Frame::coerce(other)),
    }
}

/// A one-cell cascade implementing the scalar UDF.
fn scalar_udf_spec(instructions: &str) -> CascadeSpec {
    let mut inputs = FxHashMap::default();
    inputs.insert(
        "input".to_string(),
        Value::String("{{ input.value }}".to_string()),
    );
    CascadeSpec {
        cascade_id: "rvbbit_scalar".to_string(),
        description: Some("scalar SQL UDF".to_string()),
        inputs_schema: FxHashMap::default(),
        cells: vec![CellSpec {
            name: "call".to_string(),
            instructions: Some(instructions.to_string()),
            tool: None,
            inputs,
            tools_allowed: Vec::new(),
            takes: None,
            max_parallel_takes: None,
            reforge_steps: None,
            reforge_attempts: None,
            wards: Default::default(),
            human_input: None,
            output_mode: None,
            memory: None,
            context: None,
            max_turns: None,
            model: None,
            state_bind: None,
            auto_fix: None,
            token_budget: None,
            native_tools: false,
            materialize: Some(false),
            timeout_seconds: None,
            return_type: None,
        }],
    }
}

fn parse_probe_column(name: &str) -> Option<(usize, usize)> {
    let rest = name.strip_prefix("__udf")?;
    let (i, j) = rest.split_once('_')?;
    Some((i.parse().ok()?, j.parse().ok()?))
}

/// Find UDF calls in user SQL, quote-aware, with balanced-paren argument
/// splitting and optional trailing `AS alias`.
#[must_use]
pub fn scan_udf_calls(sql: &str) -> Vec<UdfCall> {
    let bytes = sql.as_bytes();
    let mut calls = Vec::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            '\'' if !in_double => {
                in_single = !in_single;
                i += 1;
            }
            '"' if !in_single => {
                in_double = !in_double;
                i += 1;
            }
            c if !in_single && !in_double && (c.is_ascii_alphabetic() || c == '_') => {
                let word_start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                let word = &sql[word_start..i];
                // Word boundary on the left: not preceded by ident char or dot.
                let bounded = word_start == 0
                    || !((bytes[word_start - 1] as char).is_ascii_alphanumeric()
                        || bytes[word_start - 1] == b'_'
                        || bytes[word_start - 1] == b'.');
                if bounded && UDF_NAMES.contains(&word.to_ascii_lowercase().as_str()) {
                    let mut k = i;
                    while k < bytes.len() && (bytes[k] as char).is_whitespace() {
                        k += 1;
                    }
                    if k < bytes.len() && bytes[k] == b'(' {
                        if let Some((args, close)) = split_call_args(sql, k) {
                            let (alias, span_end) = parse_alias(sql, close + 1);
                            calls.push(UdfCall {
                                name: word.to_ascii_lowercase(),
                                args,
                                start: word_start,
                                end: close + 1,
                                alias,
                                span_end,
                            });
                            i = span_end;
                        }
                    }
                }
            }
            _ => i += 1,
        }
    }
    calls
}

/// Split the parenthesized arguments at `open` into top-level expressions.
/// Returns the argument list and the index of the closing paren.
fn split_call_args(sql: &str, open: usize) -> Option<(Vec<String>, usize)> {
    let bytes = sql.as_bytes();
    let mut depth = 0usize;
    let mut in_single = false;
    let mut in_double = false;
    let mut args = Vec::new();
    let mut current = String::new();
    let mut i = open;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            '\'' if !in_double => {
                in_single = !in_single;
                current.push(c);
            }
            '"' if !in_single => {
                in_double = !in_double;
                current.push(c);
            }
            '(' if !in_single && !in_double => {
                depth += 1;
                if depth > 1 {
                    current.push(c);
                }
            }
            ')' if !in_single && !in_double => {
                depth -= 1;
                if depth == 0 {
                    let trimmed = current.trim();
                    if !trimmed.is_empty() {
                        args.push(trimmed.to_string());
                    }
                    return Some((args, i));
                }
                current.push(c);
            }
            ',' if !in_single && !in_double && depth == 1 => {
                args.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
        i += 1;
    }
    None
}

fn parse_alias(sql: &str, from: usize) -> (Option<String>, usize) {
    let rest = &sql[from.min(sql.len())..];
    let trimmed = rest.trim_start();
    let offset = rest.len() - trimmed.len();
    if trimmed.len() >= 3 && trimmed[..2].eq_ignore_ascii_case("as") {
        let after = &trimmed[2..];
        let after_trim = after.trim_start();
        let ws = after.len() - after_trim.len();
        if ws > 0 {
            let end = after_trim
                .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
                .unwrap_or(after_trim.len());
            if end > 0 {
                let alias = after_trim[..end].to_string();
                let consumed = from + offset + 2 + ws + end;
                return (Some(alias), consumed);
            }
        }
    }
    (None, from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_scalar_call_with_alias() {
        let sql = "SELECT id, rvbbit('classify', t.text) AS label FROM t";
        let calls = scan_udf_calls(sql);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "rvbbit");
        assert_eq!(calls[0].args, vec!["'classify'", "t.text"]);
        assert_eq!(calls[0].alias.as_deref(), Some("label"));
    }

    #[test]
    fn ignores_calls_inside_strings() {
        let sql = "SELECT 'rvbbit(not, real)' FROM t";
        assert!(scan_udf_calls(sql).is_empty());
    }

    #[test]
    fn nested_parens_in_args() {
        let sql = "SELECT windlass_udf('x', json_extract(t.doc, '$.a,b')) FROM t";
        let calls = scan_udf_calls(sql);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args[1], "json_extract(t.doc, '$.a,b')");
    }

    #[test]
    fn multiple_calls() {
        let sql = "SELECT rvbbit('a', x), rvbbit_cascade('triage', payload) FROM t";
        let calls = scan_udf_calls(sql);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].name, "rvbbit_cascade");
    }

    #[test]
    fn member_access_is_not_a_call() {
        let sql = "SELECT schema.rvbbit('a', x) FROM t";
        assert!(scan_udf_calls(sql).is_empty());
    }

    #[test]
    fn probe_column_parsing() {
        assert_eq!(parse_probe_column("__udf0_1"), Some((0, 1)));
        assert_eq!(parse_probe_column("__udf12_0"), Some((12, 0)));
        assert_eq!(parse_probe_column("regular"), None);
    }

    #[test]
    fn scalar_spec_is_valid() {
        let spec = scalar_udf_spec("Classify the input as spam or ham.");
        spec.validate().unwrap();
        assert_eq!(spec.cells.len(), 1);
    }
}
