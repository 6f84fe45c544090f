//! Deterministic cell executors: SQL, Python, JavaScript, Clojure.
//!
//! Interpreter cells run in a subprocess with a JSON harness: the harness
//! reads `{body, data, input, state}` from stdin, exposes prior cell outputs
//! as `data.<cell>`, executes the body, and prints a tagged result envelope
//! to stdout. The body must assign `result`.

use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::frame::Frame;
use crate::session::SessionDb;

/// Default wall timeout for an interpreter subprocess.
const INTERPRETER_TIMEOUT: Duration = Duration::from_secs(120);

/// Tagged result envelope every deterministic executor returns.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "_route", rename_all = "snake_case")]
pub enum CellResult {
    Success {
        value: Value,
    },
    Error {
        error: String,
        #[serde(default)]
        traceback: Option<String>,
    },
}

impl CellResult {
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        CellResult::Error {
            error: message.into(),
            traceback: None,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, CellResult::Success { .. })
    }
}

/// Languages with interpreter harnesses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataLanguage {
    Sql,
    Python,
    JavaScript,
    Clojure,
}

impl DataLanguage {
    /// Resolve a cell `tool` identifier to a language.
    #[must_use]
    pub fn from_tool(tool: &str) -> Option<Self> {
        match tool.to_ascii_lowercase().as_str() {
            "sql" => Some(DataLanguage::Sql),
            "python" | "py" => Some(DataLanguage::Python),
            "js" | "javascript" | "node" => Some(DataLanguage::JavaScript),
            "clojure" | "clj" | "bb" => Some(DataLanguage::Clojure),
            _ => None,
        }
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            DataLanguage::Sql => "sql",
            DataLanguage::Python => "python",
            DataLanguage::JavaScript => "js",
            DataLanguage::Clojure => "clojure",
        }
    }
}

/// Execute a deterministic cell body.
///
/// `data` maps prior cell names to their output values (frames appear as
/// record lists). SQL runs against the session DB; interpreter languages run
/// under their harness.
pub async fn execute_data_cell(
    language: DataLanguage,
    body: &str,
    data: &Value,
    input: &Value,
    state: &Value,
    session_db: &SessionDb,
) -> CellResult {
    match language {
        DataLanguage::Sql => execute_sql(body, session_db).await,
        DataLanguage::Python => run_interpreter("python3", &["-c", PYTHON_HARNESS], body, data, input, state).await,
        DataLanguage::JavaScript => run_interpreter("node", &["-e", JS_HARNESS], body, data, input, state).await,
        DataLanguage::Clojure => run_interpreter("bb", &["-e", CLOJURE_HARNESS], body, data, input, state).await,
    }
}

async fn execute_sql(body: &str, session_db: &SessionDb) -> CellResult {
    match session_db.query(body.trim()).await {
        Ok(frame) => CellResult::Success {
            value: Value::Array(frame.to_records()),
        },
        Err(err) => CellResult::error(err.to_string()),
    }
}

async fn run_interpreter(
    program: &str,
    args: &[&str],
    body: &str,
    data: &Value,
    input: &Value,
    state: &Value,
) -> CellResult {
    let payload = serde_json::json!({
        "body": body,
        "data": data,
        "input": input,
        "state": state,
    });
    let payload = match serde_json::to_vec(&payload) {
        Ok(bytes) => bytes,
        Err(err) => return CellResult::error(format!("payload encode: {err}")),
    };

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let mut child = match child {
        Ok(child) => child,
        Err(err) => return CellResult::error(format!("spawn {program}: {err}")),
    };

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(err) = stdin.write_all(&payload).await {
            return CellResult::error(format!("write to {program}: {err}"));
        }
    }

    let output = match tokio::time::timeout(INTERPRETER_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => return CellResult::error(format!("{program} wait: {err}")),
        Err(_) => return CellResult::error(format!("{program} timed out")),
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    // The harness prints the envelope as the last stdout line.
    for line in stdout.lines().rev() {
        let line = line.trim();
        if line.starts_with('{') {
            if let Ok(result) = serde_json::from_str::<CellResult>(line) {
                return result;
            }
        }
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    CellResult::Error {
        error: format!("{program} produced no result envelope"),
        traceback: Some(format!("stdout: {stdout}\nstderr: {stderr}")),
    }
}

/// Materialize a successful result as a frame, when it is tabular enough.
#[must_use]
pub fn result_frame(result: &CellResult) -> Option<Frame> {
    match result {
        CellResult::Success { value } => {
            let frame = Frame::coerce(value);
            (!frame.columns.is_empty()).then_some(frame)
        }
        CellResult::Error { .. } => None,
    }
}

/// Language-specific fix prompt for the auto-fix loop.
#[must_use]
pub fn fix_prompt(language: DataLanguage, body: &str, error: &str) -> String {
    let (label, hint) = match language {
        DataLanguage::Sql => ("SQL", "Return only the corrected SQL query."),
        DataLanguage::Python => (
            "Python",
            "The script must assign its output to a variable named `result`. Return only the corrected script.",
        ),
        DataLanguage::JavaScript => (
            "JavaScript",
            "The script must assign its output to a variable named `result`. Return only the corrected script.",
        ),
        DataLanguage::Clojure => (
            "Clojure",
            "The final expression is the result. Return only the corrected script.",
        ),
    };
    format!(
        "The following {label} cell body failed.\n\nBody:\n```\n{body}\n```\n\n\
         Error:\n```\n{error}\n```\n\n{hint} Do not explain."
    )
}

const PYTHON_HARNESS: &str = r#"
import json, sys, traceback

payload = json.load(sys.stdin)

class _Data:
    def __init__(self, mapping):
        self.__dict__.update(mapping)

scope = {
    "data": _Data(payload.get("data") or {}),
    "input": payload.get("input"),
    "state": payload.get("state"),
    "result": None,
}
try:
    exec(payload["body"], scope)
    print(json.dumps({"_route": "success", "value": scope.get("result")}, default=str))
except Exception as exc:
    print(json.dumps({
        "_route": "error",
        "error": str(exc),
        "traceback": traceback.format_exc(),
    }))
"#;

const JS_HARNESS: &str = r#"
let raw = '';
process.stdin.on('data', (chunk) => { raw += chunk; });
process.stdin.on('end', () => {
    const payload = JSON.parse(raw);
    try {
        const fn = new Function('data', 'input', 'state', payload.body + '\n;return typeof result === "undefined" ? null : result;');
        const value = fn(payload.data || {}, payload.input, payload.state);
        console.log(JSON.stringify({ _route: 'success', value: value === undefined ? null : value }));
    } catch (err) {
        console.log(JSON.stringify({ _route: 'error', error: String(err), traceback: err && err.stack ? String(err.stack) : null }));
    }
});
"#;

const CLOJURE_HARNESS: &str = r#"
(require '[cheshire.core :as json])
(let [payload (json/parse-string (slurp *in*) true)]
  (try
    (let [data (:data payload)
          input (:input payload)
          state (:state payload)
          result (eval (read-string (str "(let [data " (pr-str data)
                                         " input " (pr-str input)
                                         " state " (pr-str state) "] "
                                         (:body payload) ")")))]
      (println (json/generate-string {:_route "success" :value result})))
    (catch Exception e
      (println (json/generate-string {:_route "error" :error (.getMessage e)})))))
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_round_trip() {
        let success: CellResult =
            serde_json::from_str(r#"{"_route":"success","value":{"x":1}}"#).unwrap();
        assert!(success.is_success());
        let error: CellResult =
            serde_json::from_str(r#"{"_route":"error","error":"boom"}"#).unwrap();
        assert!(!error.is_success());
        let rendered = serde_json::to_string(&CellResult::error("bad")).unwrap();
        assert!(rendered.contains("\"_route\":\"error\""));
    }

    #[test]
    fn language_resolution() {
        assert_eq!(DataLanguage::from_tool("SQL"), Some(DataLanguage::Sql));
        assert_eq!(DataLanguage::from_tool("py"), Some(DataLanguage::Python));
        assert_eq!(DataLanguage::from_tool("node"), Some(DataLanguage::JavaScript));
        assert_eq!(DataLanguage::from_tool("bb"), Some(DataLanguage::Clojure));
        assert_eq!(DataLanguage::from_tool("http"), None);
    }

    #[test]
    fn tabular_results_materialize() {
        let result = CellResult::Success {
            value: json!([{"id": 1}, {"id": 2}]),
        };
        let frame = result_frame(&result).unwrap();
        assert_eq!(frame.len(), 2);
        assert!(result_frame(&CellResult::error("x")).is_none());
    }

    #[test]
    fn fix_prompts_name_the_language() {
        let prompt = fix_prompt(DataLanguage::Python, "resul = 1", "NameError");
        assert!(prompt.contains("Python"));
        assert!(prompt.contains("resul = 1"));
        assert!(prompt.contains("NameError"));
    }
}
