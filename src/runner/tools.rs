//! Built-in deterministic tools available to LLM turn loops.

use async_trait::async_trait;
use serde_json::Value;

use crate::bridge::safety;
use crate::cascade::registry::{DataTool, ToolError};
use crate::session::SessionDb;

/// Maximum characters of a tool result kept in the cell history.
pub const TOOL_RESULT_LIMIT: usize = 8_000;

/// Run a read-only SQL query against the session DB.
pub struct RunSqlTool;

#[async_trait]
impl DataTool for RunSqlTool {
    fn name(&self) -> &str {
        "run_sql"
    }

    fn schema(&self) -> Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": "run_sql",
                "description": "Run a read-only SELECT against the session database. Prior cell outputs are tables named _<cell_name>.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "query": {"type": "string", "description": "A SELECT or WITH query."}
                    },
                    "required": ["query"],
                },
            },
        })
    }

    async fn call(&self, args: Value, session_db: &SessionDb) -> Result<Value, ToolError> {
        let query = args["query"].as_str().ok_or_else(|| ToolError::Arguments {
            name: self.name().to_string(),
            message: "missing `query`".to_string(),
        })?;
        let query = safety::strip_code_fences(query);
        safety::validate_sql_safety(&query).map_err(|e| ToolError::Failed {
            name: self.name().to_string(),
            message: e.to_string(),
        })?;
        safety::require_select(&query).map_err(|e| ToolError::Failed {
            name: self.name().to_string(),
            message: e.to_string(),
        })?;
        let frame = session_db
            .query(&query)
            .await
            .map_err(|e| ToolError::Failed {
                name: self.name().to_string(),
                message: e.to_string(),
            })?;
        Ok(Value::Array(frame.to_records()))
    }
}

/// Read one cell's materialized temp table.
pub struct ReadTableTool;

#[async_trait]
impl DataTool for ReadTableTool {
    fn name(&self) -> &str {
        "read_table"
    }

    fn schema(&self) -> Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": "read_table",
                "description": "Read a prior cell's materialized output rows by cell name.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "table": {"type": "string", "description": "Cell name or table name."}
                    },
                    "required": ["table"],
                },
            },
        })
    }

    async fn call(&self, args: Value, session_db: &SessionDb) -> Result<Value, ToolError> {
        let table = args["table"].as_str().ok_or_else(|| ToolError::Arguments {
            name: self.name().to_string(),
            message: "missing `table`".to_string(),
        })?;
        let frame = session_db
            .read_table(table)
            .await
            .map_err(|e| ToolError::Failed {
                name: self.name().to_string(),
                message: e.to_string(),
            })?;
        Ok(Value::Array(frame.to_records()))
    }
}

/// The function schema advertised for routing; `route_to` is intercepted by
/// the turn loop rather than dispatched.
#[must_use]
pub fn route_to_schema(targets: &[String]) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": "route_to",
            "description": "Jump the cascade to a named downstream cell.",
            "parameters": {
                "type": "object",
                "properties": {
                    "cell": {"type": "string", "enum": targets},
                },
                "required": ["cell"],
            },
        },
    })
}

/// Truncate a tool result for the cell history, keeping the head.
#[must_use]
pub fn truncate_result(rendered: &str) -> String {
    if rendered.len() <= TOOL_RESULT_LIMIT {
        return rendered.to_string();
    }
    let mut end = TOOL_RESULT_LIMIT;
    while !rendered.is_char_boundary(end) {
        end -= 1;
    }
    format!(
        "{}… [truncated {} of {} chars]",
        &rendered[..end],
        rendered.len() - end,
        rendered.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_keeps_head() {
        let long = "x".repeat(TOOL_RESULT_LIMIT + 100);
        let cut = truncate_result(&long);
        assert!(cut.len() < long.len());
        assert!(cut.contains("[truncated"));
        assert_eq!(truncate_result("short"), "short");
    }

    #[test]
    fn route_schema_lists_targets() {
        let schema = route_to_schema(&["draft".to_string(), "publish".to_string()]);
        assert_eq!(
            schema["function"]["parameters"]["properties"]["cell"]["enum"][1],
            "publish"
        );
    }
}
