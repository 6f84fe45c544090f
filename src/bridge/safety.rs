//! SQL safety validation, parameter binding, and scalar casting for
//! LLM-generated SQL.

use miette::Diagnostic;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// Destructive statement patterns refused in LLM-generated SQL.
static DANGEROUS_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"(?i)\bDROP\s+(TABLE|DATABASE|SCHEMA|INDEX|VIEW)\b", "DROP statements"),
        (r"(?i)\bTRUNCATE\s+TABLE\b", "TRUNCATE statements"),
        (r"(?i)\bDELETE\s+FROM\b", "DELETE statements"),
        (r"(?i)\bUPDATE\s+\w+\s+SET\b", "UPDATE statements"),
        (r"(?i)\bINSERT\s+INTO\b", "INSERT statements"),
        (r"(?i)\bALTER\s+(TABLE|DATABASE|SCHEMA)\b", "ALTER statements"),
        (r"(?i)\bCREATE\s+(TABLE|DATABASE|SCHEMA|INDEX|VIEW)\b", "CREATE statements"),
        (r"(?i)\bGRANT\s+", "GRANT statements"),
        (r"(?i)\bREVOKE\s+", "REVOKE statements"),
        (r"(?i)\bATTACH\s+", "ATTACH statements"),
        (r"(?i)\bDETACH\s+", "DETACH statements"),
        (r"(?i)\bCOPY\s+", "COPY statements"),
        (r"(?i)\bEXPORT\s+", "EXPORT statements"),
        (r"(?i)\bIMPORT\s+", "IMPORT statements"),
        (r"(?i)\bLOAD\s+", "LOAD statements"),
        (r"(?i)\bINSTALL\s+", "INSTALL statements"),
    ]
    .into_iter()
    .map(|(pattern, label)| (Regex::new(pattern).expect("safety pattern"), label))
    .collect()
});

static PARAM_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r":(\w+)").expect("param pattern"));

#[derive(Debug, Error, Diagnostic)]
pub enum SqlSafetyError {
    #[error("SQL statement blocked: {what} not allowed")]
    #[diagnostic(
        code(windlass::sql::blocked),
        help("LLM-generated SQL may only read; destructive statements are refused.")
    )]
    Blocked { what: String },

    #[error("only SELECT/WITH statements are allowed, got: {got}")]
    #[diagnostic(code(windlass::sql::not_select))]
    NotSelect { got: String },
}

/// Refuse fragments matching destructive patterns.
pub fn validate_sql_safety(sql: &str) -> Result<(), SqlSafetyError> {
    for (pattern, label) in DANGEROUS_PATTERNS.iter() {
        if pattern.is_match(sql) {
            return Err(SqlSafetyError::Blocked {
                what: (*label).to_string(),
            });
        }
    }
    Ok(())
}

/// Require the top-level statement to be SELECT or WITH.
pub fn require_select(sql: &str) -> Result<(), SqlSafetyError> {
    let trimmed = sql.trim_start();
    let upper = trimmed.to_ascii_uppercase();
    if upper.starts_with("SELECT") || upper.starts_with("WITH") {
        Ok(())
    } else {
        let mut preview: String = trimmed.chars().take(50).collect();
        if trimmed.chars().count() > 50 {
            preview.push('…');
        }
        Err(SqlSafetyError::NotSelect { got: preview })
    }
}

/// Remove markdown code fences an LLM may have wrapped around SQL or JSON.
#[must_use]
pub fn strip_code_fences(raw: &str) -> String {
    let mut s = raw.trim();
    for prefix in ["```sql", "```json", "```javascript", "```python", "```"] {
        if let Some(rest) = s.strip_prefix(prefix) {
            s = rest;
            break;
        }
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest;
    }
    s.trim().to_string()
}

/// Quote a value for SQL insertion with type-aware rendering.
#[must_use]
pub fn quote_sql_value(value: &Value, sql_type: &str) -> String {
    if value.is_null() {
        return "NULL".to_string();
    }
    match sql_type.to_ascii_uppercase().as_str() {
        "INTEGER" | "INT" | "BIGINT" | "SMALLINT" => coerce_integer(value)
            .map(|i| i.to_string())
            .unwrap_or_else(|| "NULL".to_string()),
        "DOUBLE" | "FLOAT" | "REAL" | "DECIMAL" | "NUMERIC" => coerce_float(value)
            .map(|f| f.to_string())
            .unwrap_or_else(|| "NULL".to_string()),
        "BOOLEAN" => {
            let truthy = match value {
                Value::Bool(b) => *b,
                Value::String(s) => matches!(s.to_ascii_lowercase().as_str(), "true" | "yes" | "1"),
                Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
                _ => true,
            };
            if truthy { "TRUE" } else { "FALSE" }.to_string()
        }
        _ => {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            format!("'{}'", rendered.replace('\'', "''"))
        }
    }
}

fn coerce_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn coerce_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Substitute `:name` placeholders in a fragment with quoted values.
///
/// `types` maps argument names to SQL type hints (default VARCHAR).
/// Placeholders without a matching argument are left in place and logged.
#[must_use]
pub fn bind_sql_parameters(
    fragment: &str,
    args: &serde_json::Map<String, Value>,
    types: &serde_json::Map<String, Value>,
) -> String {
    let mut result = fragment.to_string();
    let matches: Vec<(usize, usize, String)> = PARAM_PATTERN
        .captures_iter(fragment)
        .map(|c| {
            let whole = c.get(0).expect("capture 0");
            (whole.start(), whole.end(), c[1].to_string())
        })
        .collect();
    for (start, end, name) in matches.into_iter().rev() {
        match args.get(&name) {
            Some(value) => {
                let sql_type = types
                    .get(&name)
                    .and_then(Value::as_str)
                    .unwrap_or("VARCHAR");
                let quoted = quote_sql_value(value, sql_type);
                result.replace_range(start..end, &quoted);
            }
            None => {
                tracing::warn!(param = %name, "sql parameter not found in args");
            }
        }
    }
    result
}

/// Wrap a bare expression fragment in `SELECT`.
#[must_use]
pub fn wrap_select(fragment: &str) -> String {
    let trimmed = fragment.trim();
    if trimmed.to_ascii_uppercase().starts_with("SELECT") {
        trimmed.to_string()
    } else {
        format!("SELECT {trimmed}")
    }
}

/// Cast a scalar query result to the declared return type.
#[must_use]
pub fn cast_scalar(value: &Value, return_type: &str) -> Value {
    match return_type.to_ascii_uppercase().as_str() {
        "BOOLEAN" => match value {
            Value::Bool(b) => Value::Bool(*b),
            Value::String(s) => {
                Value::Bool(matches!(s.to_ascii_lowercase().as_str(), "true" | "yes" | "1"))
            }
            Value::Number(n) => Value::Bool(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
            _ => Value::Bool(false),
        },
        "DOUBLE" | "FLOAT" => Value::from(coerce_float(value).unwrap_or(0.0)),
        "INTEGER" | "INT" | "BIGINT" => Value::from(coerce_integer(value).unwrap_or(0)),
        "JSON" => match value {
            Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| value.clone()),
            other => other.clone(),
        },
        _ => match value {
            Value::Null => Value::Null,
            Value::String(s) => Value::String(s.clone()),
            other => Value::String(other.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn destructive_patterns_are_blocked() {
        for sql in [
            "DROP TABLE users",
            "delete from t where 1=1",
            "UPDATE t SET x = 1",
            "INSERT INTO t VALUES (1)",
            "ATTACH DATABASE 'x' AS y",
            "create table t (x int)",
            "install httpfs",
        ] {
            assert!(validate_sql_safety(sql).is_err(), "not blocked: {sql}");
        }
        assert!(validate_sql_safety("SELECT * FROM t WHERE note = 'updated'").is_ok());
    }

    #[test]
    fn select_requirement() {
        assert!(require_select("SELECT 1").is_ok());
        assert!(require_select("  with x as (select 1) select * from x").is_ok());
        assert!(require_select("PRAGMA table_info(t)").is_err());
    }

    #[test]
    fn code_fences_stripped() {
        assert_eq!(strip_code_fences("```sql\nSELECT 1\n```"), "SELECT 1");
        assert_eq!(strip_code_fences("```\nSELECT 2\n```"), "SELECT 2");
        assert_eq!(strip_code_fences("SELECT 3"), "SELECT 3");
    }

    #[test]
    fn quoting_is_type_aware() {
        assert_eq!(quote_sql_value(&json!(null), "VARCHAR"), "NULL");
        assert_eq!(quote_sql_value(&json!("o'brien"), "VARCHAR"), "'o''brien'");
        assert_eq!(quote_sql_value(&json!("42"), "INTEGER"), "42");
        assert_eq!(quote_sql_value(&json!("not a number"), "INTEGER"), "NULL");
        assert_eq!(quote_sql_value(&json!(true), "BOOLEAN"), "TRUE");
        assert_eq!(quote_sql_value(&json!("yes"), "BOOLEAN"), "TRUE");
        assert_eq!(quote_sql_value(&json!({"a": 1}), "JSON"), "'{\"a\":1}'");
    }

    #[test]
    fn parameter_binding() {
        let mut args = serde_json::Map::new();
        args.insert("name".to_string(), json!("alice"));
        args.insert("age".to_string(), json!(30));
        let mut types = serde_json::Map::new();
        types.insert("age".to_string(), json!("INTEGER"));
        let bound = bind_sql_parameters(
            "json_extract(:name, '$.x') + :age",
            &args,
            &types,
        );
        assert_eq!(bound, "json_extract('alice', '$.x') + 30");
    }

    #[test]
    fn wrapping_and_casting() {
        assert_eq!(wrap_select("1 + 1"), "SELECT 1 + 1");
        assert_eq!(wrap_select("select 2"), "select 2");
        assert_eq!(cast_scalar(&json!("7"), "INTEGER"), json!(7));
        assert_eq!(cast_scalar(&json!("true"), "BOOLEAN"), json!(true));
        assert_eq!(cast_scalar(&json!(3), "VARCHAR"), json!("3"));
        assert_eq!(cast_scalar(&json!("{\"k\":1}"), "JSON"), json!({"k":1}));
    }
}
