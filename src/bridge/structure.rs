//! Structure-based cache keys.
//!
//! Two JSON values with the same shape but different content share a
//! structure hash, so structurally identical UDF arguments can share one
//! cascade execution.

use serde_json::Value;

use crate::echo::hash::{canonical_json, hex_digest};

/// Maximum recursion depth when extracting structure.
const MAX_DEPTH: usize = 5;
/// Hex length of structure and content digests in cache keys.
const DIGEST_LEN: usize = 12;

/// Replace values with type indicators, keys sorted, lists reduced to their
/// first element as an exemplar.
#[must_use]
pub fn extract_structure(value: &Value) -> Value {
    extract_at(value, 0)
}

fn extract_at(value: &Value, depth: usize) -> Value {
    if depth >= MAX_DEPTH {
        return Value::String("...".to_string());
    }
    match value {
        Value::Null => Value::String("null".to_string()),
        Value::Bool(_) => Value::String("boolean".to_string()),
        Value::Number(n) if n.is_i64() || n.is_u64() => Value::String("integer".to_string()),
        Value::Number(_) => Value::String("number".to_string()),
        Value::String(_) => Value::String("string".to_string()),
        Value::Array(items) => Value::Array(
            items
                .first()
                .map(|first| extract_at(first, depth + 1))
                .into_iter()
                .collect(),
        ),
        Value::Object(map) => {
            let mut obj = serde_json::Map::new();
            for (k, v) in map {
                obj.insert(k.clone(), extract_at(v, depth + 1));
            }
            Value::Object(obj)
        }
    }
}

/// Hash of the JSON structure. Strings that do not parse as JSON hash their
/// string type and length, so unparsed payloads of similar shape still
/// collide usefully.
#[must_use]
pub fn structure_hash(value: &Value) -> String {
    let parsed = match value {
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(parsed) => parsed,
            Err(_) => return hex_digest(format!("string:{}", s.len()).as_bytes(), DIGEST_LEN),
        },
        other => other.clone(),
    };
    let structure = extract_structure(&parsed);
    hex_digest(canonical_json(&structure).as_bytes(), DIGEST_LEN)
}

/// Cache key over a UDF call: function name plus per-argument digests.
/// Arguments listed in `structure_args` hash by structure; everything else
/// hashes by content.
#[must_use]
pub fn make_cache_key(
    function_name: &str,
    args: &serde_json::Map<String, Value>,
    structure_args: &[String],
) -> String {
    let mut parts = vec![function_name.to_string()];
    let mut names: Vec<&String> = args.keys().collect();
    names.sort();
    for name in names {
        let value = &args[name.as_str()];
        if structure_args.iter().any(|s| s == name) {
            parts.push(format!("{name}:struct:{}", structure_hash(value)));
        } else {
            parts.push(format!(
                "{name}:{}",
                hex_digest(canonical_json(value).as_bytes(), DIGEST_LEN)
            ));
        }
    }
    hex_digest(parts.join(":").as_bytes(), 32)
}

/// For structure-mode cascade inputs: replace each structure arg's value
/// with its pretty-printed structure, so the LLM sees the schema rather
/// than the data. A `<name>_structure` twin is added for explicit access.
#[must_use]
pub fn structure_mode_inputs(
    args: &serde_json::Map<String, Value>,
    structure_args: &[String],
) -> serde_json::Map<String, Value> {
    let mut result = serde_json::Map::new();
    for (name, value) in args {
        if structure_args.iter().any(|s| s == name) {
            let parsed = match value {
                Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| value.clone()),
                other => other.clone(),
            };
            let structure = extract_structure(&parsed);
            let rendered = serde_json::to_string_pretty(&structure).unwrap_or_default();
            result.insert(name.clone(), Value::String(rendered.clone()));
            result.insert(format!("{name}_structure"), Value::String(rendered));
        } else {
            result.insert(name.clone(), value.clone());
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn same_shape_same_hash() {
        let a = json!({"customer": {"name": "Alice", "age": 30}});
        let b = json!({"customer": {"name": "Bob", "age": 99}});
        assert_eq!(structure_hash(&a), structure_hash(&b));

        let c = json!({"customer": {"name": "Alice"}});
        assert_ne!(structure_hash(&a), structure_hash(&c));
    }

    #[test]
    fn string_payloads_parse_first() {
        let a = json!(r#"{"x": 1}"#);
        let b = json!(r#"{"x": 999}"#);
        assert_eq!(structure_hash(&a), structure_hash(&b));
    }

    #[test]
    fn lists_use_exemplar_element() {
        let a = json!([{"id": 1}, {"id": 2}, {"id": 3}]);
        let b = json!([{"id": 9}]);
        assert_eq!(structure_hash(&a), structure_hash(&b));
    }

    #[test]
    fn depth_is_capped() {
        let deep = json!({"a": {"b": {"c": {"d": {"e": {"f": {"g": 1}}}}}}});
        let structure = extract_structure(&deep);
        assert!(structure.to_string().contains("..."));
    }

    #[test]
    fn cache_keys_differ_by_content_unless_structural() {
        let mut args_a = serde_json::Map::new();
        args_a.insert("payload".to_string(), json!({"x": 1}));
        args_a.insert("prompt".to_string(), json!("classify"));
        let mut args_b = serde_json::Map::new();
        args_b.insert("payload".to_string(), json!({"x": 2}));
        args_b.insert("prompt".to_string(), json!("classify"));

        let plain_a = make_cache_key("rvbbit", &args_a, &[]);
        let plain_b = make_cache_key("rvbbit", &args_b, &[]);
        assert_ne!(plain_a, plain_b);

        let structural = vec!["payload".to_string()];
        let struct_a = make_cache_key("rvbbit", &args_a, &structural);
        let struct_b = make_cache_key("rvbbit", &args_b, &structural);
        assert_eq!(struct_a, struct_b);
    }

    #[test]
    fn structure_mode_replaces_values() {
        let mut args = serde_json::Map::new();
        args.insert("data".to_string(), json!({"name": "secret"}));
        args.insert("q".to_string(), json!("extract the name"));
        let prepared = structure_mode_inputs(&args, &["data".to_string()]);
        let rendered = prepared["data"].as_str().unwrap();
        assert!(rendered.contains("string"));
        assert!(!rendered.contains("secret"));
        assert!(prepared.contains_key("data_structure"));
        assert_eq!(prepared["q"], json!("extract the name"));
    }
}
