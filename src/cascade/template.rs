//! Typed template layer.
//!
//! Cell inputs and instructions interpolate `{{ input.X }}`,
//! `{{ state.X }}`, `{{ outputs.<cell>.X }}`, and `{{ memory }}` against a
//! typed context. Unresolved references are errors surfaced before cell
//! execution, not empty strings at runtime.

use miette::Diagnostic;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

static TEMPLATE_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("template regex"));

#[derive(Debug, Error, Diagnostic)]
pub enum TemplateError {
    #[error("unresolved template reference: {{{{ {reference} }}}}")]
    #[diagnostic(
        code(windlass::template::unresolved),
        help("Template roots are input, state, outputs, and memory; check the path.")
    )]
    Unresolved { reference: String },
}

/// The typed rendering context for one cell.
#[derive(Clone, Debug, Default)]
pub struct TemplateContext {
    pub input: Value,
    pub state: Value,
    pub outputs: Value,
    pub memory: Value,
}

impl TemplateContext {
    fn root(&self, name: &str) -> Option<&Value> {
        match name {
            "input" => Some(&self.input),
            "state" => Some(&self.state),
            "outputs" => Some(&self.outputs),
            "memory" => Some(&self.memory),
            _ => None,
        }
    }

    /// Resolve a dotted path like `outputs.first.x`.
    #[must_use]
    pub fn resolve(&self, reference: &str) -> Option<&Value> {
        let mut parts = reference.split('.');
        let mut current = self.root(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

/// List the references used by a template string.
#[must_use]
pub fn scan_refs(template: &str) -> Vec<String> {
    TEMPLATE_REF
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .collect()
}

/// Render a template against the context.
pub fn render(template: &str, ctx: &TemplateContext) -> Result<String, TemplateError> {
    let mut result = String::with_capacity(template.len());
    let mut last = 0;
    for captures in TEMPLATE_REF.captures_iter(template) {
        let whole = captures.get(0).expect("capture 0");
        let reference = &captures[1];
        let value = ctx
            .resolve(reference)
            .ok_or_else(|| TemplateError::Unresolved {
                reference: reference.to_string(),
            })?;
        result.push_str(&template[last..whole.start()]);
        result.push_str(&render_value(value));
        last = whole.end();
    }
    result.push_str(&template[last..]);
    Ok(result)
}

/// Strings render raw; everything else renders as compact JSON.
#[must_use]
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> TemplateContext {
        TemplateContext {
            input: json!({"topic": "storms", "count": 3}),
            state: json!({"mode": "fast"}),
            outputs: json!({"first": {"x": 1, "items": ["a", "b"]}}),
            memory: json!("remembered note"),
        }
    }

    #[test]
    fn renders_all_roots() {
        let rendered = render(
            "T={{ input.topic }} N={{ input.count }} M={{ state.mode }} X={{ outputs.first.x }} MEM={{ memory }}",
            &ctx(),
        )
        .unwrap();
        assert_eq!(rendered, "T=storms N=3 M=fast X=1 MEM=remembered note");
    }

    #[test]
    fn array_index_paths() {
        let rendered = render("{{ outputs.first.items.1 }}", &ctx()).unwrap();
        assert_eq!(rendered, "b");
    }

    #[test]
    fn objects_render_as_json() {
        let rendered = render("{{ outputs.first }}", &ctx()).unwrap();
        assert_eq!(rendered, r#"{"items":["a","b"],"x":1}"#);
    }

    #[test]
    fn unresolved_reference_errors() {
        let err = render("{{ outputs.missing.x }}", &ctx()).unwrap_err();
        assert!(matches!(err, TemplateError::Unresolved { .. }));
        let err = render("{{ bogus.path }}", &ctx()).unwrap_err();
        assert!(err.to_string().contains("bogus.path"));
    }

    #[test]
    fn scan_finds_references() {
        let refs = scan_refs("a {{ input.x }} b {{outputs.c.d}} c");
        assert_eq!(refs, vec!["input.x", "outputs.c.d"]);
    }

    #[test]
    fn plain_text_untouched() {
        assert_eq!(render("no refs here", &ctx()).unwrap(), "no refs here");
    }
}
