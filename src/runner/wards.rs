//! Ward evaluation: validators at cell boundaries.

use serde_json::Value;

use crate::agent::Agent;
use crate::cascade::spec::WardCheck;

/// Outcome of evaluating one ward against a candidate text.
#[derive(Clone, Debug, PartialEq)]
pub enum WardVerdict {
    Pass,
    Fail { reason: String },
}

impl WardVerdict {
    #[must_use]
    pub fn is_pass(&self) -> bool {
        matches!(self, WardVerdict::Pass)
    }

    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            WardVerdict::Pass => None,
            WardVerdict::Fail { reason } => Some(reason),
        }
    }
}

/// Evaluate a ward check against a candidate text.
///
/// Deterministic checks run inline; `Llm` checks run one validator turn on
/// the supplied agent. A validator whose verdict cannot be parsed does not
/// block execution.
pub async fn evaluate_ward(
    check: &WardCheck,
    candidate: &str,
    validator: Option<&Agent>,
) -> WardVerdict {
    match check {
        WardCheck::NonEmpty => {
            if candidate.trim().is_empty() {
                WardVerdict::Fail {
                    reason: "output is empty".to_string(),
                }
            } else {
                WardVerdict::Pass
            }
        }
        WardCheck::MinLength { min } => {
            if candidate.len() < *min {
                WardVerdict::Fail {
                    reason: format!("output length {} is below minimum {min}", candidate.len()),
                }
            } else {
                WardVerdict::Pass
            }
        }
        WardCheck::MaxLength { max } => {
            if candidate.len() > *max {
                WardVerdict::Fail {
                    reason: format!("output length {} exceeds maximum {max}", candidate.len()),
                }
            } else {
                WardVerdict::Pass
            }
        }
        WardCheck::Contains { needle } => {
            if candidate.contains(needle) {
                WardVerdict::Pass
            } else {
                WardVerdict::Fail {
                    reason: format!("output does not contain `{needle}`"),
                }
            }
        }
        WardCheck::NotContains { needle } => {
            if candidate.contains(needle) {
                WardVerdict::Fail {
                    reason: format!("output contains forbidden `{needle}`"),
                }
            } else {
                WardVerdict::Pass
            }
        }
        WardCheck::JsonObject => match serde_json::from_str::<Value>(candidate) {
            Ok(Value::Object(_)) => WardVerdict::Pass,
            Ok(other) => WardVerdict::Fail {
                reason: format!("expected a JSON object, got {}", type_name(&other)),
            },
            Err(err) => WardVerdict::Fail {
                reason: format!("output is not valid JSON: {err}"),
            },
        },
        WardCheck::Matches { pattern } => match regex::Regex::new(pattern) {
            Ok(re) => {
                if re.is_match(candidate) {
                    WardVerdict::Pass
                } else {
                    WardVerdict::Fail {
                        reason: format!("output does not match /{pattern}/"),
                    }
                }
            }
            Err(err) => WardVerdict::Fail {
                reason: format!("invalid ward pattern /{pattern}/: {err}"),
            },
        },
        WardCheck::Llm { prompt } => {
            let Some(agent) = validator else {
                tracing::warn!("llm ward without validator agent; passing");
                return WardVerdict::Pass;
            };
            let question = format!(
                "{prompt}\n\nCandidate output:\n---\n{candidate}\n---\n\
                 Answer with JSON: {{\"valid\": true|false, \"reason\": \"...\"}}"
            );
            match agent.run(&[], Some(&question)).await {
                Ok(reply) => parse_verdict(&reply.content),
                Err(err) => {
                    tracing::warn!(error = %err, "llm ward call failed; passing");
                    WardVerdict::Pass
                }
            }
        }
    }
}

fn parse_verdict(content: &str) -> WardVerdict {
    let cleaned = crate::bridge::safety::strip_code_fences(content);
    match serde_json::from_str::<Value>(&cleaned) {
        Ok(value) => {
            let valid = value["valid"].as_bool().unwrap_or(true);
            if valid {
                WardVerdict::Pass
            } else {
                WardVerdict::Fail {
                    reason: value["reason"]
                        .as_str()
                        .unwrap_or("validator rejected output")
                        .to_string(),
                }
            }
        }
        Err(_) => {
            tracing::warn!("unparseable ward verdict; passing");
            WardVerdict::Pass
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
