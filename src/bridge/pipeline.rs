//! `THEN <STAGE> ['args'] [INTO <table>]` pipeline parsing.
//!
//! A user query may append stages after the base SELECT; each stage is bound
//! to a pre-registered cascade and receives the prior stage's frame.

use miette::Diagnostic;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static STAGE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^\s*([A-Za-z_]+)\s*(?:'((?:[^']|'')*)')?\s*(?:INTO\s+([A-Za-z_][A-Za-z0-9_]*))?\s*;?\s*$")
        .expect("stage pattern")
});

#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error("cannot parse pipeline stage {index}: {segment}")]
    #[diagnostic(
        code(windlass::pipeline::parse),
        help("Stages look like: THEN ANALYZE 'question' INTO results")
    )]
    Parse { index: usize, segment: String },

    #[error("no cascade registered for stage {keyword} (stage {index})")]
    #[diagnostic(code(windlass::pipeline::unknown_stage))]
    UnknownStage { index: usize, keyword: String },

    #[error("stage {index} ({keyword}) failed: {message}")]
    #[diagnostic(code(windlass::pipeline::stage_failed))]
    StageFailed {
        index: usize,
        keyword: String,
        message: String,
    },
}

/// One parsed pipeline stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineStage {
    pub keyword: String,
    pub arg: Option<String>,
    pub into: Option<String>,
}

/// Split a query into the base SQL and its trailing `THEN ...` stages.
///
/// `THEN` is recognized only at the top level (outside quotes and
/// parentheses), and only for the longest trailing run of segments that
/// parse as stages, so `CASE ... THEN ...` expressions and string literals
/// pass through untouched.
pub fn parse_pipeline(sql: &str) -> Result<(String, Vec<PipelineStage>), PipelineError> {
    let boundaries = top_level_then_positions(sql);

    // Walk candidates right-to-left, accepting while each segment parses as
    // a stage; the first non-stage THEN (e.g. a CASE arm) ends the run.
    let mut accepted: Vec<(usize, PipelineStage)> = Vec::new();
    let mut end = sql.len();
    for start in boundaries.iter().rev() {
        let segment = &sql[start + "THEN".len()..end];
        match STAGE_PATTERN.captures(segment) {
            Some(captures) => {
                accepted.push((
                    *start,
                    PipelineStage {
                        keyword: captures[1].to_ascii_uppercase(),
                        arg: captures.get(2).map(|m| m.as_str().replace("''", "'")),
                        into: captures.get(3).map(|m| m.as_str().to_string()),
                    },
                ));
                end = *start;
            }
            None => break,
        }
    }

    if accepted.is_empty() {
        return Ok((sql.trim().to_string(), Vec::new()));
    }
    accepted.reverse();
    let base = sql[..accepted[0].0].trim().to_string();
    let stages = accepted.into_iter().map(|(_, stage)| stage).collect();
    Ok((base, stages))
}

fn top_level_then_positions(sql: &str) -> Vec<usize> {
    let bytes = sql.as_bytes();
    let mut positions = Vec::new();
    let mut depth = 0usize;
    let mut in_single = false;
    let mut in_double = false;
    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '(' if !in_single && !in_double => depth += 1,
            ')' if !in_single && !in_double => depth = depth.saturating_sub(1),
            'T' | 't' if !in_single && !in_double && depth == 0 => {
                let rest = &sql[i..];
                if rest.len() >= 4
                    && rest[..4].eq_ignore_ascii_case("THEN")
                    && boundary_before(bytes, i)
                    && boundary_after(bytes, i + 4)
                {
                    positions.push(i);
                    i += 4;
                    continue;
                }
            }
            _ => {}
        }
        i += 1;
    }
    positions
}

fn boundary_before(bytes: &[u8], i: usize) -> bool {
    i == 0 || !(bytes[i - 1] as char).is_ascii_alphanumeric() && bytes[i - 1] != b'_'
}

fn boundary_after(bytes: &[u8], i: usize) -> bool {
    i >= bytes.len() || !(bytes[i] as char).is_ascii_alphanumeric() && bytes[i] != b'_'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_query_has_no_stages() {
        let (base, stages) = parse_pipeline("SELECT * FROM t").unwrap();
        assert_eq!(base, "SELECT * FROM t");
        assert!(stages.is_empty());
    }

    #[test]
    fn single_stage_with_arg_and_into() {
        let (base, stages) =
            parse_pipeline("SELECT * FROM t THEN ANALYZE 'what stands out?' INTO findings")
                .unwrap();
        assert_eq!(base, "SELECT * FROM t");
        assert_eq!(
            stages,
            vec![PipelineStage {
                keyword: "ANALYZE".into(),
                arg: Some("what stands out?".into()),
                into: Some("findings".into()),
            }]
        );
    }

    #[test]
    fn chained_stages() {
        let (_, stages) = parse_pipeline(
            "SELECT * FROM logs THEN FILTER 'errors only' THEN ENRICH 'add severity' INTO enriched",
        )
        .unwrap();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].keyword, "FILTER");
        assert_eq!(stages[0].into, None);
        assert_eq!(stages[1].keyword, "ENRICH");
        assert_eq!(stages[1].into.as_deref(), Some("enriched"));
    }

    #[test]
    fn then_inside_strings_and_case_expressions_is_ignored() {
        let sql = "SELECT 'and THEN what' AS s, CASE WHEN x THEN 1 ELSE 0 END FROM t";
        let (base, stages) = parse_pipeline(sql).unwrap();
        assert_eq!(base, sql);
        assert!(stages.is_empty());
    }

    #[test]
    fn case_then_before_real_stages_still_parses() {
        let (base, stages) = parse_pipeline(
            "SELECT CASE WHEN x THEN 1 ELSE 0 END AS flag FROM t THEN ANALYZE 'why?'",
        )
        .unwrap();
        assert!(base.contains("CASE WHEN x THEN 1"));
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].keyword, "ANALYZE");
    }

    #[test]
    fn escaped_quotes_in_stage_args() {
        let (_, stages) =
            parse_pipeline("SELECT 1 THEN SPEAK 'it''s fine'").unwrap();
        assert_eq!(stages[0].arg.as_deref(), Some("it's fine"));
    }
}
