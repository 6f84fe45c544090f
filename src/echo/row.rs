//! Log row model and the closed node-type vocabulary.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::hash::content_hash;

/// Last issued row timestamp in microseconds; appends are strictly
/// monotonic per process even when the clock stalls within a microsecond.
static LAST_ROW_MICROS: AtomicI64 = AtomicI64::new(0);

fn monotonic_now() -> DateTime<Utc> {
    let mut now = Utc::now().timestamp_micros();
    loop {
        let last = LAST_ROW_MICROS.load(Ordering::SeqCst);
        if now <= last {
            now = last + 1;
        }
        if LAST_ROW_MICROS
            .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            break;
        }
    }
    Utc.timestamp_micros(now).single().unwrap_or_else(Utc::now)
}

/// Semantic kind of a log row. Source of truth for UI grouping and
/// analytics; stored as the snake_case string form.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Cascade,
    CascadeStart,
    CascadeComplete,
    CascadeError,
    Cell,
    CellComplete,
    TurnStart,
    TurnOutput,
    System,
    User,
    FollowUp,
    Injection,
    Tool,
    ToolCall,
    ToolResult,
    SoundingAttempt,
    SoundingError,
    Evaluator,
    ReforgeStep,
    ReforgeAttempt,
    ReforgeWinner,
    PreWard,
    PostWard,
    Validation,
    SchemaValidation,
    ValidationRetry,
    Checkpoint,
    QuartermasterResult,
    Audible,
    CostUpdate,
    SubCascade,
    Embedding,
    AutoFixSuccess,
    AutoFixFailed,
}

impl NodeType {
    /// Encode into the persisted string form.
    #[must_use]
    pub fn encode(&self) -> String {
        serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "cascade".to_string())
    }

    /// Decode a persisted string form; unknown strings map to `Cascade`.
    #[must_use]
    pub fn decode(s: &str) -> Self {
        serde_json::from_value(Value::String(s.to_string())).unwrap_or(NodeType::Cascade)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// One unified-log row.
///
/// `trace_id` is unique; `parent_id` is null only on cascade roots. A row
/// with a non-null `take_index` descends from a cell row whose metadata
/// declares `has_takes`. `is_winner` is set on exactly one take row per
/// cell.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LogRow {
    pub trace_id: String,
    pub parent_id: Option<String>,
    pub session_id: String,
    pub ts: DateTime<Utc>,
    pub node_type: NodeType,
    pub role: String,
    pub phase_name: Option<String>,
    pub cascade_id: Option<String>,
    pub take_index: Option<i64>,
    pub reforge_step: Option<i64>,
    pub turn_number: Option<i64>,
    pub candidate_index: Option<i64>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub provider_request_id: Option<String>,
    pub tokens_in: Option<i64>,
    pub tokens_out: Option<i64>,
    pub tokens_reasoning: Option<i64>,
    pub cost: Option<f64>,
    pub duration_ms: Option<i64>,
    pub content: Option<Value>,
    pub full_request: Option<Value>,
    pub full_response: Option<Value>,
    pub tool_calls: Option<Value>,
    pub images: Option<Value>,
    pub metadata: Option<Value>,
    pub is_winner: Option<bool>,
    pub content_hash: Option<String>,
    pub context_hashes: Option<Vec<String>>,
    pub caller_id: Option<String>,
}

impl LogRow {
    /// Start a row with a fresh trace id and the current timestamp.
    #[must_use]
    pub fn new(session_id: impl Into<String>, node_type: NodeType, role: impl Into<String>) -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            parent_id: None,
            session_id: session_id.into(),
            ts: monotonic_now(),
            node_type,
            role: role.into(),
            phase_name: None,
            cascade_id: None,
            take_index: None,
            reforge_step: None,
            turn_number: None,
            candidate_index: None,
            model: None,
            provider: None,
            provider_request_id: None,
            tokens_in: None,
            tokens_out: None,
            tokens_reasoning: None,
            cost: None,
            duration_ms: None,
            content: None,
            full_request: None,
            full_response: None,
            tool_calls: None,
            images: None,
            metadata: None,
            is_winner: None,
            content_hash: None,
            context_hashes: None,
            caller_id: None,
        }
    }

    #[must_use]
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    #[must_use]
    pub fn with_cascade(mut self, cascade_id: impl Into<String>) -> Self {
        self.cascade_id = Some(cascade_id.into());
        self
    }

    #[must_use]
    pub fn with_phase(mut self, phase_name: impl Into<String>) -> Self {
        self.phase_name = Some(phase_name.into());
        self
    }

    /// Set the content and stamp its semantic hash.
    #[must_use]
    pub fn with_content(mut self, content: Value) -> Self {
        self.content_hash = Some(content_hash(&content));
        self.content = Some(content);
        self
    }

    #[must_use]
    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.with_content(Value::String(text.into()))
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    #[must_use]
    pub fn with_context_hashes(mut self, hashes: Vec<String>) -> Self {
        self.context_hashes = Some(hashes);
        self
    }

    #[must_use]
    pub fn with_take(mut self, take_index: i64) -> Self {
        self.take_index = Some(take_index);
        self
    }

    #[must_use]
    pub fn with_turn(mut self, turn_number: i64) -> Self {
        self.turn_number = Some(turn_number);
        self
    }

    #[must_use]
    pub fn with_caller(mut self, caller_id: impl Into<String>) -> Self {
        self.caller_id = Some(caller_id.into());
        self
    }

    /// Text view of the content, for prompts and UI previews.
    #[must_use]
    pub fn content_text(&self) -> String {
        match &self.content {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }
}

/// Deferred cost/usage values resolved by the reconciler.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CostUpdate {
    pub cost: Option<f64>,
    pub tokens_in: Option<i64>,
    pub tokens_out: Option<i64>,
    pub tokens_reasoning: Option<i64>,
    pub provider: Option<String>,
}

impl CostUpdate {
    /// True when the provider reported real usage.
    #[must_use]
    pub fn has_data(&self) -> bool {
        self.cost.map(|c| c > 0.0).unwrap_or(false)
            || self.tokens_in.map(|t| t > 0).unwrap_or(false)
            || self.tokens_out.map(|t| t > 0).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_type_encode_decode() {
        assert_eq!(NodeType::SoundingAttempt.encode(), "sounding_attempt");
        assert_eq!(NodeType::decode("reforge_winner"), NodeType::ReforgeWinner);
        assert_eq!(NodeType::decode("not-a-kind"), NodeType::Cascade);
    }

    #[test]
    fn content_sets_hash() {
        let a = LogRow::new("s", NodeType::TurnOutput, "assistant").with_text("same text");
        let b = LogRow::new("s", NodeType::TurnOutput, "assistant").with_text("same text");
        assert_eq!(a.content_hash, b.content_hash);
        assert_ne!(a.trace_id, b.trace_id);

        let c = LogRow::new("s", NodeType::TurnOutput, "assistant").with_text("different");
        assert_ne!(a.content_hash, c.content_hash);
    }

    #[test]
    fn cost_update_has_data() {
        assert!(!CostUpdate::default().has_data());
        assert!(CostUpdate {
            cost: Some(0.002),
            ..Default::default()
        }
        .has_data());
        assert!(CostUpdate {
            tokens_out: Some(12),
            ..Default::default()
        }
        .has_data());
    }

    #[test]
    fn content_text_views() {
        let row = LogRow::new("s", NodeType::TurnOutput, "assistant")
            .with_content(json!({"answer": 1}));
        assert_eq!(row.content_text(), "{\"answer\":1}");
    }
}
