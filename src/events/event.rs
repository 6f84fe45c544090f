use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Semantic kind of a lifecycle event emitted by the runner.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CascadeStart,
    CellStart,
    TurnStart,
    ToolCall,
    ToolResult,
    SoundingAttempt,
    Evaluator,
    ReforgeStep,
    CostUpdate,
    CellComplete,
    CascadeComplete,
    CascadeError,
    AudibleSignal,
    CheckpointCreated,
    CheckpointResponded,
}

impl EventKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::CascadeStart => "cascade_start",
            EventKind::CellStart => "cell_start",
            EventKind::TurnStart => "turn_start",
            EventKind::ToolCall => "tool_call",
            EventKind::ToolResult => "tool_result",
            EventKind::SoundingAttempt => "sounding_attempt",
            EventKind::Evaluator => "evaluator",
            EventKind::ReforgeStep => "reforge_step",
            EventKind::CostUpdate => "cost_update",
            EventKind::CellComplete => "cell_complete",
            EventKind::CascadeComplete => "cascade_complete",
            EventKind::CascadeError => "cascade_error",
            EventKind::AudibleSignal => "audible_signal",
            EventKind::CheckpointCreated => "checkpoint_created",
            EventKind::CheckpointResponded => "checkpoint_responded",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One lifecycle event: the kind, its log lineage, and a JSON payload.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LifecycleEvent {
    pub kind: EventKind,
    pub session_id: String,
    pub trace_id: Option<String>,
    pub parent_id: Option<String>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// Events flowing through the bus: cascade lifecycle plus free-form
/// diagnostics from the engine itself.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum Event {
    Lifecycle(LifecycleEvent),
    Diagnostic { scope: String, message: String },
}

impl Event {
    pub fn lifecycle(
        kind: EventKind,
        session_id: impl Into<String>,
        trace_id: Option<String>,
        parent_id: Option<String>,
        payload: Value,
    ) -> Self {
        Event::Lifecycle(LifecycleEvent {
            kind,
            session_id: session_id.into(),
            trace_id,
            parent_id,
            payload,
            timestamp: Utc::now(),
        })
    }

    pub fn diagnostic(scope: impl Into<String>, message: impl Into<String>) -> Self {
        Event::Diagnostic {
            scope: scope.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn scope_label(&self) -> &str {
        match self {
            Event::Lifecycle(ev) => ev.kind.as_str(),
            Event::Diagnostic { scope, .. } => scope,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Event::Lifecycle(ev) => Some(&ev.session_id),
            Event::Diagnostic { .. } => None,
        }
    }

    /// Convert to a normalized JSON object for sinks and SSE clients.
    #[must_use]
    pub fn to_json_value(&self) -> Value {
        match self {
            Event::Lifecycle(ev) => serde_json::json!({
                "type": "lifecycle",
                "kind": ev.kind.as_str(),
                "session_id": ev.session_id,
                "trace_id": ev.trace_id,
                "parent_id": ev.parent_id,
                "payload": ev.payload,
                "timestamp": ev.timestamp.to_rfc3339(),
            }),
            Event::Diagnostic { scope, message } => serde_json::json!({
                "type": "diagnostic",
                "scope": scope,
                "message": message,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        }
    }

    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_json_value())
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Lifecycle(ev) => {
                write!(f, "[{}@{}] {}", ev.kind, ev.session_id, ev.payload)
            }
            Event::Diagnostic { scope, message } => write!(f, "[{scope}] {message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lifecycle_json_shape() {
        let event = Event::lifecycle(
            EventKind::CellStart,
            "sess-1",
            Some("t1".into()),
            None,
            json!({"cell": "triage"}),
        );
        let value = event.to_json_value();
        assert_eq!(value["type"], "lifecycle");
        assert_eq!(value["kind"], "cell_start");
        assert_eq!(value["session_id"], "sess-1");
        assert_eq!(value["payload"]["cell"], "triage");
    }

    #[test]
    fn kind_round_trip() {
        let kind: EventKind = serde_json::from_str("\"sounding_attempt\"").unwrap();
        assert_eq!(kind, EventKind::SoundingAttempt);
        assert_eq!(kind.as_str(), "sounding_attempt");
    }
}
