//! Session record model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Session lifecycle status.
///
/// Terminal statuses are never overwritten; the store enforces this with
/// check-and-set mutations.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Running,
    Blocked,
    Completed,
    Error,
    Cancelled,
    Orphaned,
}

impl SessionStatus {
    /// Terminal statuses: `completed`, `error`, `cancelled`, `orphaned`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed
                | SessionStatus::Error
                | SessionStatus::Cancelled
                | SessionStatus::Orphaned
        )
    }

    /// Active statuses participate in zombie detection.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Running | SessionStatus::Blocked)
    }

    #[must_use]
    pub fn encode(&self) -> String {
        serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "error".to_string())
    }

    #[must_use]
    pub fn decode(s: &str) -> Self {
        serde_json::from_value(Value::String(s.to_string())).unwrap_or(SessionStatus::Error)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// What a blocked session is waiting on.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BlockedKind {
    Hitl,
    Approval,
    Decision,
    Signal,
}

impl BlockedKind {
    #[must_use]
    pub fn encode(&self) -> String {
        serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "hitl".to_string())
    }

    #[must_use]
    pub fn decode(s: &str) -> Option<Self> {
        serde_json::from_value(Value::String(s.to_string())).ok()
    }
}

/// Durable per-session record.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub id: String,
    pub cascade_id: String,
    pub parent_session_id: Option<String>,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub heartbeat_at: DateTime<Utc>,
    pub heartbeat_lease_seconds: i64,
    pub current_cell: Option<String>,
    pub cancel_requested: bool,
    pub cancel_reason: Option<String>,
    pub blocked_type: Option<BlockedKind>,
    pub blocked_on: Option<String>,
    pub resumable: bool,
    pub last_checkpoint_id: Option<String>,
    pub error_message: Option<String>,
    pub input_data: Value,
    pub output: Option<Value>,
}

impl SessionRecord {
    /// A session is a zombie iff it is active and its heartbeat lease has
    /// lapsed.
    #[must_use]
    pub fn is_zombie(&self, now: DateTime<Utc>) -> bool {
        self.status.is_active()
            && now.signed_duration_since(self.heartbeat_at).num_seconds()
                > self.heartbeat_lease_seconds
    }
}

/// Listing filter for the store and the HTTP surface.
#[derive(Clone, Debug, Default)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub cascade_id: Option<String>,
    pub active_only: bool,
    pub limit: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Orphaned.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
        assert!(SessionStatus::Blocked.is_active());
        assert!(!SessionStatus::Starting.is_active());
    }

    #[test]
    fn status_round_trip() {
        for status in [
            SessionStatus::Starting,
            SessionStatus::Running,
            SessionStatus::Blocked,
            SessionStatus::Completed,
            SessionStatus::Error,
            SessionStatus::Cancelled,
            SessionStatus::Orphaned,
        ] {
            assert_eq!(SessionStatus::decode(&status.encode()), status);
        }
    }

    #[test]
    fn zombie_requires_active_and_stale() {
        let now = Utc::now();
        let mut record = SessionRecord {
            id: "s".into(),
            cascade_id: "c".into(),
            parent_session_id: None,
            status: SessionStatus::Running,
            started_at: now,
            updated_at: now,
            completed_at: None,
            heartbeat_at: now - chrono::Duration::seconds(120),
            heartbeat_lease_seconds: 60,
            current_cell: None,
            cancel_requested: false,
            cancel_reason: None,
            blocked_type: None,
            blocked_on: None,
            resumable: false,
            last_checkpoint_id: None,
            error_message: None,
            input_data: Value::Null,
            output: None,
        };
        assert!(record.is_zombie(now));

        record.status = SessionStatus::Completed;
        assert!(!record.is_zombie(now));

        record.status = SessionStatus::Running;
        record.heartbeat_at = now;
        assert!(!record.is_zombie(now));
    }
}
