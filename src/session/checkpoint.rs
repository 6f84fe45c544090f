//! Human-in-the-loop checkpoints and the audible signal board.
//!
//! The manager exclusively owns pending checkpoints: each one pairs a
//! durable row with an in-memory oneshot waiter the producing cell parks on.
//! Responders wake the cell with the resolution; timeouts and cancellations
//! travel the same channel.

use std::fmt;

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    Confirmation,
    Choice,
    MultiChoice,
    Rating,
    Text,
    Form,
    Review,
    Auto,
    Htmx,
    Audible,
    SoundingEval,
}

impl CheckpointKind {
    #[must_use]
    pub fn encode(&self) -> String {
        serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "confirmation".to_string())
    }

    #[must_use]
    pub fn decode(s: &str) -> Self {
        serde_json::from_value(Value::String(s.to_string())).unwrap_or(CheckpointKind::Confirmation)
    }
}

impl fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Pending,
    Responded,
    Cancelled,
    TimedOut,
}

impl CheckpointStatus {
    #[must_use]
    pub fn encode(&self) -> String {
        serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "pending".to_string())
    }

    #[must_use]
    pub fn decode(s: &str) -> Self {
        serde_json::from_value(Value::String(s.to_string())).unwrap_or(CheckpointStatus::Pending)
    }
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Durable checkpoint row.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CheckpointRecord {
    pub id: String,
    pub session_id: String,
    pub cascade_id: String,
    pub cell_name: String,
    pub kind: CheckpointKind,
    pub status: CheckpointStatus,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub ui_spec: Option<Value>,
    pub cell_output: Option<String>,
    pub candidate_outputs: Option<Vec<String>>,
    pub response: Option<Value>,
    pub reasoning: Option<String>,
    pub confidence: Option<f64>,
    pub winner_index: Option<i64>,
    pub rankings: Option<Value>,
}

/// A responder's answer.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct CheckpointResponse {
    pub response: Value,
    pub reasoning: Option<String>,
    pub confidence: Option<f64>,
    /// For `sounding_eval` checkpoints: the winning take index.
    pub winner_index: Option<i64>,
    pub rankings: Option<Value>,
}

/// What the waiting cell receives when the checkpoint resolves.
#[derive(Debug)]
pub enum CheckpointResolution {
    Responded(CheckpointResponse),
    Cancelled { reason: Option<String> },
}

#[derive(Debug, Error, Diagnostic)]
pub enum CheckpointError {
    #[error("checkpoint not found: {id}")]
    #[diagnostic(code(windlass::checkpoint::not_found))]
    NotFound { id: String },

    #[error("checkpoint {id} is not pending (status {status})")]
    #[diagnostic(
        code(windlass::checkpoint::not_pending),
        help("Only pending checkpoints accept responses or cancellation.")
    )]
    NotPending {
        id: String,
        status: CheckpointStatus,
    },

    #[error("checkpoint backend error: {message}")]
    #[diagnostic(code(windlass::checkpoint::backend))]
    Backend { message: String },

    #[error(transparent)]
    #[diagnostic(code(windlass::checkpoint::serde))]
    Serde(#[from] serde_json::Error),
}

impl From<sqlx::Error> for CheckpointError {
    fn from(err: sqlx::Error) -> Self {
        CheckpointError::Backend {
            message: err.to_string(),
        }
    }
}

/// Parameters for creating a checkpoint.
#[derive(Clone, Debug)]
pub struct NewCheckpoint {
    pub session_id: String,
    pub cascade_id: String,
    pub cell_name: String,
    pub kind: CheckpointKind,
    pub ui_spec: Option<Value>,
    pub cell_output: Option<String>,
    pub candidate_outputs: Option<Vec<String>>,
    pub timeout_at: Option<DateTime<Utc>>,
}

/// Owns pending checkpoints and their wakeup channels.
pub struct CheckpointManager {
    pool: SqlitePool,
    waiters: Mutex<FxHashMap<String, oneshot::Sender<CheckpointResolution>>>,
}

impl CheckpointManager {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            waiters: Mutex::new(FxHashMap::default()),
        }
    }

    /// Create a pending checkpoint. Returns its id and the receiver the
    /// producing cell waits on.
    pub async fn create(
        &self,
        new: NewCheckpoint,
    ) -> Result<(String, oneshot::Receiver<CheckpointResolution>), CheckpointError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO checkpoints (
                id, session_id, cascade_id, cell_name, kind, status,
                created_at, timeout_at, ui_spec, cell_output, candidate_outputs
            ) VALUES (?,?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(&id)
        .bind(&new.session_id)
        .bind(&new.cascade_id)
        .bind(&new.cell_name)
        .bind(new.kind.encode())
        .bind(CheckpointStatus::Pending.encode())
        .bind(Utc::now())
        .bind(new.timeout_at)
        .bind(new.ui_spec.as_ref().map(serde_json::to_string).transpose()?)
        .bind(&new.cell_output)
        .bind(
            new.candidate_outputs
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .execute(&self.pool)
        .await?;

        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(id.clone(), tx);
        Ok((id, rx))
    }

    /// Record a response and wake the waiting cell.
    pub async fn respond(
        &self,
        id: &str,
        response: CheckpointResponse,
    ) -> Result<CheckpointRecord, CheckpointError> {
        self.transition(id, CheckpointStatus::Responded, Some(&response))
            .await?;
        if let Some(tx) = self.waiters.lock().remove(id) {
            let _ = tx.send(CheckpointResolution::Responded(response));
        }
        self.get(id).await
    }

    /// Cancel a pending checkpoint; the waiting cell observes cancellation.
    pub async fn cancel(
        &self,
        id: &str,
        reason: Option<String>,
    ) -> Result<CheckpointRecord, CheckpointError> {
        self.transition(id, CheckpointStatus::Cancelled, None).await?;
        if let Some(tx) = self.waiters.lock().remove(id) {
            let _ = tx.send(CheckpointResolution::Cancelled { reason });
        }
        self.get(id).await
    }

    /// Mark a checkpoint timed out. The waiter has already given up; this
    /// only settles the durable row.
    pub async fn mark_timed_out(&self, id: &str) -> Result<(), CheckpointError> {
        self.transition(id, CheckpointStatus::TimedOut, None).await?;
        self.waiters.lock().remove(id);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<CheckpointRecord, CheckpointError> {
        let row = sqlx::query("SELECT * FROM checkpoints WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CheckpointError::NotFound { id: id.to_string() })?;
        decode_checkpoint(&row)
    }

    pub async fn list(
        &self,
        session_id: Option<&str>,
        include_all: bool,
    ) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        let mut sql = String::from("SELECT * FROM checkpoints WHERE 1=1");
        if session_id.is_some() {
            sql.push_str(" AND session_id = ?");
        }
        if !include_all {
            sql.push_str(" AND status = 'pending'");
        }
        sql.push_str(" ORDER BY created_at DESC");
        let mut query = sqlx::query(&sql);
        if let Some(session_id) = session_id {
            query = query.bind(session_id.to_string());
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(decode_checkpoint).collect()
    }

    async fn transition(
        &self,
        id: &str,
        status: CheckpointStatus,
        response: Option<&CheckpointResponse>,
    ) -> Result<(), CheckpointError> {
        let result = sqlx::query(
            "UPDATE checkpoints SET
                status = ?, responded_at = ?,
                response = COALESCE(?, response),
                reasoning = COALESCE(?, reasoning),
                confidence = COALESCE(?, confidence),
                winner_index = COALESCE(?, winner_index),
                rankings = COALESCE(?, rankings)
             WHERE id = ? AND status = 'pending'",
        )
        .bind(status.encode())
        .bind(Utc::now())
        .bind(
            response
                .map(|r| serde_json::to_string(&r.response))
                .transpose()?,
        )
        .bind(response.and_then(|r| r.reasoning.clone()))
        .bind(response.and_then(|r| r.confidence))
        .bind(response.and_then(|r| r.winner_index))
        .bind(
            response
                .and_then(|r| r.rankings.as_ref())
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let current = self.get(id).await?;
            return Err(CheckpointError::NotPending {
                id: id.to_string(),
                status: current.status,
            });
        }
        Ok(())
    }
}

fn decode_checkpoint(row: &SqliteRow) -> Result<CheckpointRecord, CheckpointError> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let ui_spec: Option<String> = row.try_get("ui_spec")?;
    let candidate_outputs: Option<String> = row.try_get("candidate_outputs")?;
    let response: Option<String> = row.try_get("response")?;
    let rankings: Option<String> = row.try_get("rankings")?;
    Ok(CheckpointRecord {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        cascade_id: row.try_get("cascade_id")?,
        cell_name: row.try_get("cell_name")?,
        kind: CheckpointKind::decode(&kind),
        status: CheckpointStatus::decode(&status),
        created_at: row.try_get("created_at")?,
        responded_at: row.try_get("responded_at")?,
        timeout_at: row.try_get("timeout_at")?,
        ui_spec: ui_spec.map(|s| serde_json::from_str(&s)).transpose()?,
        cell_output: row.try_get("cell_output")?,
        candidate_outputs: candidate_outputs
            .map(|s| serde_json::from_str(&s))
            .transpose()?,
        response: response.map(|s| serde_json::from_str(&s)).transpose()?,
        reasoning: row.try_get("reasoning")?,
        confidence: row.try_get("confidence")?,
        winner_index: row.try_get("winner_index")?,
        rankings: rankings.map(|s| serde_json::from_str(&s)).transpose()?,
    })
}

/// Per-session audible flags.
///
/// The UI signals a session; the runner polls between turns and, when the
/// flag is up, inserts an ad-hoc checkpoint at the next safe boundary.
#[derive(Default)]
pub struct AudibleBoard {
    flags: RwLock<FxHashMap<String, bool>>,
}

impl AudibleBoard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self, session_id: &str) {
        self.flags.write().insert(session_id.to_string(), true);
    }

    pub fn clear(&self, session_id: &str) {
        self.flags.write().insert(session_id.to_string(), false);
    }

    #[must_use]
    pub fn is_signaled(&self, session_id: &str) -> bool {
        self.flags.read().get(session_id).copied().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_and_status_round_trip() {
        assert_eq!(CheckpointKind::decode("sounding_eval"), CheckpointKind::SoundingEval);
        assert_eq!(CheckpointKind::SoundingEval.encode(), "sounding_eval");
        assert_eq!(CheckpointStatus::decode("timed_out"), CheckpointStatus::TimedOut);
    }

    #[test]
    fn audible_board_flags() {
        let board = AudibleBoard::new();
        assert!(!board.is_signaled("s1"));
        board.signal("s1");
        assert!(board.is_signaled("s1"));
        assert!(!board.is_signaled("s2"));
        board.clear("s1");
        assert!(!board.is_signaled("s1"));
    }
}
