//! Durable session state store.
//!
//! The store is the durable lock for a session: every status mutation is a
//! check-and-set against the current status class, so a terminal status,
//! once written, is immutable — late writes from a formerly running process
//! are rejected here rather than trusted anywhere else.

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::instrument;

use crate::config::DEFAULT_HEARTBEAT_LEASE_SECS;
use crate::echo::hash::{canonical_json, hex_digest};

use super::state::{BlockedKind, SessionFilter, SessionRecord, SessionStatus};

const TERMINAL_GUARD: &str = "status NOT IN ('completed','error','cancelled','orphaned')";

#[derive(Debug, Error, Diagnostic)]
pub enum SessionError {
    #[error("session not found: {session_id}")]
    #[diagnostic(code(windlass::session::not_found))]
    NotFound { session_id: String },

    #[error("session {session_id} is terminal ({status}); mutation rejected")]
    #[diagnostic(
        code(windlass::session::terminal),
        help("Terminal statuses are immutable. Start a new session instead.")
    )]
    Terminal {
        session_id: String,
        status: SessionStatus,
    },

    #[error("session backend error: {message}")]
    #[diagnostic(code(windlass::session::backend))]
    Backend { message: String },

    #[error(transparent)]
    #[diagnostic(code(windlass::session::serde))]
    Serde(#[from] serde_json::Error),
}

impl From<sqlx::Error> for SessionError {
    fn from(err: sqlx::Error) -> Self {
        SessionError::Backend {
            message: err.to_string(),
        }
    }
}

/// Optional fields carried by a status transition.
#[derive(Clone, Debug, Default)]
pub struct StatusExtras {
    pub error_message: Option<String>,
    pub output: Option<Value>,
    pub current_cell: Option<String>,
}

/// Durable per-session record store over the engine pool.
#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self, input_data), err)]
    pub async fn create(
        &self,
        session_id: &str,
        cascade_id: &str,
        input_data: Value,
        heartbeat_lease_seconds: Option<i64>,
        parent_session_id: Option<&str>,
    ) -> Result<SessionRecord, SessionError> {
        let now = Utc::now();
        let lease = heartbeat_lease_seconds.unwrap_or(DEFAULT_HEARTBEAT_LEASE_SECS);
        sqlx::query(
            "INSERT INTO sessions (
                id, cascade_id, parent_session_id, status, started_at,
                updated_at, heartbeat_at, heartbeat_lease_seconds, input_data,
                cancel_requested, resumable
            ) VALUES (?,?,?,?,?,?,?,?,?,0,0)",
        )
        .bind(session_id)
        .bind(cascade_id)
        .bind(parent_session_id)
        .bind(SessionStatus::Starting.encode())
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(lease)
        .bind(serde_json::to_string(&input_data)?)
        .execute(&self.pool)
        .await?;
        self.get(session_id).await
    }

    pub async fn get(&self, session_id: &str) -> Result<SessionRecord, SessionError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| SessionError::NotFound {
                session_id: session_id.to_string(),
            })?;
        decode_session(&row)
    }

    pub async fn list(&self, filter: &SessionFilter) -> Result<Vec<SessionRecord>, SessionError> {
        // Filters are few and closed; build the clause directly.
        let mut sql = String::from("SELECT * FROM sessions WHERE 1=1");
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.cascade_id.is_some() {
            sql.push_str(" AND cascade_id = ?");
        }
        if filter.active_only {
            sql.push_str(" AND status IN ('starting','running','blocked')");
        }
        sql.push_str(" ORDER BY started_at DESC");
        if filter.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query(&sql);
        if let Some(status) = filter.status {
            query = query.bind(status.encode());
        }
        if let Some(cascade_id) = &filter.cascade_id {
            query = query.bind(cascade_id.clone());
        }
        if let Some(limit) = filter.limit {
            query = query.bind(limit);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(decode_session).collect()
    }

    /// Transition the session status. Rejected if the session is already
    /// terminal; non-terminal transitions refresh the heartbeat.
    #[instrument(skip(self, extras), err)]
    pub async fn update_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        extras: StatusExtras,
    ) -> Result<SessionRecord, SessionError> {
        let now = Utc::now();
        let completed_at: Option<DateTime<Utc>> = status.is_terminal().then_some(now);
        let output_json = extras
            .output
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let sql = format!(
            "UPDATE sessions SET
                status = ?,
                updated_at = ?,
                heartbeat_at = ?,
                completed_at = COALESCE(?, completed_at),
                error_message = COALESCE(?, error_message),
                output = COALESCE(?, output),
                current_cell = COALESCE(?, current_cell)
             WHERE id = ? AND {TERMINAL_GUARD}"
        );
        let result = sqlx::query(&sql)
            .bind(status.encode())
            .bind(now)
            .bind(now)
            .bind(completed_at)
            .bind(&extras.error_message)
            .bind(output_json)
            .bind(&extras.current_cell)
            .bind(session_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(self.rejection(session_id).await);
        }
        self.get(session_id).await
    }

    /// Refresh the heartbeat. No-op on terminal sessions.
    pub async fn heartbeat(&self, session_id: &str) -> Result<(), SessionError> {
        let now = Utc::now();
        let sql =
            format!("UPDATE sessions SET heartbeat_at = ?, updated_at = ? WHERE id = ? AND {TERMINAL_GUARD}");
        sqlx::query(&sql)
            .bind(now)
            .bind(now)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Cooperative cancellation: sets the flag the runner polls at safe
    /// boundaries. Rejected on terminal sessions.
    #[instrument(skip(self), err)]
    pub async fn request_cancellation(
        &self,
        session_id: &str,
        reason: Option<&str>,
    ) -> Result<SessionRecord, SessionError> {
        let now = Utc::now();
        let sql = format!(
            "UPDATE sessions SET
                cancel_requested = 1,
                cancel_reason = COALESCE(?, cancel_reason),
                updated_at = ?, heartbeat_at = ?
             WHERE id = ? AND {TERMINAL_GUARD}"
        );
        let result = sqlx::query(&sql)
            .bind(reason)
            .bind(now)
            .bind(now)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(self.rejection(session_id).await);
        }
        self.get(session_id).await
    }

    /// Forced cancellation writes the terminal status directly; later
    /// cooperative writes from the owning process are rejected by the
    /// terminal guard.
    pub async fn force_cancel(
        &self,
        session_id: &str,
        reason: Option<&str>,
    ) -> Result<SessionRecord, SessionError> {
        let now = Utc::now();
        let sql = format!(
            "UPDATE sessions SET
                status = ?, cancel_requested = 1,
                cancel_reason = COALESCE(?, cancel_reason),
                completed_at = ?, updated_at = ?
             WHERE id = ? AND {TERMINAL_GUARD}"
        );
        let result = sqlx::query(&sql)
            .bind(SessionStatus::Cancelled.encode())
            .bind(reason)
            .bind(now)
            .bind(now)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(self.rejection(session_id).await);
        }
        self.get(session_id).await
    }

    pub async fn mark_blocked(
        &self,
        session_id: &str,
        kind: BlockedKind,
        blocked_on: &str,
    ) -> Result<SessionRecord, SessionError> {
        let now = Utc::now();
        let sql = format!(
            "UPDATE sessions SET
                status = ?, blocked_type = ?, blocked_on = ?,
                last_checkpoint_id = ?, resumable = 1,
                updated_at = ?, heartbeat_at = ?
             WHERE id = ? AND {TERMINAL_GUARD}"
        );
        let result = sqlx::query(&sql)
            .bind(SessionStatus::Blocked.encode())
            .bind(kind.encode())
            .bind(blocked_on)
            .bind(blocked_on)
            .bind(now)
            .bind(now)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(self.rejection(session_id).await);
        }
        self.get(session_id).await
    }

    pub async fn resume_unblock(&self, session_id: &str) -> Result<SessionRecord, SessionError> {
        let now = Utc::now();
        let sql = format!(
            "UPDATE sessions SET
                status = ?, blocked_type = NULL, blocked_on = NULL,
                updated_at = ?, heartbeat_at = ?
             WHERE id = ? AND {TERMINAL_GUARD}"
        );
        let result = sqlx::query(&sql)
            .bind(SessionStatus::Running.encode())
            .bind(now)
            .bind(now)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(self.rejection(session_id).await);
        }
        self.get(session_id).await
    }

    pub async fn set_current_cell(
        &self,
        session_id: &str,
        cell: &str,
    ) -> Result<(), SessionError> {
        let now = Utc::now();
        let sql = format!(
            "UPDATE sessions SET current_cell = ?, updated_at = ?, heartbeat_at = ? WHERE id = ? AND {TERMINAL_GUARD}"
        );
        sqlx::query(&sql)
            .bind(cell)
            .bind(now)
            .bind(now)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Zombie detection is purely a read; this transitions detected zombies
    /// to `orphaned`. Idempotent and non-blocking.
    #[instrument(skip(self), err)]
    pub async fn cleanup_zombies(&self, grace_seconds: i64) -> Result<Vec<String>, SessionError> {
        let now = Utc::now();
        let rows = sqlx::query(
            "SELECT id, heartbeat_at, heartbeat_lease_seconds FROM sessions
             WHERE status IN ('running','blocked')",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut orphaned = Vec::new();
        for row in rows {
            let id: String = row.try_get("id")?;
            let heartbeat_at: DateTime<Utc> = row.try_get("heartbeat_at")?;
            let lease: i64 = row.try_get("heartbeat_lease_seconds")?;
            let stale = now.signed_duration_since(heartbeat_at).num_seconds();
            if stale > lease + grace_seconds {
                let sql = format!(
                    "UPDATE sessions SET status = ?, completed_at = ?, updated_at = ?
                     WHERE id = ? AND {TERMINAL_GUARD}"
                );
                let result = sqlx::query(&sql)
                    .bind(SessionStatus::Orphaned.encode())
                    .bind(now)
                    .bind(now)
                    .bind(&id)
                    .execute(&self.pool)
                    .await?;
                if result.rows_affected() > 0 {
                    orphaned.push(id);
                }
            }
        }
        Ok(orphaned)
    }

    pub async fn is_cancel_requested(&self, session_id: &str) -> Result<bool, SessionError> {
        let record = self.get(session_id).await?;
        Ok(record.cancel_requested)
    }

    /// Write the per-session snapshot row (input/output + genus hash of the
    /// input structure) used for pattern detection downstream.
    pub async fn record_snapshot(&self, record: &SessionRecord) -> Result<(), SessionError> {
        let genus = hex_digest(canonical_json(&shape_of(&record.input_data)).as_bytes(), 12);
        sqlx::query(
            "INSERT INTO session_snapshots (session_id, cascade_id, input_data, output, genus_hash, created_at)
             VALUES (?,?,?,?,?,?)
             ON CONFLICT (session_id) DO UPDATE SET output = excluded.output",
        )
        .bind(&record.id)
        .bind(&record.cascade_id)
        .bind(serde_json::to_string(&record.input_data)?)
        .bind(record.output.as_ref().map(serde_json::to_string).transpose()?)
        .bind(genus)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn rejection(&self, session_id: &str) -> SessionError {
        match self.get(session_id).await {
            Ok(record) => SessionError::Terminal {
                session_id: session_id.to_string(),
                status: record.status,
            },
            Err(err) => err,
        }
    }
}

/// Type tree of a JSON value; the genus hash keys on this, not on content.
fn shape_of(value: &Value) -> Value {
    match value {
        Value::Null => Value::String("null".into()),
        Value::Bool(_) => Value::String("boolean".into()),
        Value::Number(n) if n.is_i64() || n.is_u64() => Value::String("integer".into()),
        Value::Number(_) => Value::String("number".into()),
        Value::String(_) => Value::String("string".into()),
        Value::Array(items) => Value::Array(items.first().map(shape_of).into_iter().collect()),
        Value::Object(map) => {
            let mut obj = serde_json::Map::new();
            for (k, v) in map {
                obj.insert(k.clone(), shape_of(v));
            }
            Value::Object(obj)
        }
    }
}

fn decode_session(row: &SqliteRow) -> Result<SessionRecord, SessionError> {
    let status: String = row.try_get("status")?;
    let blocked_type: Option<String> = row.try_get("blocked_type")?;
    let input_data: Option<String> = row.try_get("input_data")?;
    let output: Option<String> = row.try_get("output")?;
    Ok(SessionRecord {
        id: row.try_get("id")?,
        cascade_id: row.try_get("cascade_id")?,
        parent_session_id: row.try_get("parent_session_id")?,
        status: SessionStatus::decode(&status),
        started_at: row.try_get("started_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
        heartbeat_at: row.try_get("heartbeat_at")?,
        heartbeat_lease_seconds: row.try_get("heartbeat_lease_seconds")?,
        current_cell: row.try_get("current_cell")?,
        cancel_requested: row.try_get::<i64, _>("cancel_requested")? != 0,
        cancel_reason: row.try_get("cancel_reason")?,
        blocked_type: blocked_type.as_deref().and_then(BlockedKind::decode),
        blocked_on: row.try_get("blocked_on")?,
        resumable: row.try_get::<i64, _>("resumable")? != 0,
        last_checkpoint_id: row.try_get("last_checkpoint_id")?,
        error_message: row.try_get("error_message")?,
        input_data: input_data
            .map(|s| serde_json::from_str(&s))
            .transpose()?
            .unwrap_or(Value::Null),
        output: output.map(|s| serde_json::from_str(&s)).transpose()?,
    })
}
