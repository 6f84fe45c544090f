//! Durable unified log backed by the engine SQLite store.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use super::row::{CostUpdate, LogRow, NodeType};
use super::writer::{CostApplied, EchoError, LogWriter};

/// Durable, append-only unified log.
///
/// Shares the engine pool with the session and checkpoint stores; rows are
/// visible to queries as soon as appended.
#[derive(Clone)]
pub struct EchoStore {
    pool: SqlitePool,
}

impl EchoStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the engine store at `path` and run embedded
    /// migrations.
    pub async fn open_pool(path: &Path) -> Result<SqlitePool, EchoError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EchoError::Backend {
                message: format!("create {}: {e}", parent.display()),
            })?;
        }
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| EchoError::Backend {
                message: e.to_string(),
            })?;
        Ok(pool)
    }

    /// In-memory pool for tests. Single connection so every query sees the
    /// same database.
    pub async fn memory_pool() -> Result<SqlitePool, EchoError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| EchoError::Backend {
                message: e.to_string(),
            })?;
        Ok(pool)
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn row_by_trace(&self, trace_id: &str) -> Result<Option<LogRow>, EchoError> {
        let row = sqlx::query("SELECT * FROM echo_log WHERE trace_id = ?")
            .bind(trace_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| decode_row(&r)).transpose()
    }

    pub async fn rows_for_session(&self, session_id: &str) -> Result<Vec<LogRow>, EchoError> {
        let rows = sqlx::query("SELECT * FROM echo_log WHERE session_id = ? ORDER BY ts, trace_id")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode_row).collect()
    }

    pub async fn rows_by_request_id(&self, request_id: &str) -> Result<Vec<LogRow>, EchoError> {
        let rows = sqlx::query("SELECT * FROM echo_log WHERE provider_request_id = ? ORDER BY ts")
            .bind(request_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode_row).collect()
    }

    pub async fn rows_for_caller(&self, caller_id: &str) -> Result<Vec<LogRow>, EchoError> {
        let rows = sqlx::query("SELECT * FROM echo_log WHERE caller_id = ? ORDER BY ts")
            .bind(caller_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode_row).collect()
    }
}

#[async_trait]
impl LogWriter for EchoStore {
    async fn append(&self, row: LogRow) -> Result<(), EchoError> {
        sqlx::query(
            "INSERT INTO echo_log (
                trace_id, parent_id, session_id, ts, node_type, role,
                phase_name, cascade_id, take_index, reforge_step, turn_number,
                candidate_index, model, provider, provider_request_id,
                tokens_in, tokens_out, tokens_reasoning, cost, duration_ms,
                content, full_request, full_response, tool_calls, images,
                metadata, is_winner, content_hash, context_hashes, caller_id
            ) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(&row.trace_id)
        .bind(&row.parent_id)
        .bind(&row.session_id)
        .bind(row.ts)
        .bind(row.node_type.encode())
        .bind(&row.role)
        .bind(&row.phase_name)
        .bind(&row.cascade_id)
        .bind(row.take_index)
        .bind(row.reforge_step)
        .bind(row.turn_number)
        .bind(row.candidate_index)
        .bind(&row.model)
        .bind(&row.provider)
        .bind(&row.provider_request_id)
        .bind(row.tokens_in)
        .bind(row.tokens_out)
        .bind(row.tokens_reasoning)
        .bind(row.cost)
        .bind(row.duration_ms)
        .bind(encode_json(&row.content)?)
        .bind(encode_json(&row.full_request)?)
        .bind(encode_json(&row.full_response)?)
        .bind(encode_json(&row.tool_calls)?)
        .bind(encode_json(&row.images)?)
        .bind(encode_json(&row.metadata)?)
        .bind(row.is_winner)
        .bind(&row.content_hash)
        .bind(encode_hashes(&row.context_hashes)?)
        .bind(&row.caller_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_cost(
        &self,
        provider_request_id: &str,
        update: &CostUpdate,
    ) -> Result<CostApplied, EchoError> {
        // COALESCE keeps an already-reconciled value: applying the same
        // update twice is a no-op and a late null never clobbers real cost.
        let result = sqlx::query(
            "UPDATE echo_log SET
                cost = COALESCE(cost, ?),
                tokens_in = COALESCE(tokens_in, ?),
                tokens_out = COALESCE(tokens_out, ?),
                tokens_reasoning = COALESCE(tokens_reasoning, ?),
                provider = COALESCE(provider, ?)
             WHERE provider_request_id = ?
               AND (cost IS NULL OR tokens_in IS NULL OR tokens_out IS NULL)",
        )
        .bind(update.cost)
        .bind(update.tokens_in)
        .bind(update.tokens_out)
        .bind(update.tokens_reasoning)
        .bind(&update.provider)
        .bind(provider_request_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            Ok(CostApplied::Updated)
        } else {
            Ok(CostApplied::Ignored)
        }
    }
}

fn encode_json(value: &Option<Value>) -> Result<Option<String>, EchoError> {
    value
        .as_ref()
        .map(|v| serde_json::to_string(v).map_err(EchoError::from))
        .transpose()
}

fn encode_hashes(hashes: &Option<Vec<String>>) -> Result<Option<String>, EchoError> {
    hashes
        .as_ref()
        .map(|h| serde_json::to_string(h).map_err(EchoError::from))
        .transpose()
}

fn decode_json(raw: Option<String>) -> Result<Option<Value>, EchoError> {
    raw.map(|s| serde_json::from_str(&s).map_err(EchoError::from))
        .transpose()
}

fn decode_row(row: &SqliteRow) -> Result<LogRow, EchoError> {
    let node_type: String = row.try_get("node_type")?;
    let context_hashes: Option<String> = row.try_get("context_hashes")?;
    Ok(LogRow {
        trace_id: row.try_get("trace_id")?,
        parent_id: row.try_get("parent_id")?,
        session_id: row.try_get("session_id")?,
        ts: row.try_get::<DateTime<Utc>, _>("ts")?,
        node_type: NodeType::decode(&node_type),
        role: row.try_get("role")?,
        phase_name: row.try_get("phase_name")?,
        cascade_id: row.try_get("cascade_id")?,
        take_index: row.try_get("take_index")?,
        reforge_step: row.try_get("reforge_step")?,
        turn_number: row.try_get("turn_number")?,
        candidate_index: row.try_get("candidate_index")?,
        model: row.try_get("model")?,
        provider: row.try_get("provider")?,
        provider_request_id: row.try_get("provider_request_id")?,
        tokens_in: row.try_get("tokens_in")?,
        tokens_out: row.try_get("tokens_out")?,
        tokens_reasoning: row.try_get("tokens_reasoning")?,
        cost: row.try_get("cost")?,
        duration_ms: row.try_get("duration_ms")?,
        content: decode_json(row.try_get("content")?)?,
        full_request: decode_json(row.try_get("full_request")?)?,
        full_response: decode_json(row.try_get("full_response")?)?,
        tool_calls: decode_json(row.try_get("tool_calls")?)?,
        images: decode_json(row.try_get("images")?)?,
        metadata: decode_json(row.try_get("metadata")?)?,
        is_winner: row.try_get("is_winner")?,
        content_hash: row.try_get("content_hash")?,
        context_hashes: context_hashes
            .map(|s| serde_json::from_str(&s))
            .transpose()?,
        caller_id: row.try_get("caller_id")?,
    })
}
