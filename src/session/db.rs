//! Per-session database for inter-cell temp tables.
//!
//! Each session owns one file-backed database where cells materialize their
//! outputs as `_<cell_name>` tables for downstream cells to read. The file
//! (and its WAL siblings) is deleted when the session ends. The session DB
//! is single-writer: the runner serializes all access.

use std::path::{Path, PathBuf};

use miette::Diagnostic;
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Column, Row, SqlitePool, TypeInfo};
use thiserror::Error;

use crate::frame::Frame;

#[derive(Debug, Error, Diagnostic)]
pub enum SessionDbError {
    #[error("session db error: {message}")]
    #[diagnostic(code(windlass::session_db::backend))]
    Backend { message: String },

    #[error("table not found: {table}")]
    #[diagnostic(
        code(windlass::session_db::no_table),
        help("Cell temp tables are named _<cell_name>; has the producing cell run?")
    )]
    NoTable { table: String },

    #[error(transparent)]
    #[diagnostic(code(windlass::session_db::serde))]
    Serde(#[from] serde_json::Error),
}

impl From<sqlx::Error> for SessionDbError {
    fn from(err: sqlx::Error) -> Self {
        SessionDbError::Backend {
            message: err.to_string(),
        }
    }
}

/// File-backed session database owning `_<cell>` temp tables and the
/// session's artifacts directory.
pub struct SessionDb {
    pool: SqlitePool,
    db_path: PathBuf,
    artifacts_dir: PathBuf,
}

impl SessionDb {
    /// Open (or create) the database for `session_id` under `sessions_dir`.
    pub async fn open(
        sessions_dir: &Path,
        artifacts_dir: &Path,
        session_id: &str,
    ) -> Result<Self, SessionDbError> {
        std::fs::create_dir_all(sessions_dir).map_err(io_err)?;
        let safe_id: String = session_id
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        let db_path = sessions_dir.join(format!("{safe_id}.db"));
        let artifacts = artifacts_dir.join(&safe_id);
        std::fs::create_dir_all(&artifacts).map_err(io_err)?;

        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await?;
        Ok(Self {
            pool,
            db_path,
            artifacts_dir: artifacts,
        })
    }

    #[must_use]
    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts_dir
    }

    /// Canonical temp-table name for a cell.
    #[must_use]
    pub fn table_name(cell: &str) -> String {
        if cell.starts_with('_') {
            cell.to_string()
        } else {
            format!("_{cell}")
        }
    }

    /// Materialize a frame as `_<cell>`, replacing any prior table.
    pub async fn materialize(&self, cell: &str, frame: &Frame) -> Result<(), SessionDbError> {
        let table = Self::table_name(cell);
        self.create_table(&table, frame).await
    }

    /// Create or replace an arbitrary named table (pipeline `INTO` targets).
    pub async fn create_table(&self, table: &str, frame: &Frame) -> Result<(), SessionDbError> {
        let table = sanitize_identifier(table)?;
        sqlx::query(&format!("DROP TABLE IF EXISTS \"{table}\""))
            .execute(&self.pool)
            .await?;
        let columns: Vec<String> = frame
            .columns
            .iter()
            .map(|c| sanitize_identifier(c).map(|c| format!("\"{c}\"")))
            .collect::<Result<_, _>>()?;
        if columns.is_empty() {
            sqlx::query(&format!("CREATE TABLE \"{table}\" (value TEXT)"))
                .execute(&self.pool)
                .await?;
            return Ok(());
        }
        sqlx::query(&format!(
            "CREATE TABLE \"{table}\" ({})",
            columns.join(", ")
        ))
        .execute(&self.pool)
        .await?;

        let placeholders = vec!["?"; frame.columns.len()].join(",");
        let insert = format!("INSERT INTO \"{table}\" VALUES ({placeholders})");
        for row in &frame.rows {
            let mut query = sqlx::query(&insert);
            for value in row {
                query = bind_value(query, value)?;
            }
            query.execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Read a table as a frame. Bare cell names resolve through the
    /// `_<cell>` convention.
    pub async fn read_table(&self, name: &str) -> Result<Frame, SessionDbError> {
        let table = sanitize_identifier(&Self::table_name(name))?;
        if !self.table_exists(&table).await? {
            // Callers may also pass fully-qualified table names.
            let raw = sanitize_identifier(name)?;
            if self.table_exists(&raw).await? {
                return self.query(&format!("SELECT * FROM \"{raw}\"")).await;
            }
            return Err(SessionDbError::NoTable {
                table: name.to_string(),
            });
        }
        self.query(&format!("SELECT * FROM \"{table}\"")).await
    }

    pub async fn list_tables(&self) -> Result<Vec<String>, SessionDbError> {
        let rows = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("name").map_err(SessionDbError::from))
            .collect()
    }

    async fn table_exists(&self, table: &str) -> Result<bool, SessionDbError> {
        let row = sqlx::query("SELECT 1 FROM sqlite_master WHERE type='table' AND name = ?")
            .bind(table)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Run a query and decode the result set into a frame.
    pub async fn query(&self, sql: &str) -> Result<Frame, SessionDbError> {
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        let mut frame = Frame::default();
        if let Some(first) = rows.first() {
            frame.columns = first
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect();
        }
        for row in &rows {
            let mut decoded = Vec::with_capacity(frame.columns.len());
            for (idx, column) in row.columns().iter().enumerate() {
                decoded.push(decode_column(row, idx, column.type_info().name())?);
            }
            frame.rows.push(decoded);
        }
        Ok(frame)
    }

    /// Execute a statement that returns no rows.
    pub async fn execute(&self, sql: &str) -> Result<(), SessionDbError> {
        sqlx::query(sql).execute(&self.pool).await?;
        Ok(())
    }

    /// Close the pool and delete the database file, WAL siblings, and the
    /// artifacts directory.
    pub async fn destroy(self) -> Result<(), SessionDbError> {
        self.pool.close().await;
        for suffix in ["", "-wal", "-shm"] {
            let path = PathBuf::from(format!("{}{suffix}", self.db_path.display()));
            if path.exists() {
                let _ = std::fs::remove_file(path);
            }
        }
        let _ = std::fs::remove_dir_all(&self.artifacts_dir);
        Ok(())
    }
}

fn io_err(err: std::io::Error) -> SessionDbError {
    SessionDbError::Backend {
        message: err.to_string(),
    }
}

/// Identifiers come from cell names and LLM-proposed table names; allow only
/// word characters so they can be safely quoted.
fn sanitize_identifier(name: &str) -> Result<String, SessionDbError> {
    if !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        Ok(name.to_string())
    } else {
        Err(SessionDbError::Backend {
            message: format!("invalid identifier: {name}"),
        })
    }
}

type SqliteQuery<'q> =
    sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

fn bind_value<'q>(query: SqliteQuery<'q>, value: &Value) -> Result<SqliteQuery<'q>, SessionDbError> {
    Ok(match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(serde_json::to_string(other)?),
    })
}

fn decode_column(
    row: &sqlx::sqlite::SqliteRow,
    idx: usize,
    type_name: &str,
) -> Result<Value, SessionDbError> {
    // Declared types guide decoding; expression columns fall through the
    // chain because SQLite types are per-value.
    let typed = match type_name {
        "INTEGER" => row.try_get::<Option<i64>, _>(idx).map(|v| v.map(Value::from)),
        "REAL" => row.try_get::<Option<f64>, _>(idx).map(|v| v.map(Value::from)),
        "BOOLEAN" => row.try_get::<Option<bool>, _>(idx).map(|v| v.map(Value::from)),
        _ => row
            .try_get::<Option<String>, _>(idx)
            .map(|v| v.map(Value::from)),
    };
    if let Ok(value) = typed {
        return Ok(value.unwrap_or(Value::Null));
    }
    if let Ok(value) = row.try_get::<Option<i64>, _>(idx) {
        return Ok(value.map(Value::from).unwrap_or(Value::Null));
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(idx) {
        return Ok(value.map(Value::from).unwrap_or(Value::Null));
    }
    if let Ok(value) = row.try_get::<Option<String>, _>(idx) {
        return Ok(value.map(Value::from).unwrap_or(Value::Null));
    }
    Ok(Value::Null)
}
