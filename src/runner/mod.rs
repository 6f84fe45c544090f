//! The cascade runner: sequences cells, carries state and outputs, publishes
//! lifecycle events, and writes session state transitions.

pub mod cell;
pub mod data_cells;
pub mod tools;
pub mod wards;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use miette::Diagnostic;
use serde_json::Value;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use crate::agent::{Agent, AgentError, BudgetError, ChatProvider, HttpProvider};
use crate::cascade::registry::{Registries, ToolError, ToolKind};
use crate::cascade::spec::{CascadeConfigError, CascadeSpec};
use crate::cascade::template::TemplateError;
use crate::config::WindlassConfig;
use crate::echo::{
    CostFetcher, CostJob, CostReconciler, EchoError, EchoStore, FanOutWriter, HttpCostFetcher,
    LiveMirror, LogRow, LogWriter, NodeType,
};
use crate::events::{Event, EventBus, EventEmitter, EventKind};
use crate::session::db::SessionDbError;
use crate::session::{
    AudibleBoard, CheckpointError, CheckpointManager, SessionDb, SessionError, SessionStatus,
    SessionStore, StatusExtras,
};

pub use cell::CellValue;
pub use data_cells::{CellResult, DataLanguage};

/// Route-loop backstop: a cascade may revisit cells via `route_to`, but not
/// unboundedly.
const MAX_CELL_VISITS_FACTOR: usize = 8;

#[derive(Debug, Error, Diagnostic)]
pub enum RunnerError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] CascadeConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    SessionDb(#[from] SessionDbError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Echo(#[from] EchoError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Budget(#[from] BudgetError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Tool(#[from] ToolError),

    #[error("cell {cell} failed: {message}")]
    #[diagnostic(code(windlass::runner::cell))]
    Cell { cell: String, message: String },

    #[error("ward {ward} blocked cell {cell}: {reason}")]
    #[diagnostic(code(windlass::runner::ward))]
    Ward {
        cell: String,
        ward: String,
        reason: String,
    },

    #[error("session {session_id} cancelled")]
    #[diagnostic(code(windlass::runner::cancelled))]
    Cancelled { session_id: String },

    #[error("checkpoint timed out in cell {cell}")]
    #[diagnostic(code(windlass::runner::checkpoint_timeout))]
    CheckpointTimeout { cell: String },

    #[error("unknown cascade: {id}")]
    #[diagnostic(code(windlass::runner::unknown_cascade))]
    UnknownCascade { id: String },

    #[error("route_to target {target} does not exist in cascade (from cell {cell})")]
    #[diagnostic(code(windlass::runner::route_target))]
    RouteTarget { cell: String, target: String },

    #[error("cell {cell} exceeded its turn budget without a valid output")]
    #[diagnostic(code(windlass::runner::forced_termination))]
    ForcedTermination { cell: String },
}

/// Options for one cascade run.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    pub session_id: Option<String>,
    pub parent_session_id: Option<String>,
    /// Stable id shared by all rows produced by a single SQL UDF call.
    pub caller_id: Option<String>,
}

/// Result of a completed cascade.
#[derive(Clone, Debug)]
pub struct CascadeOutcome {
    pub session_id: String,
    pub outputs: Value,
    pub state: Value,
    pub final_output: Value,
}

/// Everything the runner needs, passed explicitly (no globals).
pub struct RunnerParts {
    pub config: WindlassConfig,
    pub pool: SqlitePool,
    pub provider: Arc<dyn ChatProvider>,
    pub cost_fetcher: Arc<dyn CostFetcher>,
    pub bus: EventBus,
    pub registries: Registries,
}

/// Drives cascades: one instance per process, shared across sessions.
pub struct CascadeRunner {
    config: WindlassConfig,
    registries: Arc<Registries>,
    provider: Arc<dyn ChatProvider>,
    writer: Arc<FanOutWriter>,
    store: Arc<EchoStore>,
    mirror: Arc<LiveMirror>,
    sessions: Arc<SessionStore>,
    checkpoints: Arc<CheckpointManager>,
    audible: Arc<AudibleBoard>,
    bus: Arc<EventBus>,
    emitter: Arc<dyn EventEmitter>,
    reconciler: Arc<CostReconciler>,
    pool: SqlitePool,
}

impl CascadeRunner {
    /// Bootstrap a runner from environment configuration: engine store,
    /// HTTP provider, cost reconciler, stdout event bus, and built-in tools.
    pub async fn bootstrap(config: WindlassConfig) -> Result<Arc<Self>, RunnerError> {
        let pool = EchoStore::open_pool(&config.store_path()).await?;
        let provider: Arc<dyn ChatProvider> = Arc::new(HttpProvider::new(
            config.provider_base_url.clone(),
            config.provider_api_key.clone(),
        ));
        let fetcher: Arc<dyn CostFetcher> = Arc::new(HttpCostFetcher::new(
            config.provider_base_url.clone(),
            config.provider_api_key.clone(),
        ));
        let mut registries = Registries::new();
        let spec_dir = config.data_dir.join("cascades");
        if spec_dir.is_dir() {
            let loaded = registries.load_spec_dir(&spec_dir)?;
            tracing::info!(count = loaded, dir = %spec_dir.display(), "loaded cascade specs");
        }
        Ok(Self::assemble(RunnerParts {
            config,
            pool,
            provider,
            cost_fetcher: fetcher,
            bus: EventBus::default(),
            registries,
        }))
    }

    /// Wire a runner from explicit parts. Used directly by tests to inject
    /// scripted providers and fetchers.
    #[must_use]
    pub fn assemble(parts: RunnerParts) -> Arc<Self> {
        let RunnerParts {
            config,
            pool,
            provider,
            cost_fetcher,
            bus,
            mut registries,
        } = parts;

        registries.register_tool(
            "run_sql",
            ToolKind::Deterministic(Arc::new(tools::RunSqlTool)),
        );
        registries.register_tool(
            "read_table",
            ToolKind::Deterministic(Arc::new(tools::ReadTableTool)),
        );

        bus.listen_for_events();
        let bus = Arc::new(bus);
        let emitter = bus.get_emitter();

        let store = Arc::new(EchoStore::new(pool.clone()));
        let mirror = Arc::new(LiveMirror::default());
        let _scavenger = mirror.spawn_scavenger();
        let writer = Arc::new(FanOutWriter::new(vec![
            store.clone() as Arc<dyn LogWriter>,
            mirror.clone() as Arc<dyn LogWriter>,
        ]));
        let reconciler = Arc::new(CostReconciler::spawn(
            4,
            cost_fetcher,
            writer.clone() as Arc<dyn LogWriter>,
            emitter.clone(),
        ));

        Arc::new(Self {
            sessions: Arc::new(SessionStore::new(pool.clone())),
            checkpoints: Arc::new(CheckpointManager::new(pool.clone())),
            audible: Arc::new(AudibleBoard::new()),
            registries: Arc::new(registries),
            config,
            provider,
            writer,
            store,
            mirror,
            bus,
            emitter,
            reconciler,
            pool,
        })
    }

    #[must_use]
    pub fn config(&self) -> &WindlassConfig {
        &self.config
    }

    #[must_use]
    pub fn registries(&self) -> &Registries {
        &self.registries
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    #[must_use]
    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    #[must_use]
    pub fn audible(&self) -> &Arc<AudibleBoard> {
        &self.audible
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    #[must_use]
    pub fn store(&self) -> &Arc<EchoStore> {
        &self.store
    }

    #[must_use]
    pub fn mirror(&self) -> &Arc<LiveMirror> {
        &self.mirror
    }

    /// Run a registered cascade by id.
    pub async fn run_by_id(
        &self,
        cascade_id: &str,
        input: Value,
        opts: RunOptions,
    ) -> Result<CascadeOutcome, RunnerError> {
        let spec = self
            .registries
            .cascade(cascade_id)
            .cloned()
            .ok_or_else(|| RunnerError::UnknownCascade {
                id: cascade_id.to_string(),
            })?;
        self.run(&spec, input, opts).await
    }

    /// Run a cascade to completion.
    #[instrument(skip(self, spec, input, opts), fields(cascade_id = %spec.cascade_id), err)]
    pub async fn run(
        &self,
        spec: &CascadeSpec,
        input: Value,
        opts: RunOptions,
    ) -> Result<CascadeOutcome, RunnerError> {
        spec.validate()?;
        let session_id = opts
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        self.sessions
            .create(
                &session_id,
                &spec.cascade_id,
                input.clone(),
                Some(self.config.heartbeat_lease_seconds),
                opts.parent_session_id.as_deref(),
            )
            .await?;
        let session_db = SessionDb::open(
            &self.config.sessions_dir(),
            &self.config.artifacts_dir(),
            &session_id,
        )
        .await?;

        let mut root = LogRow::new(&session_id, NodeType::CascadeStart, "system")
            .with_cascade(&spec.cascade_id)
            .with_content(input.clone());
        if let Some(caller) = &opts.caller_id {
            root = root.with_caller(caller.clone());
        }
        let root_trace = root.trace_id.clone();
        self.log(root).await?;
        self.emit(
            EventKind::CascadeStart,
            &session_id,
            Some(root_trace.clone()),
            None,
            serde_json::json!({"cascade_id": spec.cascade_id, "input": input}),
        );

        self.sessions
            .update_status(&session_id, SessionStatus::Running, StatusExtras::default())
            .await?;

        // Background lease refresh; cell boundaries heartbeat as well, but a
        // single slow LLM call must not let the lease lapse.
        let heartbeat = {
            let sessions = self.sessions.clone();
            let session_id = session_id.clone();
            let period = (self.config.heartbeat_lease_seconds.max(2) as u64) / 2;
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(period.max(1)));
                tick.tick().await;
                loop {
                    tick.tick().await;
                    if sessions.heartbeat(&session_id).await.is_err() {
                        break;
                    }
                }
            })
        };

        let result = self
            .drive_cells(spec, &session_id, &root_trace, &input, &opts, &session_db)
            .await;
        heartbeat.abort();

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                self.finalize_failure(spec, &session_id, &root_trace, &err)
                    .await;
                let _ = session_db.destroy().await;
                self.mirror.end_session(&session_id);
                return Err(err);
            }
        };

        let completed = self
            .sessions
            .update_status(
                &session_id,
                SessionStatus::Completed,
                StatusExtras {
                    output: Some(outcome.final_output.clone()),
                    ..Default::default()
                },
            )
            .await;
        let record = match completed {
            Ok(record) => record,
            // A force-cancel won the race; the terminal guard rejected our
            // write, which is the invariant working as intended.
            Err(SessionError::Terminal { .. }) => {
                let _ = session_db.destroy().await;
                self.mirror.end_session(&session_id);
                return Err(RunnerError::Cancelled { session_id });
            }
            Err(err) => return Err(err.into()),
        };
        let _ = self.sessions.record_snapshot(&record).await;

        self.log(
            LogRow::new(&session_id, NodeType::CascadeComplete, "system")
                .with_parent(root_trace.clone())
                .with_cascade(&spec.cascade_id)
                .with_content(outcome.final_output.clone()),
        )
        .await?;
        self.emit(
            EventKind::CascadeComplete,
            &session_id,
            Some(root_trace.clone()),
            None,
            serde_json::json!({"cascade_id": spec.cascade_id}),
        );

        session_db.destroy().await?;
        self.mirror.end_session(&session_id);
        Ok(outcome)
    }

    async fn drive_cells(
        &self,
        spec: &CascadeSpec,
        session_id: &str,
        root_trace: &str,
        input: &Value,
        opts: &RunOptions,
        session_db: &SessionDb,
    ) -> Result<CascadeOutcome, RunnerError> {
        let mut outputs = serde_json::Map::new();
        let mut state = Value::Object(serde_json::Map::new());
        let mut final_output = Value::Null;

        let mut idx = 0usize;
        let mut visits = 0usize;
        let max_visits = spec.cells.len().saturating_mul(MAX_CELL_VISITS_FACTOR).max(1);
        while idx < spec.cells.len() {
            visits += 1;
            if visits > max_visits {
                return Err(RunnerError::Cell {
                    cell: spec.cells[idx].name.clone(),
                    message: "route loop exceeded the visit budget".to_string(),
                });
            }
            self.check_cancelled(session_id).await?;

            let cell_spec = &spec.cells[idx];
            self.sessions
                .set_current_cell(session_id, &cell_spec.name)
                .await?;

            let run = cell::CellRun {
                runner: self,
                spec,
                cell: cell_spec,
                session_id,
                root_trace,
                caller_id: opts.caller_id.as_deref(),
                session_db,
            };
            let outputs_value = Value::Object(outputs.clone());
            let execution = run.execute(input, &state, &outputs_value);
            let value = match cell_spec.timeout_seconds {
                Some(secs) => tokio::time::timeout(Duration::from_secs(secs), execution)
                    .await
                    .map_err(|_| RunnerError::Cell {
                        cell: cell_spec.name.clone(),
                        message: format!("cell exceeded its {secs}s wall timeout"),
                    })??,
                None => execution.await?,
            };

            outputs.insert(cell_spec.name.clone(), value.value.clone());
            if let Some(bind) = &cell_spec.state_bind {
                if let Value::Object(map) = &mut state {
                    map.insert(bind.clone(), value.value.clone());
                }
            }
            final_output = value.value;
            self.sessions.heartbeat(session_id).await?;

            match value.route_to {
                Some(target) => {
                    let next = spec.cell_index(&target).ok_or_else(|| {
                        RunnerError::RouteTarget {
                            cell: cell_spec.name.clone(),
                            target: target.clone(),
                        }
                    })?;
                    idx = next;
                }
                None => idx += 1,
            }
        }

        Ok(CascadeOutcome {
            session_id: session_id.to_string(),
            outputs: Value::Object(outputs),
            state,
            final_output,
        })
    }

    /// Settle the session after a failed or cancelled run. Terminal-status
    /// writes may be rejected if a force-cancel won the race; that is the
    /// intended outcome.
    async fn finalize_failure(
        &self,
        spec: &CascadeSpec,
        session_id: &str,
        root_trace: &str,
        err: &RunnerError,
    ) {
        let (status, kind) = match err {
            RunnerError::Cancelled { .. } => (SessionStatus::Cancelled, "cancelled"),
            _ => (SessionStatus::Error, "error"),
        };
        let _ = self
            .log(
                LogRow::new(session_id, NodeType::CascadeError, "system")
                    .with_parent(root_trace.to_string())
                    .with_cascade(&spec.cascade_id)
                    .with_text(err.to_string())
                    .with_metadata(serde_json::json!({"kind": kind})),
            )
            .await;
        self.emit(
            EventKind::CascadeError,
            session_id,
            Some(root_trace.to_string()),
            None,
            serde_json::json!({"error": err.to_string(), "kind": kind}),
        );
        let result = self
            .sessions
            .update_status(
                session_id,
                status,
                StatusExtras {
                    error_message: Some(err.to_string()),
                    ..Default::default()
                },
            )
            .await;
        if let Ok(record) = result {
            let _ = self.sessions.record_snapshot(&record).await;
        }
    }

    /// Cooperative cancellation check at a safe boundary.
    pub(crate) async fn check_cancelled(&self, session_id: &str) -> Result<(), RunnerError> {
        let record = self.sessions.get(session_id).await?;
        if record.cancel_requested || record.status == SessionStatus::Cancelled {
            return Err(RunnerError::Cancelled {
                session_id: session_id.to_string(),
            });
        }
        Ok(())
    }

    pub(crate) async fn log(&self, row: LogRow) -> Result<(), RunnerError> {
        self.writer.append(row).await?;
        Ok(())
    }

    pub(crate) fn emit(
        &self,
        kind: EventKind,
        session_id: &str,
        trace_id: Option<String>,
        parent_id: Option<String>,
        payload: Value,
    ) {
        let _ = self.emitter.emit(Event::lifecycle(
            kind,
            session_id,
            trace_id,
            parent_id,
            payload,
        ));
    }

    /// Queue an assistant row's request id for deferred cost resolution.
    pub(crate) fn enqueue_cost(&self, session_id: &str, trace_id: &str, request_id: &str) {
        self.reconciler.enqueue(CostJob {
            session_id: session_id.to_string(),
            trace_id: trace_id.to_string(),
            provider_request_id: request_id.to_string(),
        });
    }

    /// An agent for internal calls (evaluators, validators, summarizers,
    /// auto-fix) on the cheap model.
    pub(crate) fn utility_agent(&self, system_prompt: &str) -> Agent {
        Agent::new(
            self.provider.clone(),
            self.config.eval_model.clone(),
            system_prompt,
        )
    }

    /// An agent for a cell's main calls.
    pub(crate) fn cell_agent(&self, model: Option<&str>, system_prompt: &str) -> Agent {
        Agent::new(
            self.provider.clone(),
            model.unwrap_or(&self.config.default_model).to_string(),
            system_prompt,
        )
        .with_embeddings(
            self.config.embed_model.clone(),
            self.config.deterministic_embeddings,
        )
    }

    /// Generate embeddings through the provider (or the deterministic
    /// offline backend) and append an `embedding` row to the log.
    pub async fn embed_texts(
        &self,
        session_id: &str,
        texts: &[String],
        model: Option<&str>,
    ) -> Result<crate::agent::EmbedResult, RunnerError> {
        let agent = self.cell_agent(None, "");
        let result = agent.embed(texts, model).await?;

        let mut row = LogRow::new(session_id, NodeType::Embedding, "assistant").with_text(format!(
            "Embedded {} texts ({} dimensions)",
            texts.len(),
            result.dim
        ));
        row.model = Some(result.model.clone());
        row.provider = Some(result.provider.clone());
        row.provider_request_id = result.request_id.clone();
        row.tokens_in = Some(result.tokens);
        row.metadata = Some(serde_json::json!({
            "text_count": texts.len(),
            "dimension": result.dim,
        }));
        let trace = row.trace_id.clone();
        self.log(row).await?;
        if let Some(request_id) = &result.request_id {
            self.enqueue_cost(session_id, &trace, request_id);
        }
        Ok(result)
    }

    /// Load a named memory slot for a cascade; `Null` when absent.
    pub(crate) async fn load_memory(
        &self,
        cascade_id: &str,
        slot: &str,
    ) -> Result<Value, RunnerError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM cascade_memory WHERE cascade_id = ? AND slot = ?")
                .bind(cascade_id)
                .bind(slot)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| EchoError::Backend {
                    message: e.to_string(),
                })?;
        Ok(row
            .map(|(raw,)| serde_json::from_str(&raw))
            .transpose()
            .map_err(EchoError::from)?
            .unwrap_or(Value::Null))
    }

    pub(crate) async fn store_memory(
        &self,
        cascade_id: &str,
        slot: &str,
        value: &Value,
    ) -> Result<(), RunnerError> {
        sqlx::query(
            "INSERT INTO cascade_memory (cascade_id, slot, value, updated_at)
             VALUES (?,?,?,?)
             ON CONFLICT (cascade_id, slot) DO UPDATE SET
                value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(cascade_id)
        .bind(slot)
        .bind(serde_json::to_string(value).map_err(EchoError::from)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| EchoError::Backend {
            message: e.to_string(),
        })?;
        Ok(())
    }
}
