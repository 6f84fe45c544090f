//! HTTP control surface consumed by UI collaborators.
//!
//! Sessions, checkpoints, audible signals, and a per-session SSE event
//! stream. Dashboard-style paginated queries live elsewhere; this surface
//! only drives and observes the core.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::cascade::spec::CascadeSpec;
use crate::runner::{CascadeRunner, RunOptions};
use crate::session::{
    CheckpointError, CheckpointResponse, SessionError, SessionFilter, SessionStatus,
};

struct AppError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        let status = match &err {
            SessionError::NotFound { .. } => StatusCode::NOT_FOUND,
            SessionError::Terminal { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            message: err.to_string(),
        }
    }
}

impl From<CheckpointError> for AppError {
    fn from(err: CheckpointError) -> Self {
        let status = match &err {
            CheckpointError::NotFound { .. } => StatusCode::NOT_FOUND,
            CheckpointError::NotPending { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            message: err.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        message: message.into(),
    }
}

/// Build the control router over a shared runner.
#[must_use]
pub fn router(runner: Arc<CascadeRunner>) -> Router {
    Router::new()
        .route("/session/start", post(start_session))
        .route("/session/:id", get(get_session))
        .route("/session/:id/cancel", post(cancel_session))
        .route("/sessions", get(list_sessions))
        .route("/checkpoints", get(list_checkpoints))
        .route("/checkpoint/:id/respond", post(respond_checkpoint))
        .route("/checkpoint/:id/cancel", post(cancel_checkpoint))
        .route("/audible/signal/:session_id", post(audible_signal))
        .route("/audible/clear/:session_id", post(audible_clear))
        .route("/events/:session_id", get(event_stream))
        .with_state(runner)
}

/// Serve the control surface until the process exits.
pub async fn serve(runner: Arc<CascadeRunner>, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "windlass control surface listening");
    axum::serve(listener, router(runner)).await
}

#[derive(Deserialize)]
struct StartRequest {
    #[serde(default)]
    cascade_id: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    inputs: Value,
}

async fn start_session(
    State(runner): State<Arc<CascadeRunner>>,
    Json(request): Json<StartRequest>,
) -> Result<Json<Value>, AppError> {
    let session_id = Uuid::new_v4().to_string();
    let opts = RunOptions {
        session_id: Some(session_id.clone()),
        ..Default::default()
    };

    let spec = match (&request.cascade_id, &request.path) {
        (Some(id), _) => runner
            .registries()
            .cascade(id)
            .cloned()
            .ok_or_else(|| bad_request(format!("unknown cascade: {id}")))?,
        (None, Some(path)) => {
            CascadeSpec::from_path(path).map_err(|e| bad_request(e.to_string()))?
        }
        (None, None) => return Err(bad_request("cascade_id or path is required")),
    };

    let inputs = request.inputs;
    tokio::spawn({
        let runner = runner.clone();
        async move {
            if let Err(err) = runner.run(&spec, inputs, opts).await {
                tracing::warn!(error = %err, "session ended with error");
            }
        }
    });

    Ok(Json(json!({"session_id": session_id})))
}

async fn get_session(
    State(runner): State<Arc<CascadeRunner>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let record = runner.sessions().get(&id).await?;
    Ok(Json(serde_json::to_value(record).unwrap_or(Value::Null)))
}

#[derive(Deserialize)]
struct CancelRequest {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    force: bool,
}

async fn cancel_session(
    State(runner): State<Arc<CascadeRunner>>,
    Path(id): Path<String>,
    Json(request): Json<CancelRequest>,
) -> Result<Json<Value>, AppError> {
    let record = if request.force {
        runner
            .sessions()
            .force_cancel(&id, request.reason.as_deref())
            .await?
    } else {
        runner
            .sessions()
            .request_cancellation(&id, request.reason.as_deref())
            .await?
    };
    Ok(Json(serde_json::to_value(record).unwrap_or(Value::Null)))
}

#[derive(Deserialize)]
struct SessionsQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    cascade_id: Option<String>,
    #[serde(default)]
    active_only: bool,
    #[serde(default)]
    limit: Option<i64>,
}

async fn list_sessions(
    State(runner): State<Arc<CascadeRunner>>,
    Query(query): Query<SessionsQuery>,
) -> Result<Json<Value>, AppError> {
    let filter = SessionFilter {
        status: query.status.as_deref().map(SessionStatus::decode),
        cascade_id: query.cascade_id,
        active_only: query.active_only,
        limit: query.limit,
    };
    let sessions = runner.sessions().list(&filter).await?;
    Ok(Json(serde_json::to_value(sessions).unwrap_or(Value::Null)))
}

#[derive(Deserialize)]
struct CheckpointsQuery {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    include_all: bool,
}

async fn list_checkpoints(
    State(runner): State<Arc<CascadeRunner>>,
    Query(query): Query<CheckpointsQuery>,
) -> Result<Json<Value>, AppError> {
    let checkpoints = runner
        .checkpoints()
        .list(query.session_id.as_deref(), query.include_all)
        .await?;
    Ok(Json(
        serde_json::to_value(checkpoints).unwrap_or(Value::Null),
    ))
}

#[derive(Deserialize)]
struct RespondRequest {
    response: Value,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    winner_index: Option<i64>,
    #[serde(default)]
    rankings: Option<Value>,
}

async fn respond_checkpoint(
    State(runner): State<Arc<CascadeRunner>>,
    Path(id): Path<String>,
    Json(request): Json<RespondRequest>,
) -> Result<Json<Value>, AppError> {
    let record = runner
        .checkpoints()
        .respond(
            &id,
            CheckpointResponse {
                response: request.response,
                reasoning: request.reasoning,
                confidence: request.confidence,
                winner_index: request.winner_index,
                rankings: request.rankings,
            },
        )
        .await?;
    Ok(Json(serde_json::to_value(record).unwrap_or(Value::Null)))
}

#[derive(Deserialize)]
struct CheckpointCancelRequest {
    #[serde(default)]
    reason: Option<String>,
}

async fn cancel_checkpoint(
    State(runner): State<Arc<CascadeRunner>>,
    Path(id): Path<String>,
    Json(request): Json<CheckpointCancelRequest>,
) -> Result<Json<Value>, AppError> {
    let record = runner.checkpoints().cancel(&id, request.reason).await?;
    Ok(Json(serde_json::to_value(record).unwrap_or(Value::Null)))
}

async fn audible_signal(
    State(runner): State<Arc<CascadeRunner>>,
    Path(session_id): Path<String>,
) -> Json<Value> {
    runner.audible().signal(&session_id);
    Json(json!({"ok": true}))
}

async fn audible_clear(
    State(runner): State<Arc<CascadeRunner>>,
    Path(session_id): Path<String>,
) -> Json<Value> {
    runner.audible().clear(&session_id);
    Json(json!({"ok": true}))
}

/// Stream one session's lifecycle events as SSE.
async fn event_stream(
    State(runner): State<Arc<CascadeRunner>>,
    Path(session_id): Path<String>,
) -> Sse<impl futures_util::Stream<Item = Result<SseEvent, Infallible>>> {
    let stream = runner.bus().subscribe().into_session_stream(session_id);
    let sse_stream = async_stream::stream! {
        let mut stream = stream;
        while let Some(event) = stream.next().await {
            let payload = event.to_json_value().to_string();
            yield Ok(SseEvent::default()
                .event(event.scope_label().to_string())
                .data(payload));
        }
    };
    Sse::new(sse_stream).keep_alive(KeepAlive::default())
}
