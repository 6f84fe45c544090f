//! The single writer abstraction shared by the durable log and the mirror.

use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

use super::row::{CostUpdate, LogRow};

/// Errors from log writers.
#[derive(Debug, Error, Diagnostic)]
pub enum EchoError {
    #[error("log backend error: {message}")]
    #[diagnostic(
        code(windlass::echo::backend),
        help("Check the engine store file and its permissions.")
    )]
    Backend { message: String },

    #[error("log row not found: {what}")]
    #[diagnostic(code(windlass::echo::not_found))]
    NotFound { what: String },

    #[error(transparent)]
    #[diagnostic(code(windlass::echo::serde))]
    Serde(#[from] serde_json::Error),
}

impl From<sqlx::Error> for EchoError {
    fn from(err: sqlx::Error) -> Self {
        EchoError::Backend {
            message: err.to_string(),
        }
    }
}

/// How a cost update landed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CostApplied {
    /// An existing row was updated.
    Updated,
    /// No row carried the request id; a fresh `cost_update` row was inserted.
    Inserted,
    /// The row already carried identical or newer cost data.
    Ignored,
}

/// One append/update interface implemented by the durable store, the live
/// mirror, and the fan-out writer that feeds both.
#[async_trait]
pub trait LogWriter: Send + Sync {
    /// Total append to the append-only log.
    async fn append(&self, row: LogRow) -> Result<(), EchoError>;

    /// Resolve deferred cost for the unique row identified by
    /// `provider_request_id`. Idempotent; never regresses a non-null cost to
    /// null.
    async fn update_cost(
        &self,
        provider_request_id: &str,
        update: &CostUpdate,
    ) -> Result<CostApplied, EchoError>;
}

/// Sends every append and cost update to each inner writer.
///
/// Append failures on one writer do not stop delivery to the others; the
/// first error is reported after full fan-out.
pub struct FanOutWriter {
    writers: Vec<Arc<dyn LogWriter>>,
}

impl FanOutWriter {
    #[must_use]
    pub fn new(writers: Vec<Arc<dyn LogWriter>>) -> Self {
        Self { writers }
    }
}

#[async_trait]
impl LogWriter for FanOutWriter {
    async fn append(&self, row: LogRow) -> Result<(), EchoError> {
        let mut first_err = None;
        for writer in &self.writers {
            if let Err(err) = writer.append(row.clone()).await {
                tracing::warn!(error = %err, "log writer append failed");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn update_cost(
        &self,
        provider_request_id: &str,
        update: &CostUpdate,
    ) -> Result<CostApplied, EchoError> {
        let mut outcome = CostApplied::Ignored;
        let mut first_err = None;
        for writer in &self.writers {
            match writer.update_cost(provider_request_id, update).await {
                Ok(CostApplied::Updated) => outcome = CostApplied::Updated,
                Ok(CostApplied::Inserted) => {
                    if outcome == CostApplied::Ignored {
                        outcome = CostApplied::Inserted;
                    }
                }
                Ok(CostApplied::Ignored) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "log writer cost update failed");
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(outcome),
        }
    }
}
