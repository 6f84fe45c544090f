//! Deferred cost reconciliation.
//!
//! Providers expose cost only some seconds after a chat completion; blocking
//! the cell would serialize every LLM call. Instead every assistant row with
//! a provider request id is queued here, and a bounded worker pool polls the
//! provider's generation endpoint until usage is reported or the wall budget
//! runs out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::events::{Event, EventEmitter, EventKind};

use super::row::CostUpdate;
use super::writer::{EchoError, LogWriter};

/// Backoff schedule between polls, in seconds.
const WAIT_SCHEDULE_SECS: [u64; 5] = [0, 1, 2, 3, 4];
/// Wall budget per request id.
const MAX_WAIT: Duration = Duration::from_secs(10);

/// One queued reconciliation unit.
#[derive(Clone, Debug)]
pub struct CostJob {
    pub session_id: String,
    pub trace_id: String,
    pub provider_request_id: String,
}

/// Provider-side usage lookup. `Ok(None)` means the data is not ready yet.
#[async_trait]
pub trait CostFetcher: Send + Sync {
    async fn fetch(&self, request_id: &str) -> Result<Option<CostUpdate>, EchoError>;
}

/// Polls `{base}/generation?id=<request_id>` on an OpenAI-compatible
/// provider.
pub struct HttpCostFetcher {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpCostFetcher {
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl CostFetcher for HttpCostFetcher {
    async fn fetch(&self, request_id: &str) -> Result<Option<CostUpdate>, EchoError> {
        let url = format!(
            "{}/generation?id={}",
            self.base_url.trim_end_matches('/'),
            request_id
        );
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| EchoError::Backend {
                message: format!("cost fetch: {e}"),
            })?;

        // 404 means the provider has not processed the generation yet.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(EchoError::Backend {
                message: format!("cost endpoint returned {}", response.status()),
            });
        }

        let body: Value = response.json().await.map_err(|e| EchoError::Backend {
            message: format!("cost body: {e}"),
        })?;
        let data = &body["data"];
        let cost = data["total_cost"]
            .as_f64()
            .filter(|c| *c > 0.0)
            .or_else(|| data["cost"].as_f64());
        let tokens_in = data["native_tokens_prompt"]
            .as_i64()
            .filter(|t| *t > 0)
            .or_else(|| data["tokens_prompt"].as_i64());
        let tokens_out = data["native_tokens_completion"]
            .as_i64()
            .filter(|t| *t > 0)
            .or_else(|| data["tokens_completion"].as_i64());
        let tokens_reasoning = data["native_tokens_reasoning"]
            .as_i64()
            .or_else(|| data["tokens_reasoning"].as_i64())
            .or_else(|| data["reasoning_tokens"].as_i64());
        let provider = data["provider"].as_str().map(str::to_string);

        let update = CostUpdate {
            cost,
            tokens_in,
            tokens_out,
            tokens_reasoning,
            provider,
        };
        if update.has_data() {
            Ok(Some(update))
        } else {
            Ok(None)
        }
    }
}

/// Bounded worker pool resolving deferred costs.
///
/// Decoupled from cell execution: enqueueing never blocks, and a failed
/// fetch simply leaves the row's cost null.
pub struct CostReconciler {
    tx: flume::Sender<CostJob>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl CostReconciler {
    /// Spawn `worker_count` workers feeding `writer` and announcing
    /// successful updates on `emitter`.
    #[must_use]
    pub fn spawn(
        worker_count: usize,
        fetcher: Arc<dyn CostFetcher>,
        writer: Arc<dyn LogWriter>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        let (tx, rx) = flume::unbounded::<CostJob>();
        let workers = (0..worker_count.max(1))
            .map(|_| {
                let rx = rx.clone();
                let fetcher = Arc::clone(&fetcher);
                let writer = Arc::clone(&writer);
                let emitter = Arc::clone(&emitter);
                tokio::spawn(async move {
                    while let Ok(job) = rx.recv_async().await {
                        reconcile_one(&job, fetcher.as_ref(), writer.as_ref(), emitter.as_ref())
                            .await;
                    }
                })
            })
            .collect();
        Self { tx, workers }
    }

    /// Queue a request id for reconciliation. Never blocks.
    pub fn enqueue(&self, job: CostJob) {
        if self.tx.send(job).is_err() {
            tracing::warn!("cost reconciler queue closed; dropping job");
        }
    }

    /// Close the queue and wait for in-flight jobs to settle.
    pub async fn shutdown(self) {
        drop(self.tx);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

async fn reconcile_one(
    job: &CostJob,
    fetcher: &dyn CostFetcher,
    writer: &dyn LogWriter,
    emitter: &dyn EventEmitter,
) {
    let started = tokio::time::Instant::now();
    for (attempt, wait) in WAIT_SCHEDULE_SECS.iter().enumerate() {
        if *wait > 0 {
            tokio::time::sleep(Duration::from_secs(*wait)).await;
        }
        if started.elapsed() > MAX_WAIT {
            break;
        }
        match fetcher.fetch(&job.provider_request_id).await {
            Ok(Some(update)) => {
                if let Err(err) = writer.update_cost(&job.provider_request_id, &update).await {
                    tracing::warn!(
                        request_id = %job.provider_request_id,
                        error = %err,
                        "cost update write failed"
                    );
                    return;
                }
                let _ = emitter.emit(Event::lifecycle(
                    EventKind::CostUpdate,
                    job.session_id.clone(),
                    Some(job.trace_id.clone()),
                    None,
                    serde_json::json!({
                        "provider_request_id": job.provider_request_id,
                        "cost": update.cost,
                        "tokens_in": update.tokens_in,
                        "tokens_out": update.tokens_out,
                        "tokens_reasoning": update.tokens_reasoning,
                    }),
                ));
                return;
            }
            Ok(None) => {
                tracing::debug!(
                    request_id = %job.provider_request_id,
                    attempt,
                    "cost data not ready"
                );
            }
            Err(err) => {
                // Hard endpoint errors are not retried; cost stays null.
                tracing::warn!(
                    request_id = %job.provider_request_id,
                    error = %err,
                    "cost fetch failed"
                );
                return;
            }
        }
    }
    tracing::warn!(
        request_id = %job.provider_request_id,
        "cost data unavailable after wall budget; leaving cost null"
    );
}
