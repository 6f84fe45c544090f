//! Chat providers: the HTTP client and a scripted stand-in for tests.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;

use super::ToolCallPayload;

/// Wire-level chat completion request.
#[derive(Clone, Debug)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Value>,
    pub tools: Option<Vec<Value>>,
    pub tool_choice: Option<String>,
}

/// Wire-level completion reply.
#[derive(Clone, Debug)]
pub struct ProviderReply {
    pub id: Option<String>,
    pub model: String,
    pub content: String,
    pub tool_calls: Vec<ToolCallPayload>,
    pub finish_reason: Option<String>,
    /// Full response body for logging.
    pub raw: Value,
}

/// Wire-level embeddings reply.
#[derive(Clone, Debug)]
pub struct EmbedReply {
    pub embeddings: Vec<Vec<f32>>,
    pub dim: usize,
    pub request_id: Option<String>,
    pub tokens: i64,
    pub model: String,
}

#[derive(Debug, Error, Diagnostic)]
pub enum ProviderError {
    #[error("rate limited: {message}")]
    #[diagnostic(code(windlass::provider::rate_limit))]
    RateLimited { message: String },

    #[error("transport error: {message}")]
    #[diagnostic(code(windlass::provider::transport))]
    Transport { message: String },

    #[error("bad response: {message}")]
    #[diagnostic(code(windlass::provider::bad_response))]
    BadResponse { message: String },

    #[error("provider script exhausted")]
    #[diagnostic(
        code(windlass::provider::script_exhausted),
        help("The scripted provider ran out of queued replies.")
    )]
    ScriptExhausted,
}

/// Provider seam: one chat completion or embedding call at a time.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<ProviderReply, ProviderError>;
    async fn embed(&self, model: &str, texts: &[String]) -> Result<EmbedReply, ProviderError>;
}

/// OpenAI-compatible HTTP provider.
pub struct HttpProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpProvider {
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ChatProvider for HttpProvider {
    async fn complete(&self, request: &ChatRequest) -> Result<ProviderReply, ProviderError> {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": request.messages,
        });
        if let Some(tools) = &request.tools {
            body["tools"] = Value::Array(tools.clone());
            body["tool_choice"] = Value::String(
                request
                    .tool_choice
                    .clone()
                    .unwrap_or_else(|| "auto".to_string()),
            );
        }

        let response = self
            .client
            .post(self.url("chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .timeout(Duration::from_secs(180))
            .send()
            .await
            .map_err(|e| ProviderError::Transport {
                message: e.to_string(),
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::RateLimited { message });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::BadResponse {
                message: format!("HTTP {status}: {}", truncate(&message, 1000)),
            });
        }

        let raw: Value = response.json().await.map_err(|e| ProviderError::BadResponse {
            message: format!("response parse: {e}"),
        })?;
        let message = &raw["choices"][0]["message"];
        if message.is_null() {
            return Err(ProviderError::BadResponse {
                message: format!("no choices in response: {}", truncate(&raw.to_string(), 500)),
            });
        }
        let tool_calls = message["tool_calls"]
            .as_array()
            .map(|calls| {
                calls
                    .iter()
                    .filter_map(|c| serde_json::from_value(c.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();

        Ok(ProviderReply {
            id: raw["id"].as_str().map(str::to_string),
            model: raw["model"]
                .as_str()
                .unwrap_or(&request.model)
                .to_string(),
            content: message["content"].as_str().unwrap_or_default().to_string(),
            tool_calls,
            finish_reason: raw["choices"][0]["finish_reason"]
                .as_str()
                .map(str::to_string),
            raw,
        })
    }

    async fn embed(&self, model: &str, texts: &[String]) -> Result<EmbedReply, ProviderError> {
        let body = serde_json::json!({ "model": model, "input": texts });
        let response = self
            .client
            .post(self.url("embeddings"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .timeout(Duration::from_secs(60))
            .send()
            .await
            .map_err(|e| ProviderError::Transport {
                message: e.to_string(),
            })?;
        if !response.status().is_success() {
            let status = response.status();
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::BadResponse {
                message: format!("HTTP {status}: {}", truncate(&message, 500)),
            });
        }
        let raw: Value = response.json().await.map_err(|e| ProviderError::BadResponse {
            message: format!("embedding parse: {e}"),
        })?;
        let vectors: Vec<Vec<f32>> = raw["data"]
            .as_array()
            .map(|data| {
                data.iter()
                    .filter_map(|d| {
                        d["embedding"].as_array().map(|v| {
                            v.iter()
                                .filter_map(|x| x.as_f64().map(|f| f as f32))
                                .collect()
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        if vectors.is_empty() || vectors[0].is_empty() {
            return Err(ProviderError::BadResponse {
                message: "empty embedding response".to_string(),
            });
        }
        let dim = vectors[0].len();
        Ok(EmbedReply {
            dim,
            request_id: raw["id"].as_str().map(str::to_string),
            tokens: raw["usage"]["total_tokens"].as_i64().unwrap_or(0),
            model: raw["model"].as_str().unwrap_or(model).to_string(),
            embeddings: vectors,
        })
    }
}

/// One queued reply for the scripted provider.
#[derive(Clone, Debug, Default)]
pub struct ScriptedReply {
    pub content: String,
    pub tool_calls: Vec<ToolCallPayload>,
    pub request_id: Option<String>,
    /// When set, the call fails with this error instead of replying.
    pub fail: Option<String>,
    /// When set, the call fails once with a rate limit.
    pub rate_limit: bool,
}

impl ScriptedReply {
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_tool_call(mut self, name: &str, arguments: Value) -> Self {
        let index = self.tool_calls.len();
        self.tool_calls.push(ToolCallPayload {
            id: format!("call_{index}"),
            kind: "function".to_string(),
            function: super::FunctionCall {
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
        });
        self
    }
}

/// Deterministic provider for tests and offline runs: pops scripted replies
/// in order and records every request it receives.
#[derive(Default)]
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<ChatRequest>>,
    /// Fallback content when the script runs dry (None = error).
    fallback: Option<String>,
}

impl ScriptedProvider {
    #[must_use]
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
            fallback: None,
        }
    }

    /// Replies with `fallback` forever once the script is exhausted.
    #[must_use]
    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = Some(fallback.into());
        self
    }

    pub fn push(&self, reply: ScriptedReply) {
        self.replies.lock().push_back(reply);
    }

    /// Number of completion calls received.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Copies of the requests received, for assertions.
    #[must_use]
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn complete(&self, request: &ChatRequest) -> Result<ProviderReply, ProviderError> {
        self.requests.lock().push(request.clone());
        let reply = self.replies.lock().pop_front();
        let reply = match reply {
            Some(reply) => reply,
            None => match &self.fallback {
                Some(content) => ScriptedReply::text(content.clone()),
                None => return Err(ProviderError::ScriptExhausted),
            },
        };
        if reply.rate_limit {
            return Err(ProviderError::RateLimited {
                message: "scripted rate limit".to_string(),
            });
        }
        if let Some(message) = reply.fail {
            return Err(ProviderError::BadResponse { message });
        }
        let raw = serde_json::json!({
            "id": reply.request_id.clone(),
            "model": request.model.clone(),
            "choices": [{
                "message": {"role": "assistant", "content": reply.content.clone()},
                "finish_reason": "stop",
            }],
        });
        Ok(ProviderReply {
            id: reply.request_id,
            model: request.model.clone(),
            content: reply.content,
            tool_calls: reply.tool_calls,
            finish_reason: Some("stop".to_string()),
            raw,
        })
    }

    async fn embed(&self, model: &str, texts: &[String]) -> Result<EmbedReply, ProviderError> {
        // Scripted embeddings mirror the deterministic backend.
        let result = super::deterministic_embed(texts);
        Ok(EmbedReply {
            embeddings: result.embeddings,
            dim: result.dim,
            request_id: None,
            tokens: 0,
            model: model.to_string(),
        })
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}
