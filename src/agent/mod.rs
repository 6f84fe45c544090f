//! Provider-backed LLM agent.
//!
//! [`Agent`] wraps a [`ChatProvider`] behind a sanitized request contract:
//! only API-legal message fields are sent, prompt-based tool mode strips
//! native tool plumbing, and empty messages are dropped. One retry on rate
//! limit; any other failure carries the full request envelope so the runner
//! can log it.

pub mod budget;
pub mod provider;

use std::sync::Arc;
use std::time::Duration;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::WindlassConfig;

pub use budget::{BudgetError, BudgetStatus, BudgetStrategy, TokenBudget};
pub use provider::{
    ChatProvider, ChatRequest, EmbedReply, HttpProvider, ProviderError, ProviderReply,
    ScriptedProvider, ScriptedReply,
};

/// Dimension of deterministic offline embeddings.
const DETERMINISTIC_EMBED_DIM: usize = 256;

/// One chat message as sent to (or received from) a provider.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallPayload>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub const SYSTEM: &'static str = "system";
    pub const USER: &'static str = "user";
    pub const ASSISTANT: &'static str = "assistant";
    pub const TOOL: &'static str = "tool";

    #[must_use]
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(Value::String(content.into())),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Self::SYSTEM, content)
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Self::USER, content)
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Self::ASSISTANT, content)
    }

    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.role == role
    }

    /// Text view of the content; non-string content renders as compact JSON.
    #[must_use]
    pub fn content_text(&self) -> String {
        match &self.content {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        let no_content = match &self.content {
            None => true,
            Some(Value::String(s)) => s.trim().is_empty(),
            Some(Value::Null) => true,
            Some(_) => false,
        };
        no_content && self.tool_calls.as_ref().map_or(true, |t| t.is_empty())
    }
}

/// A tool call emitted by the model.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToolCallPayload {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionCall,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

impl ToolCallPayload {
    /// Parse the arguments JSON; malformed arguments yield an empty object.
    #[must_use]
    pub fn parsed_arguments(&self) -> Value {
        serde_json::from_str(&self.function.arguments).unwrap_or(Value::Object(Default::default()))
    }
}

/// The agent's view of one completed turn.
#[derive(Clone, Debug)]
pub struct AgentReply {
    pub role: String,
    pub content: String,
    pub tool_calls: Vec<ToolCallPayload>,
    pub provider_request_id: Option<String>,
    pub model: String,
    pub provider: String,
    pub full_request: Value,
    pub full_response: Value,
    pub duration_ms: i64,
}

/// Embedding result.
#[derive(Clone, Debug)]
pub struct EmbedResult {
    pub embeddings: Vec<Vec<f32>>,
    pub dim: usize,
    pub request_id: Option<String>,
    pub tokens: i64,
    pub model: String,
    pub provider: String,
}

#[derive(Debug, Error, Diagnostic)]
pub enum AgentError {
    /// Provider failure after retries; carries the request envelope that
    /// triggered it so the failure can be logged with full context.
    #[error("provider call failed: {message}")]
    #[diagnostic(code(windlass::agent::provider))]
    Provider {
        message: String,
        full_request: Box<Value>,
    },

    #[error("embedding call failed: {message}")]
    #[diagnostic(code(windlass::agent::embed))]
    Embed { message: String },
}

/// Provider wrapper executing one turn at a time.
pub struct Agent {
    provider: Arc<dyn ChatProvider>,
    model: String,
    system_prompt: String,
    tools: Vec<Value>,
    native_tools: bool,
    embed_model: String,
    deterministic_embeddings: bool,
}

impl Agent {
    #[must_use]
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            system_prompt: system_prompt.into(),
            tools: Vec::new(),
            native_tools: false,
            embed_model: String::new(),
            deterministic_embeddings: false,
        }
    }

    #[must_use]
    pub fn with_tools(mut self, tools: Vec<Value>, native: bool) -> Self {
        self.tools = tools;
        self.native_tools = native;
        self
    }

    #[must_use]
    pub fn with_embeddings(mut self, embed_model: impl Into<String>, deterministic: bool) -> Self {
        self.embed_model = embed_model.into();
        self.deterministic_embeddings = deterministic;
        self
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Execute one turn: system prompt + context + optional user input.
    pub async fn run(
        &self,
        context_messages: &[ChatMessage],
        input_message: Option<&str>,
    ) -> Result<AgentReply, AgentError> {
        let mut messages: Vec<ChatMessage> = Vec::new();
        if !self.system_prompt.trim().is_empty() {
            messages.push(ChatMessage::system(self.system_prompt.clone()));
        }
        messages.extend_from_slice(context_messages);
        if let Some(input) = input_message {
            messages.push(ChatMessage::user(input));
        }
        let sanitized = self.sanitize(messages);

        let wire_messages: Vec<Value> = sanitized
            .iter()
            .map(|m| serde_json::to_value(m).unwrap_or(Value::Null))
            .collect();
        let request = ChatRequest {
            model: self.model.clone(),
            messages: wire_messages.clone(),
            tools: (!self.tools.is_empty()).then(|| self.tools.clone()),
            tool_choice: (!self.tools.is_empty()).then(|| "auto".to_string()),
        };
        let full_request = serde_json::json!({
            "model": self.model,
            "messages": wire_messages,
            "tools": request.tools,
            "tool_choice": request.tool_choice,
        });

        let started = tokio::time::Instant::now();
        let mut attempt = 0;
        let reply = loop {
            match self.provider.complete(&request).await {
                Ok(reply) => break reply,
                Err(ProviderError::RateLimited { message }) if attempt == 0 => {
                    attempt += 1;
                    tracing::warn!(model = %self.model, %message, "rate limited; retrying once");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                Err(err) => {
                    return Err(AgentError::Provider {
                        message: err.to_string(),
                        full_request: Box::new(full_request),
                    });
                }
            }
        };

        let provider_name = WindlassConfig::provider_from_model(&self.model).to_string();
        Ok(AgentReply {
            role: ChatMessage::ASSISTANT.to_string(),
            content: reply.content,
            tool_calls: reply.tool_calls,
            provider_request_id: reply.id,
            model: reply.model,
            provider: provider_name,
            full_request,
            full_response: reply.raw,
            duration_ms: started.elapsed().as_millis() as i64,
        })
    }

    /// Keep only API-legal fields; in prompt-based tool mode additionally
    /// strip native tool plumbing and drop tool-result messages. Messages
    /// with no content and no tool calls are dropped entirely.
    #[must_use]
    pub fn sanitize(&self, messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
        messages
            .into_iter()
            .filter_map(|mut message| {
                if !self.native_tools {
                    if message.has_role(ChatMessage::TOOL) {
                        tracing::debug!("dropping tool-result message in prompt-based mode");
                        return None;
                    }
                    message.tool_calls = None;
                    message.tool_call_id = None;
                }
                if message.is_empty() {
                    return None;
                }
                Some(message)
            })
            .collect()
    }

    /// Generate embeddings; the deterministic backend never leaves the
    /// process.
    pub async fn embed(
        &self,
        texts: &[String],
        model: Option<&str>,
    ) -> Result<EmbedResult, AgentError> {
        if self.deterministic_embeddings {
            return Ok(deterministic_embed(texts));
        }
        let embed_model = model.unwrap_or(&self.embed_model).to_string();
        let reply = self
            .provider
            .embed(&embed_model, texts)
            .await
            .map_err(|e| AgentError::Embed {
                message: e.to_string(),
            })?;
        let provider = WindlassConfig::provider_from_model(&embed_model).to_string();
        Ok(EmbedResult {
            embeddings: reply.embeddings,
            dim: reply.dim,
            request_id: reply.request_id,
            tokens: reply.tokens,
            model: reply.model,
            provider,
        })
    }
}

/// Normalized hashed token-count vectors of fixed dimension; used for
/// offline tests where the vectors must be stable across runs.
#[must_use]
pub fn deterministic_embed(texts: &[String]) -> EmbedResult {
    let mut embeddings = Vec::with_capacity(texts.len());
    for text in texts {
        let mut vec = vec![0.0f32; DETERMINISTIC_EMBED_DIM];
        for token in text.split_whitespace() {
            let mut hasher = Sha256::new();
            hasher.update(token.as_bytes());
            let digest = hasher.finalize();
            let bucket = u64::from_be_bytes(digest[..8].try_into().unwrap_or([0; 8]))
                % DETERMINISTIC_EMBED_DIM as u64;
            vec[bucket as usize] += 1.0;
        }
        let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt().max(1.0);
        for v in &mut vec {
            *v /= norm;
        }
        embeddings.push(vec);
    }
    EmbedResult {
        embeddings,
        dim: DETERMINISTIC_EMBED_DIM,
        request_id: None,
        tokens: 0,
        model: "deterministic".to_string(),
        provider: "deterministic".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn prompt_agent() -> Agent {
        Agent::new(
            Arc::new(ScriptedProvider::default()),
            "openai/gpt-test",
            "You are terse.",
        )
    }

    #[test]
    fn sanitize_drops_tool_rows_in_prompt_mode() {
        let agent = prompt_agent();
        let messages = vec![
            ChatMessage::system("sys"),
            ChatMessage {
                role: "tool".into(),
                content: Some(json!("result")),
                tool_call_id: Some("tc1".into()),
                ..Default::default()
            },
            ChatMessage {
                role: "assistant".into(),
                content: Some(json!("thinking")),
                tool_calls: Some(vec![ToolCallPayload {
                    id: "tc1".into(),
                    kind: "function".into(),
                    function: FunctionCall {
                        name: "route_to".into(),
                        arguments: "{}".into(),
                    },
                }]),
                ..Default::default()
            },
        ];
        let clean = agent.sanitize(messages);
        assert_eq!(clean.len(), 2);
        assert!(clean.iter().all(|m| !m.has_role("tool")));
        assert!(clean[1].tool_calls.is_none());
    }

    #[test]
    fn sanitize_keeps_tool_plumbing_in_native_mode() {
        let agent = prompt_agent().with_tools(vec![json!({"name": "x"})], true);
        let messages = vec![ChatMessage {
            role: "assistant".into(),
            content: None,
            tool_calls: Some(vec![ToolCallPayload {
                id: "tc1".into(),
                kind: "function".into(),
                function: FunctionCall {
                    name: "x".into(),
                    arguments: "{}".into(),
                },
            }]),
            ..Default::default()
        }];
        let clean = agent.sanitize(messages);
        assert_eq!(clean.len(), 1);
        assert!(clean[0].tool_calls.is_some());
    }

    #[test]
    fn sanitize_drops_empty_messages() {
        let agent = prompt_agent();
        let clean = agent.sanitize(vec![
            ChatMessage::user(""),
            ChatMessage::user("  "),
            ChatMessage::user("real"),
        ]);
        assert_eq!(clean.len(), 1);
        assert_eq!(clean[0].content_text(), "real");
    }

    #[test]
    fn deterministic_embeddings_are_stable_and_normalized() {
        let a = deterministic_embed(&["hello world".to_string()]);
        let b = deterministic_embed(&["hello world".to_string()]);
        assert_eq!(a.embeddings, b.embeddings);
        assert_eq!(a.dim, 256);
        let norm: f32 = a.embeddings[0].iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }
}
