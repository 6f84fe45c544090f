//! Token budget enforcement for cascade contexts.
//!
//! Prevents context explosion: given a budget and a candidate message list,
//! either returns the list unchanged (within budget) or prunes it under the
//! configured strategy.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::{Agent, ChatMessage};

/// Approximate cost of one medium image part.
const IMAGE_TOKENS: usize = 765;
/// Per-message framing overhead.
const MESSAGE_OVERHEAD: usize = 4;
/// Messages kept verbatim by the summarize strategy.
const SUMMARIZE_KEEP_RECENT: usize = 10;
/// Below this many old messages, summarize falls back to sliding window.
const SUMMARIZE_MIN_OLD: usize = 5;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStrategy {
    SlidingWindow,
    PruneOldest,
    Summarize,
    Fail,
}

impl Default for BudgetStrategy {
    fn default() -> Self {
        BudgetStrategy::SlidingWindow
    }
}

/// Budget configuration for one cell's context.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TokenBudget {
    pub max_total: usize,
    #[serde(default = "default_reserve")]
    pub reserve_for_output: usize,
    #[serde(default)]
    pub strategy: BudgetStrategy,
    #[serde(default = "default_warning")]
    pub warning_threshold: f64,
}

fn default_reserve() -> usize {
    4_000
}

fn default_warning() -> f64 {
    0.8
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self {
            max_total: 60_000,
            reserve_for_output: default_reserve(),
            strategy: BudgetStrategy::default(),
            warning_threshold: default_warning(),
        }
    }
}

impl TokenBudget {
    #[must_use]
    pub fn available(&self) -> usize {
        self.max_total.saturating_sub(self.reserve_for_output)
    }
}

/// Result of a budget check.
#[derive(Clone, Debug, PartialEq)]
pub struct BudgetStatus {
    pub current: usize,
    pub limit: usize,
    pub percentage: f64,
    pub over_budget: bool,
    pub warning: bool,
}

#[derive(Debug, Error, Diagnostic)]
pub enum BudgetError {
    #[error("token budget exceeded: {current}/{limit} tokens")]
    #[diagnostic(
        code(windlass::budget::exceeded),
        help("Raise max_total, lower reserve_for_output, or pick a pruning strategy.")
    )]
    Exceeded { current: usize, limit: usize },
}

/// Count tokens across a message list.
///
/// Approximation: framing overhead per message, one token per four content
/// characters, a flat charge per image part, and the serialized length of
/// tool calls.
#[must_use]
pub fn count_tokens(messages: &[ChatMessage]) -> usize {
    messages.iter().map(count_message).sum()
}

fn count_message(message: &ChatMessage) -> usize {
    let mut total = MESSAGE_OVERHEAD;
    match &message.content {
        Some(Value::String(s)) => total += count_text(s),
        Some(Value::Array(parts)) => {
            for part in parts {
                match part.get("type").and_then(Value::as_str) {
                    Some("image_url") => total += IMAGE_TOKENS,
                    Some("text") => {
                        total += count_text(part.get("text").and_then(Value::as_str).unwrap_or(""))
                    }
                    _ => total += count_text(&part.to_string()),
                }
            }
        }
        Some(other) => total += count_text(&other.to_string()),
        None => {}
    }
    if let Some(calls) = &message.tool_calls {
        let rendered = serde_json::to_string(calls).unwrap_or_default();
        total += count_text(&rendered);
    }
    total
}

fn count_text(text: &str) -> usize {
    text.len() / 4
}

/// Check the list against the budget without modifying it.
#[must_use]
pub fn check_budget(budget: &TokenBudget, messages: &[ChatMessage]) -> BudgetStatus {
    let current = count_tokens(messages);
    let limit = budget.available();
    BudgetStatus {
        current,
        limit,
        percentage: if limit > 0 {
            current as f64 / limit as f64
        } else {
            1.0
        },
        over_budget: current > limit,
        warning: current as f64 > limit as f64 * budget.warning_threshold,
    }
}

/// Enforce the budget, pruning per the configured strategy.
///
/// `summarizer` powers the summarize strategy; when absent (or the
/// summarizer call fails) it falls back to the sliding window.
pub async fn enforce_budget(
    budget: &TokenBudget,
    messages: Vec<ChatMessage>,
    summarizer: Option<&Agent>,
) -> Result<Vec<ChatMessage>, BudgetError> {
    let status = check_budget(budget, &messages);
    if !status.over_budget {
        return Ok(messages);
    }
    if status.warning {
        tracing::warn!(
            current = status.current,
            limit = status.limit,
            strategy = ?budget.strategy,
            "token budget exceeded; pruning context"
        );
    }
    match budget.strategy {
        BudgetStrategy::SlidingWindow => Ok(sliding_window(budget, messages)),
        BudgetStrategy::PruneOldest => Ok(prune_oldest(budget, messages)),
        BudgetStrategy::Summarize => Ok(summarize(budget, messages, summarizer).await),
        BudgetStrategy::Fail => Err(BudgetError::Exceeded {
            current: status.current,
            limit: status.limit,
        }),
    }
}

/// Keep the first system message plus the most recent suffix that fits.
fn sliding_window(budget: &TokenBudget, messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    if messages.is_empty() {
        return messages;
    }
    let mut preserved: Vec<ChatMessage> = Vec::new();
    let mut start_idx = 0;
    if messages[0].has_role(ChatMessage::SYSTEM) {
        preserved.push(messages[0].clone());
        start_idx = 1;
    }
    let available = budget.available();
    let mut current = count_tokens(&preserved);

    let mut recent: Vec<ChatMessage> = Vec::new();
    for message in messages[start_idx..].iter().rev() {
        let message_tokens = count_message(message);
        if current + message_tokens <= available {
            recent.push(message.clone());
            current += message_tokens;
        } else {
            break;
        }
    }
    recent.reverse();
    preserved.extend(recent);
    preserved
}

/// Remove oldest non-critical messages until within budget.
///
/// Critical: the leading system message, the last three user/assistant
/// turns, any message whose content carries an error marker, and any
/// message carrying a `route_to` tool call.
fn prune_oldest(budget: &TokenBudget, messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    if messages.is_empty() {
        return messages;
    }
    let critical = find_critical(&messages);
    let available = budget.available();

    let mut kept: Vec<bool> = vec![true; messages.len()];
    let mut current = count_tokens(&messages);
    for (idx, message) in messages.iter().enumerate() {
        if current <= available {
            break;
        }
        if critical.contains(&idx) {
            continue;
        }
        kept[idx] = false;
        current -= count_message(message);
    }
    messages
        .into_iter()
        .zip(kept)
        .filter_map(|(m, keep)| keep.then_some(m))
        .collect()
}

fn find_critical(messages: &[ChatMessage]) -> Vec<usize> {
    let mut critical = Vec::new();
    if messages
        .first()
        .map(|m| m.has_role(ChatMessage::SYSTEM))
        .unwrap_or(false)
    {
        critical.push(0);
    }

    // Last three assistant turns and the user messages among them.
    let mut turns = 0;
    for idx in (0..messages.len()).rev() {
        let role = &messages[idx].role;
        if role == ChatMessage::USER || role == ChatMessage::ASSISTANT {
            critical.push(idx);
            if role == ChatMessage::ASSISTANT {
                turns += 1;
            }
            if turns >= 3 {
                break;
            }
        }
    }

    for (idx, message) in messages.iter().enumerate() {
        let content = message.content_text().to_lowercase();
        if content.contains("error") || content.contains("exception") {
            critical.push(idx);
        }
        if let Some(calls) = &message.tool_calls {
            if calls.iter().any(|c| c.function.name == "route_to") {
                critical.push(idx);
            }
        }
    }
    critical
}

/// Keep system plus the last ten messages; compress the rest into one
/// synthetic system message via the summarizer.
async fn summarize(
    budget: &TokenBudget,
    messages: Vec<ChatMessage>,
    summarizer: Option<&Agent>,
) -> Vec<ChatMessage> {
    if messages.is_empty() {
        return messages;
    }
    let split = messages.len().saturating_sub(SUMMARIZE_KEEP_RECENT).max(1);
    let (old, recent) = messages.split_at(split);
    if old.len() < SUMMARIZE_MIN_OLD {
        return sliding_window(budget, messages);
    }
    let Some(agent) = summarizer else {
        return sliding_window(budget, messages);
    };

    let prompt = build_summary_prompt(old);
    match agent.run(&[], Some(&prompt)).await {
        Ok(reply) => {
            let mut result: Vec<ChatMessage> = Vec::new();
            if messages[0].has_role(ChatMessage::SYSTEM) {
                result.push(messages[0].clone());
            }
            result.push(ChatMessage::system(format!(
                "CONTEXT SUMMARY (compressed from {} messages):\n{}",
                old.len(),
                reply.content
            )));
            result.extend_from_slice(recent);
            result
        }
        Err(err) => {
            tracing::warn!(error = %err, "summarization failed; falling back to sliding window");
            sliding_window(budget, messages)
        }
    }
}

fn build_summary_prompt(messages: &[ChatMessage]) -> String {
    let mut lines = Vec::with_capacity(messages.len());
    for message in messages {
        let mut content = message.content_text();
        if content.len() > 500 {
            let mut end = 500;
            while !content.is_char_boundary(end) {
                end -= 1;
            }
            content.truncate(end);
            content.push_str("...");
        }
        lines.push(format!("[{}]: {}", message.role, content));
    }
    format!(
        "Summarize this conversation history.\n\n\
         Focus on:\n\
         1. Key decisions made\n\
         2. Important findings from tools\n\
         3. Errors encountered\n\
         4. Current state/progress\n\n\
         Be extremely concise. Omit pleasantries and explanations.\n\n\
         Conversation:\n{}\n\nSummary:",
        lines.join("\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{FunctionCall, ToolCallPayload};

    fn msg(role: &str, content: &str) -> ChatMessage {
        ChatMessage::new(role, content)
    }

    fn tiny_budget(strategy: BudgetStrategy) -> TokenBudget {
        TokenBudget {
            max_total: 60,
            reserve_for_output: 10,
            strategy,
            warning_threshold: 0.8,
        }
    }

    #[test]
    fn within_budget_is_unchanged() {
        let budget = TokenBudget::default();
        let messages = vec![msg("system", "sys"), msg("user", "hello")];
        let status = check_budget(&budget, &messages);
        assert!(!status.over_budget);
    }

    #[tokio::test]
    async fn sliding_window_keeps_system_and_recent() {
        let budget = tiny_budget(BudgetStrategy::SlidingWindow);
        let mut messages = vec![msg("system", "system prompt")];
        for i in 0..20 {
            messages.push(msg("user", &format!("message number {i} with padding text")));
        }
        let pruned = enforce_budget(&budget, messages.clone(), None).await.unwrap();
        assert!(pruned.len() < messages.len());
        assert!(pruned[0].has_role("system"));
        // Most recent message always survives.
        assert_eq!(
            pruned.last().unwrap().content_text(),
            messages.last().unwrap().content_text()
        );
    }

    #[tokio::test]
    async fn prune_oldest_preserves_errors_and_routing() {
        let budget = tiny_budget(BudgetStrategy::PruneOldest);
        let mut messages = vec![msg("system", "sys")];
        messages.push(msg("user", "an old and very long padding message here"));
        messages.push(msg("assistant", "Error: something broke badly"));
        let mut route = msg("assistant", "routing now");
        route.tool_calls = Some(vec![ToolCallPayload {
            id: "c1".into(),
            kind: "function".into(),
            function: FunctionCall {
                name: "route_to".into(),
                arguments: "{\"cell\":\"next\"}".into(),
            },
        }]);
        messages.push(route);
        for i in 0..10 {
            messages.push(msg("user", &format!("filler message {i} padding padding")));
        }
        let pruned = enforce_budget(&budget, messages, None).await.unwrap();
        assert!(pruned
            .iter()
            .any(|m| m.content_text().contains("Error: something broke")));
        assert!(pruned.iter().any(|m| m
            .tool_calls
            .as_ref()
            .map(|c| c.iter().any(|t| t.function.name == "route_to"))
            .unwrap_or(false)));
    }

    #[tokio::test]
    async fn fail_strategy_raises() {
        let budget = tiny_budget(BudgetStrategy::Fail);
        let messages = vec![msg(
            "user",
            "a message easily long enough to overflow a fifty-token budget \
             because it keeps going and going and going and going",
        )];
        let err = enforce_budget(&budget, messages, None).await.unwrap_err();
        assert!(matches!(err, BudgetError::Exceeded { .. }));
    }

    #[tokio::test]
    async fn summarize_without_summarizer_falls_back() {
        let budget = tiny_budget(BudgetStrategy::Summarize);
        let mut messages = vec![msg("system", "sys")];
        for i in 0..30 {
            messages.push(msg("user", &format!("padding message number {i} right here")));
        }
        let pruned = enforce_budget(&budget, messages, None).await.unwrap();
        assert!(pruned[0].has_role("system"));
        assert!(count_tokens(&pruned) <= budget.available());
    }

    #[test]
    fn image_parts_are_expensive() {
        let text_only = msg("user", "hi");
        let with_image = ChatMessage {
            role: "user".into(),
            content: Some(serde_json::json!([
                {"type": "text", "text": "hi"},
                {"type": "image_url", "image_url": {"url": "data:..."}},
            ])),
            ..Default::default()
        };
        assert!(count_message(&with_image) > count_message(&text_only) + 700);
    }
}
