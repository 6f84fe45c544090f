//! The cell state machine.
//!
//! Per cell: render inputs, pre-wards, memory load, LLM turn loop or
//! deterministic body, post-wards, memory store, `cell_complete`. LLM cells
//! may fan out into soundings (takes) with an evaluator pick and reforge
//! refinement rounds; any cell may end in a blocking human checkpoint.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;

use crate::agent::{budget, ChatMessage, ToolCallPayload};
use crate::bridge::safety;
use crate::cascade::registry::ToolKind;
use crate::cascade::spec::{
    CascadeSpec, CellSpec, HumanInputSpec, OutputMode, TimeoutAction, WardMode, WardSpec,
};
use crate::cascade::template::{render, TemplateContext};
use crate::echo::hash::content_hash;
use crate::echo::{LogRow, NodeType};
use crate::events::EventKind;
use crate::session::{
    BlockedKind, CheckpointKind, CheckpointResolution, CheckpointResponse, NewCheckpoint,
    SessionDb,
};

use super::data_cells::{self, CellResult, DataLanguage};
use super::tools::{route_to_schema, truncate_result};
use super::wards::{evaluate_ward, WardVerdict};
use super::{CascadeRunner, RunnerError};

/// Row cap for `sql_statement` results.
const SQL_STATEMENT_MAX_ROWS: usize = 10_000;

/// A cell's final value plus an optional routing jump.
#[derive(Clone, Debug)]
pub struct CellValue {
    pub value: Value,
    pub route_to: Option<String>,
}

/// One completed take attempt, buffered until the evaluator has picked.
struct TakeAttempt {
    index: i64,
    text: Option<String>,
    error: Option<String>,
    duration_ms: i64,
}

pub(crate) struct CellRun<'a> {
    pub runner: &'a CascadeRunner,
    pub spec: &'a CascadeSpec,
    pub cell: &'a CellSpec,
    pub session_id: &'a str,
    pub root_trace: &'a str,
    pub caller_id: Option<&'a str>,
    pub session_db: &'a SessionDb,
}

impl CellRun<'_> {
    pub async fn execute(
        &self,
        input: &Value,
        state: &Value,
        outputs: &Value,
    ) -> Result<CellValue, RunnerError> {
        let memory = match &self.cell.memory {
            Some(slot) => self.runner.load_memory(&self.spec.cascade_id, slot).await?,
            None => Value::Null,
        };
        let ctx = TemplateContext {
            input: input.clone(),
            state: state.clone(),
            outputs: outputs.clone(),
            memory,
        };

        let rendered_inputs = self.render_inputs(&ctx)?;
        let instructions = self
            .cell
            .instructions
            .as_ref()
            .map(|raw| render(raw, &ctx))
            .transpose()?;

        let cell_row = self
            .row(NodeType::Cell, "structure")
            .with_parent(self.root_trace.to_string())
            .with_content(Value::Object(rendered_inputs.clone()))
            .with_metadata(serde_json::json!({
                "has_takes": self.cell.effective_takes() > 1,
                "tools_allowed": self.cell.tools_allowed,
                "output_mode": self.cell.output_mode,
                "is_llm": self.cell.is_llm(),
            }));
        let cell_trace = cell_row.trace_id.clone();
        self.runner.log(cell_row).await?;
        self.runner.emit(
            EventKind::CellStart,
            self.session_id,
            Some(cell_trace.clone()),
            Some(self.root_trace.to_string()),
            serde_json::json!({"cell": self.cell.name}),
        );

        // Pre-wards validate the rendered input payload.
        let pre_candidate = instructions
            .clone()
            .unwrap_or_else(|| Value::Object(rendered_inputs.clone()).to_string());
        self.run_pre_wards(&pre_candidate, &cell_trace).await?;

        let mut value = if let Some(instructions) = &instructions {
            self.run_llm_body(instructions, &rendered_inputs, outputs, &cell_trace)
                .await?
        } else {
            self.run_data_body(&rendered_inputs, outputs, &cell_trace)
                .await?
        };

        // Blocking human review of the draft output (sounding_eval is
        // handled inside the take flow instead).
        if let Some(config) = self.cell.human_input_config() {
            if config.kind != CheckpointKind::SoundingEval {
                let response = self
                    .human_checkpoint(&config, &value.value, &cell_trace)
                    .await?;
                value.value = response;
            }
        }

        // LLM cells with tabular JSON output also materialize, so downstream
        // SQL can read `_<cell>` regardless of what produced it.
        if self.cell.is_llm() && self.cell.should_materialize() {
            if let Value::Array(items) = &value.value {
                if !items.is_empty() && items.iter().all(Value::is_object) {
                    let frame = crate::frame::Frame::from_records(items);
                    self.session_db.materialize(&self.cell.name, &frame).await?;
                }
            }
        }

        if let Some(slot) = &self.cell.memory {
            self.runner
                .store_memory(&self.spec.cascade_id, slot, &value.value)
                .await?;
        }

        let mut complete = self
            .row(NodeType::CellComplete, "structure")
            .with_parent(cell_trace.clone())
            .with_content(value.value.clone());
        if let Some(target) = &value.route_to {
            complete = complete.with_metadata(serde_json::json!({"handoffs": [target]}));
        }
        self.runner.log(complete).await?;
        self.runner.emit(
            EventKind::CellComplete,
            self.session_id,
            Some(cell_trace),
            Some(self.root_trace.to_string()),
            serde_json::json!({"cell": self.cell.name, "route_to": value.route_to}),
        );
        Ok(value)
    }

    // ------------------------------------------------------------------
    // LLM path
    // ------------------------------------------------------------------

    async fn run_llm_body(
        &self,
        instructions: &str,
        rendered_inputs: &serde_json::Map<String, Value>,
        outputs: &Value,
        cell_trace: &str,
    ) -> Result<CellValue, RunnerError> {
        let input_payload = input_payload(rendered_inputs);
        let (context, context_hashes) = self.cross_cell_context(outputs);

        let takes = self.cell.effective_takes();
        if takes == 1 {
            return self
                .llm_validated(
                    instructions,
                    input_payload.as_deref(),
                    &context,
                    &context_hashes,
                    rendered_inputs,
                    cell_trace,
                )
                .await;
        }

        let attempts = self
            .run_takes(
                takes,
                instructions,
                input_payload.as_deref(),
                &context,
                &context_hashes,
                cell_trace,
            )
            .await?;
        let candidates: Vec<(i64, String)> = attempts
            .iter()
            .filter_map(|a| a.text.clone().map(|t| (a.index, t)))
            .collect();
        if candidates.is_empty() {
            return Err(RunnerError::Cell {
                cell: self.cell.name.clone(),
                message: "every sounding attempt failed".to_string(),
            });
        }

        let texts: Vec<String> = candidates.iter().map(|(_, t)| t.clone()).collect();
        let meta: Vec<Value> = attempts
            .iter()
            .filter(|a| a.text.is_some())
            .map(|a| serde_json::json!({"take_index": a.index, "duration_ms": a.duration_ms}))
            .collect();
        let (winner_pos, verdict) = self
            .evaluate_candidates(&texts, &meta, None, cell_trace)
            .await?;
        let winner_index = candidates[winner_pos].0;

        // Attempts buffer until the winner is known, then all attempt rows
        // precede the evaluator row.
        for attempt in &attempts {
            let mut row = self
                .row(NodeType::SoundingAttempt, "assistant")
                .with_parent(cell_trace.to_string())
                .with_take(attempt.index);
            row.duration_ms = Some(attempt.duration_ms);
            row.is_winner = Some(attempt.index == winner_index);
            row = match (&attempt.text, &attempt.error) {
                (Some(text), _) => row.with_text(text.clone()),
                (None, Some(error)) => {
                    row.node_type = NodeType::SoundingError;
                    row.is_winner = Some(false);
                    row.with_text(error.clone())
                }
                (None, None) => row,
            };
            self.runner.log(row).await?;
            self.runner.emit(
                EventKind::SoundingAttempt,
                self.session_id,
                None,
                Some(cell_trace.to_string()),
                serde_json::json!({"cell": self.cell.name, "take_index": attempt.index}),
            );
        }
        self.runner
            .log(
                self.row(NodeType::Evaluator, "assistant")
                    .with_parent(cell_trace.to_string())
                    .with_content(verdict.clone())
                    .with_metadata(serde_json::json!({"candidates": texts.len()})),
            )
            .await?;
        self.runner.emit(
            EventKind::Evaluator,
            self.session_id,
            None,
            Some(cell_trace.to_string()),
            serde_json::json!({"cell": self.cell.name, "winner_index": winner_index}),
        );

        let mut winner_text = candidates[winner_pos].1.clone();
        let reforge_rounds = self.cell.reforge_steps.unwrap_or(0);
        if reforge_rounds > 0 {
            winner_text = self
                .run_reforge(&winner_text, reforge_rounds, cell_trace)
                .await?;
        }

        let value = self
            .finish_output(&winner_text, rendered_inputs, cell_trace)
            .await?;
        Ok(CellValue {
            value,
            route_to: None,
        })
    }

    /// Turn loop plus output validation and post-wards, with bounded
    /// retry-mode re-runs feeding validation messages back into the cell
    /// history.
    async fn llm_validated(
        &self,
        instructions: &str,
        input_payload: Option<&str>,
        context: &[ChatMessage],
        context_hashes: &[String],
        rendered_inputs: &serde_json::Map<String, Value>,
        cell_trace: &str,
    ) -> Result<CellValue, RunnerError> {
        let take_index: Option<i64> = None;
        let mut history: Vec<ChatMessage> = Vec::new();
        let max_retries = self
            .cell
            .wards
            .post
            .iter()
            .filter(|w| w.mode == WardMode::Retry)
            .map(|w| w.max_retries)
            .max()
            .unwrap_or(0);
        let mut retries_used = 0u32;
        let mut turn_counter = 0i64;

        loop {
            let output = self
                .llm_turn_loop(
                    instructions,
                    input_payload,
                    &mut history,
                    context,
                    context_hashes,
                    take_index,
                    cell_trace,
                    &mut turn_counter,
                )
                .await?;
            if let Some(target) = output.route_to {
                return Ok(CellValue {
                    value: Value::String(output.text),
                    route_to: Some(target),
                });
            }

            // Output-mode validation first; its failures ride the same
            // retry budget as retry-mode wards.
            match self
                .validate_output_mode(&output.text, rendered_inputs)
                .await
            {
                Ok(value) => {
                    match self
                        .run_post_wards(&output.text, retries_used, cell_trace)
                        .await?
                    {
                        PostWardOutcome::Pass => {
                            return Ok(CellValue {
                                value,
                                route_to: None,
                            })
                        }
                        PostWardOutcome::Retry { reason } => {
                            retries_used += 1;
                            history.push(ChatMessage::user(format!(
                                "Validation failed: {reason}. Revise your answer."
                            )));
                        }
                    }
                }
                Err(reason) => {
                    if retries_used < max_retries {
                        retries_used += 1;
                        self.runner
                            .log(
                                self.row(NodeType::ValidationRetry, "system")
                                    .with_parent(cell_trace.to_string())
                                    .with_text(reason.clone()),
                            )
                            .await?;
                        history.push(ChatMessage::user(format!(
                            "Output validation failed: {reason}. Respond again in the required format."
                        )));
                    } else {
                        // No retry budget: keep the raw text rather than
                        // failing the cell.
                        return Ok(CellValue {
                            value: Value::String(output.text),
                            route_to: None,
                        });
                    }
                }
            }
        }
    }

    /// One or more turns until the model stops calling tools.
    #[allow(clippy::too_many_arguments)]
    async fn llm_turn_loop(
        &self,
        instructions: &str,
        input_payload: Option<&str>,
        history: &mut Vec<ChatMessage>,
        context: &[ChatMessage],
        context_hashes: &[String],
        take_index: Option<i64>,
        cell_trace: &str,
        turn_counter: &mut i64,
    ) -> Result<TurnOutput, RunnerError> {
        let max_turns = self.cell.effective_max_turns() as i64;
        let mut schemas = self.runner.registries().tool_schemas(&self.cell.tools_allowed);
        if self.cell.tools_allowed.iter().any(|t| t == "route_to") {
            let targets: Vec<String> = self.spec.cells.iter().map(|c| c.name.clone()).collect();
            schemas.push(route_to_schema(&targets));
        }

        let mut turns_this_call = 0i64;
        loop {
            if turns_this_call >= max_turns {
                return Err(RunnerError::ForcedTermination {
                    cell: self.cell.name.clone(),
                });
            }
            turns_this_call += 1;
            *turn_counter += 1;

            self.runner.check_cancelled(self.session_id).await?;
            self.poll_audible(cell_trace).await?;

            let mut messages: Vec<ChatMessage> = Vec::with_capacity(context.len() + history.len());
            messages.extend_from_slice(context);
            messages.extend_from_slice(history);

            let budget_config = self.cell.token_budget.clone().unwrap_or_default();
            let summarizer = self.runner.utility_agent("You are a concise summarizer.");
            let messages =
                budget::enforce_budget(&budget_config, messages, Some(&summarizer)).await?;

            let agent = self
                .runner
                .cell_agent(self.cell.model.as_deref(), instructions)
                .with_tools(schemas.clone(), self.cell.native_tools);

            self.runner.emit(
                EventKind::TurnStart,
                self.session_id,
                None,
                Some(cell_trace.to_string()),
                serde_json::json!({"cell": self.cell.name, "turn": *turn_counter}),
            );

            // The rendered input payload seeds the conversation once.
            let input = (history.is_empty() && turns_this_call == 1)
                .then_some(input_payload)
                .flatten();
            let reply = agent.run(&messages, input).await?;

            let mut row = self
                .row(NodeType::TurnOutput, "assistant")
                .with_parent(cell_trace.to_string())
                .with_text(reply.content.clone())
                .with_turn(*turn_counter)
                .with_context_hashes(context_hashes.to_vec());
            if let Some(take) = take_index {
                row = row.with_take(take);
            }
            row.model = Some(reply.model.clone());
            row.provider = Some(reply.provider.clone());
            row.provider_request_id = reply.provider_request_id.clone();
            row.duration_ms = Some(reply.duration_ms);
            row.full_request = Some(reply.full_request.clone());
            row.full_response = Some(reply.full_response.clone());
            if !reply.tool_calls.is_empty() {
                row.tool_calls = serde_json::to_value(&reply.tool_calls).ok();
            }
            let row_trace = row.trace_id.clone();
            self.runner.log(row).await?;
            if let Some(request_id) = &reply.provider_request_id {
                self.runner
                    .enqueue_cost(self.session_id, &row_trace, request_id);
            }

            if reply.tool_calls.is_empty() {
                history.push(ChatMessage::assistant(reply.content.clone()));
                return Ok(TurnOutput {
                    text: reply.content,
                    route_to: None,
                });
            }

            // Tool calls are consumed one at a time; they share the cell
            // history.
            let mut assistant = ChatMessage::assistant(reply.content.clone());
            assistant.tool_calls = Some(reply.tool_calls.clone());
            history.push(assistant);

            for call in &reply.tool_calls {
                if call.function.name == "route_to" {
                    let target = call.parsed_arguments()["cell"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string();
                    self.log_tool_call(call, &row_trace).await?;
                    return Ok(TurnOutput {
                        text: reply.content,
                        route_to: Some(target),
                    });
                }
                let observation = self.dispatch_tool(call, &row_trace).await?;
                if self.cell.native_tools {
                    history.push(ChatMessage {
                        role: ChatMessage::TOOL.to_string(),
                        content: Some(Value::String(observation.clone())),
                        tool_call_id: Some(call.id.clone()),
                        name: Some(call.function.name.clone()),
                        ..Default::default()
                    });
                } else {
                    history.push(ChatMessage::user(format!(
                        "Observation from {}: {observation}",
                        call.function.name
                    )));
                }
                self.runner.sessions().heartbeat(self.session_id).await?;
            }
        }
    }

    async fn log_tool_call(
        &self,
        call: &ToolCallPayload,
        parent: &str,
    ) -> Result<String, RunnerError> {
        let row = self
            .row(NodeType::ToolCall, "tool")
            .with_parent(parent.to_string())
            .with_content(call.parsed_arguments())
            .with_metadata(serde_json::json!({"tool": call.function.name, "call_id": call.id}));
        let trace = row.trace_id.clone();
        self.runner.log(row).await?;
        self.runner.emit(
            EventKind::ToolCall,
            self.session_id,
            Some(trace.clone()),
            Some(parent.to_string()),
            serde_json::json!({"tool": call.function.name}),
        );
        Ok(trace)
    }

    /// Dispatch one tool call and return the truncated observation text.
    async fn dispatch_tool(
        &self,
        call: &ToolCallPayload,
        parent: &str,
    ) -> Result<String, RunnerError> {
        let call_trace = self.log_tool_call(call, parent).await?;
        let args = call.parsed_arguments();
        let name = call.function.name.as_str();

        let result: Result<Value, String> = match self.runner.registries().tool(name) {
            Some(ToolKind::Deterministic(tool)) => tool
                .call(args.clone(), self.session_db)
                .await
                .map_err(|e| e.to_string()),
            Some(ToolKind::Llm(cell_spec)) => {
                let prompt = cell_spec.instructions.clone().unwrap_or_default();
                let agent = self.runner.cell_agent(cell_spec.model.as_deref(), &prompt);
                let input = args["input"].as_str().map(str::to_string).unwrap_or_else(|| args.to_string());
                agent
                    .run(&[], Some(&input))
                    .await
                    .map(|reply| Value::String(reply.content))
                    .map_err(|e| e.to_string())
            }
            Some(ToolKind::Cascade(cascade_id)) => {
                let cascade_id = cascade_id.clone();
                let sub_args = if args["args"].is_object() {
                    args["args"].clone()
                } else {
                    args.clone()
                };
                self.runner
                    .log(
                        self.row(NodeType::SubCascade, "structure")
                            .with_parent(call_trace.clone())
                            .with_content(sub_args.clone())
                            .with_metadata(serde_json::json!({"cascade_id": cascade_id})),
                    )
                    .await?;
                let opts = super::RunOptions {
                    parent_session_id: Some(self.session_id.to_string()),
                    caller_id: self.caller_id.map(str::to_string),
                    ..Default::default()
                };
                let child = Box::pin(self.runner.run_by_id(&cascade_id, sub_args, opts)).await;
                child
                    .map(|outcome| outcome.final_output)
                    .map_err(|e| e.to_string())
            }
            None => Err(format!("unknown tool: {name}")),
        };

        let (observation, ok) = match result {
            Ok(value) => (truncate_result(&value_text(&value)), true),
            Err(error) => (format!("Tool {name} failed: {error}"), false),
        };

        self.runner
            .log(
                self.row(NodeType::ToolResult, "tool")
                    .with_parent(call_trace.clone())
                    .with_text(observation.clone())
                    .with_metadata(serde_json::json!({"tool": name, "ok": ok})),
            )
            .await?;
        self.runner.emit(
            EventKind::ToolResult,
            self.session_id,
            None,
            Some(call_trace),
            serde_json::json!({"tool": name, "ok": ok}),
        );
        Ok(observation)
    }

    // ------------------------------------------------------------------
    // Takes, evaluation, reforge
    // ------------------------------------------------------------------

    /// Run N independent take attempts, bounded by `max_parallel_takes`.
    /// Attempt rows are buffered by the caller; failures become
    /// `sounding_error` rows without aborting the cell.
    async fn run_takes(
        &self,
        takes: u32,
        instructions: &str,
        input_payload: Option<&str>,
        context: &[ChatMessage],
        context_hashes: &[String],
        cell_trace: &str,
    ) -> Result<Vec<TakeAttempt>, RunnerError> {
        let limit = self
            .cell
            .max_parallel_takes
            .unwrap_or(takes)
            .clamp(1, takes) as usize;
        let semaphore = Arc::new(Semaphore::new(limit));

        let futures = (0..takes as i64).map(|index| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await.ok();
                let started = tokio::time::Instant::now();
                let mut history: Vec<ChatMessage> = Vec::new();
                let mut turn_counter = 0i64;
                let result = self
                    .llm_turn_loop(
                        instructions,
                        input_payload,
                        &mut history,
                        context,
                        context_hashes,
                        Some(index),
                        cell_trace,
                        &mut turn_counter,
                    )
                    .await;
                let duration_ms = started.elapsed().as_millis() as i64;
                match result {
                    Ok(output) => TakeAttempt {
                        index,
                        text: Some(output.text),
                        error: None,
                        duration_ms,
                    },
                    Err(err) => TakeAttempt {
                        index,
                        text: None,
                        error: Some(err.to_string()),
                        duration_ms,
                    },
                }
            }
        });
        let attempts = futures_util::future::join_all(futures).await;
        self.runner.check_cancelled(self.session_id).await?;
        Ok(attempts)
    }

    /// Pick a winner among candidate texts: a `sounding_eval` checkpoint
    /// when the cell asks for human evaluation, otherwise an LLM evaluator.
    /// Returns `(position, verdict_json)`.
    async fn evaluate_candidates(
        &self,
        candidates: &[String],
        meta: &[Value],
        reforge_step: Option<i64>,
        cell_trace: &str,
    ) -> Result<(usize, Value), RunnerError> {
        if reforge_step.is_none() {
            if let Some(config) = self.cell.human_input_config() {
                if config.kind == CheckpointKind::SoundingEval {
                    return self
                        .human_sounding_eval(&config, candidates, cell_trace)
                        .await;
                }
            }
        }

        let mut prompt = String::from(
            "You are evaluating candidate outputs for the same task. \
             Pick the best one.\n\n",
        );
        for (i, candidate) in candidates.iter().enumerate() {
            prompt.push_str(&format!("--- Candidate {i} ---\n{candidate}\n"));
            if let Some(m) = meta.get(i) {
                prompt.push_str(&format!("(metadata: {m})\n"));
            }
            prompt.push('\n');
        }
        prompt.push_str(
            "Respond with JSON only: {\"winner_index\": <int>, \
             \"quality_scores\": [<float per candidate>], \"reasoning\": \"...\"}",
        );

        let agent = self.runner.utility_agent("You are a strict output evaluator.");
        let reply = agent.run(&[], Some(&prompt)).await?;
        let cleaned = safety::strip_code_fences(&reply.content);
        let (winner, verdict) = match serde_json::from_str::<Value>(&cleaned) {
            Ok(parsed) => {
                let winner = parsed["winner_index"]
                    .as_i64()
                    .filter(|w| (0..candidates.len() as i64).contains(w))
                    .unwrap_or(0) as usize;
                (winner, parsed)
            }
            Err(_) => (
                0,
                serde_json::json!({
                    "winner_index": 0,
                    "reasoning": "evaluator output unparseable; defaulted to first candidate",
                    "fallback": true,
                    "raw": reply.content,
                }),
            ),
        };
        Ok((winner, verdict))
    }

    async fn human_sounding_eval(
        &self,
        config: &HumanInputSpec,
        candidates: &[String],
        cell_trace: &str,
    ) -> Result<(usize, Value), RunnerError> {
        let (id, rx) = self
            .runner
            .checkpoints()
            .create(NewCheckpoint {
                session_id: self.session_id.to_string(),
                cascade_id: self.spec.cascade_id.clone(),
                cell_name: self.cell.name.clone(),
                kind: CheckpointKind::SoundingEval,
                ui_spec: Some(serde_json::json!({
                    "title": config.title,
                    "hint": config.hint,
                })),
                cell_output: None,
                candidate_outputs: Some(candidates.to_vec()),
                timeout_at: None,
            })
            .await?;
        let resolution = self.block_on_checkpoint(&id, rx, None, cell_trace).await?;
        match resolution {
            CheckpointResolution::Responded(response) => {
                let winner = response
                    .winner_index
                    .filter(|w| (0..candidates.len() as i64).contains(w))
                    .unwrap_or(0) as usize;
                Ok((
                    winner,
                    serde_json::json!({
                        "winner_index": winner,
                        "human": true,
                        "reasoning": response.reasoning,
                        "rankings": response.rankings,
                    }),
                ))
            }
            CheckpointResolution::Cancelled { .. } => Err(RunnerError::Cancelled {
                session_id: self.session_id.to_string(),
            }),
        }
    }

    /// R refinement rounds; each generates candidates from the prior winner
    /// and picks again.
    async fn run_reforge(
        &self,
        winner: &str,
        rounds: u32,
        cell_trace: &str,
    ) -> Result<String, RunnerError> {
        let attempts = self.cell.reforge_attempts.unwrap_or(2).max(1);
        let mut current = winner.to_string();

        for round in 1..=rounds as i64 {
            self.runner.check_cancelled(self.session_id).await?;
            let mut step_row = self
                .row(NodeType::ReforgeStep, "system")
                .with_parent(cell_trace.to_string())
                .with_metadata(serde_json::json!({"round": round}))
                .with_text(format!("reforge round {round}"));
            step_row.reforge_step = Some(round);
            self.runner.log(step_row).await?;
            self.runner.emit(
                EventKind::ReforgeStep,
                self.session_id,
                None,
                Some(cell_trace.to_string()),
                serde_json::json!({"cell": self.cell.name, "round": round}),
            );

            let prompt = format!(
                "Improve the following output. Keep what works, fix what does not, \
                 and return only the improved output.\n\n---\n{current}\n---"
            );
            let mut candidates: Vec<String> = Vec::with_capacity(attempts as usize);
            for candidate_index in 0..attempts as i64 {
                let agent = self
                    .runner
                    .cell_agent(self.cell.model.as_deref(), "You refine drafts.");
                let reply = agent.run(&[], Some(&prompt)).await?;
                let mut row = self
                    .row(NodeType::ReforgeAttempt, "assistant")
                    .with_parent(cell_trace.to_string())
                    .with_text(reply.content.clone());
                row.reforge_step = Some(round);
                row.candidate_index = Some(candidate_index);
                row.model = Some(reply.model.clone());
                row.provider_request_id = reply.provider_request_id.clone();
                let trace = row.trace_id.clone();
                self.runner.log(row).await?;
                if let Some(request_id) = &reply.provider_request_id {
                    self.runner.enqueue_cost(self.session_id, &trace, request_id);
                }
                candidates.push(reply.content);
            }

            let (winner_pos, verdict) = self
                .evaluate_candidates(&candidates, &[], Some(round), cell_trace)
                .await?;
            let mut eval_row = self
                .row(NodeType::Evaluator, "assistant")
                .with_parent(cell_trace.to_string())
                .with_content(verdict);
            eval_row.reforge_step = Some(round);
            self.runner.log(eval_row).await?;

            current = candidates[winner_pos].clone();
            let mut winner_row = self
                .row(NodeType::ReforgeWinner, "assistant")
                .with_parent(cell_trace.to_string())
                .with_text(current.clone());
            winner_row.reforge_step = Some(round);
            winner_row.candidate_index = Some(winner_pos as i64);
            self.runner.log(winner_row).await?;
        }
        Ok(current)
    }

    /// Output-mode validation and post-wards for a winner produced outside
    /// the single-take validation loop.
    async fn finish_output(
        &self,
        text: &str,
        rendered_inputs: &serde_json::Map<String, Value>,
        cell_trace: &str,
    ) -> Result<Value, RunnerError> {
        let value = match self.validate_output_mode(text, rendered_inputs).await {
            Ok(value) => value,
            Err(reason) => {
                self.runner
                    .log(
                        self.row(NodeType::SchemaValidation, "system")
                            .with_parent(cell_trace.to_string())
                            .with_text(reason)
                            .with_metadata(serde_json::json!({"valid": false})),
                    )
                    .await?;
                Value::String(text.to_string())
            }
        };
        match self.run_post_wards(text, u32::MAX, cell_trace).await? {
            PostWardOutcome::Pass => Ok(value),
            // No turn loop to feed; bounded retries were exhausted upstream.
            PostWardOutcome::Retry { reason } => Err(RunnerError::Ward {
                cell: self.cell.name.clone(),
                ward: "post".to_string(),
                reason,
            }),
        }
    }

    // ------------------------------------------------------------------
    // Deterministic path
    // ------------------------------------------------------------------

    async fn run_data_body(
        &self,
        rendered_inputs: &serde_json::Map<String, Value>,
        outputs: &Value,
        cell_trace: &str,
    ) -> Result<CellValue, RunnerError> {
        let tool_name = self.cell.tool.as_deref().unwrap_or_default();

        // Registered deterministic/cascade tools run directly.
        let Some(language) = DataLanguage::from_tool(tool_name) else {
            let args = Value::Object(rendered_inputs.clone());
            let value = match self.runner.registries().tool(tool_name) {
                Some(ToolKind::Deterministic(tool)) => {
                    tool.call(args, self.session_db).await?
                }
                Some(ToolKind::Cascade(cascade_id)) => {
                    let opts = super::RunOptions {
                        parent_session_id: Some(self.session_id.to_string()),
                        caller_id: self.caller_id.map(str::to_string),
                        ..Default::default()
                    };
                    let cascade_id = cascade_id.clone();
                    Box::pin(self.runner.run_by_id(&cascade_id, args, opts))
                        .await?
                        .final_output
                }
                _ => {
                    return Err(RunnerError::Cell {
                        cell: self.cell.name.clone(),
                        message: format!("unknown cell tool: {tool_name}"),
                    })
                }
            };
            return self.settle_data_value(value, cell_trace).await;
        };

        let body = rendered_inputs
            .get("body")
            .or_else(|| rendered_inputs.get("query"))
            .and_then(Value::as_str)
            .ok_or_else(|| RunnerError::Cell {
                cell: self.cell.name.clone(),
                message: "data cell requires a `body` (or `query`) input".to_string(),
            })?
            .to_string();

        let data = outputs.clone();
        let input = rendered_inputs
            .get("input")
            .cloned()
            .unwrap_or(Value::Null);
        let state = Value::Null;

        let mut result = data_cells::execute_data_cell(
            language,
            &body,
            &data,
            &input,
            &state,
            self.session_db,
        )
        .await;

        // Auto-fix: deterministic cells only; each attempt asks the model
        // for a corrected body and re-executes.
        let initial_error = match &result {
            CellResult::Error { error, .. } => Some(error.clone()),
            CellResult::Success { .. } => None,
        };
        if let Some(initial_error) = initial_error {
            let auto_fix = self.cell.auto_fix.clone().unwrap_or_default();
            if auto_fix.enabled {
                let mut last_error = initial_error;
                let mut current_body = body.clone();
                let mut fixed = false;
                for attempt in 1..=auto_fix.max_attempts {
                    let agent = self.runner.cell_agent(
                        auto_fix.model.as_deref(),
                        "You fix broken code. Return only the corrected code.",
                    );
                    let prompt = data_cells::fix_prompt(language, &current_body, &last_error);
                    let reply = agent.run(&[], Some(&prompt)).await?;
                    current_body = safety::strip_code_fences(&reply.content);
                    let retry = data_cells::execute_data_cell(
                        language,
                        &current_body,
                        &data,
                        &input,
                        &state,
                        self.session_db,
                    )
                    .await;
                    match retry {
                        CellResult::Success { .. } => {
                            self.runner
                                .log(
                                    self.row(NodeType::AutoFixSuccess, "system")
                                        .with_parent(cell_trace.to_string())
                                        .with_text(current_body.clone())
                                        .with_metadata(serde_json::json!({"attempt": attempt})),
                                )
                                .await?;
                            result = retry;
                            fixed = true;
                            break;
                        }
                        CellResult::Error { error, .. } => {
                            last_error = error;
                        }
                    }
                }
                if !fixed {
                    self.runner
                        .log(
                            self.row(NodeType::AutoFixFailed, "system")
                                .with_parent(cell_trace.to_string())
                                .with_text(last_error.clone())
                                .with_metadata(
                                    serde_json::json!({"attempts": auto_fix.max_attempts}),
                                )
                        )
                        .await?;
                }
            }
        }

        match result {
            CellResult::Success { value } => {
                if self.cell.should_materialize() {
                    if let Some(frame) = data_cells::result_frame(&CellResult::Success {
                        value: value.clone(),
                    }) {
                        self.session_db.materialize(&self.cell.name, &frame).await?;
                    }
                }
                self.settle_data_value(value, cell_trace).await
            }
            CellResult::Error { error, traceback } => Err(RunnerError::Cell {
                cell: self.cell.name.clone(),
                message: match traceback {
                    Some(tb) => format!("{error}\n{tb}"),
                    None => error,
                },
            }),
        }
    }

    /// Post-wards for a deterministic result (retry re-executes nothing; a
    /// deterministic body is stable, so retry failures block).
    async fn settle_data_value(
        &self,
        value: Value,
        cell_trace: &str,
    ) -> Result<CellValue, RunnerError> {
        let text = value_text(&value);
        match self.run_post_wards(&text, u32::MAX, cell_trace).await? {
            PostWardOutcome::Pass => Ok(CellValue {
                value,
                route_to: None,
            }),
            PostWardOutcome::Retry { reason } => Err(RunnerError::Ward {
                cell: self.cell.name.clone(),
                ward: "post".to_string(),
                reason,
            }),
        }
    }

    // ------------------------------------------------------------------
    // Wards
    // ------------------------------------------------------------------

    async fn run_pre_wards(&self, candidate: &str, cell_trace: &str) -> Result<(), RunnerError> {
        for ward in &self.cell.wards.pre {
            let verdict = self.eval_ward(ward, candidate).await;
            self.log_ward(NodeType::PreWard, ward, &verdict, cell_trace)
                .await?;
            if let WardVerdict::Fail { reason } = verdict {
                match ward.mode {
                    WardMode::Blocking | WardMode::Retry => {
                        return Err(RunnerError::Ward {
                            cell: self.cell.name.clone(),
                            ward: ward.label(),
                            reason,
                        });
                    }
                    WardMode::Advisory => {
                        tracing::warn!(
                            cell = %self.cell.name,
                            ward = %ward.label(),
                            %reason,
                            "advisory pre-ward failed"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Evaluate post-wards once. Returns `Retry` when a retry-mode ward
    /// failed and budget remains; logs a `validation_retry` row in that
    /// case. Blocking failures error; advisory failures log and pass.
    async fn run_post_wards(
        &self,
        candidate: &str,
        retries_used: u32,
        cell_trace: &str,
    ) -> Result<PostWardOutcome, RunnerError> {
        for ward in &self.cell.wards.post {
            let verdict = self.eval_ward(ward, candidate).await;
            self.log_ward(NodeType::PostWard, ward, &verdict, cell_trace)
                .await?;
            if let WardVerdict::Fail { reason } = verdict {
                match ward.mode {
                    WardMode::Blocking => {
                        return Err(RunnerError::Ward {
                            cell: self.cell.name.clone(),
                            ward: ward.label(),
                            reason,
                        });
                    }
                    WardMode::Retry => {
                        if retries_used < ward.max_retries {
                            self.runner
                                .log(
                                    self.row(NodeType::ValidationRetry, "system")
                                        .with_parent(cell_trace.to_string())
                                        .with_text(reason.clone())
                                        .with_metadata(
                                            serde_json::json!({"ward": ward.label()}),
                                        ),
                                )
                                .await?;
                            return Ok(PostWardOutcome::Retry { reason });
                        }
                        return Err(RunnerError::Ward {
                            cell: self.cell.name.clone(),
                            ward: ward.label(),
                            reason,
                        });
                    }
                    WardMode::Advisory => {}
                }
            }
        }
        Ok(PostWardOutcome::Pass)
    }

    async fn eval_ward(&self, ward: &WardSpec, candidate: &str) -> WardVerdict {
        let validator = self
            .runner
            .utility_agent("You validate outputs against a rule.");
        evaluate_ward(&ward.check, candidate, Some(&validator)).await
    }

    async fn log_ward(
        &self,
        node_type: NodeType,
        ward: &WardSpec,
        verdict: &WardVerdict,
        cell_trace: &str,
    ) -> Result<(), RunnerError> {
        self.runner
            .log(
                self.row(node_type, "structure")
                    .with_parent(cell_trace.to_string())
                    .with_text(verdict.reason().unwrap_or("ok").to_string())
                    .with_metadata(serde_json::json!({
                        "ward": ward.label(),
                        "mode": ward.mode,
                        "valid": verdict.is_pass(),
                    })),
            )
            .await
    }

    // ------------------------------------------------------------------
    // Checkpoints, audible
    // ------------------------------------------------------------------

    async fn human_checkpoint(
        &self,
        config: &HumanInputSpec,
        draft: &Value,
        cell_trace: &str,
    ) -> Result<Value, RunnerError> {
        let mut asks = 0;
        loop {
            asks += 1;
            let timeout_at = config
                .timeout_seconds
                .map(|t| chrono::Utc::now() + chrono::Duration::seconds(t as i64));
            let (id, rx) = self
                .runner
                .checkpoints()
                .create(NewCheckpoint {
                    session_id: self.session_id.to_string(),
                    cascade_id: self.spec.cascade_id.clone(),
                    cell_name: self.cell.name.clone(),
                    kind: config.kind,
                    ui_spec: Some(serde_json::json!({
                        "title": config.title,
                        "hint": config.hint,
                        "output": value_text(draft),
                    })),
                    cell_output: Some(value_text(draft)),
                    candidate_outputs: None,
                    timeout_at,
                })
                .await?;

            match self
                .wait_checkpoint(&id, rx, config.timeout_seconds, cell_trace)
                .await?
            {
                CheckpointWait::Responded(response) => {
                    return Ok(checkpoint_output(&response));
                }
                CheckpointWait::Cancelled => {
                    return Err(RunnerError::Cancelled {
                        session_id: self.session_id.to_string(),
                    });
                }
                CheckpointWait::TimedOut => match config.on_timeout {
                    TimeoutAction::Continue => {
                        return Ok(config.default.clone().unwrap_or_else(|| draft.clone()));
                    }
                    TimeoutAction::Abort => {
                        return Err(RunnerError::Cancelled {
                            session_id: self.session_id.to_string(),
                        });
                    }
                    TimeoutAction::Retry => {
                        if asks >= 3 {
                            return Err(RunnerError::CheckpointTimeout {
                                cell: self.cell.name.clone(),
                            });
                        }
                    }
                },
            }
        }
    }

    /// Block the session on a checkpoint: mark blocked, park on the waiter,
    /// resume on resolution.
    async fn block_on_checkpoint(
        &self,
        id: &str,
        rx: tokio::sync::oneshot::Receiver<CheckpointResolution>,
        timeout_seconds: Option<u64>,
        cell_trace: &str,
    ) -> Result<CheckpointResolution, RunnerError> {
        match self.wait_checkpoint(id, rx, timeout_seconds, cell_trace).await? {
            CheckpointWait::Responded(response) => Ok(CheckpointResolution::Responded(response)),
            CheckpointWait::Cancelled => Ok(CheckpointResolution::Cancelled { reason: None }),
            CheckpointWait::TimedOut => Err(RunnerError::CheckpointTimeout {
                cell: self.cell.name.clone(),
            }),
        }
    }

    async fn wait_checkpoint(
        &self,
        id: &str,
        rx: tokio::sync::oneshot::Receiver<CheckpointResolution>,
        timeout_seconds: Option<u64>,
        cell_trace: &str,
    ) -> Result<CheckpointWait, RunnerError> {
        self.runner
            .log(
                self.row(NodeType::Checkpoint, "structure")
                    .with_parent(cell_trace.to_string())
                    .with_text(id.to_string())
                    .with_metadata(serde_json::json!({"checkpoint_id": id})),
            )
            .await?;
        self.runner.emit(
            EventKind::CheckpointCreated,
            self.session_id,
            None,
            Some(cell_trace.to_string()),
            serde_json::json!({"checkpoint_id": id, "cell": self.cell.name}),
        );
        self.runner
            .sessions()
            .mark_blocked(self.session_id, BlockedKind::Hitl, id)
            .await?;

        let outcome = match timeout_seconds {
            Some(secs) => {
                match tokio::time::timeout(std::time::Duration::from_secs(secs), rx).await {
                    Ok(Ok(resolution)) => resolution_to_wait(resolution),
                    Ok(Err(_)) => CheckpointWait::Cancelled,
                    Err(_) => {
                        let _ = self.runner.checkpoints().mark_timed_out(id).await;
                        CheckpointWait::TimedOut
                    }
                }
            }
            None => match rx.await {
                Ok(resolution) => resolution_to_wait(resolution),
                Err(_) => CheckpointWait::Cancelled,
            },
        };

        // A cancel may have landed while blocked; surface it before
        // resuming.
        if matches!(outcome, CheckpointWait::Responded(_)) {
            self.runner.check_cancelled(self.session_id).await?;
            self.runner.sessions().resume_unblock(self.session_id).await?;
            self.runner.emit(
                EventKind::CheckpointResponded,
                self.session_id,
                None,
                Some(cell_trace.to_string()),
                serde_json::json!({"checkpoint_id": id}),
            );
        } else if matches!(outcome, CheckpointWait::TimedOut) {
            let _ = self.runner.sessions().resume_unblock(self.session_id).await;
        }
        Ok(outcome)
    }

    /// Between turns: when the UI has signaled an audible, insert an ad-hoc
    /// checkpoint at this safe boundary.
    async fn poll_audible(&self, cell_trace: &str) -> Result<(), RunnerError> {
        if !self.runner.audible().is_signaled(self.session_id) {
            return Ok(());
        }
        self.runner.audible().clear(self.session_id);
        self.runner
            .log(
                self.row(NodeType::Audible, "structure")
                    .with_parent(cell_trace.to_string())
                    .with_text("audible checkpoint requested".to_string()),
            )
            .await?;
        self.runner.emit(
            EventKind::AudibleSignal,
            self.session_id,
            None,
            Some(cell_trace.to_string()),
            serde_json::json!({"cell": self.cell.name}),
        );

        let (id, rx) = self
            .runner
            .checkpoints()
            .create(NewCheckpoint {
                session_id: self.session_id.to_string(),
                cascade_id: self.spec.cascade_id.clone(),
                cell_name: self.cell.name.clone(),
                kind: CheckpointKind::Audible,
                ui_spec: Some(serde_json::json!({"title": "Audible", "cell": self.cell.name})),
                cell_output: None,
                candidate_outputs: None,
                timeout_at: None,
            })
            .await?;
        match self.block_on_checkpoint(&id, rx, None, cell_trace).await? {
            CheckpointResolution::Responded(_) => Ok(()),
            CheckpointResolution::Cancelled { .. } => Err(RunnerError::Cancelled {
                session_id: self.session_id.to_string(),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Output modes, context, helpers
    // ------------------------------------------------------------------

    /// Apply the cell's output mode; `Err(reason)` means a validation
    /// failure that may be retried.
    async fn validate_output_mode(
        &self,
        text: &str,
        rendered_inputs: &serde_json::Map<String, Value>,
    ) -> Result<Value, String> {
        match self.cell.output_mode {
            None | Some(OutputMode::Text) => Ok(Value::String(text.to_string())),
            Some(OutputMode::Json) => {
                let cleaned = safety::strip_code_fences(text);
                serde_json::from_str::<Value>(&cleaned)
                    .map_err(|e| format!("expected JSON output: {e}"))
            }
            Some(OutputMode::SqlExecute) => {
                // The fragment's :name placeholders bind from the rendered
                // cell inputs with type-aware quoting.
                let fragment = safety::strip_code_fences(text);
                safety::validate_sql_safety(&fragment).map_err(|e| e.to_string())?;
                let types = rendered_inputs
                    .get("arg_types")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                let bound = safety::bind_sql_parameters(&fragment, rendered_inputs, &types);
                let sql = safety::wrap_select(&bound);
                let frame = self
                    .session_db
                    .query(&sql)
                    .await
                    .map_err(|e| format!("sql_execute failed: {e}"))?;
                let scalar = frame
                    .rows
                    .first()
                    .and_then(|r| r.first())
                    .cloned()
                    .unwrap_or(Value::Null);
                let return_type = self.cell.return_type.as_deref().unwrap_or("VARCHAR");
                Ok(safety::cast_scalar(&scalar, return_type))
            }
            Some(OutputMode::SqlStatement) => {
                let sql = safety::strip_code_fences(text);
                safety::validate_sql_safety(&sql).map_err(|e| e.to_string())?;
                safety::require_select(&sql).map_err(|e| e.to_string())?;
                let mut frame = self
                    .session_db
                    .query(&sql)
                    .await
                    .map_err(|e| format!("sql_statement failed: {e}"))?;
                frame.rows.truncate(SQL_STATEMENT_MAX_ROWS);
                Ok(Value::Array(frame.to_records()))
            }
        }
    }

    /// Context set from prior cells: the last output of each cell named in
    /// the `context` list (or all prior cells), with content hashes for
    /// attribution.
    fn cross_cell_context(&self, outputs: &Value) -> (Vec<ChatMessage>, Vec<String>) {
        let Some(map) = outputs.as_object() else {
            return (Vec::new(), Vec::new());
        };
        let names: Vec<String> = match &self.cell.context {
            Some(list) => list.clone(),
            None => self
                .spec
                .cells
                .iter()
                .map(|c| c.name.clone())
                .filter(|n| map.contains_key(n))
                .collect(),
        };
        let mut messages = Vec::new();
        let mut hashes = Vec::new();
        for name in names {
            if let Some(value) = map.get(&name) {
                hashes.push(content_hash(value));
                messages.push(ChatMessage::assistant(format!(
                    "[{name}] {}",
                    value_text(value)
                )));
            }
        }
        (messages, hashes)
    }

    fn render_inputs(
        &self,
        ctx: &TemplateContext,
    ) -> Result<serde_json::Map<String, Value>, RunnerError> {
        let mut rendered = serde_json::Map::new();
        for (key, value) in &self.cell.inputs {
            let rendered_value = match value {
                Value::String(template) => Value::String(render(template, ctx)?),
                other => other.clone(),
            };
            rendered.insert(key.clone(), rendered_value);
        }
        Ok(rendered)
    }

    fn row(&self, node_type: NodeType, role: &str) -> LogRow {
        let mut row = LogRow::new(self.session_id, node_type, role)
            .with_cascade(&self.spec.cascade_id)
            .with_phase(&self.cell.name);
        if let Some(caller) = self.caller_id {
            row = row.with_caller(caller.to_string());
        }
        row
    }
}

struct TurnOutput {
    text: String,
    route_to: Option<String>,
}

enum PostWardOutcome {
    Pass,
    Retry { reason: String },
}

enum CheckpointWait {
    Responded(CheckpointResponse),
    Cancelled,
    TimedOut,
}

fn resolution_to_wait(resolution: CheckpointResolution) -> CheckpointWait {
    match resolution {
        CheckpointResolution::Responded(response) => CheckpointWait::Responded(response),
        CheckpointResolution::Cancelled { .. } => CheckpointWait::Cancelled,
    }
}

/// The checkpoint response object becomes the cell output.
fn checkpoint_output(response: &CheckpointResponse) -> Value {
    response.response.clone()
}

/// Seed the conversation with the rendered inputs: an explicit `input` key
/// wins; otherwise the whole rendered map as JSON; nothing when empty.
fn input_payload(rendered: &serde_json::Map<String, Value>) -> Option<String> {
    if let Some(input) = rendered.get("input") {
        return Some(match input {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
    }
    if rendered.is_empty() {
        None
    } else {
        Some(Value::Object(rendered.clone()).to_string())
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
