//! End-to-end cascade runs against a scripted provider.

mod common;

use common::*;
use serde_json::json;
use windlass::agent::ScriptedReply;
use windlass::echo::NodeType;
use windlass::runner::{RunOptions, RunnerError};
use windlass::session::SessionStatus;

#[tokio::test]
async fn two_cell_cascade_threads_outputs_through_templates() {
    let h = harness(vec![
        ScriptedReply::text(r#"{"x": 1, "y": 2}"#).with_request_id("req-first"),
        ScriptedReply::text("computed from x=1").with_request_id("req-second"),
    ])
    .await;

    let spec = spec(
        r#"
cascade_id: two_cell
cells:
  - name: first
    instructions: "Produce a small JSON object."
    output_mode: json
  - name: second
    instructions: "Work with the value {{ outputs.first.x }}."
"#,
    );
    let outcome = h
        .runner
        .run(&spec, json!({}), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.outputs["first"], json!({"x": 1, "y": 2}));
    assert_eq!(outcome.outputs["second"], json!("computed from x=1"));
    assert_eq!(outcome.final_output, json!("computed from x=1"));

    let record = h.runner.sessions().get(&outcome.session_id).await.unwrap();
    assert_eq!(record.status, SessionStatus::Completed);

    // The second cell's system prompt carries the rendered x=1.
    let requests = h.provider.requests();
    assert_eq!(requests.len(), 2);
    let rendered = serde_json::to_string(&requests[1].messages).unwrap();
    assert!(rendered.contains("Work with the value 1."));
}

#[tokio::test]
async fn three_takes_produce_attempts_and_one_winner() {
    let h = harness(vec![
        ScriptedReply::text("candidate alpha").with_request_id("r0"),
        ScriptedReply::text("candidate beta").with_request_id("r1"),
        ScriptedReply::text("candidate gamma").with_request_id("r2"),
        // Evaluator verdict.
        ScriptedReply::text(r#"{"winner_index": 1, "quality_scores": [0.2, 0.9, 0.4], "reasoning": "clearest"}"#),
        // Second cell consumes the winner.
        ScriptedReply::text("done"),
    ])
    .await;

    let spec = spec(
        r#"
cascade_id: soundings
cells:
  - name: brainstorm
    instructions: "Propose an answer."
    takes: 3
  - name: summarize
    instructions: "Summarize the chosen answer."
"#,
    );
    let outcome = h
        .runner
        .run(&spec, json!({}), RunOptions::default())
        .await
        .unwrap();

    let rows = h
        .runner
        .store()
        .rows_for_session(&outcome.session_id)
        .await
        .unwrap();

    let attempts: Vec<_> = rows
        .iter()
        .filter(|r| r.node_type == NodeType::SoundingAttempt)
        .collect();
    assert_eq!(attempts.len(), 3);
    let winners: Vec<_> = attempts
        .iter()
        .filter(|r| r.is_winner == Some(true))
        .collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(
        attempts
            .iter()
            .filter(|r| r.is_winner == Some(false))
            .count(),
        2
    );

    let evaluators: Vec<_> = rows
        .iter()
        .filter(|r| r.node_type == NodeType::Evaluator)
        .collect();
    assert_eq!(evaluators.len(), 1);

    // All attempt rows precede the evaluator row.
    let eval_ts = evaluators[0].ts;
    assert!(attempts.iter().all(|a| a.ts <= eval_ts));

    // Every take row descends from a cell row declaring has_takes.
    let cell_row = rows
        .iter()
        .find(|r| {
            r.node_type == NodeType::Cell && r.phase_name.as_deref() == Some("brainstorm")
        })
        .unwrap();
    assert_eq!(cell_row.metadata.as_ref().unwrap()["has_takes"], json!(true));
    for row in rows.iter().filter(|r| r.take_index.is_some()) {
        assert_eq!(row.phase_name.as_deref(), Some("brainstorm"));
    }

    // The next cell saw only the winner's text.
    let winner_text = winners[0].content_text();
    assert_eq!(outcome.outputs["brainstorm"], json!(winner_text));
    let last_request = h.provider.requests().pop().unwrap();
    let rendered = serde_json::to_string(&last_request.messages).unwrap();
    assert!(rendered.contains(&winner_text));
}

#[tokio::test]
async fn retry_ward_fails_twice_then_passes() {
    let h = harness(vec![
        ScriptedReply::text("draft one"),
        ScriptedReply::text("draft two"),
        ScriptedReply::text("APPROVED: final draft"),
    ])
    .await;

    let spec = spec(
        r#"
cascade_id: warded
cells:
  - name: draft
    instructions: "Write a draft; prefix with APPROVED when confident."
    wards:
      post:
        - check: contains
          needle: "APPROVED"
          mode: retry
          max_retries: 2
"#,
    );
    let outcome = h
        .runner
        .run(&spec, json!({}), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.final_output, json!("APPROVED: final draft"));

    let rows = h
        .runner
        .store()
        .rows_for_session(&outcome.session_id)
        .await
        .unwrap();
    let sequence: Vec<NodeType> = rows
        .iter()
        .filter(|r| r.phase_name.as_deref() == Some("draft"))
        .filter(|r| {
            matches!(
                r.node_type,
                NodeType::TurnOutput
                    | NodeType::PostWard
                    | NodeType::ValidationRetry
                    | NodeType::CellComplete
            )
        })
        .map(|r| r.node_type)
        .collect();
    assert_eq!(
        sequence,
        vec![
            NodeType::TurnOutput,
            NodeType::PostWard,
            NodeType::ValidationRetry,
            NodeType::TurnOutput,
            NodeType::PostWard,
            NodeType::ValidationRetry,
            NodeType::TurnOutput,
            NodeType::PostWard,
            NodeType::CellComplete,
        ]
    );

    let ward_validity: Vec<bool> = rows
        .iter()
        .filter(|r| r.node_type == NodeType::PostWard)
        .map(|r| r.metadata.as_ref().unwrap()["valid"].as_bool().unwrap())
        .collect();
    assert_eq!(ward_validity, vec![false, false, true]);
}

#[tokio::test]
async fn reforge_refines_the_winner_across_rounds() {
    let h = harness(vec![
        ScriptedReply::text("take zero"),
        ScriptedReply::text("take one"),
        ScriptedReply::text(r#"{"winner_index": 0, "reasoning": "ok"}"#),
        ScriptedReply::text("polished A"),
        ScriptedReply::text("polished B"),
        ScriptedReply::text(r#"{"winner_index": 1, "reasoning": "B reads better"}"#),
    ])
    .await;

    let spec = spec(
        r#"
cascade_id: reforged
cells:
  - name: forge
    instructions: "Draft."
    takes: 2
    reforge_steps: 1
    reforge_attempts: 2
"#,
    );
    let outcome = h
        .runner
        .run(&spec, json!({}), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.final_output, json!("polished B"));

    let rows = h
        .runner
        .store()
        .rows_for_session(&outcome.session_id)
        .await
        .unwrap();
    let count = |node_type: NodeType| rows.iter().filter(|r| r.node_type == node_type).count();
    assert_eq!(count(NodeType::SoundingAttempt), 2);
    assert_eq!(count(NodeType::Evaluator), 2);
    assert_eq!(count(NodeType::ReforgeStep), 1);
    assert_eq!(count(NodeType::ReforgeAttempt), 2);
    assert_eq!(count(NodeType::ReforgeWinner), 1);

    // The take evaluator precedes every reforge row; reforge rows precede
    // cell_complete.
    let first_evaluator = rows
        .iter()
        .find(|r| r.node_type == NodeType::Evaluator)
        .unwrap();
    let complete = rows
        .iter()
        .find(|r| r.node_type == NodeType::CellComplete)
        .unwrap();
    for row in rows.iter().filter(|r| {
        matches!(
            r.node_type,
            NodeType::ReforgeStep | NodeType::ReforgeAttempt | NodeType::ReforgeWinner
        )
    }) {
        assert!(row.ts >= first_evaluator.ts);
        assert!(row.ts <= complete.ts);
        assert_eq!(row.reforge_step, Some(1));
    }

    let winner_row = rows
        .iter()
        .find(|r| r.node_type == NodeType::ReforgeWinner)
        .unwrap();
    assert_eq!(winner_row.content_text(), "polished B");
}

#[tokio::test]
async fn blocking_ward_fails_the_cascade() {
    let h = harness(vec![ScriptedReply::text("too short")]).await;
    let spec = spec(
        r#"
cascade_id: blocked
cells:
  - name: draft
    instructions: "Write something long."
    wards:
      post:
        - check: min_length
          min: 10000
          mode: blocking
"#,
    );
    let err = h
        .runner
        .run(&spec, json!({}), RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::Ward { .. }));
}

#[tokio::test]
async fn advisory_ward_failure_does_not_change_terminal_status() {
    let h = harness(vec![ScriptedReply::text("short")]).await;
    let spec = spec(
        r#"
cascade_id: advisory
cells:
  - name: draft
    instructions: "Write something."
    wards:
      post:
        - check: min_length
          min: 10000
          mode: advisory
"#,
    );
    let outcome = h
        .runner
        .run(&spec, json!({}), RunOptions::default())
        .await
        .unwrap();
    let record = h.runner.sessions().get(&outcome.session_id).await.unwrap();
    assert_eq!(record.status, SessionStatus::Completed);

    let rows = h
        .runner
        .store()
        .rows_for_session(&outcome.session_id)
        .await
        .unwrap();
    let ward_row = rows
        .iter()
        .find(|r| r.node_type == NodeType::PostWard)
        .unwrap();
    assert_eq!(ward_row.metadata.as_ref().unwrap()["valid"], json!(false));
}

#[tokio::test]
async fn route_to_jumps_over_spec_order() {
    let h = harness(vec![
        ScriptedReply::text("routing away").with_tool_call("route_to", json!({"cell": "final"})),
        ScriptedReply::text("landed"),
    ])
    .await;

    let spec = spec(
        r#"
cascade_id: routed
cells:
  - name: gate
    instructions: "Decide where to go."
    tools_allowed: [route_to]
  - name: skipped
    instructions: "Never runs."
  - name: final
    instructions: "The destination."
"#,
    );
    let outcome = h
        .runner
        .run(&spec, json!({}), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.outputs["final"], json!("landed"));
    assert!(outcome.outputs.get("skipped").is_none());

    let rows = h
        .runner
        .store()
        .rows_for_session(&outcome.session_id)
        .await
        .unwrap();
    assert!(rows.iter().all(|r| r.phase_name.as_deref() != Some("skipped")));

    let gate_complete = rows
        .iter()
        .find(|r| {
            r.node_type == NodeType::CellComplete && r.phase_name.as_deref() == Some("gate")
        })
        .unwrap();
    assert_eq!(
        gate_complete.metadata.as_ref().unwrap()["handoffs"],
        json!(["final"])
    );
}

#[tokio::test]
async fn timestamps_never_precede_parents() {
    let h = harness(vec![
        ScriptedReply::text(r#"{"x": 1}"#),
        ScriptedReply::text("fin"),
    ])
    .await;
    let spec = spec(
        r#"
cascade_id: lineage
cells:
  - name: a
    instructions: "First."
    output_mode: json
  - name: b
    instructions: "Second, after {{ outputs.a.x }}."
"#,
    );
    let outcome = h
        .runner
        .run(&spec, json!({}), RunOptions::default())
        .await
        .unwrap();
    let rows = h
        .runner
        .store()
        .rows_for_session(&outcome.session_id)
        .await
        .unwrap();

    for row in &rows {
        if let Some(parent_id) = &row.parent_id {
            let parent = rows.iter().find(|r| &r.trace_id == parent_id).unwrap();
            assert!(row.ts >= parent.ts, "row {} precedes parent", row.trace_id);
        }
    }
    // Trace ids are unique.
    let mut ids: Vec<_> = rows.iter().map(|r| r.trace_id.clone()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), rows.len());
}

#[tokio::test]
async fn data_cell_sql_reads_prior_materialized_table() {
    let h = harness(vec![ScriptedReply::text(
        r#"[{"id": 1, "score": 10}, {"id": 2, "score": 20}]"#,
    )])
    .await;
    let spec = spec(
        r#"
cascade_id: data_flow
cells:
  - name: fetch
    instructions: "Emit rows as JSON."
    output_mode: json
  - name: total
    tool: sql
    inputs:
      query: "SELECT SUM(score) AS total FROM _fetch"
"#,
    );
    let outcome = h
        .runner
        .run(&spec, json!({}), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.outputs["total"], json!([{"total": 30}]));
}

#[tokio::test]
async fn unresolved_template_fails_before_execution() {
    let h = harness(vec![]).await;
    let raw = r#"
cascade_id: invalid
cells:
  - name: only
    instructions: "Uses {{ outputs.ghost.x }}"
"#;
    let spec = windlass::cascade::spec::CascadeSpec::from_yaml_str(raw).unwrap();
    let err = h
        .runner
        .run(&spec, json!({}), RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::Config(_)));
    // Nothing ran against the provider.
    assert_eq!(h.provider.call_count(), 0);
}
