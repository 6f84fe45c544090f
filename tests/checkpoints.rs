//! Blocking human-in-the-loop checkpoints.

mod common;

use common::*;
use serde_json::json;
use windlass::agent::ScriptedReply;
use windlass::echo::NodeType;
use windlass::runner::RunOptions;
use windlass::session::{
    BlockedKind, CheckpointResponse, CheckpointStatus, SessionStatus,
};

#[tokio::test]
async fn confirmation_blocks_then_resumes_with_response() {
    let h = harness(vec![ScriptedReply::text("Deploy?")]).await;
    let spec = spec(
        r#"
cascade_id: deploy
cells:
  - name: confirm
    instructions: "Ask whether to deploy."
    human_input:
      type: confirmation
      title: "Deploy?"
"#,
    );

    let runner = h.runner.clone();
    let handle = tokio::spawn({
        let spec = spec.clone();
        async move { runner.run(&spec, json!({}), RunOptions::default()).await }
    });

    let checkpoints = h.runner.checkpoints().clone();
    let pending = wait_for(|| {
        let checkpoints = checkpoints.clone();
        async move {
            checkpoints
                .list(None, false)
                .await
                .ok()
                .and_then(|list| list.into_iter().next())
        }
    })
    .await;
    assert_eq!(pending.status, CheckpointStatus::Pending);
    assert_eq!(pending.cell_output.as_deref(), Some("Deploy?"));

    // Session is blocked on the checkpoint.
    let record = h.runner.sessions().get(&pending.session_id).await.unwrap();
    assert_eq!(record.status, SessionStatus::Blocked);
    assert_eq!(record.blocked_type, Some(BlockedKind::Hitl));
    assert_eq!(record.blocked_on.as_deref(), Some(pending.id.as_str()));

    let response = json!({"confirmed": false, "comment": "no"});
    h.runner
        .checkpoints()
        .respond(
            &pending.id,
            CheckpointResponse {
                response: response.clone(),
                reasoning: Some("not today".to_string()),
                confidence: Some(0.9),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let outcome = handle.await.unwrap().unwrap();
    // The response object becomes the cell output.
    assert_eq!(outcome.final_output, response);

    let record = h.runner.sessions().get(&pending.session_id).await.unwrap();
    assert_eq!(record.status, SessionStatus::Completed);

    let stored = h.runner.checkpoints().get(&pending.id).await.unwrap();
    assert_eq!(stored.status, CheckpointStatus::Responded);
    assert_eq!(stored.reasoning.as_deref(), Some("not today"));
    assert_eq!(stored.confidence, Some(0.9));
}

#[tokio::test]
async fn timeout_continue_uses_the_default() {
    let h = harness(vec![ScriptedReply::text("waiting for a human")]).await;
    let spec = spec(
        r#"
cascade_id: impatient
cells:
  - name: ask
    instructions: "Ask something."
    human_input:
      type: confirmation
      timeout_seconds: 1
      on_timeout: continue
      default: {"confirmed": true}
"#,
    );
    let outcome = h
        .runner
        .run(&spec, json!({}), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.final_output, json!({"confirmed": true}));

    let rows = h
        .runner
        .store()
        .rows_for_session(&outcome.session_id)
        .await
        .unwrap();
    let checkpoint_row = rows
        .iter()
        .find(|r| r.node_type == NodeType::Checkpoint)
        .unwrap();
    let stored = h
        .runner
        .checkpoints()
        .get(&checkpoint_row.content_text())
        .await
        .unwrap();
    assert_eq!(stored.status, CheckpointStatus::TimedOut);
}

#[tokio::test]
async fn timeout_abort_cancels_the_session() {
    let h = harness(vec![ScriptedReply::text("still waiting")]).await;
    let spec = spec(
        r#"
cascade_id: strict
cells:
  - name: ask
    instructions: "Ask something."
    human_input:
      type: confirmation
      timeout_seconds: 1
      on_timeout: abort
"#,
    );
    let err = h
        .runner
        .run(&spec, json!({}), RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, windlass::runner::RunnerError::Cancelled { .. }));
}

#[tokio::test]
async fn responding_twice_is_rejected() {
    let h = harness(vec![ScriptedReply::text("Deploy?")]).await;
    let spec = spec(
        r#"
cascade_id: once
cells:
  - name: confirm
    instructions: "Ask."
    human_input: true
"#,
    );
    let runner = h.runner.clone();
    let handle = tokio::spawn({
        let spec = spec.clone();
        async move { runner.run(&spec, json!({}), RunOptions::default()).await }
    });

    let checkpoints = h.runner.checkpoints().clone();
    let pending = wait_for(|| {
        let checkpoints = checkpoints.clone();
        async move {
            checkpoints
                .list(None, false)
                .await
                .ok()
                .and_then(|list| list.into_iter().next())
        }
    })
    .await;

    h.runner
        .checkpoints()
        .respond(
            &pending.id,
            CheckpointResponse {
                response: json!({"ok": true}),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let err = h
        .runner
        .checkpoints()
        .respond(
            &pending.id,
            CheckpointResponse {
                response: json!({"ok": false}),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        windlass::session::CheckpointError::NotPending { .. }
    ));
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn audible_inserts_an_ad_hoc_checkpoint_between_turns() {
    // Two turns: the first emits a tool call so a second turn happens, and
    // the audible lands at the turn boundary.
    let h = harness(vec![
        ScriptedReply::text("checking the data").with_tool_call(
            "run_sql",
            json!({"query": "SELECT 1 AS one"}),
        ),
        ScriptedReply::text("all done"),
    ])
    .await;
    let spec = spec(
        r#"
cascade_id: audible_demo
cells:
  - name: work
    instructions: "Do the work."
    tools_allowed: [run_sql]
    max_turns: 3
"#,
    );

    let session_id = "audible-session".to_string();
    h.runner.audible().signal(&session_id);

    let runner = h.runner.clone();
    let opts = RunOptions {
        session_id: Some(session_id.clone()),
        ..Default::default()
    };
    let handle = tokio::spawn({
        let spec = spec.clone();
        async move { runner.run(&spec, json!({}), opts).await }
    });

    let checkpoints = h.runner.checkpoints().clone();
    let pending = wait_for(|| {
        let checkpoints = checkpoints.clone();
        async move {
            checkpoints
                .list(None, false)
                .await
                .ok()
                .and_then(|list| list.into_iter().next())
        }
    })
    .await;
    assert_eq!(pending.kind, windlass::session::CheckpointKind::Audible);

    h.runner
        .checkpoints()
        .respond(
            &pending.id,
            CheckpointResponse {
                response: json!({"note": "carry on"}),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let outcome = handle.await.unwrap().unwrap();
    assert_eq!(outcome.final_output, json!("all done"));

    let rows = h.runner.store().rows_for_session(&session_id).await.unwrap();
    assert!(rows.iter().any(|r| r.node_type == NodeType::Audible));
}
