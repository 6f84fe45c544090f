//! Durable session state: terminal immutability, zombies, cancellation.

mod common;

use common::*;
use serde_json::json;
use windlass::agent::ScriptedReply;
use windlass::runner::{RunOptions, RunnerError};
use windlass::session::{
    CheckpointResponse, SessionError, SessionFilter, SessionStatus, StatusExtras,
};

#[tokio::test]
async fn lifecycle_and_listing() {
    let h = harness(vec![]).await;
    let sessions = h.runner.sessions();

    sessions
        .create("s1", "demo", json!({"a": 1}), Some(60), None)
        .await
        .unwrap();
    let record = sessions
        .update_status("s1", SessionStatus::Running, StatusExtras::default())
        .await
        .unwrap();
    assert_eq!(record.status, SessionStatus::Running);
    assert!(!record.cancel_requested);

    let active = sessions
        .list(&SessionFilter {
            active_only: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(active.len(), 1);

    sessions
        .update_status("s1", SessionStatus::Completed, StatusExtras::default())
        .await
        .unwrap();
    let active = sessions
        .list(&SessionFilter {
            active_only: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(active.is_empty());
}

#[tokio::test]
async fn terminal_status_is_immutable() {
    let h = harness(vec![]).await;
    let sessions = h.runner.sessions();
    sessions
        .create("s1", "demo", json!({}), Some(60), None)
        .await
        .unwrap();
    sessions
        .update_status("s1", SessionStatus::Completed, StatusExtras::default())
        .await
        .unwrap();

    let err = sessions
        .update_status("s1", SessionStatus::Running, StatusExtras::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Terminal { .. }));

    // Cancelling an already-terminal session is rejected without mutation.
    let err = sessions.request_cancellation("s1", Some("late")).await.unwrap_err();
    assert!(matches!(err, SessionError::Terminal { .. }));
    let record = sessions.get("s1").await.unwrap();
    assert_eq!(record.status, SessionStatus::Completed);
    assert_eq!(record.cancel_reason, None);
}

#[tokio::test]
async fn zombie_cleanup_orphans_stale_sessions() {
    let h = harness(vec![]).await;
    let sessions = h.runner.sessions();
    sessions
        .create("stale", "demo", json!({}), Some(60), None)
        .await
        .unwrap();
    sessions
        .update_status("stale", SessionStatus::Running, StatusExtras::default())
        .await
        .unwrap();

    // Age the heartbeat 120s under a 60s lease.
    let old = chrono::Utc::now() - chrono::Duration::seconds(120);
    sqlx::query("UPDATE sessions SET heartbeat_at = ? WHERE id = ?")
        .bind(old)
        .bind("stale")
        .execute(h.runner.store().pool())
        .await
        .unwrap();

    let orphaned = sessions.cleanup_zombies(30).await.unwrap();
    assert_eq!(orphaned, vec!["stale".to_string()]);

    let record = sessions.get("stale").await.unwrap();
    assert_eq!(record.status, SessionStatus::Orphaned);
    assert_eq!(record.cancel_reason, None);

    // Idempotent.
    assert!(sessions.cleanup_zombies(30).await.unwrap().is_empty());

    // A later write from the stale process is rejected.
    let err = sessions
        .update_status("stale", SessionStatus::Completed, StatusExtras::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Terminal { .. }));
}

#[tokio::test]
async fn fresh_heartbeats_are_not_zombies() {
    let h = harness(vec![]).await;
    let sessions = h.runner.sessions();
    sessions
        .create("alive", "demo", json!({}), Some(60), None)
        .await
        .unwrap();
    sessions
        .update_status("alive", SessionStatus::Running, StatusExtras::default())
        .await
        .unwrap();
    assert!(sessions.cleanup_zombies(0).await.unwrap().is_empty());
}

#[tokio::test]
async fn cooperative_cancellation_lands_while_blocked() {
    let h = harness(vec![ScriptedReply::text("Deploy?")]).await;
    let spec = spec(
        r#"
cascade_id: cancellable
cells:
  - name: confirm
    instructions: "Ask for confirmation."
    human_input:
      type: confirmation
"#,
    );

    let runner = h.runner.clone();
    let handle = tokio::spawn({
        let spec = spec.clone();
        async move { runner.run(&spec, json!({}), RunOptions::default()).await }
    });

    // Wait for the pending checkpoint, then cancel the session and the
    // checkpoint.
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

    let session_id = pending.session_id.clone();
    h.runner
        .sessions()
        .request_cancellation(&session_id, Some("operator"))
        .await
        .unwrap();
    h.runner
        .checkpoints()
        .cancel(&pending.id, Some("operator".to_string()))
        .await
        .unwrap();

    let result = handle.await.unwrap();
    assert!(matches!(result, Err(RunnerError::Cancelled { .. })));
    let record = h.runner.sessions().get(&session_id).await.unwrap();
    assert_eq!(record.status, SessionStatus::Cancelled);
}

#[tokio::test]
async fn force_cancel_wins_over_late_cooperative_writes() {
    let h = harness(vec![]).await;
    let sessions = h.runner.sessions();
    sessions
        .create("forced", "demo", json!({}), Some(60), None)
        .await
        .unwrap();
    sessions
        .update_status("forced", SessionStatus::Running, StatusExtras::default())
        .await
        .unwrap();

    let record = sessions.force_cancel("forced", Some("stuck")).await.unwrap();
    assert_eq!(record.status, SessionStatus::Cancelled);
    assert_eq!(record.cancel_reason.as_deref(), Some("stuck"));

    let err = sessions
        .update_status("forced", SessionStatus::Completed, StatusExtras::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Terminal { .. }));
}

#[tokio::test]
async fn sounding_eval_checkpoint_picks_winner() {
    let h = harness(vec![
        ScriptedReply::text("option zero"),
        ScriptedReply::text("option one"),
    ])
    .await;
    let spec = spec(
        r#"
cascade_id: human_eval
cells:
  - name: pick
    instructions: "Propose an option."
    takes: 2
    human_input:
      type: sounding_eval
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
    let candidates = pending.candidate_outputs.clone().unwrap();
    assert_eq!(candidates.len(), 2);

    h.runner
        .checkpoints()
        .respond(
            &pending.id,
            CheckpointResponse {
                response: json!({"picked": 1}),
                winner_index: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let outcome = handle.await.unwrap().unwrap();
    assert_eq!(outcome.final_output, json!(candidates[1]));
}
