//! The SQL UDF bridge and `THEN <STAGE>` pipeline.

mod common;

use std::collections::HashSet;

use common::*;
use serde_json::json;
use windlass::agent::ScriptedReply;
use windlass::bridge::udf::SqlBridge;
use windlass::echo::NodeType;
use windlass::frame::Frame;

fn tickets_frame() -> Frame {
    Frame::from_records(&[
        json!({"id": 1, "text": "refund please"}),
        json!({"id": 2, "text": "love the product"}),
        json!({"id": 3, "text": "app crashes on login"}),
    ])
}

#[tokio::test]
async fn scalar_udf_runs_one_cascade_per_row() {
    let h = harness(vec![
        ScriptedReply::text("billing").with_request_id("p1"),
        ScriptedReply::text("praise").with_request_id("p2"),
        ScriptedReply::text("bug").with_request_id("p3"),
    ])
    .await;
    let bridge = SqlBridge::open(h.runner.clone()).await.unwrap();
    bridge
        .session_db()
        .create_table("t", &tickets_frame())
        .await
        .unwrap();

    let frame = bridge
        .execute("SELECT id, rvbbit('classify the ticket', text) AS label FROM t")
        .await
        .unwrap();
    assert_eq!(frame.columns, vec!["id", "label"]);
    assert_eq!(frame.len(), 3);
    let labels: Vec<String> = frame
        .rows
        .iter()
        .map(|r| r[1].as_str().unwrap().to_string())
        .collect();
    let mut sorted = labels.clone();
    sorted.sort();
    assert_eq!(sorted, vec!["billing", "bug", "praise"]);
    assert_eq!(h.provider.call_count(), 3);
}

#[tokio::test]
async fn repeat_statement_serves_from_cache_with_distinct_caller_ids() {
    let h = harness(vec![
        ScriptedReply::text("billing").with_request_id("p1"),
        ScriptedReply::text("praise").with_request_id("p2"),
        ScriptedReply::text("bug").with_request_id("p3"),
    ])
    .await;
    let bridge = SqlBridge::open(h.runner.clone()).await.unwrap();
    bridge
        .session_db()
        .create_table("t", &tickets_frame())
        .await
        .unwrap();

    let sql = "SELECT rvbbit('classify', text) AS label FROM t WHERE id IN (1, 2, 3)";
    let first = bridge.execute(sql).await.unwrap();
    assert_eq!(h.provider.call_count(), 3);

    // Second invocation: zero LLM calls, identical results.
    let second = bridge.execute(sql).await.unwrap();
    assert_eq!(h.provider.call_count(), 3);
    assert_eq!(first, second);

    // Six result rows across the two statements: the three live turn
    // outputs and the three cache hits. Two caller ids (one per
    // statement), three provider request ids shared between them.
    let turn_rows: Vec<_> = h
        .runner
        .store()
        .rows_by_request_id("p1")
        .await
        .unwrap()
        .into_iter()
        .chain(h.runner.store().rows_by_request_id("p2").await.unwrap())
        .chain(h.runner.store().rows_by_request_id("p3").await.unwrap())
        .filter(|r| {
            matches!(
                r.node_type,
                NodeType::TurnOutput | NodeType::QuartermasterResult
            )
        })
        .collect();
    assert_eq!(turn_rows.len(), 6);

    let caller_ids: HashSet<_> = turn_rows
        .iter()
        .map(|r| r.caller_id.clone().unwrap())
        .collect();
    assert_eq!(caller_ids.len(), 2);

    let request_ids: HashSet<_> = turn_rows
        .iter()
        .map(|r| r.provider_request_id.clone().unwrap())
        .collect();
    assert_eq!(request_ids.len(), 3);

    let hits = turn_rows
        .iter()
        .filter(|r| r.node_type == NodeType::QuartermasterResult)
        .count();
    assert_eq!(hits, 3);
}

#[tokio::test]
async fn structure_hashed_args_share_one_execution() {
    let h = harness_with(
        vec![ScriptedReply::text("shape understood").with_request_id("s1")],
        |registries| {
            registries.register_cascade(spec(
                r#"
cascade_id: shape_reader
cells:
  - name: read
    instructions: "Describe the JSON structure you were given."
"#,
            ));
        },
    )
    .await;
    let bridge = SqlBridge::open(h.runner.clone())
        .await
        .unwrap()
        .with_structure_keys(vec!["args".to_string()]);

    // Same shape, different content, per row.
    let frame = Frame::from_records(&[
        json!({"id": 1, "payload": r#"{"customer": {"name": "Alice", "age": 30}}"#}),
        json!({"id": 2, "payload": r#"{"customer": {"name": "Bob", "age": 44}}"#}),
        json!({"id": 3, "payload": r#"{"customer": {"name": "Cleo", "age": 58}}"#}),
    ]);
    bridge.session_db().create_table("t", &frame).await.unwrap();

    let result = bridge
        .execute("SELECT rvbbit_cascade('shape_reader', payload) AS parsed FROM t")
        .await
        .unwrap();
    assert_eq!(result.len(), 3);
    // Structurally identical inputs share one cascade execution.
    assert_eq!(h.provider.call_count(), 1);
    for row in &result.rows {
        assert_eq!(row[0], json!("shape understood"));
    }
}

#[tokio::test]
async fn pipeline_stage_materializes_into_table() {
    let h = harness_with(
        vec![ScriptedReply::text(
            r#"[{"insight": "two error rows"}, {"insight": "one praise row"}]"#,
        )],
        |registries| {
            registries.register_cascade(spec(
                r#"
cascade_id: analyze_frame
cells:
  - name: analyze
    instructions: "Analyze the rows: {{ input.data }} with question {{ input.question }}"
    output_mode: json
"#,
            ));
            registries.bind_stage("ANALYZE", "analyze_frame");
        },
    )
    .await;
    let bridge = SqlBridge::open(h.runner.clone()).await.unwrap();
    bridge
        .session_db()
        .create_table("t", &tickets_frame())
        .await
        .unwrap();

    let frame = bridge
        .execute("SELECT * FROM t THEN ANALYZE 'what stands out?' INTO findings")
        .await
        .unwrap();
    assert_eq!(frame.columns, vec!["insight"]);
    assert_eq!(frame.len(), 2);

    // Round trip: the INTO table is queryable afterwards.
    let stored = bridge.execute("SELECT * FROM findings").await.unwrap();
    assert_eq!(stored, frame);
}

#[tokio::test]
async fn unknown_stage_names_the_stage() {
    let h = harness(vec![]).await;
    let bridge = SqlBridge::open(h.runner.clone()).await.unwrap();
    bridge
        .session_db()
        .create_table("t", &tickets_frame())
        .await
        .unwrap();

    let err = bridge
        .execute("SELECT * FROM t THEN SPEAK 'aloud'")
        .await
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("SPEAK"), "unexpected error: {message}");
}

#[tokio::test]
async fn plain_sql_passes_through() {
    let h = harness(vec![]).await;
    let bridge = SqlBridge::open(h.runner.clone()).await.unwrap();
    bridge
        .session_db()
        .create_table("t", &tickets_frame())
        .await
        .unwrap();

    let frame = bridge
        .execute("SELECT COUNT(*) AS n FROM t")
        .await
        .unwrap();
    assert_eq!(frame.value(0, "n"), Some(&json!(3)));
    assert_eq!(h.provider.call_count(), 0);
}
