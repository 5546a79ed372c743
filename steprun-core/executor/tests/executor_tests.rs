//! 执行器集成测试

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use steprun_common::{
    AssertRule, Comparator, ErrorKind, ExecuteEnv, ExecuteMode, ExecuteSpec, ExecuteStatus,
    ExecutionResult, InteractSpec, NodePath, ResultNode, StepFlags, StepSpec, StepStatus, ValueSource,
    WorkerEvent,
};
use steprun_executor::{EngineServices, EventSink, Execution, ExecutorError};

fn script(id: &str, source: &str) -> StepSpec {
    StepSpec::new(id, "script").with_config(json!({ "script": source }))
}

fn execution(steps: Vec<StepSpec>) -> Execution {
    let spec = ExecuteSpec {
        id: "e1".to_string(),
        steps,
        ..Default::default()
    };
    Execution::new(
        EngineServices::builtin(),
        Arc::new(ExecuteEnv::default()),
        spec,
        EventSink::disabled("e1"),
    )
}

async fn run(steps: Vec<StepSpec>) -> ExecutionResult {
    execution(steps).run().await
}

fn node<'a>(result: &'a ExecutionResult, key: &str) -> &'a ResultNode {
    result
        .node(&key.parse::<NodePath>().unwrap())
        .unwrap_or_else(|| panic!("节点 {} 不存在", key))
}

#[tokio::test]
async fn test_condition_runs_only_true_branch() {
    let condition = StepSpec::new("c", "condition")
        .with_config(json!({ "condition": "1 < 2" }))
        .with_groups(vec![
            vec![script("yes", "ctx.set(\"branch\", 0); 0")],
            vec![script("no", "throw \"不应执行\";")],
        ]);
    let result = run(vec![condition]).await;

    assert_eq!(result.status, ExecuteStatus::Done);
    let root = node(&result, "0");
    assert_eq!(root.status, StepStatus::Done);
    assert_eq!(root.extra["result"], json!([true, false]));
    assert_eq!(node(&result, "0/0.0").status, StepStatus::Done);
    assert_eq!(node(&result, "0/1.0").status, StepStatus::Skip);
}

#[tokio::test]
async fn test_condition_false_selects_else_branch() {
    let condition = StepSpec::new("c", "condition")
        .with_config(json!({ "condition": "false" }))
        .with_groups(vec![vec![script("yes", "1")], vec![script("no", "2")]]);
    let result = run(vec![condition]).await;

    assert_eq!(node(&result, "0").extra["result"], json!([false, true]));
    assert_eq!(node(&result, "0/0.0").status, StepStatus::Skip);
    assert_eq!(node(&result, "0/1.0").status, StepStatus::Done);
}

#[tokio::test]
async fn test_condition_with_empty_groups_is_skipped_without_evaluation() {
    let condition = StepSpec::new("c", "condition")
        .with_config(json!({ "condition": "throw \"不应求值\";" }))
        .with_groups(vec![vec![], vec![]]);
    let result = run(vec![condition]).await;

    let root = node(&result, "0");
    assert_eq!(root.status, StepStatus::Skip);
    assert!(root.errors.is_empty());
    assert_eq!(result.status, ExecuteStatus::Done);
}

#[tokio::test]
async fn test_condition_with_only_disabled_children_is_skipped() {
    let mut off = script("off", "throw \"不应执行\";");
    off.flag = StepFlags::DISABLED;
    let condition = StepSpec::new("c", "condition")
        .with_config(json!({ "condition": "true" }))
        .with_groups(vec![vec![off], vec![script("no", "2")]]);
    let result = run(vec![condition, script("next", "3")]).await;

    assert_eq!(node(&result, "0").status, StepStatus::Skip);
    assert_eq!(node(&result, "0/0.0").status, StepStatus::Skip);
    assert_eq!(node(&result, "0/1.0").status, StepStatus::Skip);
    assert_eq!(node(&result, "1").status, StepStatus::Done);
    assert_eq!(result.status, ExecuteStatus::Done);
}

#[tokio::test]
async fn test_combination_error_reports_one_based_index() {
    let group = StepSpec::new("g", "group").with_steps(vec![
        StepSpec::new("a", "empty"),
        StepSpec::new("b", "empty"),
        script("c", "throw \"boom\";"),
        StepSpec::new("d", "empty"),
    ]);
    let result = run(vec![group]).await;

    let root = node(&result, "0");
    assert_eq!(root.status, StepStatus::Error);
    let error = &root.errors[0];
    assert_eq!(error.kind, ErrorKind::Combination);
    assert_eq!(error.combination_indices(), vec![3]);
    assert_eq!(error.severity, ErrorKind::Execute.severity());

    assert_eq!(node(&result, "0/0.1").status, StepStatus::Done);
    let failed = node(&result, "0/0.2");
    assert_eq!(failed.status, StepStatus::Error);
    assert_eq!(failed.errors[0].kind, ErrorKind::Execute);
    assert!(failed.errors[0].message.contains("boom"));
    assert_eq!(node(&result, "0/0.3").status, StepStatus::Skip);
    assert_eq!(result.status, ExecuteStatus::Error);
}

#[tokio::test]
async fn test_continue_on_error_lists_every_failure() {
    let group = StepSpec::new("g", "group")
        .with_config(json!({ "continueOnError": true }))
        .with_steps(vec![
            script("a", "throw \"a\";"),
            StepSpec::new("b", "empty"),
            StepSpec::new("c", "nope"),
        ]);
    let result = run(vec![group]).await;

    let root = node(&result, "0");
    assert_eq!(root.errors[0].combination_indices(), vec![1, 3]);
    assert_eq!(root.errors[0].severity, ErrorKind::System.severity());
    assert_eq!(node(&result, "0/0.1").status, StepStatus::Done);
}

#[tokio::test]
async fn test_context_writes_do_not_leak_between_branches() {
    let group = StepSpec::new("g", "group").with_groups(vec![
        vec![script("writer", "ctx.set(\"leak\", 1); 0")],
        vec![script(
            "reader",
            "if type_of(ctx.get(\"leak\")) != \"()\" { throw \"leaked\"; } 0",
        )],
    ]);
    let after = script("after", "type_of(ctx.get(\"leak\"))");
    let result = run(vec![group, after]).await;

    assert_eq!(node(&result, "0/1.0").status, StepStatus::Done);
    assert_eq!(node(&result, "1").extra["result"], json!("()"));
}

#[tokio::test]
async fn test_context_flows_forward_between_siblings() {
    let result = run(vec![
        script("a", "ctx.set(\"token\", \"t1\"); 0"),
        script("b", "ctx.get(\"token\")"),
    ])
    .await;
    assert_eq!(node(&result, "1").extra["result"], json!("t1"));
}

#[tokio::test]
async fn test_cancel_is_idempotent() {
    let execution = execution(vec![StepSpec::new("a", "empty")]);
    let handle = execution.handle();
    handle.cancel();
    handle.cancel();

    let result = execution.run().await;
    assert_eq!(result.status, ExecuteStatus::Cancelled);
    assert_eq!(node(&result, "0").status, StepStatus::Skip);

    handle.cancel();
    assert!(handle.is_cancelled());
}

#[tokio::test]
async fn test_cancel_after_done_is_noop() {
    let execution = execution(vec![StepSpec::new("a", "empty")]);
    let handle = execution.handle();
    let result = execution.run().await;
    assert_eq!(result.status, ExecuteStatus::Done);

    handle.cancel();
    handle.cancel();
    assert_eq!(handle.status(), ExecuteStatus::Done);
}

#[tokio::test(start_paused = true)]
async fn test_execute_timeout() {
    let mut wait = StepSpec::new("w", "wait").with_config(json!({ "delay": 60_000 }));
    wait.timeout = Some(500);
    let result = run(vec![wait, StepSpec::new("next", "empty")]).await;

    let root = node(&result, "0");
    assert_eq!(root.status, StepStatus::Error);
    assert!(root.errors[0].is_timeout());
    assert_eq!(root.errors[0].kind, ErrorKind::Execute);
    assert_eq!(node(&result, "1").status, StepStatus::Skip);
}

#[tokio::test(start_paused = true)]
async fn test_templated_wait_delay() {
    let spec = ExecuteSpec {
        id: "e1".to_string(),
        steps: vec![StepSpec::new("w", "wait").with_config(json!({ "delay": "{{pause}}" }))],
        variables: json!({ "pause": 250 }).as_object().cloned().unwrap(),
        ..Default::default()
    };
    let execution = Execution::new(
        EngineServices::builtin(),
        Arc::new(ExecuteEnv::default()),
        spec,
        EventSink::disabled("e1"),
    );
    let result = execution.run().await;
    assert_eq!(node(&result, "0").extra["delay"], json!(250));
}

#[tokio::test]
async fn test_interact_answer_resumes_step() {
    let mut ask = StepSpec::new("ask", "empty");
    ask.interact = Some(InteractSpec {
        message: "确认继续?".to_string(),
        variable: Some("answer".to_string()),
        fields: Value::Null,
        timeout: None,
    });
    let execution = execution(vec![ask, script("use", "ctx.get(\"answer\")")]);
    let handle = execution.handle();
    let task = tokio::spawn(execution.run());

    while handle.pending_interactions().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let tree = handle.query_tree().await;
    assert_eq!(tree[0].status, StepStatus::Interact);

    handle.interact("ask", json!({ "value": 42 })).unwrap();
    let result = task.await.unwrap();

    assert_eq!(result.status, ExecuteStatus::Done);
    assert_eq!(node(&result, "1").extra["result"], json!(42));
    assert!(matches!(
        handle.interact("ask", json!(1)),
        Err(ExecutorError::NotInteracting(_))
    ));
}

#[tokio::test]
async fn test_interact_rejected() {
    let mut ask = StepSpec::new("ask", "empty");
    ask.interact = Some(InteractSpec {
        message: "确认?".to_string(),
        variable: None,
        fields: Value::Null,
        timeout: None,
    });
    let execution = execution(vec![ask]);
    let handle = execution.handle();
    let task = tokio::spawn(execution.run());

    while handle.pending_interactions().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    handle.interact("0", json!({ "accept": false })).unwrap();
    let result = task.await.unwrap();

    assert_eq!(node(&result, "0").errors[0].kind, ErrorKind::Interact);
}

#[tokio::test]
async fn test_cancel_resolves_pending_interaction() {
    let mut ask = StepSpec::new("ask", "empty");
    ask.interact = Some(InteractSpec {
        message: "等待".to_string(),
        variable: None,
        fields: Value::Null,
        timeout: None,
    });
    let execution = execution(vec![ask, StepSpec::new("next", "empty")]);
    let handle = execution.handle();
    let task = tokio::spawn(execution.run());

    while handle.pending_interactions().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    handle.cancel();
    let result = task.await.unwrap();

    assert_eq!(result.status, ExecuteStatus::Cancelled);
    assert_eq!(node(&result, "0").status, StepStatus::Error);
    assert_eq!(node(&result, "1").status, StepStatus::Skip);
}

#[tokio::test]
async fn test_loop_stops_on_failed_iteration() {
    let looped = StepSpec::new("l", "loop")
        .with_config(json!({ "count": 3 }))
        .with_steps(vec![script(
            "body",
            "if ctx.get(\"_index\") == 1 { throw \"fail\"; } ctx.get(\"_index\")",
        )]);
    let result = run(vec![looped]).await;

    let root = node(&result, "0");
    assert_eq!(root.status, StepStatus::Error);
    assert_eq!(root.extra["completed"], json!(2));
    assert_eq!(root.errors[0].combination_indices(), vec![2]);
    assert_eq!(node(&result, "0/0.0").extra["result"], json!(0));
}

#[tokio::test]
async fn test_loop_ignore_error_runs_every_iteration() {
    let looped = StepSpec::new("l", "loop")
        .with_config(json!({ "count": 3, "ignoreError": true, "indexName": "i" }))
        .with_steps(vec![script(
            "body",
            "if ctx.get(\"i\") == 1 { throw \"fail\"; } 0",
        )]);
    let result = run(vec![looped]).await;

    let root = node(&result, "0");
    assert_eq!(root.status, StepStatus::Error);
    assert_eq!(root.extra["completed"], json!(3));
    assert_eq!(node(&result, "0/2.0").status, StepStatus::Done);
}

#[tokio::test]
async fn test_async_loop_runs_all_iterations() {
    let looped = StepSpec::new("l", "loop")
        .with_config(json!({ "count": 4, "async": 2 }))
        .with_steps(vec![script("body", "ctx.set_global(\"n\" + ctx.get(\"_index\"), true); 0")]);
    let result = run(vec![looped]).await;

    assert_eq!(node(&result, "0").status, StepStatus::Done);
    for i in 0..4 {
        assert_eq!(node(&result, &format!("0/{}.0", i)).status, StepStatus::Done);
    }
}

#[tokio::test]
async fn test_poll_until_condition() {
    let poll = StepSpec::new("p", "poll")
        .with_config(json!({ "interval": 0, "condition": "ctx.get(\"_index\") >= 2" }))
        .with_steps(vec![StepSpec::new("probe", "empty")]);
    let result = run(vec![poll]).await;

    let root = node(&result, "0");
    assert_eq!(root.status, StepStatus::Done);
    assert_eq!(root.extra["attempts"], json!(3));
}

#[tokio::test]
async fn test_poll_breaks_on_system_error() {
    let poll = StepSpec::new("p", "poll")
        .with_config(json!({ "interval": 0, "maxCount": 5 }))
        .with_steps(vec![StepSpec::new("bad", "nope")]);
    let result = run(vec![poll]).await;

    let root = node(&result, "0");
    assert_eq!(root.status, StepStatus::Error);
    assert_eq!(root.extra["attempts"], json!(1));
    assert_eq!(root.errors[0].severity, ErrorKind::System.severity());
}

#[tokio::test]
async fn test_poll_exhaustion() {
    let poll = StepSpec::new("p", "poll")
        .with_config(json!({ "interval": 0, "maxCount": 3 }))
        .with_steps(vec![script("flaky", "throw \"not yet\";")]);
    let result = run(vec![poll]).await;

    let root = node(&result, "0");
    assert_eq!(root.extra["attempts"], json!(3));
    assert_eq!(root.errors[0].kind, ErrorKind::Execute);
}

#[tokio::test]
async fn test_dataset_rows_from_static_csv_and_mock() {
    let dataset = StepSpec::new("d", "dataset")
        .with_config(json!({
            "file": "user,age\nalice,30\nbob,41\n",
            "seed": 1,
            "fields": [
                {"name": "user", "mode": "csv"},
                {"name": "years", "mode": "csv", "column": "age"},
                {"name": "tag", "mode": "static", "values": ["x"]},
                {"name": "serial", "mode": "mock", "generator": {"kind": "seq", "start": 100}}
            ]
        }))
        .with_steps(vec![script(
            "row",
            "#{user: ctx.get(\"user\"), years: ctx.get(\"years\"), tag: ctx.get(\"tag\"), serial: ctx.get(\"serial\")}",
        )]);
    let result = run(vec![dataset]).await;

    assert_eq!(node(&result, "0").extra["rows"], json!(2));
    assert_eq!(
        node(&result, "0/0.0").extra["result"],
        json!({"user": "alice", "years": "30", "tag": "x", "serial": 100})
    );
    let second = &node(&result, "0/1.0").extra["result"];
    assert_eq!(second["user"], json!("bob"));
    assert_eq!(second["serial"], json!(101));
    assert_eq!(second["tag"], Value::Null);
    assert!(result.details.contains_key("0"));
}

#[tokio::test]
async fn test_component_params_and_returns() {
    let component = StepSpec::new("comp", "component")
        .with_config(json!({
            "params": [{"name": "base", "value": "{{seed}}"}],
            "returns": [{"name": "doubled", "target": "out"}]
        }))
        .with_steps(vec![script("calc", "ctx.set(\"doubled\", ctx.get(\"base\") * 2); 0")]);
    let result = run(vec![
        script("init", "ctx.set(\"seed\", 21); 0"),
        component,
        script("read", "ctx.get(\"out\")"),
    ])
    .await;

    assert_eq!(node(&result, "1").extra, json!({"out": 42}));
    assert_eq!(node(&result, "2").extra["result"], json!(42));
}

#[tokio::test]
async fn test_post_script_and_assertions() {
    let mut step = script("s", "#{code: 200}");
    step.post_script = Some("ctx.set(\"code\", result.result.code); 0".to_string());
    step.asserts = vec![
        AssertRule {
            name: Some("状态码".to_string()),
            source: ValueSource::Variable,
            path: Some("code".to_string()),
            comparator: Comparator::Eq,
            expected: json!(200),
        },
        AssertRule {
            name: None,
            source: ValueSource::Extra,
            path: Some("/result/code".to_string()),
            comparator: Comparator::Gt,
            expected: json!(300),
        },
    ];
    let result = run(vec![step]).await;

    let root = node(&result, "0");
    assert_eq!(root.status, StepStatus::Error);
    assert_eq!(root.errors.len(), 1);
    assert_eq!(root.errors[0].kind, ErrorKind::Assert);
}

#[tokio::test]
async fn test_pre_script_failure_skips_execute() {
    let mut step = script("s", "ctx.set(\"ran\", true); 0");
    step.pre_script = Some("throw \"pre\";".to_string());
    let result = run(vec![step]).await;

    let root = node(&result, "0");
    assert_eq!(root.errors[0].kind, ErrorKind::Pre);
    assert_eq!(root.extra["result"], Value::Null);
}

#[tokio::test]
async fn test_unknown_step_type_is_system_error() {
    let result = run(vec![StepSpec::new("x", "http")]).await;
    let root = node(&result, "0");
    assert_eq!(root.status, StepStatus::Error);
    assert_eq!(root.errors[0].kind, ErrorKind::System);
}

#[tokio::test]
async fn test_disabled_step_is_skipped() {
    let mut disabled = script("off", "throw \"x\";");
    disabled.flag = steprun_common::StepFlags::DISABLED;
    let result = run(vec![disabled, StepSpec::new("on", "empty")]).await;

    assert_eq!(node(&result, "0").status, StepStatus::Skip);
    assert_eq!(node(&result, "1").status, StepStatus::Done);
    assert_eq!(result.status, ExecuteStatus::Done);
}

#[tokio::test]
async fn test_query_detail_by_id() {
    let execution = execution(vec![StepSpec::new("only", "empty")]);
    let handle = execution.handle();
    let _ = execution.run().await;

    let detail = handle.query_detail("only").await.unwrap();
    assert_eq!(detail["key"], "0");
    assert!(matches!(
        handle.query_detail("missing").await,
        Err(ExecutorError::NodeNotFound(_))
    ));
}

#[tokio::test]
async fn test_dataset_detail_survives_completion() {
    let dataset = StepSpec::new("d", "dataset")
        .with_config(json!({
            "fields": [{"name": "x", "mode": "static", "values": [1, 2]}]
        }))
        .with_steps(vec![StepSpec::new("e", "empty")]);
    let execution = execution(vec![dataset]);
    let handle = execution.handle();
    let result = execution.run().await;

    let payload_detail = result.details.get("0").cloned().unwrap();
    let queried = handle.query_detail("d").await.unwrap();
    assert_eq!(queried["key"], "0");
    assert_eq!(queried["detail"]["rows"], json!([{"x": 1}, {"x": 2}]));
    assert_eq!(queried["detail"], payload_detail);
}

#[tokio::test]
async fn test_progress_events_follow_mode() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let spec = ExecuteSpec {
        id: "e1".to_string(),
        steps: vec![script("log", "console.log(\"hello\"); 0")],
        ..Default::default()
    };
    let execution = Execution::new(
        EngineServices::builtin(),
        Arc::new(ExecuteEnv::default()),
        spec.clone(),
        EventSink::new("e1", ExecuteMode::Async, tx),
    );
    let result = execution.run().await;
    assert_eq!(node(&result, "0").logs.len(), 1);

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.kind());
        if let WorkerEvent::Progress { status, .. } = event {
            assert_ne!(status, StepStatus::Wait);
        }
    }
    assert!(kinds.contains(&"progress"));
    assert!(kinds.contains(&"log"));

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let execution = Execution::new(
        EngineServices::builtin(),
        Arc::new(ExecuteEnv::default()),
        ExecuteSpec {
            mode: ExecuteMode::Sync,
            ..spec
        },
        EventSink::new("e1", ExecuteMode::Sync, tx),
    );
    execution.run().await;
    assert!(rx.try_recv().is_err());
}
