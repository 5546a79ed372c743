//! 脚本沙箱集成测试

use serde_json::{json, Map};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use rhai::{Dynamic, Map as ScriptMap};
use steprun_common::codec::{as_back_reference, decode_payload, encode_payload};
use steprun_common::{ExecutionResult, LogLevel, NodePath, ResultNode, StepSpec};
use steprun_sandbox::{Console, SandboxError, ScriptBindings, ScriptRequest, ScriptSandbox};

#[tokio::test]
async fn test_env_overlay_does_not_touch_process_env() {
    let sandbox = ScriptSandbox::default();
    let env = Arc::new(RwLock::new(Map::new()));
    let bindings = ScriptBindings {
        env: Arc::clone(&env),
        ..Default::default()
    };

    let run = sandbox
        .run(
            r#"ctx.set_env("STEPRUN_SANDBOX_TEST", 5); ctx.get_env("STEPRUN_SANDBOX_TEST")"#,
            ScriptRequest::new(bindings),
        )
        .await;

    assert_eq!(run.result.unwrap(), json!("5"));
    assert_eq!(env.read().unwrap().get("STEPRUN_SANDBOX_TEST"), Some(&json!("5")));
    assert!(std::env::var("STEPRUN_SANDBOX_TEST").is_err());
}

#[tokio::test]
async fn test_debug_statement_is_captured() {
    let sandbox = ScriptSandbox::default();
    let run = sandbox
        .run(r#"debug("checkpoint"); console.trace(1, 2); true"#, ScriptRequest::new(ScriptBindings::default()))
        .await;

    assert_eq!(run.result.unwrap(), json!(true));
    let debug_entries: Vec<_> = run.logs.iter().filter(|e| e.level == LogLevel::Debug).collect();
    assert_eq!(debug_entries.len(), 2);
    assert_eq!(debug_entries[1].values, vec![json!(1), json!(2)]);
}

#[tokio::test]
async fn test_console_accepts_many_arguments() {
    let sandbox = ScriptSandbox::default();
    let run = sandbox
        .run(
            r#"console.log(1, 2, 3, 4); console.error("a", "b", "c", "d", "e", "f", "g", "h"); 0"#,
            ScriptRequest::new(ScriptBindings::default()),
        )
        .await;

    assert!(run.result.is_ok());
    assert_eq!(run.logs.len(), 2);
    assert_eq!(run.logs[0].values, vec![json!(1), json!(2), json!(3), json!(4)]);
    assert_eq!(run.logs[1].level, LogLevel::Error);
    assert_eq!(run.logs[1].values.len(), 8);
}

#[tokio::test]
async fn test_context_writes_survive_timeout() {
    let sandbox = ScriptSandbox::default();
    let run = sandbox
        .run(
            r#"ctx.set("before", true); loop { }"#,
            ScriptRequest::new(ScriptBindings::default()).with_timeout(Some(Duration::from_millis(100))),
        )
        .await;

    assert!(matches!(run.result, Err(SandboxError::Timeout(100))));
    assert_eq!(run.context.get("before"), Some(&json!(true)));
}

#[tokio::test]
async fn test_syntax_error_reports_position() {
    let sandbox = ScriptSandbox::default();
    let run = sandbox
        .run("let a = ;", ScriptRequest::new(ScriptBindings::default()))
        .await;

    match run.result {
        Err(SandboxError::Script { message, line, .. }) => {
            assert!(message.starts_with("语法错误"));
            assert_eq!(line, Some(1));
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn test_circular_console_value_survives_result_encoding() {
    let mut shared = Dynamic::from_map(ScriptMap::new()).into_shared();
    let me = shared.clone();
    if let Some(mut map) = shared.write_lock::<ScriptMap>() {
        map.insert("name".into(), Dynamic::from("loop"));
        map.insert("me".into(), me);
    }

    let console = Console::new(None);
    console.write(LogLevel::Info, &[shared]);
    let logs = console.take();
    assert_eq!(logs.len(), 1);

    let mut node = ResultNode::pending(&StepSpec::new("s", "script"), &NodePath::root(0));
    node.logs = logs;
    let mut result = ExecutionResult::new("e1");
    result.steps.push(node);

    let bytes = encode_payload(&result).unwrap();
    let decoded: ExecutionResult = decode_payload(&bytes).unwrap();
    let value = &decoded.steps[0].logs[0].values[0];
    assert_eq!(value["name"], json!("loop"));
    assert_eq!(as_back_reference(&value["me"]), Some("$"));
}
