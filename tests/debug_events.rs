#![cfg(unix)]

mod common;

use std::path::Path;

use common::{TestResult, spawn_server_with_args_and_env};
use serde_json::{Value, json};

fn read_events(dir: &Path) -> TestResult<Vec<Value>> {
    let mut events = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("jsonl") {
            continue;
        }
        for line in std::fs::read_to_string(&path)?.lines() {
            events.push(serde_json::from_str(line)?);
        }
    }
    Ok(events)
}

fn find<'a>(events: &'a [Value], name: &str) -> Option<&'a Value> {
    events
        .iter()
        .find(|event| event.get("event").and_then(Value::as_str) == Some(name))
}

fn names(events: &[Value]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|event| event.get("event").and_then(Value::as_str))
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn env_var_enables_jsonl_event_log() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    let events_dir = temp.path().join("events");
    let session = spawn_server_with_args_and_env(
        Vec::new(),
        vec![(
            "STATA_REPL_DEBUG_EVENTS_DIR".to_string(),
            events_dir.to_string_lossy().to_string(),
        )],
    )
    .await?;

    session
        .call_tool("stata", json!({"input": "display \"logged\""}))
        .await?;
    session.call_tool("stata_interrupt", json!({})).await?;

    let events = read_events(&events_dir)?;
    let names = names(&events);
    assert_eq!(names.first(), Some(&"startup"), "got {names:?}");
    assert!(names.contains(&"session_start"), "got {names:?}");
    assert!(names.contains(&"tool_call_begin"), "got {names:?}");
    assert!(names.contains(&"tool_call_end"), "got {names:?}");
    assert!(names.contains(&"interrupt"), "got {names:?}");

    let startup = &events[0];
    assert_eq!(
        startup.pointer("/payload/mode").and_then(Value::as_str),
        Some("server"),
        "got {startup}"
    );

    let logged = events
        .iter()
        .filter(|event| event.get("event").and_then(Value::as_str) == Some("execution"))
        .find(|event| {
            event.pointer("/payload/result/output").and_then(Value::as_str) == Some("logged")
        });
    assert!(logged.is_some(), "no execution record for the call: {names:?}");

    session.cancel().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn startup_failures_are_logged_as_tool_errors() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    let events_dir = temp.path().join("events");
    let missing = temp.path().join("no-such-stata");
    let session = spawn_server_with_args_and_env(
        vec![
            "--stata-path".to_string(),
            missing.to_string_lossy().to_string(),
            "--debug-events-dir".to_string(),
            events_dir.to_string_lossy().to_string(),
        ],
        Vec::new(),
    )
    .await?;

    let result = session
        .call_tool("stata", json!({"input": "display 1"}))
        .await?;
    let text = common::result_text(&result);
    assert!(text.starts_with("session error:"), "got {text:?}");

    let events = read_events(&events_dir)?;
    let error = find(&events, "tool_call_error").expect("tool_call_error record");
    assert_eq!(
        error.pointer("/payload/tool").and_then(Value::as_str),
        Some("stata")
    );
    assert!(
        find(&events, "session_start_error").is_some(),
        "got {:?}",
        names(&events)
    );

    session.cancel().await?;
    Ok(())
}
