mod common;

use std::sync::Arc;
use std::time::Duration;

use agent_bridge::config::BridgeConfig;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use serde_json::{json, Value};
use tokio::sync::Notify;

use common::{claude_turn, script_from, send, send_json, Script, TestApp};

fn chat_body(app: &TestApp, conversation_id: &str, message: &str) -> Value {
    json!({
        "conversation_id": conversation_id,
        "message": message,
        "working_dir": app.workdir(),
    })
}

async fn health(app: &TestApp) -> Value {
    let (status, body) = send_json(&app.app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    body
}

#[tokio::test]
async fn first_turn_returns_result_and_session() {
    let app = TestApp::new();
    app.runner.push(script_from(claude_turn("s1", "Hi there!", 100, 50)));

    let (status, body) = send_json(
        &app.app,
        Method::POST,
        "/chat",
        Some(chat_body(&app, "c1", "Hello")),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({
            "result": "Hi there!",
            "session_id": "s1",
            "usage": {"input_tokens": 100, "output_tokens": 50},
            "is_error": false,
            "compacted": false,
        })
    );

    let launches = app.runner.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].program.to_string_lossy(), "claude");
    assert_eq!(launches[0].stdin.as_deref(), Some("Hello"));
    assert_eq!(launches[0].current_dir, app.workdir.path());
    assert!(!launches[0].args.iter().any(|arg| arg == "--resume"));

    assert_eq!(health(&app).await, json!({"status": "ok", "active_sessions": 1}));
}

#[tokio::test]
async fn second_turn_resumes_backend_session() {
    let app = TestApp::new();
    app.runner.push(script_from(claude_turn("s1", "Hi there!", 100, 50)));
    app.runner.push(script_from(claude_turn("s1", "Still here.", 180, 20)));

    send_json(&app.app, Method::POST, "/chat", Some(chat_body(&app, "c1", "Hello"))).await;
    let (status, body) = send_json(
        &app.app,
        Method::POST,
        "/chat",
        Some(chat_body(&app, "c1", "Are you there?")),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], "Still here.");
    assert_eq!(body["session_id"], "s1");

    let launches = app.runner.launches();
    let resume_at = launches[1]
        .args
        .iter()
        .position(|arg| arg == "--resume")
        .expect("second turn resumes");
    assert_eq!(launches[1].args[resume_at + 1], "s1");
}

#[tokio::test]
async fn backend_error_is_reported_in_band() {
    let app = TestApp::new();
    app.runner.push(script_from(claude_turn("s1", "Hi there!", 100, 50)));
    app.runner.push(Script::exited(
        &[r#"{"type":"result","subtype":"error_during_execution","is_error":true,"result":"rate limited","session_id":"s1"}"#],
        "exit code 1",
        "",
    ));

    send_json(&app.app, Method::POST, "/chat", Some(chat_body(&app, "c1", "Hello"))).await;
    let (status, body) = send_json(
        &app.app,
        Method::POST,
        "/chat",
        Some(chat_body(&app, "c1", "Again")),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_error"], true);
    assert_eq!(body["result"], "rate limited");
    assert_eq!(body["session_id"], "s1");
}

#[tokio::test]
async fn crashed_backend_reports_exit_and_stderr() {
    let app = TestApp::new();
    app.runner.push(Script::exited(&[], "exit code 1", "Invalid API key\n"));

    let (status, body) = send_json(
        &app.app,
        Method::POST,
        "/chat",
        Some(chat_body(&app, "c1", "Hello")),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_error"], true);
    assert_eq!(
        body["result"],
        "claude-code exited unexpectedly (exit code 1): Invalid API key"
    );
    assert_eq!(body["session_id"], "");
    assert_eq!(body["usage"], json!({"input_tokens": 0, "output_tokens": 0}));
    assert_eq!(health(&app).await["active_sessions"], 0);
}

#[tokio::test]
async fn missing_backend_binary_is_an_error_result() {
    let app = TestApp::new();
    app.runner.push(Script::SpawnFailure);

    let (status, body) = send_json(
        &app.app,
        Method::POST,
        "/chat",
        Some(chat_body(&app, "c1", "Hello")),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_error"], true);
    assert!(body["result"]
        .as_str()
        .unwrap_or_default()
        .starts_with("failed to start claude-code"));
}

#[tokio::test]
async fn delete_forgets_session_and_is_idempotent() {
    let app = TestApp::new();
    app.runner.push(script_from(claude_turn("s1", "Hi there!", 100, 50)));
    app.runner.push(script_from(claude_turn("s2", "Fresh start.", 10, 5)));

    send_json(&app.app, Method::POST, "/chat", Some(chat_body(&app, "c1", "Hello"))).await;

    let (status, body) = send_json(&app.app, Method::DELETE, "/sessions/c1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"deleted": true}));

    let (status, body) = send_json(&app.app, Method::DELETE, "/sessions/c1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"deleted": false}));

    let (_, body) = send_json(
        &app.app,
        Method::POST,
        "/chat",
        Some(chat_body(&app, "c1", "Hello again")),
    )
    .await;
    assert_eq!(body["session_id"], "s2");
    let launches = app.runner.launches();
    assert!(!launches[1].args.iter().any(|arg| arg == "--resume"));
}

#[tokio::test]
async fn invalid_requests_never_reach_a_backend() {
    let app = TestApp::new();

    let cases = [
        json!({"message": "Hello"}),
        json!({"conversation_id": "", "message": "Hello"}),
        json!({"conversation_id": "c1"}),
        json!({"conversation_id": "c1", "message": ""}),
        json!({"conversation_id": 7, "message": "Hello"}),
    ];
    for case in cases {
        let (status, body) = send_json(&app.app, Method::POST, "/chat", Some(case.clone())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "case {case}");
        assert_eq!(body["is_error"], true, "case {case}");
        assert_eq!(body["session_id"], "");
        assert_eq!(body["usage"], json!({"input_tokens": 0, "output_tokens": 0}));
    }

    let request = Request::builder()
        .method(Method::POST)
        .uri("/chat")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .expect("request");
    let (status, body) = send(&app.app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["is_error"], true);

    assert!(app.runner.launches().is_empty());
}

#[tokio::test]
async fn model_selector_routes_to_codex() {
    let app = TestApp::new();
    app.runner.push(Script::lines(&[
        r#"{"type":"thread.started","thread_id":"thread-1"}"#,
        r#"{"type":"item.completed","item":{"id":"item_0","type":"agent_message","text":"Done."}}"#,
        r#"{"type":"turn.completed","usage":{"input_tokens":300,"cached_input_tokens":100,"output_tokens":12}}"#,
    ]));

    let mut body = chat_body(&app, "c1", "Fix it");
    body["model"] = json!("codex");
    let (status, body) = send_json(&app.app, Method::POST, "/chat", Some(body)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], "Done.");
    assert_eq!(body["session_id"], "thread-1");
    assert_eq!(body["usage"], json!({"input_tokens": 300, "output_tokens": 12}));

    let launches = app.runner.launches();
    assert_eq!(launches[0].program.to_string_lossy(), "codex");
    assert!(!launches[0].args.iter().any(|arg| arg == "--model"));

    // The same conversation id has independent state per backend.
    assert_eq!(health(&app).await["active_sessions"], 1);
    let (_, deleted) = send_json(&app.app, Method::DELETE, "/sessions/c1", None).await;
    assert_eq!(deleted["deleted"], true);
}

#[tokio::test]
async fn codex_retry_notice_does_not_fail_a_completed_turn() {
    let app = TestApp::new();
    app.runner.push(Script::lines(&[
        r#"{"type":"thread.started","thread_id":"thread-1"}"#,
        r#"{"type":"error","message":"stream disconnected, retrying"}"#,
        r#"{"type":"item.completed","item":{"id":"item_0","type":"agent_message","text":"All done."}}"#,
        r#"{"type":"turn.completed","usage":{"input_tokens":20,"output_tokens":4}}"#,
    ]));

    let mut body = chat_body(&app, "c1", "Fix it");
    body["model"] = json!("codex");
    let (status, body) = send_json(&app.app, Method::POST, "/chat", Some(body)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_error"], false);
    assert_eq!(body["result"], "All done.");
    assert_eq!(body["session_id"], "thread-1");
    assert_eq!(health(&app).await["active_sessions"], 1);
}

#[tokio::test]
async fn compaction_is_flagged() {
    let app = TestApp::new();
    app.runner.push(Script::lines(&[
        r#"{"type":"system","subtype":"init","session_id":"s1"}"#,
        r#"{"type":"system","subtype":"compact_boundary","session_id":"s1"}"#,
        r#"{"type":"result","subtype":"success","is_error":false,"result":"Summarized.","session_id":"s1"}"#,
    ]));

    let (_, body) = send_json(
        &app.app,
        Method::POST,
        "/chat",
        Some(chat_body(&app, "c1", "Continue")),
    )
    .await;
    assert_eq!(body["compacted"], true);
    assert_eq!(body["usage"], json!({"input_tokens": 0, "output_tokens": 0}));
}

#[tokio::test]
async fn adapter_panic_becomes_internal_error() {
    let app = TestApp::new();
    app.runner.push(Script::Panic);

    let (status, body) = send_json(
        &app.app,
        Method::POST,
        "/chat",
        Some(chat_body(&app, "c1", "Hello")),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["is_error"], true);
    assert_eq!(body["result"], "internal error");

    // The service keeps serving.
    assert_eq!(health(&app).await["status"], "ok");
}

#[tokio::test]
async fn dropped_caller_does_not_cancel_the_turn() {
    let app = TestApp::new();
    let gate = Arc::new(Notify::new());
    let turn: Vec<String> = claude_turn("s1", "Hi there!", 100, 50);
    let turn: Vec<&str> = turn.iter().map(String::as_str).collect();
    app.runner.push(Script::gated(&turn, gate.clone()));

    let router = app.app.clone();
    let body = chat_body(&app, "c1", "Hello");
    let caller = tokio::spawn(async move {
        send_json(&router, Method::POST, "/chat", Some(body)).await
    });
    app.wait_for_launches(1).await;
    caller.abort();
    gate.notify_one();

    tokio::time::timeout(Duration::from_secs(5), async {
        while health(&app).await["active_sessions"] != 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("session persisted after caller went away");
}

#[tokio::test]
async fn serialized_turns_resume_the_previous_handle() {
    let app = TestApp::with_config(BridgeConfig {
        serialize_turns: true,
        ..BridgeConfig::default()
    });
    let gate = Arc::new(Notify::new());
    let first: Vec<String> = claude_turn("s1", "first", 1, 1);
    let first: Vec<&str> = first.iter().map(String::as_str).collect();
    app.runner.push(Script::gated(&first, gate.clone()));
    app.runner.push(script_from(claude_turn("s1", "second", 1, 1)));

    let router = app.app.clone();
    let body = chat_body(&app, "c1", "one");
    let first_call = tokio::spawn(async move {
        send_json(&router, Method::POST, "/chat", Some(body)).await
    });
    app.wait_for_launches(1).await;

    let router = app.app.clone();
    let body = chat_body(&app, "c1", "two");
    let second_call = tokio::spawn(async move {
        send_json(&router, Method::POST, "/chat", Some(body)).await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(app.runner.launches().len(), 1, "second turn waits for the first");

    gate.notify_one();
    let (_, first_body) = first_call.await.expect("first call");
    let (_, second_body) = second_call.await.expect("second call");
    assert_eq!(first_body["result"], "first");
    assert_eq!(second_body["result"], "second");

    let launches = app.runner.launches();
    assert!(launches[1].args.iter().any(|arg| arg == "s1"));
}

#[tokio::test]
async fn unknown_routes_return_problem_details() {
    let app = TestApp::new();
    let (status, body) = send_json(&app.app, Method::GET, "/v1/chat", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["type"], "urn:agent-bridge:error:not_found");
    assert_eq!(body["status"], 404);
    assert_eq!(body["detail"], "not found: /v1/chat");
}

#[tokio::test]
async fn openapi_document_is_served() {
    let app = TestApp::new();
    let (status, body) = send_json(&app.app, Method::GET, "/openapi.json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["paths"]["/chat"]["post"].is_object());
    assert!(body["components"]["schemas"]["ChatResponse"].is_object());
}
