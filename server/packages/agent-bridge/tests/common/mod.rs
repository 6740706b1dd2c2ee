#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_bridge::app::build_router;
use agent_bridge::config::BridgeConfig;
use agent_bridge::process::{AgentRunner, LaunchSpec, LineStream, RunnerError};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use futures::stream::{self, StreamExt};
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::Notify;
use tower::util::ServiceExt;

/// What the next backend launch does.
pub enum Script {
    Lines(Vec<Result<String, RunnerError>>),
    /// Emits its lines only after the gate is notified.
    Gated(Vec<Result<String, RunnerError>>, Arc<Notify>),
    SpawnFailure,
    Panic,
}

impl Script {
    pub fn lines(lines: &[&str]) -> Self {
        Script::Lines(lines.iter().map(|line| Ok(line.to_string())).collect())
    }

    pub fn exited(lines: &[&str], status: &str, stderr: &str) -> Self {
        let mut items: Vec<_> = lines.iter().map(|line| Ok(line.to_string())).collect();
        items.push(Err(RunnerError::Exited {
            status: status.to_string(),
            stderr: stderr.to_string(),
        }));
        Script::Lines(items)
    }

    pub fn gated(lines: &[&str], gate: Arc<Notify>) -> Self {
        Script::Gated(lines.iter().map(|line| Ok(line.to_string())).collect(), gate)
    }
}

/// Runner that replays scripted backend output and records every launch.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    scripts: Mutex<VecDeque<ScriptSlot>>,
    launches: Mutex<Vec<LaunchSpec>>,
}

struct ScriptSlot(Script);

impl std::fmt::Debug for ScriptSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Script")
    }
}

impl ScriptedRunner {
    pub fn push(&self, script: Script) {
        self.scripts.lock().expect("scripts").push_back(ScriptSlot(script));
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.launches.lock().expect("launches").clone()
    }
}

#[async_trait]
impl AgentRunner for ScriptedRunner {
    async fn spawn(&self, spec: LaunchSpec) -> Result<LineStream, RunnerError> {
        let command = spec.display();
        self.launches.lock().expect("launches").push(spec);
        let script = self.scripts.lock().expect("scripts").pop_front();
        match script.map(|slot| slot.0) {
            Some(Script::Lines(items)) => Ok(stream::iter(items).boxed()),
            Some(Script::Gated(items, gate)) => Ok(stream::once(async move {
                gate.notified().await;
                stream::iter(items)
            })
            .flatten()
            .boxed()),
            Some(Script::Panic) => panic!("scripted backend panic"),
            Some(Script::SpawnFailure) | None => Err(RunnerError::Spawn {
                command,
                error: std::io::Error::new(std::io::ErrorKind::NotFound, "No such file or directory"),
            }),
        }
    }
}

pub struct TestApp {
    pub app: Router,
    pub runner: Arc<ScriptedRunner>,
    pub workdir: TempDir,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(BridgeConfig::default())
    }

    pub fn with_config(config: BridgeConfig) -> Self {
        let runner = Arc::new(ScriptedRunner::default());
        let router = config
            .backend_router(runner.clone())
            .expect("build backend router");
        let workdir = tempfile::tempdir().expect("create temp workdir");
        Self {
            app: build_router(Arc::new(router)),
            runner,
            workdir,
        }
    }

    pub fn workdir(&self) -> String {
        self.workdir.path().to_string_lossy().to_string()
    }

    /// Waits until the runner has seen `count` launches.
    pub async fn wait_for_launches(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.runner.launches().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("backend launch");
    }
}

pub async fn send_json(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    let body = if let Some(body) = body {
        builder = builder.header("content-type", "application/json");
        Body::from(body.to_string())
    } else {
        Body::empty()
    };
    send(app, builder.body(body).expect("request")).await
}

pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("request handled");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).to_string())
        })
    };
    (status, value)
}

pub fn claude_turn(session_id: &str, text: &str, input: u64, output: u64) -> Vec<String> {
    vec![
        format!(r#"{{"type":"system","subtype":"init","session_id":"{session_id}"}}"#),
        format!(
            r#"{{"type":"result","subtype":"success","is_error":false,"result":"{text}","session_id":"{session_id}","usage":{{"input_tokens":{input},"output_tokens":{output}}}}}"#
        ),
    ]
}

pub fn script_from(lines: Vec<String>) -> Script {
    Script::Lines(lines.into_iter().map(Ok).collect())
}
