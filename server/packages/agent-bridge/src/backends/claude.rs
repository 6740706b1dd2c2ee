//! Claude Code CLI adapter.
//!
//! Runs `claude -p --output-format stream-json` once per turn and folds the
//! newline-delimited event stream as it arrives:
//! - `system`/`init` carries the session id used with `--resume`
//! - `system`/`compact_boundary` marks a context compaction
//! - `assistant` messages carry provisional text
//! - `result` carries the authoritative text, usage and error state

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agent_bridge_error::BridgeError;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;

use super::{run_turn, BackendAdapter, BackendKind, ChatRequest, ChatResult, TurnState, Usage};
use crate::process::{AgentRunner, LaunchSpec};
use crate::sessions::SessionTable;

pub const DEFAULT_ALLOWED_TOOLS: &[&str] = &[
    "Bash",
    "Read",
    "Write",
    "Edit",
    "Glob",
    "Grep",
    "WebFetch",
    "WebSearch",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaudeSettings {
    pub program: PathBuf,
    pub allowed_tools: Vec<String>,
    pub turn_timeout: Option<Duration>,
}

impl Default for ClaudeSettings {
    fn default() -> Self {
        Self {
            program: PathBuf::from("claude"),
            allowed_tools: DEFAULT_ALLOWED_TOOLS.iter().map(|tool| tool.to_string()).collect(),
            turn_timeout: None,
        }
    }
}

impl ClaudeSettings {
    pub fn launch_spec(&self, request: &ChatRequest, resume: Option<&str>) -> LaunchSpec {
        let mut spec = LaunchSpec::new(&self.program, &request.working_dir)
            .args(["-p", "--output-format", "stream-json", "--verbose"]);
        if !self.allowed_tools.is_empty() {
            spec = spec.arg("--allowedTools").arg(self.allowed_tools.join(","));
        }
        if let Some(handle) = resume {
            spec = spec.arg("--resume").arg(handle);
        }
        spec.stdin(request.message.clone()).timeout(self.turn_timeout)
    }
}

#[derive(Debug)]
pub struct ClaudeAdapter {
    settings: ClaudeSettings,
    runner: Arc<dyn AgentRunner>,
    sessions: Arc<SessionTable>,
}

impl ClaudeAdapter {
    pub fn new(
        settings: ClaudeSettings,
        runner: Arc<dyn AgentRunner>,
        sessions: Arc<SessionTable>,
    ) -> Self {
        Self {
            settings,
            runner,
            sessions,
        }
    }

    async fn invoke(&self, request: &ChatRequest, resume: Option<String>) -> TurnState {
        let backend = BackendKind::ClaudeCode.as_str();
        let spec = self.settings.launch_spec(request, resume.as_deref());

        let stream = match self.runner.spawn(spec).await {
            Ok(stream) => stream,
            Err(err) => {
                let mut state = TurnState::default();
                state.fail(err.into_bridge_error(backend));
                return state;
            }
        };

        stream
            .fold(TurnState::default(), |mut state, item| async move {
                match item {
                    Ok(line) => apply_line(&mut state, &line),
                    Err(err) => state.fail(err.into_bridge_error(backend)),
                }
                state
            })
            .await
    }
}

#[async_trait]
impl BackendAdapter for ClaudeAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::ClaudeCode
    }

    async fn chat(&self, request: &ChatRequest) -> ChatResult {
        run_turn(self.kind(), &self.sessions, request, |resume| {
            self.invoke(request, resume)
        })
        .await
    }

    async fn delete_session(&self, conversation_id: &str) -> bool {
        self.sessions.delete(conversation_id).await
    }

    async fn active_sessions(&self) -> usize {
        self.sessions.count().await
    }

    async fn sweep_idle(&self, threshold: Duration) -> usize {
        self.sessions.sweep_idle(threshold).await
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClaudeEvent {
    System(SystemEvent),
    Assistant(AssistantEvent),
    Result(ResultEvent),
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct SystemEvent {
    #[serde(default)]
    subtype: String,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AssistantEvent {
    #[serde(default)]
    message: Option<AssistantMessage>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ResultEvent {
    #[serde(default)]
    subtype: String,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    usage: Option<ResultUsage>,
    #[serde(default)]
    errors: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ResultUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl ResultUsage {
    /// Cached prompt tokens count as input.
    fn to_usage(&self) -> Usage {
        Usage {
            input_tokens: self.input_tokens
                + self.cache_creation_input_tokens
                + self.cache_read_input_tokens,
            output_tokens: self.output_tokens,
        }
    }
}

pub(crate) fn apply_line(state: &mut TurnState, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let event = match serde_json::from_str::<ClaudeEvent>(line) {
        Ok(event) => event,
        Err(err) => {
            tracing::debug!(error = %err, line = %line, "skipping unparseable claude event");
            return;
        }
    };

    match event {
        ClaudeEvent::System(system) => match system.subtype.as_str() {
            "init" => state.capture_handle(system.session_id.as_deref()),
            "compact_boundary" => {
                tracing::info!(session_id = ?system.session_id, "claude compacted its context");
                state.compacted = true;
            }
            _ => {}
        },
        ClaudeEvent::Assistant(assistant) => {
            state.capture_handle(assistant.session_id.as_deref());
            let text = assistant
                .message
                .map(|message| {
                    message
                        .content
                        .into_iter()
                        .filter_map(|block| match block {
                            ContentBlock::Text { text } => Some(text),
                            ContentBlock::Other => None,
                        })
                        .collect::<Vec<_>>()
                        .join("")
                })
                .unwrap_or_default();
            state.set_text(&text);
        }
        ClaudeEvent::Result(result) => {
            state.capture_handle(result.session_id.as_deref());
            if let Some(usage) = &result.usage {
                state.usage = usage.to_usage();
            }
            let text = result.result.unwrap_or_default();
            state.set_text(&text);
            if result.is_error {
                let message = if !text.is_empty() {
                    text
                } else if !result.errors.is_empty() {
                    result.errors.join("; ")
                } else {
                    result.subtype.replace('_', " ")
                };
                state.failure = Some(BridgeError::BackendFailed {
                    backend: BackendKind::ClaudeCode.to_string(),
                    message,
                });
            }
            state.completed = true;
        }
        ClaudeEvent::Other => {}
    }
}
