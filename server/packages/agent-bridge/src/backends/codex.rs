//! Codex CLI adapter.
//!
//! A turn is a single awaited `codex exec --json` run (or `codex exec resume
//! <thread>`). The JSONL output is folded after the run completes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agent_bridge_error::BridgeError;
use async_trait::async_trait;
use serde::Deserialize;

use super::{run_turn, BackendAdapter, BackendKind, ChatRequest, ChatResult, TurnState};
use crate::process::{AgentRunner, LaunchSpec};
use crate::sessions::SessionTable;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodexSettings {
    pub program: PathBuf,
    /// Value for `--sandbox`; `None` leaves the CLI default in place.
    pub sandbox: Option<String>,
    pub turn_timeout: Option<Duration>,
}

impl Default for CodexSettings {
    fn default() -> Self {
        Self {
            program: PathBuf::from("codex"),
            sandbox: Some("workspace-write".to_string()),
            turn_timeout: None,
        }
    }
}

impl CodexSettings {
    pub fn launch_spec(&self, request: &ChatRequest, resume: Option<&str>) -> LaunchSpec {
        let mut spec = LaunchSpec::new(&self.program, &request.working_dir)
            .args(["exec", "--json", "--skip-git-repo-check"]);
        if let Some(sandbox) = &self.sandbox {
            spec = spec.arg("--sandbox").arg(sandbox);
        }
        spec = match resume {
            Some(thread_id) => spec.arg("resume").arg(thread_id),
            None => spec
                .arg("--cd")
                .arg(request.working_dir.to_string_lossy().to_string()),
        };
        // "-" reads the prompt from stdin.
        spec.arg("-")
            .stdin(request.message.clone())
            .timeout(self.turn_timeout)
    }
}

#[derive(Debug)]
pub struct CodexAdapter {
    settings: CodexSettings,
    runner: Arc<dyn AgentRunner>,
    sessions: Arc<SessionTable>,
}

impl CodexAdapter {
    pub fn new(
        settings: CodexSettings,
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
        let backend = BackendKind::Codex.as_str();
        let spec = self.settings.launch_spec(request, resume.as_deref());

        let run = match self.runner.run_to_end(spec).await {
            Ok(run) => run,
            Err(err) => {
                let mut state = TurnState::default();
                state.fail(err.into_bridge_error(backend));
                return state;
            }
        };

        let mut state = run
            .lines
            .iter()
            .fold(TurnState::default(), |mut state, line| {
                apply_line(&mut state, line);
                state
            });
        if let Some(failure) = run.failure {
            state.fail(failure.into_bridge_error(backend));
        }
        state
    }
}

#[async_trait]
impl BackendAdapter for CodexAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Codex
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
#[serde(tag = "type")]
enum CodexEvent {
    #[serde(rename = "thread.started")]
    ThreadStarted {
        #[serde(default)]
        thread_id: Option<String>,
    },
    #[serde(rename = "thread.compacted")]
    ThreadCompacted,
    #[serde(rename = "item.started", alias = "item.updated")]
    ItemProgress { item: CodexItem },
    #[serde(rename = "item.completed")]
    ItemCompleted { item: CodexItem },
    #[serde(rename = "turn.completed")]
    TurnCompleted {
        #[serde(default)]
        usage: Option<CodexUsage>,
    },
    #[serde(rename = "turn.failed")]
    TurnFailed {
        #[serde(default)]
        error: Option<CodexErrorBody>,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct CodexItem {
    #[serde(rename = "type", alias = "item_type", default)]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

impl CodexItem {
    fn is_compaction(&self) -> bool {
        matches!(self.kind.as_str(), "context_compaction" | "compaction")
    }
}

#[derive(Debug, Default, Deserialize)]
struct CodexUsage {
    /// Already includes `cached_input_tokens`.
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct CodexErrorBody {
    #[serde(default)]
    message: Option<String>,
}

fn codex_failure(message: Option<String>) -> BridgeError {
    BridgeError::BackendFailed {
        backend: BackendKind::Codex.to_string(),
        message: message.unwrap_or_default(),
    }
}

pub(crate) fn apply_line(state: &mut TurnState, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let event = match serde_json::from_str::<CodexEvent>(line) {
        Ok(event) => event,
        Err(err) => {
            tracing::debug!(error = %err, line = %line, "skipping unparseable codex event");
            return;
        }
    };

    match event {
        CodexEvent::ThreadStarted { thread_id } => state.capture_handle(thread_id.as_deref()),
        CodexEvent::ThreadCompacted => state.compacted = true,
        CodexEvent::ItemProgress { item } => {
            if item.is_compaction() {
                state.compacted = true;
            }
        }
        CodexEvent::ItemCompleted { item } => {
            if item.is_compaction() {
                state.compacted = true;
            } else if item.kind == "agent_message" {
                state.set_text(item.text.as_deref().unwrap_or_default());
            }
        }
        CodexEvent::TurnCompleted { usage } => {
            if let Some(usage) = usage {
                state.usage.input_tokens += usage.input_tokens;
                state.usage.output_tokens += usage.output_tokens;
            }
            state.pending_error = None;
            state.completed = true;
        }
        CodexEvent::TurnFailed { error } => {
            let message = error
                .and_then(|error| error.message)
                .filter(|message| !message.trim().is_empty());
            let failure = match message {
                Some(message) => codex_failure(Some(message)),
                None => state
                    .pending_error
                    .take()
                    .unwrap_or_else(|| codex_failure(None)),
            };
            state.failure = Some(failure);
            state.pending_error = None;
            state.completed = true;
        }
        CodexEvent::Error { message } => {
            // Retry notices also arrive as `error`; only `turn.failed` is fatal.
            if state.pending_error.is_none() && !state.completed {
                state.pending_error = Some(codex_failure(message));
            }
        }
        CodexEvent::Other => {}
    }
}
