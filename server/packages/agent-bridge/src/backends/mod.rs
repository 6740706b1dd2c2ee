//! Backend adapters: one per coding-agent kind, each folding its backend's
//! output into a [`ChatResult`].

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use agent_bridge_error::BridgeError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::sessions::SessionTable;

pub mod claude;
pub mod codex;

pub use claude::{ClaudeAdapter, ClaudeSettings};
pub use codex::{CodexAdapter, CodexSettings};

const GENERIC_FAILURE: &str = "backend request failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    ClaudeCode,
    Codex,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::ClaudeCode => "claude-code",
            BackendKind::Codex => "codex",
        }
    }

    pub fn all() -> [BackendKind; 2] {
        [BackendKind::ClaudeCode, BackendKind::Codex]
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "claude-code" | "claude" => Ok(BackendKind::ClaudeCode),
            "codex" => Ok(BackendKind::Codex),
            other => Err(format!(
                "unknown backend `{other}` (expected `claude-code` or `codex`)"
            )),
        }
    }
}

/// A validated chat turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    pub conversation_id: String,
    pub message: String,
    pub working_dir: PathBuf,
    /// Routing selector only; never passed to the backend as its model.
    pub model: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatResult {
    pub text: String,
    pub session_handle: String,
    pub usage: Usage,
    pub is_error: bool,
    pub compacted: bool,
}

impl ChatResult {
    pub fn error(text: impl Into<String>, session_handle: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            session_handle: session_handle.into(),
            is_error: true,
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait BackendAdapter: Send + Sync + fmt::Debug {
    fn kind(&self) -> BackendKind;

    /// Runs one turn. Failures come back as error-flagged results.
    async fn chat(&self, request: &ChatRequest) -> ChatResult;

    async fn delete_session(&self, conversation_id: &str) -> bool;

    async fn active_sessions(&self) -> usize;

    async fn sweep_idle(&self, threshold: Duration) -> usize;
}

/// Accumulator a backend's output is folded into.
#[derive(Debug, Default)]
pub(crate) struct TurnState {
    pub text: String,
    pub handle: Option<String>,
    pub usage: Usage,
    pub compacted: bool,
    /// A result-bearing terminal event was seen.
    pub completed: bool,
    pub failure: Option<BridgeError>,
    /// Non-fatal error reported mid-run. Discarded by a completed turn and
    /// reported only if the run ends without a terminal event.
    pub pending_error: Option<BridgeError>,
}

impl TurnState {
    pub fn capture_handle(&mut self, handle: Option<&str>) {
        if let Some(handle) = handle.filter(|handle| !handle.is_empty()) {
            self.handle = Some(handle.to_string());
        }
    }

    pub fn set_text(&mut self, text: &str) {
        if !text.is_empty() {
            self.text = text.to_string();
        }
    }

    /// Records an abnormal end of the backend run. Ignored once a terminal
    /// event has arrived; the first failure wins.
    pub fn fail(&mut self, error: BridgeError) {
        if self.completed {
            tracing::debug!(error = %error, "ignoring backend failure after terminal event");
            return;
        }
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }
}

/// Shared turn lifecycle: lookup, invoke, write back, error isolation.
pub(crate) async fn run_turn<F, Fut>(
    kind: BackendKind,
    sessions: &SessionTable,
    request: &ChatRequest,
    invoke: F,
) -> ChatResult
where
    F: FnOnce(Option<String>) -> Fut,
    Fut: std::future::Future<Output = TurnState>,
{
    let _turn = sessions.begin_turn(&request.conversation_id).await;
    let started = Instant::now();
    let prior = sessions.get(&request.conversation_id).await;
    let resumed = prior.is_some();

    let state = invoke(prior.clone()).await;

    if state.completed {
        if let Some(handle) = &state.handle {
            sessions.set(&request.conversation_id, handle.clone()).await;
        }
    }

    let session_handle = state
        .handle
        .clone()
        .or(prior)
        .unwrap_or_default();

    let failure = match state.failure {
        Some(failure) => Some(failure),
        None if !state.completed => Some(state.pending_error.unwrap_or_else(|| {
            BridgeError::MalformedOutput {
                backend: kind.to_string(),
                message: "backend ended the turn without a result".to_string(),
            }
        })),
        None => None,
    };

    let result = match failure {
        None => ChatResult {
            text: state.text,
            session_handle,
            usage: state.usage,
            is_error: false,
            compacted: state.compacted,
        },
        Some(failure) => {
            let description = failure.describe();
            tracing::warn!(
                backend = %kind,
                conversation_id = %request.conversation_id,
                error = %description,
                "backend turn failed"
            );
            ChatResult {
                text: if description.trim().is_empty() {
                    GENERIC_FAILURE.to_string()
                } else {
                    description
                },
                session_handle,
                usage: state.usage,
                is_error: true,
                compacted: state.compacted,
            }
        }
    };

    tracing::info!(
        backend = %kind,
        conversation_id = %request.conversation_id,
        resumed = resumed,
        session_handle = %result.session_handle,
        input_tokens = result.usage.input_tokens,
        output_tokens = result.usage.output_tokens,
        compacted = result.compacted,
        is_error = result.is_error,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "backend turn finished"
    );

    result
}

/// Builds the adapter for `kind` around a shared runner.
pub fn build_adapter(
    kind: BackendKind,
    runner: Arc<dyn crate::process::AgentRunner>,
    sessions: Arc<SessionTable>,
    claude: &ClaudeSettings,
    codex: &CodexSettings,
) -> Arc<dyn BackendAdapter> {
    match kind {
        BackendKind::ClaudeCode => Arc::new(ClaudeAdapter::new(claude.clone(), runner, sessions)),
        BackendKind::Codex => Arc::new(CodexAdapter::new(codex.clone(), runner, sessions)),
    }
}
