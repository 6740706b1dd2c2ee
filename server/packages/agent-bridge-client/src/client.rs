use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use url::Url;

use crate::context::current_conversation_id;
use crate::types::{ChatRequestBody, ChatResult, Content, Request, Response, Role, StopReason, Usage};

pub const DEFAULT_CONTEXT_WINDOW: u64 = 200_000;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no user message found in request")]
    NoUserMessage,
    #[error("invalid bridge url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("bridge request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("bridge returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to decode bridge response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("bridge error: {}", .0.result)]
    Bridge(ChatResult),
}

/// The calling application's model-service seam.
#[async_trait]
pub trait ChatService: Send + Sync {
    async fn complete(&self, request: &Request) -> Result<Response, ClientError>;

    fn token_context_window(&self) -> u64;

    fn max_image_dimension(&self) -> u32;
}

/// Sends the newest user message of a chat history to an agent bridge,
/// tagged with the ambient conversation id.
#[derive(Debug, Clone)]
pub struct BridgeClient {
    http: reqwest::Client,
    base_url: Url,
    model: Option<String>,
    working_dir: Option<String>,
    context_window: u64,
}

impl BridgeClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: Url::parse(base_url)?,
            model: None,
            working_dir: None,
            context_window: DEFAULT_CONTEXT_WINDOW,
        })
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Backend selector forwarded as `model`, e.g. `claude-code` or `codex`.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_working_dir(mut self, working_dir: impl Into<String>) -> Self {
        self.working_dir = Some(working_dir.into());
        self
    }

    pub fn with_context_window(mut self, context_window: u64) -> Self {
        self.context_window = context_window;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn chat_url(&self) -> Result<Url, ClientError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| ClientError::InvalidUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase))?;
            segments.pop_if_empty().push("chat");
        }
        Ok(url)
    }

    pub async fn complete(&self, request: &Request) -> Result<Response, ClientError> {
        let message = request.last_user_text().ok_or(ClientError::NoUserMessage)?;
        let conversation_id = current_conversation_id();
        let body = ChatRequestBody {
            conversation_id: &conversation_id,
            message,
            working_dir: self.working_dir.as_deref(),
            model: self.model.as_deref(),
        };

        let start_time = Utc::now();
        tracing::debug!(
            conversation_id = %conversation_id,
            model = ?self.model,
            "sending bridge chat turn"
        );
        let response = self.http.post(self.chat_url()?).json(&body).send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        let result: ChatResult = serde_json::from_slice(&bytes)?;
        if result.is_error {
            tracing::warn!(
                conversation_id = %conversation_id,
                error = %result.result,
                "bridge reported an error"
            );
            return Err(ClientError::Bridge(result));
        }
        let end_time = Utc::now();

        let (input_tokens, output_tokens) = if result.compacted {
            // Compacted: report a full context window.
            (self.token_context_window(), 0)
        } else {
            (result.usage.input_tokens, result.usage.output_tokens)
        };

        Ok(Response {
            role: Role::Assistant,
            content: vec![Content::text(result.result)],
            stop_reason: StopReason::EndTurn,
            usage: Usage {
                input_tokens,
                output_tokens,
                start_time: Some(start_time),
                end_time: Some(end_time),
            },
        })
    }

    pub fn token_context_window(&self) -> u64 {
        self.context_window
    }

    /// Images are handled by the backend agent, never resized client-side.
    pub fn max_image_dimension(&self) -> u32 {
        0
    }
}

#[async_trait]
impl ChatService for BridgeClient {
    async fn complete(&self, request: &Request) -> Result<Response, ClientError> {
        BridgeClient::complete(self, request).await
    }

    fn token_context_window(&self) -> u64 {
        BridgeClient::token_context_window(self)
    }

    fn max_image_dimension(&self) -> u32 {
        BridgeClient::max_image_dimension(self)
    }
}
