use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agent_bridge_error::{BridgeError, ProblemDetails};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{OpenApi, ToSchema};

use crate::backends::{ChatRequest, ChatResult};
use crate::routing::BackendRouter;

#[derive(Debug, Clone)]
pub struct AppState {
    router: Arc<BackendRouter>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ChatRequestBody {
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    /// Defaults to the bridge's working directory.
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Backend selector, e.g. `claude-code` or `codex`.
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ChatResponse {
    pub result: String,
    pub session_id: String,
    pub usage: TokenUsage,
    pub is_error: bool,
    pub compacted: bool,
}

impl ChatResponse {
    fn error(message: impl Into<String>) -> Self {
        Self {
            result: message.into(),
            is_error: true,
            ..Self::default()
        }
    }
}

impl From<ChatResult> for ChatResponse {
    fn from(result: ChatResult) -> Self {
        Self {
            result: result.text,
            session_id: result.session_handle,
            usage: TokenUsage {
                input_tokens: result.usage.input_tokens,
                output_tokens: result.usage.output_tokens,
            },
            is_error: result.is_error,
            compacted: result.compacted,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub active_sessions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeleteSessionResponse {
    pub deleted: bool,
}

impl ChatRequestBody {
    fn into_chat_request(self) -> Result<ChatRequest, BridgeError> {
        let conversation_id = self
            .conversation_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| BridgeError::invalid_request("conversation_id is required"))?;
        let message = self
            .message
            .filter(|message| !message.trim().is_empty())
            .ok_or_else(|| BridgeError::invalid_request("message is required"))?;
        let working_dir = match self.working_dir.filter(|dir| !dir.trim().is_empty()) {
            Some(dir) => PathBuf::from(dir),
            None => std::env::current_dir().map_err(|err| {
                BridgeError::internal(format!("failed to resolve working directory: {err}"))
            })?,
        };
        Ok(ChatRequest {
            conversation_id,
            message,
            working_dir,
            model: self.model.filter(|model| !model.is_empty()),
        })
    }
}

pub fn build_router(router: Arc<BackendRouter>) -> Router {
    let state = Arc::new(AppState { router });

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %req.method(),
                uri = %req.uri()
            )
        })
        .on_request(|_req: &Request<_>, span: &Span| {
            tracing::debug!(parent: span, "request");
        })
        .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
            tracing::info!(
                parent: span,
                status = %res.status(),
                latency_ms = latency.as_millis()
            );
        });

    Router::new()
        .route("/health", get(get_health))
        .route("/chat", post(post_chat))
        .route("/sessions/:conversation_id", delete(delete_session))
        .route("/openapi.json", get(get_openapi))
        .fallback(not_found)
        .with_state(state)
        .layer(trace_layer)
}

#[derive(OpenApi)]
#[openapi(
    paths(get_health, post_chat, delete_session),
    components(
        schemas(
            ChatRequestBody,
            ChatResponse,
            TokenUsage,
            HealthResponse,
            DeleteSessionResponse,
            ProblemDetails
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "chat", description = "Chat turns"),
        (name = "sessions", description = "Session management")
    )
)]
pub struct ApiDoc;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match self {
            ApiError::Bridge(err) => err.into(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        active_sessions: state.router.active_sessions().await,
    })
}

/// Runs one turn. Backend failures are reported in-band with `is_error`
/// and a 200 status; only caller and bridge faults change the status code.
#[utoipa::path(
    post,
    path = "/chat",
    request_body = ChatRequestBody,
    responses(
        (status = 200, body = ChatResponse),
        (status = 400, body = ChatResponse),
        (status = 500, body = ChatResponse)
    ),
    tag = "chat"
)]
async fn post_chat(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ChatRequestBody>, JsonRejection>,
) -> (StatusCode, Json<ChatResponse>) {
    let request = match body
        .map_err(|rejection| BridgeError::invalid_request(rejection.body_text()))
        .and_then(|Json(body)| body.into_chat_request())
    {
        Ok(request) => request,
        Err(err) => {
            tracing::warn!(error = %err, "rejected chat request");
            return chat_error(err);
        }
    };

    let conversation_id = request.conversation_id.clone();
    let router = state.router.clone();
    // Detached from the request: a dropped caller must not cancel the turn.
    let turn = tokio::spawn(async move { router.chat(&request).await });

    match turn.await {
        Ok(result) => (StatusCode::OK, Json(result.into())),
        Err(err) => {
            tracing::error!(
                conversation_id = %conversation_id,
                error = %err,
                "chat turn task failed"
            );
            chat_error(BridgeError::internal(err.to_string()))
        }
    }
}

fn chat_error(err: BridgeError) -> (StatusCode, Json<ChatResponse>) {
    let status = StatusCode::from_u16(err.error_type().status_code())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ChatResponse::error(err.to_string())))
}

#[utoipa::path(
    delete,
    path = "/sessions/{conversation_id}",
    responses((status = 200, body = DeleteSessionResponse)),
    params(("conversation_id" = String, Path, description = "Caller conversation id")),
    tag = "sessions"
)]
async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
) -> Json<DeleteSessionResponse> {
    let deleted = state.router.delete_session(&conversation_id).await;
    tracing::info!(conversation_id = %conversation_id, deleted = deleted, "session delete");
    Json(DeleteSessionResponse { deleted })
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

async fn not_found(uri: Uri) -> ApiError {
    BridgeError::NotFound {
        path: uri.path().to_string(),
    }
    .into()
}
