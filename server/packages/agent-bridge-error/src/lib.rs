use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    NotFound,
    BackendUnavailable,
    BackendExited,
    BackendFailed,
    MalformedOutput,
    Timeout,
    Internal,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:agent-bridge:error:invalid_request",
            Self::NotFound => "urn:agent-bridge:error:not_found",
            Self::BackendUnavailable => "urn:agent-bridge:error:backend_unavailable",
            Self::BackendExited => "urn:agent-bridge:error:backend_exited",
            Self::BackendFailed => "urn:agent-bridge:error:backend_failed",
            Self::MalformedOutput => "urn:agent-bridge:error:malformed_output",
            Self::Timeout => "urn:agent-bridge:error:timeout",
            Self::Internal => "urn:agent-bridge:error:internal",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::NotFound => "Not Found",
            Self::BackendUnavailable => "Backend Unavailable",
            Self::BackendExited => "Backend Exited",
            Self::BackendFailed => "Backend Failed",
            Self::MalformedOutput => "Malformed Backend Output",
            Self::Timeout => "Timeout",
            Self::Internal => "Internal Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::NotFound => 404,
            Self::BackendUnavailable => 502,
            Self::BackendExited => 502,
            Self::BackendFailed => 502,
            Self::MalformedOutput => 502,
            Self::Timeout => 504,
            Self::Internal => 500,
        }
    }
}

/// RFC 7807 problem document returned for non-chat failures.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("not found: {path}")]
    NotFound { path: String },
    #[error("failed to start {backend}: {message}")]
    BackendUnavailable { backend: String, message: String },
    #[error("{backend} exited unexpectedly ({status})")]
    BackendExited {
        backend: String,
        status: String,
        stderr: Option<String>,
    },
    /// An error the backend itself reported; the message is shown verbatim.
    #[error("{message}")]
    BackendFailed { backend: String, message: String },
    #[error("malformed {backend} output: {message}")]
    MalformedOutput { backend: String, message: String },
    #[error("{backend} turn timed out after {seconds}s")]
    Timeout { backend: String, seconds: u64 },
    #[error("internal error")]
    Internal { message: String },
}

impl BridgeError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::NotFound { .. } => ErrorType::NotFound,
            Self::BackendUnavailable { .. } => ErrorType::BackendUnavailable,
            Self::BackendExited { .. } => ErrorType::BackendExited,
            Self::BackendFailed { .. } => ErrorType::BackendFailed,
            Self::MalformedOutput { .. } => ErrorType::MalformedOutput,
            Self::Timeout { .. } => ErrorType::Timeout,
            Self::Internal { .. } => ErrorType::Internal,
        }
    }

    /// Backend name the error is attributed to, if any.
    pub fn backend(&self) -> Option<&str> {
        match self {
            Self::BackendUnavailable { backend, .. }
            | Self::BackendExited { backend, .. }
            | Self::BackendFailed { backend, .. }
            | Self::MalformedOutput { backend, .. }
            | Self::Timeout { backend, .. } => Some(backend),
            Self::InvalidRequest { .. } | Self::NotFound { .. } | Self::Internal { .. } => None,
        }
    }

    /// Human-readable description for a chat result, with the backend's
    /// stderr tail appended when the process died.
    pub fn describe(&self) -> String {
        match self {
            Self::BackendExited {
                stderr: Some(stderr),
                ..
            } if !stderr.trim().is_empty() => format!("{self}: {}", stderr.trim()),
            _ => self.to_string(),
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));

        let mut extensions = Map::new();
        if let Some(backend) = self.backend() {
            extensions.insert("backend".to_string(), Value::String(backend.to_string()));
        }
        if let Self::BackendExited {
            stderr: Some(stderr),
            ..
        } = self
        {
            let mut details = Map::new();
            details.insert("stderr".to_string(), Value::String(stderr.clone()));
            extensions.insert("details".to_string(), Value::Object(details));
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<BridgeError> for ProblemDetails {
    fn from(value: BridgeError) -> Self {
        value.to_problem_details()
    }
}
