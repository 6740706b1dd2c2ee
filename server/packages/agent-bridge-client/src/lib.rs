//! Caller-side client for agent-bridge.
//!
//! Converts a chat history into a single bridge turn keyed by the ambient
//! conversation id (see [`with_conversation_id`]) and maps the reply back
//! into the caller's response shape.

pub mod client;
pub mod context;
pub mod types;

pub use client::{BridgeClient, ChatService, ClientError, DEFAULT_CONTEXT_WINDOW};
pub use context::{current_conversation_id, with_conversation_id, DEFAULT_CONVERSATION_ID};
pub use types::{BridgeUsage, ChatResult, Content, Message, Request, Response, Role, StopReason, Usage};
