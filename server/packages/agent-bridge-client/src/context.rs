use std::future::Future;

pub const DEFAULT_CONVERSATION_ID: &str = "default";

tokio::task_local! {
    static CONVERSATION_ID: String;
}

/// Runs `future` with `conversation_id` as the ambient conversation for any
/// bridge calls it makes.
pub async fn with_conversation_id<F>(conversation_id: impl Into<String>, future: F) -> F::Output
where
    F: Future,
{
    CONVERSATION_ID.scope(conversation_id.into(), future).await
}

/// The ambient conversation id, or [`DEFAULT_CONVERSATION_ID`] outside any
/// [`with_conversation_id`] scope or when the scoped id is empty.
pub fn current_conversation_id() -> String {
    CONVERSATION_ID
        .try_with(|id| id.clone())
        .ok()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| DEFAULT_CONVERSATION_ID.to_string())
}
