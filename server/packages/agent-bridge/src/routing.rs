use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::backends::{BackendAdapter, BackendKind, ChatRequest, ChatResult};
use crate::config::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorMatch {
    Exact(String),
    Prefix(String),
}

impl SelectorMatch {
    fn matches(&self, selector: &str) -> bool {
        match self {
            SelectorMatch::Exact(value) => selector == value,
            SelectorMatch::Prefix(prefix) => selector.starts_with(prefix.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    pub matcher: SelectorMatch,
    pub backend: BackendKind,
}

impl RouteRule {
    pub fn exact(value: impl Into<String>, backend: BackendKind) -> Self {
        Self {
            matcher: SelectorMatch::Exact(value.into()),
            backend,
        }
    }

    pub fn prefix(prefix: impl Into<String>, backend: BackendKind) -> Self {
        Self {
            matcher: SelectorMatch::Prefix(prefix.into()),
            backend,
        }
    }
}

pub fn default_rules() -> Vec<RouteRule> {
    vec![
        RouteRule::exact("claude-code", BackendKind::ClaudeCode),
        RouteRule::prefix("claude", BackendKind::ClaudeCode),
        RouteRule::exact("codex", BackendKind::Codex),
        RouteRule::prefix("codex-", BackendKind::Codex),
    ]
}

/// Dispatches turns to adapters by model selector and fans session
/// management out across every registered adapter.
#[derive(Debug)]
pub struct BackendRouter {
    rules: Vec<RouteRule>,
    default_backend: BackendKind,
    adapters: BTreeMap<BackendKind, Arc<dyn BackendAdapter>>,
}

impl BackendRouter {
    pub fn new(
        adapters: Vec<Arc<dyn BackendAdapter>>,
        rules: Vec<RouteRule>,
        default_backend: BackendKind,
    ) -> Result<Self, ConfigError> {
        let adapters: BTreeMap<_, _> = adapters
            .into_iter()
            .map(|adapter| (adapter.kind(), adapter))
            .collect();
        if !adapters.contains_key(&default_backend) {
            return Err(ConfigError::DefaultBackendDisabled(default_backend));
        }
        Ok(Self {
            rules,
            default_backend,
            adapters,
        })
    }

    pub fn default_backend(&self) -> BackendKind {
        self.default_backend
    }

    /// The first matching rule decides. No match, or a match naming a
    /// backend that is not registered, selects the default backend.
    pub fn select(&self, selector: Option<&str>) -> BackendKind {
        let Some(selector) = selector.filter(|selector| !selector.is_empty()) else {
            return self.default_backend;
        };
        self.rules
            .iter()
            .find(|rule| rule.matcher.matches(selector))
            .map(|rule| rule.backend)
            .filter(|kind| self.adapters.contains_key(kind))
            .unwrap_or(self.default_backend)
    }

    pub fn adapter(&self, kind: BackendKind) -> Option<&Arc<dyn BackendAdapter>> {
        self.adapters.get(&kind)
    }

    pub fn adapters(&self) -> impl Iterator<Item = &Arc<dyn BackendAdapter>> {
        self.adapters.values()
    }

    pub async fn chat(&self, request: &ChatRequest) -> ChatResult {
        let kind = self.select(request.model.as_deref());
        tracing::debug!(
            conversation_id = %request.conversation_id,
            selector = ?request.model,
            backend = %kind,
            "routing chat turn"
        );
        match self.adapters.get(&kind) {
            Some(adapter) => adapter.chat(request).await,
            // Unreachable: `select` only returns registered kinds.
            None => ChatResult::error(format!("backend {kind} is not enabled"), ""),
        }
    }

    /// Deletes the conversation from every adapter. True if any held it.
    pub async fn delete_session(&self, conversation_id: &str) -> bool {
        let mut deleted = false;
        for adapter in self.adapters.values() {
            deleted |= adapter.delete_session(conversation_id).await;
        }
        deleted
    }

    pub async fn active_sessions(&self) -> usize {
        let mut total = 0;
        for adapter in self.adapters.values() {
            total += adapter.active_sessions().await;
        }
        total
    }

    pub async fn sweep_idle(&self, threshold: Duration) -> usize {
        let mut removed = 0;
        for adapter in self.adapters.values() {
            let count = adapter.sweep_idle(threshold).await;
            if count > 0 {
                tracing::debug!(backend = %adapter.kind(), removed = count, "swept idle sessions");
            }
            removed += count;
        }
        removed
    }
}
