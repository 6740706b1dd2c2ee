use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct SessionEntry {
    handle: String,
    last_activity: Instant,
}

/// Maps a caller conversation id to the backend's own session handle.
///
/// Each backend adapter owns one table. Reads count as activity, so an entry
/// is only reaped once it has been neither read nor written for longer than
/// the idle threshold.
#[derive(Debug, Default)]
pub struct SessionTable {
    entries: Mutex<HashMap<String, SessionEntry>>,
    turn_locks: Option<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table that hands out one turn at a time per conversation id.
    pub fn with_turn_serialization() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            turn_locks: Some(Mutex::new(HashMap::new())),
        }
    }

    pub fn serializes_turns(&self) -> bool {
        self.turn_locks.is_some()
    }

    pub async fn get(&self, conversation_id: &str) -> Option<String> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(conversation_id)?;
        entry.last_activity = Instant::now();
        Some(entry.handle.clone())
    }

    /// Installs `handle` for the conversation, replacing any previous handle.
    /// Empty handles are ignored.
    pub async fn set(&self, conversation_id: &str, handle: impl Into<String>) {
        let handle = handle.into();
        if handle.is_empty() {
            return;
        }
        self.entries.lock().await.insert(
            conversation_id.to_string(),
            SessionEntry {
                handle,
                last_activity: Instant::now(),
            },
        );
    }

    pub async fn delete(&self, conversation_id: &str) -> bool {
        self.entries.lock().await.remove(conversation_id).is_some()
    }

    pub async fn count(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Removes entries idle for strictly longer than `threshold`.
    pub async fn sweep_idle(&self, threshold: Duration) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| now.duration_since(entry.last_activity) <= threshold);
        let removed = before - entries.len();

        if let Some(turn_locks) = &self.turn_locks {
            turn_locks
                .lock()
                .await
                .retain(|id, lock| Arc::strong_count(lock) > 1 || entries.contains_key(id));
        }
        removed
    }

    /// Waits for exclusive use of the conversation when turn serialization is
    /// enabled. The returned guard must be held across lookup, backend call and
    /// write-back.
    pub async fn begin_turn(&self, conversation_id: &str) -> Option<OwnedMutexGuard<()>> {
        let turn_locks = self.turn_locks.as_ref()?;
        let lock = turn_locks
            .lock()
            .await
            .entry(conversation_id.to_string())
            .or_default()
            .clone();
        Some(lock.lock_owned().await)
    }
}
