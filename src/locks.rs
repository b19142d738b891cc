//! Per-key mutual exclusion.
//!
//! Two jobs for the same file, or two batches for the same collector
//! session, must never run concurrently. [`KeyedLocks`] hands out one async
//! mutex per key; jobs for different keys proceed in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

/// Lock key for a watched or uploaded file.
pub fn file_key(path: &std::path::Path) -> String {
    format!("file:{}", path.display())
}

/// Lock key for a stored conversation.
pub fn conversation_key(source: &str, external_id: &str) -> String {
    format!("conversation:{}:{}", source, external_id)
}

/// Lock key for a collector session.
pub fn session_key(collector_id: &str, session_id: &str) -> String {
    format!("session:{}:{}", collector_id, session_id)
}

#[derive(Clone, Default)]
pub struct KeyedLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

/// Proof that the holder owns the lock for `key`. Released on drop.
pub struct KeyGuard {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn acquire(&self, key: &str) -> KeyGuard {
        let mutex = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            // Entries only the map references are idle.
            map.retain(|k, m| k == key || Arc::strong_count(m) > 1);
            map.entry(key.to_string()).or_default().clone()
        };
        KeyGuard {
            key: key.to_string(),
            _guard: mutex.lock_owned().await,
        }
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
