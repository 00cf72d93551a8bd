use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

/// Per-recipient backlog of serialized events that could not be delivered live.
///
/// Process-lifetime only: the durable history lives in the conversation store.
#[derive(Clone, Default)]
pub struct OfflineQueue {
    inner: Arc<Mutex<HashMap<String, Vec<String>>>>,
}

impl OfflineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enqueue(&self, identity: &str, line: String) {
        let mut queues = self.inner.lock().await;
        let queue = queues.entry(identity.to_string()).or_default();
        queue.push(line);
        debug!("Queued message for {} ({} pending)", identity, queue.len());
    }

    /// Take the whole backlog in one step, leaving nothing behind.
    pub async fn drain_and_clear(&self, identity: &str) -> Vec<String> {
        self.inner
            .lock()
            .await
            .remove(identity)
            .unwrap_or_default()
    }

    pub async fn pending(&self, identity: &str) -> usize {
        self.inner
            .lock()
            .await
            .get(identity)
            .map_or(0, Vec::len)
    }
}
