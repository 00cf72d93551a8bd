use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use courier_types::models::Message;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Time between scans of the cache.
    pub interval: Duration,
    /// Resends before a message is given up on.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryEntry {
    pub message: Message,
    pub retry_count: u32,
}

/// Outcome of one scan for a single entry.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryAction {
    Resend(Message),
    /// Retry ceiling reached; the entry is gone from the cache.
    Failed(Message),
}

/// Sent-but-unconfirmed messages, resent on a timer until a receipt arrives.
///
/// With a backing file the cache is written through on every change and
/// reloaded on startup, so unconfirmed messages survive a restart.
#[derive(Clone)]
pub struct RetryCache {
    entries: Arc<Mutex<Vec<RetryEntry>>>,
    path: Option<PathBuf>,
    config: RetryConfig,
}

impl RetryCache {
    /// Memory-only cache.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            path: None,
            config,
        }
    }

    /// `<dir>/retry_cache_<identity>.json`
    pub fn path_for(dir: &Path, identity: &str) -> PathBuf {
        let safe: String = identity
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '@' | '.' | '-' | '_' => c,
                _ => '_',
            })
            .collect();
        dir.join(format!("retry_cache_{}.json", safe))
    }

    /// Open a file-backed cache. A missing file is an empty cache; a corrupt
    /// one is logged and replaced on the next write.
    pub async fn load(path: PathBuf, config: RetryConfig) -> Result<Self> {
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Vec<RetryEntry>>(&bytes) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Ignoring corrupt retry cache {}: {}", path.display(), e);
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        if !entries.is_empty() {
            info!("Loaded {} unconfirmed messages from {}", entries.len(), path.display());
        }
        Ok(Self {
            entries: Arc::new(Mutex::new(entries)),
            path: Some(path),
            config,
        })
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Track a freshly sent message. Caching the same id again resets its count.
    pub async fn cache_message(&self, message: Message) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.retain(|entry| entry.message.id != message.id);
        debug!("Caching {} for retry", message.id);
        entries.push(RetryEntry {
            message,
            retry_count: 0,
        });
        self.persist(&entries).await
    }

    /// Drop a confirmed message. Returns whether it was still cached; unknown
    /// ids are fine since receipts can arrive more than once.
    pub async fn remove_delivered_message(&self, message_id: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|entry| entry.message.id != message_id);
        if entries.len() == before {
            return Ok(false);
        }
        debug!("{} confirmed, removed from retry cache", message_id);
        self.persist(&entries).await?;
        Ok(true)
    }

    /// One scan: bump and resend entries under the ceiling, expel the rest.
    pub async fn tick(&self) -> Result<Vec<RetryAction>> {
        let mut entries = self.entries.lock().await;
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut actions = Vec::with_capacity(entries.len());
        let max_attempts = self.config.max_attempts;
        entries.retain_mut(|entry| {
            if entry.retry_count < max_attempts {
                entry.retry_count += 1;
                actions.push(RetryAction::Resend(entry.message.clone()));
                true
            } else {
                warn!(
                    "Giving up on {} after {} attempts",
                    entry.message.id, entry.retry_count
                );
                actions.push(RetryAction::Failed(entry.message.clone()));
                false
            }
        });

        self.persist(&entries).await?;
        Ok(actions)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn contains(&self, message_id: &str) -> bool {
        self.entries
            .lock()
            .await
            .iter()
            .any(|entry| entry.message.id == message_id)
    }

    pub async fn entries(&self) -> Vec<RetryEntry> {
        self.entries.lock().await.clone()
    }

    /// Run [`tick`](Self::tick) every `interval` until the handle is aborted.
    pub fn spawn<F>(&self, mut on_action: F) -> JoinHandle<()>
    where
        F: FnMut(RetryAction) + Send + 'static,
    {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cache.config.interval);
            interval.tick().await;

            loop {
                interval.tick().await;
                match cache.tick().await {
                    Ok(actions) => actions.into_iter().for_each(&mut on_action),
                    Err(e) => warn!("Retry scan failed: {}", e),
                }
            }
        })
    }

    /// Write-then-rename so a crash mid-write never leaves a truncated file.
    async fn persist(&self, entries: &[RetryEntry]) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(entries)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            interval: Duration::from_millis(20),
            max_attempts,
        }
    }

    #[tokio::test]
    async fn resends_until_ceiling_then_fails_once() {
        let cache = RetryCache::new(config(3));
        let msg = Message::direct("a", "b", "hello");
        cache.cache_message(msg.clone()).await.unwrap();

        for attempt in 1..=3 {
            assert_eq!(cache.tick().await.unwrap(), vec![RetryAction::Resend(msg.clone())]);
            assert_eq!(cache.entries().await[0].retry_count, attempt);
        }

        assert_eq!(cache.tick().await.unwrap(), vec![RetryAction::Failed(msg.clone())]);
        assert!(!cache.contains(&msg.id).await);
        assert!(cache.tick().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn removal_is_idempotent() {
        let cache = RetryCache::new(config(5));
        let msg = Message::direct("a", "b", "hello");
        cache.cache_message(msg.clone()).await.unwrap();

        assert!(cache.remove_delivered_message(&msg.id).await.unwrap());
        assert!(!cache.remove_delivered_message(&msg.id).await.unwrap());
        assert!(!cache.remove_delivered_message("never-cached").await.unwrap());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn recaching_resets_the_count() {
        let cache = RetryCache::new(config(5));
        let msg = Message::direct("a", "b", "hello");
        cache.cache_message(msg.clone()).await.unwrap();
        cache.tick().await.unwrap();
        cache.cache_message(msg.clone()).await.unwrap();

        let entries = cache.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].retry_count, 0);
    }

    #[tokio::test]
    async fn survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = RetryCache::path_for(dir.path(), "alice@example.com");
        assert!(path.ends_with("retry_cache_alice@example.com.json"));

        let msg = Message::direct("alice@example.com", "bob@example.com", "hello");
        {
            let cache = RetryCache::load(path.clone(), config(5)).await.unwrap();
            cache.cache_message(msg.clone()).await.unwrap();
            cache.tick().await.unwrap();
        }

        let reloaded = RetryCache::load(path.clone(), config(5)).await.unwrap();
        assert_eq!(
            reloaded.entries().await,
            vec![RetryEntry {
                message: msg.clone(),
                retry_count: 1
            }]
        );

        reloaded.remove_delivered_message(&msg.id).await.unwrap();
        let emptied = RetryCache::load(path, config(5)).await.unwrap();
        assert!(emptied.is_empty().await);
    }

    #[tokio::test]
    async fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = RetryCache::path_for(dir.path(), "../odd/name");
        assert_eq!(path.parent(), Some(dir.path()));
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let cache = RetryCache::load(path, config(5)).await.unwrap();
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn periodic_task_reports_actions() {
        let cache = RetryCache::new(config(1));
        let msg = Message::direct("a", "b", "hello");
        cache.cache_message(msg.clone()).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = cache.spawn(move |action| {
            let _ = tx.send(action);
        });

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(first, Some(RetryAction::Resend(msg.clone())));
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(second, Some(RetryAction::Failed(msg)));

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
    }
}
