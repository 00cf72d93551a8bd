use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

/// Identity -> base64 public key, as announced at login. Relayed to peers so
/// they can encrypt direct messages; the server never decrypts anything.
#[derive(Clone, Default)]
pub struct KeyDirectory {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl KeyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each client process has a fresh keypair, so the latest login wins.
    pub async fn record(&self, identity: &str, public_key: String) {
        self.inner
            .write()
            .await
            .insert(identity.to_string(), public_key);
    }

    pub async fn get(&self, identity: &str) -> Option<String> {
        self.inner.read().await.get(identity).cloned()
    }
}
