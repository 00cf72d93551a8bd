use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};
use uuid::Uuid;

use courier_types::events::ServerEvent;

use crate::error::{GatewayError, Result};

/// Handle to one authenticated session's outbound line channel.
#[derive(Debug, Clone)]
pub struct Connection {
    id: Uuid,
    identity: String,
    tx: mpsc::UnboundedSender<String>,
}

impl Connection {
    pub fn new(identity: impl Into<String>, tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity: identity.into(),
            tx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Queue an event for the writer task. `false` if the session is gone.
    pub fn send(&self, event: &ServerEvent) -> bool {
        self.send_line(event.to_line())
    }

    pub fn send_line(&self, line: String) -> bool {
        self.tx.send(line).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Identity -> live connection. One coarse lock: every register, unregister,
/// lookup and full iteration is linearizable with the others.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<String, Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the connection's identity. Fails if another live session holds it;
    /// a binding whose writer has already shut down is replaced.
    pub async fn register(&self, conn: Connection) -> Result<()> {
        self.register_with(conn, |_| async {}).await
    }

    /// Like [`register`](Self::register), but runs `on_bound` while the write
    /// lock is still held. Whatever it queues reaches the session before any
    /// line routed through [`deliver_or_else`](Self::deliver_or_else).
    pub async fn register_with<F, Fut>(&self, conn: Connection, on_bound: F) -> Result<Fut::Output>
    where
        F: FnOnce(Connection) -> Fut,
        Fut: Future,
    {
        let mut connections = self.inner.write().await;
        if let Some(existing) = connections.get(conn.identity()) {
            if !existing.is_closed() {
                return Err(GatewayError::AlreadyConnected(conn.identity().to_string()));
            }
            debug!("Replacing dead binding for {}", conn.identity());
        }
        info!("{} registered (conn {})", conn.identity(), conn.id());
        connections.insert(conn.identity().to_string(), conn.clone());
        Ok(on_bound(conn).await)
    }

    /// Remove the binding, but only if it still belongs to this connection.
    /// Returns whether anything was removed; repeated calls are no-ops.
    pub async fn unregister(&self, conn: &Connection) -> bool {
        let mut connections = self.inner.write().await;
        let owned = connections
            .get(conn.identity())
            .is_some_and(|current| current.id() == conn.id());
        if owned {
            connections.remove(conn.identity());
            info!("{} unregistered (conn {})", conn.identity(), conn.id());
        }
        owned
    }

    pub async fn lookup(&self, identity: &str) -> Option<Connection> {
        self.inner.read().await.get(identity).cloned()
    }

    /// Send `line` to the live session for `identity`. If there is none, or
    /// its writer is gone, `on_missing` gets the line back and runs before
    /// the read lock is released, so no registration can slip in between.
    /// Returns whether the line went out live.
    pub async fn deliver_or_else<F, Fut>(&self, identity: &str, line: String, on_missing: F) -> bool
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = ()>,
    {
        let connections = self.inner.read().await;
        let undelivered = match connections.get(identity) {
            Some(conn) => match conn.tx.send(line) {
                Ok(()) => return true,
                Err(mpsc::error::SendError(line)) => line,
            },
            None => line,
        };
        on_missing(undelivered).await;
        false
    }

    /// Visit every registered connection under the read lock, so the set seen
    /// is a single consistent snapshot.
    pub async fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&Connection),
    {
        let connections = self.inner.read().await;
        for conn in connections.values() {
            visit(conn);
        }
    }
}
