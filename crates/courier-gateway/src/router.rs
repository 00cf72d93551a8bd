use std::collections::BTreeSet;
use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use tracing::{debug, info, trace, warn};

use courier_db::{ConversationStore, Database, DiskFileStore, FileStore, GroupStore, UserStore};
use courier_types::events::{DeliveryStatus, GroupSummary, ServerEvent};
use courier_types::models::{
    FileDescriptor, FileTarget, Group, Message, conversation_id, group_conversation_id,
};

use crate::error::{GatewayError, Result};
use crate::groups::GroupDirectory;
use crate::keys::KeyDirectory;
use crate::offline::OfflineQueue;
use crate::registry::{Connection, ConnectionRegistry};

/// The external collaborators the router persists through.
#[derive(Clone)]
pub struct Stores {
    pub users: Arc<dyn UserStore>,
    pub conversations: Arc<dyn ConversationStore>,
    pub groups: Arc<dyn GroupStore>,
    pub files: Arc<dyn FileStore>,
}

impl Stores {
    /// SQLite for users, messages and groups; flat files for blobs.
    pub fn sqlite(db: Arc<Database>, files: Arc<DiskFileStore>) -> Self {
        Self {
            users: db.clone(),
            conversations: db.clone(),
            groups: db,
            files,
        }
    }
}

/// Run a blocking store call off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| GatewayError::Store(anyhow::anyhow!("spawn_blocking join error: {}", e)))?
        .map_err(GatewayError::Store)
}

/// Where a name points. Groups shadow users with the same name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Group(String),
    User(String),
}

/// Decides direct/group/broadcast delivery and fans out over live connections,
/// falling back to the offline queue.
#[derive(Clone)]
pub struct MessageRouter {
    registry: ConnectionRegistry,
    groups: GroupDirectory,
    offline: OfflineQueue,
    keys: KeyDirectory,
    stores: Stores,
}

impl MessageRouter {
    pub fn new(stores: Stores, groups: GroupDirectory) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            groups,
            offline: OfflineQueue::new(),
            keys: KeyDirectory::new(),
            stores,
        }
    }

    /// Build the router with the group directory preloaded from the store.
    pub async fn load(stores: Stores) -> Result<Self> {
        let group_store = stores.groups.clone();
        let groups = blocking(move || group_store.all_groups()).await?;
        info!("Loaded {} groups", groups.len());
        Ok(Self::new(stores, GroupDirectory::from_groups(groups)))
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn groups(&self) -> &GroupDirectory {
        &self.groups
    }

    pub fn offline(&self) -> &OfflineQueue {
        &self.offline
    }

    pub fn keys(&self) -> &KeyDirectory {
        &self.keys
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub async fn resolve(&self, name: &str) -> Target {
        if self.groups.contains(name).await {
            Target::Group(name.to_string())
        } else {
            Target::User(name.to_string())
        }
    }

    // -- Authentication helpers --

    pub async fn authenticate(&self, identity: &str, credential: &str) -> Result<bool> {
        let users = self.stores.users.clone();
        let (identity, credential) = (identity.to_string(), credential.to_string());
        blocking(move || users.authenticate(&identity, &credential)).await
    }

    pub async fn register_user(&self, identity: &str, credential: &str) -> Result<bool> {
        let users = self.stores.users.clone();
        let (identity, credential) = (identity.to_string(), credential.to_string());
        blocking(move || users.register(&identity, &credential)).await
    }

    /// Make `conn` routable: greet it, then hand it its backlog, all before
    /// any other session can route to it. Returns the number of queued
    /// messages delivered.
    pub async fn bind(&self, conn: Connection, greeting: &ServerEvent) -> Result<usize> {
        self.registry
            .register_with(conn, |bound| async move {
                bound.send(greeting);
                self.flush_offline(&bound).await
            })
            .await
    }

    /// Hand a freshly authenticated session its backlog, then a summary.
    pub async fn flush_offline(&self, conn: &Connection) -> usize {
        let pending = self.offline.drain_and_clear(conn.identity()).await;
        let count = pending.len();
        if count == 0 {
            return 0;
        }

        for line in pending {
            conn.send_line(line);
        }
        conn.send(&ServerEvent::System {
            message: format!(
                "{} message{} delivered while you were offline",
                count,
                if count == 1 { " was" } else { "s were" }
            ),
        });
        info!("Delivered {} queued messages to {}", count, conn.identity());
        count
    }

    // -- Messaging --

    /// Write the message once. A resend of an id already stored for the same
    /// sender and conversation is accepted as is; any other reuse of the id
    /// is refused so it can't ride on someone else's row.
    async fn persist(&self, message: &Message) -> Result<()> {
        let store = self.stores.conversations.clone();
        let stored = message.clone();
        let existing = blocking(move || {
            if store.save(&stored)? {
                return Ok(None);
            }
            store.find(&stored.id)
        })
        .await?;

        match existing {
            Some(prior)
                if prior.sender != message.sender
                    || prior.conversation_id != message.conversation_id =>
            {
                Err(GatewayError::Protocol(format!(
                    "message id {} is already in use",
                    message.id
                )))
            }
            Some(_) => {
                debug!("{} already stored, treating as a resend", message.id);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Forward live, or queue for the next login if `identity` has no session.
    async fn deliver_or_queue(&self, identity: &str, line: String) -> bool {
        self.registry
            .deliver_or_else(identity, line, |line| self.offline.enqueue(identity, line))
            .await
    }

    async fn mark_delivered(&self, message_id: &str) {
        let store = self.stores.conversations.clone();
        let id = message_id.to_string();
        if let Err(e) = blocking(move || store.mark_delivered(&id)).await {
            warn!("Failed to mark {} delivered: {}", message_id, e);
        }
    }

    /// `private` command: resolves `to` and routes as a direct or group message.
    pub async fn send_private(
        &self,
        origin: &Connection,
        to: &str,
        content: String,
        id: Option<String>,
        encrypted: bool,
    ) -> Result<()> {
        let sender = origin.identity();
        match self.resolve(to).await {
            Target::Group(group_name) => {
                let message = Message::group(sender, &group_name, content).with_id(id);
                let event = ServerEvent::GroupMessage {
                    id: message.id.clone(),
                    group_name: group_name.clone(),
                    from: message.sender.clone(),
                    content: message.content.clone(),
                    timestamp: message.timestamp,
                };
                let status = self.route_group(origin, &group_name, &message, &event).await?;
                origin.send(&ServerEvent::DeliveryReceipt {
                    message_id: message.id,
                    status,
                });
            }
            Target::User(recipient) => {
                let message = Message::direct(sender, &recipient, content)
                    .with_id(id)
                    .encrypted(encrypted);
                let event = ServerEvent::Private {
                    id: message.id.clone(),
                    from: message.sender.clone(),
                    to: recipient.clone(),
                    content: message.content.clone(),
                    timestamp: message.timestamp,
                    encrypted,
                    public_key: self.keys.get(sender).await,
                };
                let status = self.route_direct(&recipient, &message, &event).await?;
                origin.send(&ServerEvent::DeliveryReceipt {
                    message_id: message.id,
                    status,
                });
            }
        }
        Ok(())
    }

    /// Persist, then forward live or queue. A failed store write reports
    /// `Failed` without forwarding so the sender's retry cache resends.
    async fn route_direct(
        &self,
        recipient: &str,
        message: &Message,
        event: &ServerEvent,
    ) -> Result<DeliveryStatus> {
        match self.persist(message).await {
            Ok(()) => {}
            Err(GatewayError::Store(e)) => {
                warn!("Failed to persist message {}: {}", message.id, e);
                return Ok(DeliveryStatus::Failed);
            }
            Err(e) => return Err(e),
        }

        let users = self.stores.users.clone();
        let who = recipient.to_string();
        match blocking(move || users.exists(&who)).await {
            Ok(true) => {}
            Ok(false) => return Err(GatewayError::Route(recipient.to_string())),
            Err(e) => warn!("Could not verify recipient {}: {}", recipient, e),
        }

        if self.deliver_or_queue(recipient, event.to_line()).await {
            self.mark_delivered(&message.id).await;
            debug!("{} -> {} delivered ({})", message.sender, recipient, message.id);
            Ok(DeliveryStatus::Delivered)
        } else {
            debug!("{} -> {} queued ({})", message.sender, recipient, message.id);
            Ok(DeliveryStatus::Pending)
        }
    }

    /// Persist once, then fan out over a membership snapshot. Offline members
    /// other than the sender get exactly one queued copy each.
    async fn route_group(
        &self,
        origin: &Connection,
        group_name: &str,
        message: &Message,
        event: &ServerEvent,
    ) -> Result<DeliveryStatus> {
        let members = self.member_snapshot(origin, group_name).await?;

        match self.persist(message).await {
            Ok(()) => {}
            Err(GatewayError::Store(e)) => {
                warn!("Failed to persist group message {}: {}", message.id, e);
                return Ok(DeliveryStatus::Failed);
            }
            Err(e) => return Err(e),
        }

        let line = event.to_line();
        let mut live = 0usize;
        let mut queued = 0usize;
        for member in &members {
            let delivered = if member == origin.identity() {
                // The sender's own copy is never queued
                match self.registry.lookup(member).await {
                    Some(conn) => conn.send_line(line.clone()),
                    None => false,
                }
            } else {
                self.deliver_or_queue(member, line.clone()).await
            };
            if delivered {
                live += 1;
            } else if member != origin.identity() {
                queued += 1;
            }
        }

        debug!(
            "{} -> group {}: {} live, {} queued ({})",
            origin.identity(),
            group_name,
            live,
            queued,
            message.id
        );
        Ok(DeliveryStatus::Delivered)
    }

    async fn member_snapshot(&self, origin: &Connection, group_name: &str) -> Result<BTreeSet<String>> {
        let members = self
            .groups
            .members(group_name)
            .await
            .ok_or_else(|| GatewayError::Route(group_name.to_string()))?;
        if !members.contains(origin.identity()) {
            return Err(GatewayError::Route(format!(
                "{} (not a member)",
                group_name
            )));
        }
        Ok(members)
    }

    /// Persist, then forward to every registered connection including the sender.
    /// No offline queuing for broadcasts. A failed store write is reported to
    /// the sender and nothing goes out.
    pub async fn broadcast(&self, origin: &Connection, content: String) {
        let message = Message::broadcast(origin.identity(), content);
        if let Err(e) = self.persist(&message).await {
            warn!("Failed to persist broadcast {}: {}", message.id, e);
            origin.send(&ServerEvent::error(format!("Broadcast not sent: {}", e)));
            return;
        }

        let line = ServerEvent::Broadcast {
            id: message.id.clone(),
            from: message.sender.clone(),
            content: message.content.clone(),
            timestamp: message.timestamp,
        }
        .to_line();

        let mut reached = 0usize;
        self.registry
            .for_each(|conn| {
                if conn.send_line(line.clone()) {
                    reached += 1;
                }
            })
            .await;
        trace!("Broadcast {} from {} reached {}", message.id, message.sender, reached);
    }

    /// A non-JSON line from an authenticated session goes out as `"<sender>: <line>"`.
    pub async fn plain_text(&self, origin: &Connection, text: &str) {
        let content = format!("{}: {}", origin.identity(), text);
        self.broadcast(origin, content).await;
    }

    /// Best-effort: forwarded if the original sender is online, dropped otherwise.
    /// Only someone the message was addressed to can mark it read, and the
    /// named sender must be the one on record.
    pub async fn read_receipt(&self, reader: &Connection, message_id: String, sender: String) {
        let store = self.stores.conversations.clone();
        let id = message_id.clone();
        let message = match blocking(move || store.find(&id)).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!("Ignoring read receipt for unknown message {}", message_id);
                return;
            }
            Err(e) => {
                warn!("Failed to look up {} for read receipt: {}", message_id, e);
                return;
            }
        };
        if message.sender != sender || !self.addressed_to(&message, reader.identity()).await {
            warn!(
                "{} sent a read receipt for {} it did not receive",
                reader.identity(),
                message_id
            );
            return;
        }

        let store = self.stores.conversations.clone();
        let id = message_id.clone();
        if let Err(e) = blocking(move || store.mark_read(&id)).await {
            warn!("Failed to mark {} read: {}", message_id, e);
        }

        match self.registry.lookup(&sender).await {
            Some(conn) => {
                conn.send(&ServerEvent::ReadReceipt {
                    message_id,
                    sender,
                    reader: reader.identity().to_string(),
                });
            }
            None => debug!("Dropping read receipt for offline sender {}", sender),
        }
    }

    async fn addressed_to(&self, message: &Message, identity: &str) -> bool {
        let Some(recipient) = message.recipient.as_deref() else {
            return false;
        };
        if message.conversation_id == group_conversation_id(recipient) {
            return identity != message.sender
                && self
                    .groups
                    .members(recipient)
                    .await
                    .is_some_and(|members| members.contains(identity));
        }
        recipient == identity
    }

    // -- Groups --

    pub async fn create_group(
        &self,
        origin: &Connection,
        group_name: String,
        members: Vec<String>,
    ) -> Result<()> {
        let group_name = group_name.trim().to_string();
        if group_name.is_empty() {
            return Err(GatewayError::Protocol("group name must not be empty".into()));
        }

        let creator = origin.identity().to_string();
        let group = Group::new(
            group_name.clone(),
            members
                .into_iter()
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .chain(std::iter::once(creator.clone())),
        );

        let store = self.stores.groups.clone();
        let stored = group.clone();
        if !blocking(move || store.create(&stored)).await? || !self.groups.insert(group.clone()).await {
            origin.send(&ServerEvent::error(format!("Group '{}' already exists", group_name)));
            return Ok(());
        }
        info!("{} created group {} ({} members)", creator, group_name, group.members.len());

        let event = ServerEvent::GroupCreated {
            group_name: group_name.clone(),
            members: group.members.iter().cloned().collect(),
            info: format!("Group '{}' created by {}", group_name, creator),
        };
        for member in &group.members {
            if let Some(conn) = self.registry.lookup(member).await {
                conn.send(&event);
            }
        }
        Ok(())
    }

    pub async fn list_groups(&self, origin: &Connection) {
        let groups = self
            .groups
            .groups_of(origin.identity())
            .await
            .iter()
            .map(GroupSummary::from)
            .collect();
        origin.send(&ServerEvent::GroupList { groups });
    }

    // -- History --

    pub async fn history(&self, origin: &Connection, other_user: String) -> Result<()> {
        let store = self.stores.conversations.clone();
        let conversation = conversation_id(origin.identity(), &other_user);
        let messages = blocking(move || store.history(&conversation)).await?;
        origin.send(&ServerEvent::History {
            other_user,
            messages,
        });
        Ok(())
    }

    pub async fn group_history(&self, origin: &Connection, group_name: String) -> Result<()> {
        self.member_snapshot(origin, &group_name).await?;

        let store = self.stores.conversations.clone();
        let conversation = group_conversation_id(&group_name);
        let messages = blocking(move || store.history(&conversation)).await?;
        origin.send(&ServerEvent::GroupHistory {
            group_name,
            messages,
        });
        Ok(())
    }

    // -- Files --

    async fn store_blob(&self, filename: String, mime_type: String, data: &str) -> Result<FileDescriptor> {
        let bytes = B64
            .decode(data)
            .map_err(|e| GatewayError::Protocol(format!("file data is not base64: {}", e)))?;
        if bytes.is_empty() {
            return Err(GatewayError::Protocol("empty file".into()));
        }

        let size = bytes.len() as u64;
        let files = self.stores.files.clone();
        let id = blocking(move || files.save(&bytes)).await?;
        Ok(FileDescriptor {
            id,
            filename,
            mime_type,
            size,
        })
    }

    /// `file_upload`: same routing as a `private` message, with a file descriptor payload.
    pub async fn upload_file(
        &self,
        origin: &Connection,
        to: &str,
        filename: String,
        mime_type: String,
        data: &str,
        id: Option<String>,
    ) -> Result<()> {
        match self.resolve(to).await {
            Target::Group(group_name) => {
                self.upload_group_file(origin, &group_name, filename, mime_type, data, id)
                    .await
            }
            Target::User(recipient) => {
                let descriptor = self.store_blob(filename, mime_type, data).await?;
                let message = Message::file(origin.identity(), FileTarget::User(&recipient), &descriptor)
                    .with_id(id);
                let event = ServerEvent::file_notice(&message, None)
                    .ok_or_else(|| GatewayError::Protocol("bad file descriptor".into()))?;

                let status = self.route_direct(&recipient, &message, &event).await?;
                info!(
                    "{} shared {} ({} bytes) with {}: {:?}",
                    origin.identity(),
                    descriptor.filename,
                    descriptor.size,
                    recipient,
                    status
                );
                origin.send(&ServerEvent::FileReceipt {
                    file_id: descriptor.id,
                    status,
                });
                Ok(())
            }
        }
    }

    pub async fn upload_group_file(
        &self,
        origin: &Connection,
        group_name: &str,
        filename: String,
        mime_type: String,
        data: &str,
        id: Option<String>,
    ) -> Result<()> {
        // Check membership before writing the blob
        self.member_snapshot(origin, group_name).await?;

        let descriptor = self.store_blob(filename, mime_type, data).await?;
        let message = Message::file(origin.identity(), FileTarget::Group(group_name), &descriptor)
            .with_id(id);
        let event = ServerEvent::file_notice(&message, Some(group_name))
            .ok_or_else(|| GatewayError::Protocol("bad file descriptor".into()))?;

        let status = self.route_group(origin, group_name, &message, &event).await?;
        origin.send(&ServerEvent::FileReceipt {
            file_id: descriptor.id,
            status,
        });
        Ok(())
    }

    pub async fn download_file(
        &self,
        origin: &Connection,
        file_id: String,
        filename: Option<String>,
        mime_type: Option<String>,
    ) -> Result<()> {
        let files = self.stores.files.clone();
        let locator = file_id.clone();
        let Some(bytes) = blocking(move || files.load(&locator)).await? else {
            origin.send(&ServerEvent::error(format!("File {} not found", file_id)));
            return Ok(());
        };

        debug!("{} downloading {} ({} bytes)", origin.identity(), file_id, bytes.len());
        origin.send(&ServerEvent::FileData {
            filename: filename.unwrap_or_else(|| file_id.clone()),
            mime_type: mime_type.unwrap_or_else(|| "application/octet-stream".into()),
            file_id,
            data: B64.encode(bytes),
        });
        Ok(())
    }

    // -- Keys --

    pub async fn public_key(&self, origin: &Connection, email: String) {
        let public_key = self.keys.get(&email).await;
        origin.send(&ServerEvent::PublicKey { email, public_key });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    struct Harness {
        router: MessageRouter,
        _dir: tempfile::TempDir,
    }

    async fn harness(users: &[&str]) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        for user in users {
            assert!(db.register(user, "password").unwrap());
        }
        let files = Arc::new(DiskFileStore::new(dir.path().to_path_buf()).unwrap());
        let router = MessageRouter::load(Stores::sqlite(db, files)).await.unwrap();
        Harness { router, _dir: dir }
    }

    async fn online(
        router: &MessageRouter,
        identity: &str,
    ) -> (Connection, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::new(identity, tx);
        router.registry().register(conn.clone()).await.unwrap();
        (conn, rx)
    }

    fn offline_conn(identity: &str) -> (Connection, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Connection::new(identity, tx), rx)
    }

    fn events(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(line) = rx.try_recv() {
            out.push(serde_json::from_str(&line).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn direct_to_online_recipient_is_delivered() {
        let h = harness(&["a", "b"]).await;
        let (a, mut a_rx) = online(&h.router, "a").await;
        let (_b, mut b_rx) = online(&h.router, "b").await;
        h.router.keys().record("a", "A-KEY".into()).await;

        h.router
            .send_private(&a, "b", "hi".into(), Some("m1".into()), false)
            .await
            .unwrap();

        match events(&mut b_rx).as_slice() {
            [ServerEvent::Private { id, from, content, public_key, .. }] => {
                assert_eq!(id, "m1");
                assert_eq!(from, "a");
                assert_eq!(content, "hi");
                assert_eq!(public_key.as_deref(), Some("A-KEY"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            events(&mut a_rx),
            vec![ServerEvent::DeliveryReceipt {
                message_id: "m1".into(),
                status: DeliveryStatus::Delivered
            }]
        );

        let history = h.router.stores().conversations.history(&conversation_id("a", "b")).unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].delivered);
        assert_eq!(h.router.offline().pending("b").await, 0);
    }

    #[tokio::test]
    async fn direct_to_offline_recipient_is_queued_once() {
        let h = harness(&["a", "b"]).await;
        let (a, mut a_rx) = online(&h.router, "a").await;

        h.router
            .send_private(&a, "b", "hi".into(), Some("m1".into()), false)
            .await
            .unwrap();

        assert_eq!(
            events(&mut a_rx),
            vec![ServerEvent::DeliveryReceipt {
                message_id: "m1".into(),
                status: DeliveryStatus::Pending
            }]
        );
        assert_eq!(h.router.offline().pending("b").await, 1);

        let history = h.router.stores().conversations.history(&conversation_id("a", "b")).unwrap();
        assert!(!history[0].delivered);

        // Reconnect: backlog first, then the summary
        let (b, mut b_rx) = online(&h.router, "b").await;
        assert_eq!(h.router.flush_offline(&b).await, 1);
        match events(&mut b_rx).as_slice() {
            [ServerEvent::Private { id, .. }, ServerEvent::System { message }] => {
                assert_eq!(id, "m1");
                assert!(message.starts_with("1 message was delivered"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.router.flush_offline(&b).await, 0);
        assert!(events(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn unknown_recipient_is_a_route_error_but_persisted() {
        let h = harness(&["a"]).await;
        let (a, mut a_rx) = online(&h.router, "a").await;

        let err = h
            .router
            .send_private(&a, "ghost", "boo".into(), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Route(ref who) if who == "ghost"));
        assert!(events(&mut a_rx).is_empty());
        assert_eq!(h.router.offline().pending("ghost").await, 0);
        assert_eq!(
            h.router.stores().conversations.history(&conversation_id("a", "ghost")).unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn group_fanout_live_and_queued() {
        let h = harness(&["a", "m1", "m2", "m3"]).await;
        let (a, mut a_rx) = online(&h.router, "a").await;
        let (_m1, mut m1_rx) = online(&h.router, "m1").await;
        let (_m2, mut m2_rx) = online(&h.router, "m2").await;

        h.router
            .create_group(&a, "team".into(), vec!["m1".into(), "m2".into(), "m3".into()])
            .await
            .unwrap();
        for rx in [&mut a_rx, &mut m1_rx, &mut m2_rx] {
            assert!(matches!(
                events(rx).as_slice(),
                [ServerEvent::GroupCreated { group_name, members, .. }]
                    if group_name == "team" && members.len() == 4
            ));
        }

        h.router
            .send_private(&a, "team", "hello team".into(), Some("g1".into()), false)
            .await
            .unwrap();

        for rx in [&mut m1_rx, &mut m2_rx] {
            assert!(matches!(
                events(rx).as_slice(),
                [ServerEvent::GroupMessage { id, group_name, .. }] if id == "g1" && group_name == "team"
            ));
        }
        // Sender sees its own message and a receipt
        match events(&mut a_rx).as_slice() {
            [ServerEvent::GroupMessage { id, .. }, ServerEvent::DeliveryReceipt { status, .. }] => {
                assert_eq!(id, "g1");
                assert_eq!(*status, DeliveryStatus::Delivered);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(h.router.offline().pending("m3").await, 1);
        assert_eq!(h.router.offline().pending("a").await, 0);
        assert_eq!(
            h.router.stores().conversations.history("group_team").unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn offline_sender_is_not_queued_its_own_group_message() {
        let h = harness(&["a", "b"]).await;
        let (a, _a_rx) = online(&h.router, "a").await;
        h.router
            .create_group(&a, "pair".into(), vec!["b".into()])
            .await
            .unwrap();

        // Sender's connection is not registered (e.g. already torn down)
        h.router.registry().unregister(&a).await;
        h.router
            .send_private(&a, "pair", "x".into(), None, false)
            .await
            .unwrap();
        assert_eq!(h.router.offline().pending("a").await, 0);
        assert_eq!(h.router.offline().pending("b").await, 1);
    }

    #[tokio::test]
    async fn group_name_shadows_user() {
        let h = harness(&["a", "team"]).await;
        let (a, _a_rx) = online(&h.router, "a").await;
        assert_eq!(h.router.resolve("team").await, Target::User("team".into()));

        h.router.create_group(&a, "team".into(), vec![]).await.unwrap();
        assert_eq!(h.router.resolve("team").await, Target::Group("team".into()));
    }

    #[tokio::test]
    async fn non_member_cannot_post_or_read_group() {
        let h = harness(&["a", "b", "c"]).await;
        let (a, _a_rx) = online(&h.router, "a").await;
        let (c, _c_rx) = online(&h.router, "c").await;
        h.router
            .create_group(&a, "ab".into(), vec!["b".into()])
            .await
            .unwrap();

        assert!(matches!(
            h.router.send_private(&c, "ab", "let me in".into(), None, false).await,
            Err(GatewayError::Route(_))
        ));
        assert!(matches!(
            h.router.group_history(&c, "ab".into()).await,
            Err(GatewayError::Route(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_group_name_reports_error() {
        let h = harness(&["a"]).await;
        let (a, mut a_rx) = online(&h.router, "a").await;
        h.router.create_group(&a, "g".into(), vec![]).await.unwrap();
        events(&mut a_rx);

        h.router.create_group(&a, "g".into(), vec![]).await.unwrap();
        assert!(matches!(
            events(&mut a_rx).as_slice(),
            [ServerEvent::Error { message }] if message.contains("already exists")
        ));
    }

    #[tokio::test]
    async fn broadcast_reaches_everyone_including_sender() {
        let h = harness(&["a", "b"]).await;
        let (a, mut a_rx) = online(&h.router, "a").await;
        let (_b, mut b_rx) = online(&h.router, "b").await;

        h.router.plain_text(&a, "hello").await;

        for rx in [&mut a_rx, &mut b_rx] {
            assert!(matches!(
                events(rx).as_slice(),
                [ServerEvent::Broadcast { content, from, .. }] if content == "a: hello" && from == "a"
            ));
        }
        assert_eq!(
            h.router.stores().conversations.history("broadcast").unwrap().len(),
            1
        );
        assert_eq!(h.router.offline().pending("b").await, 0);
    }

    #[tokio::test]
    async fn read_receipts_are_best_effort() {
        let h = harness(&["a", "b"]).await;
        let (a, _a_rx) = online(&h.router, "a").await;
        let (b, _b_rx) = online(&h.router, "b").await;
        h.router
            .send_private(&a, "b", "hi".into(), Some("m1".into()), false)
            .await
            .unwrap();

        // Sender offline: dropped silently, but still recorded as read
        h.router.registry().unregister(&a).await;
        h.router.read_receipt(&b, "m1".into(), "a".into()).await;
        assert_eq!(h.router.offline().pending("a").await, 0);
        let stored = h.router.stores().conversations.find("m1").unwrap().unwrap();
        assert!(stored.read);

        let (_a, mut a_rx) = online(&h.router, "a").await;
        h.router.read_receipt(&b, "m1".into(), "a".into()).await;
        assert_eq!(
            events(&mut a_rx),
            vec![ServerEvent::ReadReceipt {
                message_id: "m1".into(),
                sender: "a".into(),
                reader: "b".into()
            }]
        );
    }

    #[tokio::test]
    async fn only_the_recipient_can_mark_read() {
        let h = harness(&["a", "b", "c"]).await;
        let (a, mut a_rx) = online(&h.router, "a").await;
        let (b, _b_rx) = online(&h.router, "b").await;
        let (c, _c_rx) = online(&h.router, "c").await;
        h.router
            .send_private(&a, "b", "for b".into(), Some("m1".into()), false)
            .await
            .unwrap();
        events(&mut a_rx);

        // A bystander, the sender itself, a wrong sender and an unknown id
        h.router.read_receipt(&c, "m1".into(), "a".into()).await;
        h.router.read_receipt(&a, "m1".into(), "a".into()).await;
        h.router.read_receipt(&b, "m1".into(), "c".into()).await;
        h.router.read_receipt(&b, "nope".into(), "a".into()).await;

        assert!(events(&mut a_rx).is_empty());
        let stored = h.router.stores().conversations.find("m1").unwrap().unwrap();
        assert!(!stored.read);
    }

    #[tokio::test]
    async fn group_members_can_mark_group_messages_read() {
        let h = harness(&["a", "b", "c"]).await;
        let (a, mut a_rx) = online(&h.router, "a").await;
        let (b, _b_rx) = online(&h.router, "b").await;
        let (c, _c_rx) = online(&h.router, "c").await;
        h.router
            .create_group(&a, "team".into(), vec!["b".into()])
            .await
            .unwrap();
        h.router
            .send_private(&a, "team", "hi team".into(), Some("g1".into()), false)
            .await
            .unwrap();
        events(&mut a_rx);

        h.router.read_receipt(&c, "g1".into(), "a".into()).await;
        assert!(events(&mut a_rx).is_empty());

        h.router.read_receipt(&b, "g1".into(), "a".into()).await;
        assert!(matches!(
            events(&mut a_rx).as_slice(),
            [ServerEvent::ReadReceipt { reader, .. }] if reader == "b"
        ));
    }

    #[tokio::test]
    async fn history_stays_inside_its_conversation() {
        let h = harness(&["a", "a_b", "b_c", "c", "m", "group"]).await;
        let (a_b, _r1) = online(&h.router, "a_b").await;
        let (m, _r2) = online(&h.router, "m").await;
        let (a, mut a_rx) = online(&h.router, "a").await;
        let (g, mut g_rx) = online(&h.router, "group").await;

        h.router
            .send_private(&a_b, "c", "private between a_b and c".into(), None, false)
            .await
            .unwrap();
        h.router.create_group(&m, "team".into(), vec![]).await.unwrap();
        h.router
            .send_private(&m, "team", "secret plan".into(), None, false)
            .await
            .unwrap();
        events(&mut a_rx);
        events(&mut g_rx);

        h.router.history(&a, "b_c".into()).await.unwrap();
        assert!(matches!(
            events(&mut a_rx).as_slice(),
            [ServerEvent::History { messages, .. }] if messages.is_empty()
        ));

        // "group" + "team" is a direct pair, not the team's group chat
        h.router.history(&g, "team".into()).await.unwrap();
        assert!(matches!(
            events(&mut g_rx).as_slice(),
            [ServerEvent::History { messages, .. }] if messages.is_empty()
        ));
    }

    #[tokio::test]
    async fn reused_id_from_another_conversation_is_refused() {
        let h = harness(&["a", "b", "c", "d"]).await;
        let (a, _a_rx) = online(&h.router, "a").await;
        let (c, mut c_rx) = online(&h.router, "c").await;
        let (_d, mut d_rx) = online(&h.router, "d").await;

        h.router
            .send_private(&a, "b", "first".into(), Some("X".into()), false)
            .await
            .unwrap();
        let err = h
            .router
            .send_private(&c, "d", "second".into(), Some("X".into()), false)
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Protocol(ref m) if m.contains("already in use")));
        assert!(events(&mut c_rx).is_empty());
        assert!(events(&mut d_rx).is_empty());
        let stored = h.router.stores().conversations.find("X").unwrap().unwrap();
        assert_eq!(stored.sender, "a");
        assert!(h
            .router
            .stores()
            .conversations
            .history(&conversation_id("c", "d"))
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn resend_of_the_same_message_is_idempotent() {
        let h = harness(&["a", "b"]).await;
        let (a, mut a_rx) = online(&h.router, "a").await;

        for _ in 0..2 {
            h.router
                .send_private(&a, "b", "hi".into(), Some("m1".into()), false)
                .await
                .unwrap();
        }
        assert_eq!(
            events(&mut a_rx),
            vec![
                ServerEvent::DeliveryReceipt { message_id: "m1".into(), status: DeliveryStatus::Pending },
                ServerEvent::DeliveryReceipt { message_id: "m1".into(), status: DeliveryStatus::Pending },
            ]
        );
        assert_eq!(
            h.router.stores().conversations.history(&conversation_id("a", "b")).unwrap().len(),
            1
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn messages_racing_a_login_are_never_stranded() {
        const SENDS: usize = 200;
        let h = harness(&["a", "b"]).await;
        let (a, _a_rx) = online(&h.router, "a").await;

        let mut senders = Vec::new();
        for i in 0..SENDS {
            let router = h.router.clone();
            let a = a.clone();
            senders.push(tokio::spawn(async move {
                router
                    .send_private(&a, "b", format!("n{}", i), None, false)
                    .await
                    .unwrap();
            }));
        }

        let (tx, mut b_rx) = mpsc::unbounded_channel();
        let b = Connection::new("b", tx);
        h.router
            .bind(b, &ServerEvent::auth_ok("b"))
            .await
            .unwrap();
        for sender in senders {
            sender.await.unwrap();
        }

        assert_eq!(h.router.offline().pending("b").await, 0);
        let received = events(&mut b_rx)
            .into_iter()
            .filter(|event| matches!(event, ServerEvent::Private { .. }))
            .count();
        assert_eq!(received, SENDS);
    }

    #[tokio::test]
    async fn bind_greets_before_the_backlog() {
        let h = harness(&["a", "b"]).await;
        let (a, _a_rx) = online(&h.router, "a").await;
        h.router
            .send_private(&a, "b", "while away".into(), None, false)
            .await
            .unwrap();

        let (tx, mut b_rx) = mpsc::unbounded_channel();
        let flushed = h
            .router
            .bind(Connection::new("b", tx), &ServerEvent::auth_ok("b"))
            .await
            .unwrap();
        assert_eq!(flushed, 1);
        assert!(matches!(
            events(&mut b_rx).as_slice(),
            [
                ServerEvent::AuthResult { success: true, .. },
                ServerEvent::Private { .. },
                ServerEvent::System { .. }
            ]
        ));
    }

    struct BrokenConversations;

    impl ConversationStore for BrokenConversations {
        fn save(&self, _: &Message) -> anyhow::Result<bool> {
            anyhow::bail!("disk full")
        }

        fn find(&self, _: &str) -> anyhow::Result<Option<Message>> {
            Ok(None)
        }

        fn history(&self, _: &str) -> anyhow::Result<Vec<Message>> {
            Ok(Vec::new())
        }

        fn mark_delivered(&self, _: &str) -> anyhow::Result<()> {
            Ok(())
        }

        fn mark_read(&self, _: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn store_failure_is_reported_to_the_sender() {
        let h = harness(&["a", "b"]).await;
        let mut stores = h.router.stores().clone();
        stores.conversations = Arc::new(BrokenConversations);
        let router = MessageRouter::new(stores, GroupDirectory::new());
        let (a, mut a_rx) = online(&router, "a").await;
        let (_b, mut b_rx) = online(&router, "b").await;

        router.broadcast(&a, "hello".into()).await;
        assert!(matches!(
            events(&mut a_rx).as_slice(),
            [ServerEvent::Error { message }] if message.contains("disk full")
        ));

        router
            .send_private(&a, "b", "hi".into(), Some("m1".into()), false)
            .await
            .unwrap();
        assert_eq!(
            events(&mut a_rx),
            vec![ServerEvent::DeliveryReceipt {
                message_id: "m1".into(),
                status: DeliveryStatus::Failed
            }]
        );
        assert!(events(&mut b_rx).is_empty());
        assert_eq!(router.offline().pending("b").await, 0);
    }

    #[tokio::test]
    async fn history_is_symmetric() {
        let h = harness(&["a", "b"]).await;
        let (a, _a_rx) = online(&h.router, "a").await;
        let (b, mut b_rx) = online(&h.router, "b").await;
        h.router
            .send_private(&a, "b", "one".into(), None, false)
            .await
            .unwrap();
        events(&mut b_rx);

        h.router.history(&b, "a".into()).await.unwrap();
        match events(&mut b_rx).as_slice() {
            [ServerEvent::History { other_user, messages }] => {
                assert_eq!(other_user, "a");
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].content, "one");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn file_upload_and_download() {
        let h = harness(&["a", "b"]).await;
        let (a, mut a_rx) = online(&h.router, "a").await;
        let (b, mut b_rx) = online(&h.router, "b").await;

        h.router
            .upload_file(&a, "b", "notes.txt".into(), "text/plain".into(), &B64.encode("hello"), None)
            .await
            .unwrap();

        let file_id = match events(&mut b_rx).as_slice() {
            [ServerEvent::File { file_id, filename, size, to, .. }] => {
                assert_eq!(filename, "notes.txt");
                assert_eq!(*size, 5);
                assert_eq!(to.as_deref(), Some("b"));
                file_id.clone()
            }
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(
            events(&mut a_rx),
            vec![ServerEvent::FileReceipt {
                file_id: file_id.clone(),
                status: DeliveryStatus::Delivered
            }]
        );

        h.router
            .download_file(&b, file_id.clone(), Some("notes.txt".into()), None)
            .await
            .unwrap();
        assert_eq!(
            events(&mut b_rx),
            vec![ServerEvent::FileData {
                file_id,
                filename: "notes.txt".into(),
                mime_type: "application/octet-stream".into(),
                data: B64.encode("hello"),
            }]
        );
    }

    #[tokio::test]
    async fn file_to_offline_user_is_pending_and_bad_data_rejected() {
        let h = harness(&["a", "b"]).await;
        let (a, mut a_rx) = online(&h.router, "a").await;

        h.router
            .upload_file(&a, "b", "x.bin".into(), "application/octet-stream".into(), &B64.encode([1u8, 2]), None)
            .await
            .unwrap();
        assert!(matches!(
            events(&mut a_rx).as_slice(),
            [ServerEvent::FileReceipt { status: DeliveryStatus::Pending, .. }]
        ));
        assert_eq!(h.router.offline().pending("b").await, 1);

        assert!(matches!(
            h.router
                .upload_file(&a, "b", "x".into(), "text/plain".into(), "%%%", None)
                .await,
            Err(GatewayError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn group_file_upload_fans_out() {
        let h = harness(&["a", "b", "c"]).await;
        let (a, mut a_rx) = online(&h.router, "a").await;
        let (_b, mut b_rx) = online(&h.router, "b").await;
        h.router
            .create_group(&a, "team".into(), vec!["b".into(), "c".into()])
            .await
            .unwrap();
        events(&mut a_rx);
        events(&mut b_rx);

        h.router
            .upload_group_file(&a, "team", "pic.png".into(), "image/png".into(), &B64.encode([9u8; 8]), None)
            .await
            .unwrap();
        assert!(matches!(
            events(&mut b_rx).as_slice(),
            [ServerEvent::File { group_name: Some(g), .. }] if g == "team"
        ));
        assert_eq!(h.router.offline().pending("c").await, 1);
        assert!(matches!(
            events(&mut a_rx).last(),
            Some(ServerEvent::FileReceipt { status: DeliveryStatus::Delivered, .. })
        ));
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let h = harness(&["a"]).await;
        let (a, mut a_rx) = online(&h.router, "a").await;
        h.router
            .download_file(&a, "nope".into(), None, None)
            .await
            .unwrap();
        assert!(matches!(
            events(&mut a_rx).as_slice(),
            [ServerEvent::Error { message }] if message.contains("not found")
        ));
    }

    #[tokio::test]
    async fn closed_recipient_counts_as_offline() {
        let h = harness(&["a", "b"]).await;
        let (a, mut a_rx) = online(&h.router, "a").await;
        let (_b, b_rx) = online(&h.router, "b").await;
        drop(b_rx);

        h.router
            .send_private(&a, "b", "hi".into(), None, false)
            .await
            .unwrap();
        assert!(matches!(
            events(&mut a_rx).as_slice(),
            [ServerEvent::DeliveryReceipt { status: DeliveryStatus::Pending, .. }]
        ));
        assert_eq!(h.router.offline().pending("b").await, 1);
    }

    #[tokio::test]
    async fn public_key_lookup() {
        let h = harness(&["a", "b"]).await;
        let (a, mut a_rx) = online(&h.router, "a").await;
        h.router.keys().record("b", "B-KEY".into()).await;

        h.router.public_key(&a, "b".into()).await;
        h.router.public_key(&a, "c".into()).await;
        assert_eq!(
            events(&mut a_rx),
            vec![
                ServerEvent::PublicKey { email: "b".into(), public_key: Some("B-KEY".into()) },
                ServerEvent::PublicKey { email: "c".into(), public_key: None },
            ]
        );
    }

    #[tokio::test]
    async fn list_groups_only_shows_membership() {
        let h = harness(&["a", "b"]).await;
        let (a, mut a_rx) = online(&h.router, "a").await;
        let (b, _b_rx) = offline_conn("b");
        h.router.create_group(&a, "mine".into(), vec![]).await.unwrap();
        h.router.create_group(&b, "theirs".into(), vec![]).await.unwrap();
        events(&mut a_rx);

        h.router.list_groups(&a).await;
        assert_eq!(
            events(&mut a_rx),
            vec![ServerEvent::GroupList {
                groups: vec![GroupSummary {
                    group_name: "mine".into(),
                    members: vec!["a".into()]
                }]
            }]
        );
    }
}
