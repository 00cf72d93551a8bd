use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use dashmap::DashSet;
use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, info, trace, warn};

use courier_crypto::CryptoSession;
use courier_types::events::{ClientCommand, DeliveryStatus, ServerEvent};
use courier_types::models::Message;

use crate::error::{ClientError, Result};
use crate::events::ClientEvent;
use crate::retry::{RetryAction, RetryCache, RetryConfig};

/// How long `disconnect` waits for the server to close its side.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub retry: RetryConfig,
    /// Directory for the persistent retry cache. `None` keeps it in memory.
    pub cache_dir: Option<PathBuf>,
    pub max_line_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            cache_dir: None,
            max_line_bytes: 16 * 1024 * 1024,
        }
    }
}

/// One authenticated connection to the server.
///
/// Owns the reader, writer and retry tasks; they stop when the session is
/// disconnected or dropped.
pub struct ClientSession {
    identity: String,
    tx: mpsc::UnboundedSender<String>,
    crypto: Arc<CryptoSession>,
    retry: RetryCache,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    retrier: JoinHandle<()>,
}

impl ClientSession {
    pub async fn login(
        addr: impl ToSocketAddrs,
        email: &str,
        password: &str,
        config: ClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>)> {
        let crypto = Arc::new(CryptoSession::new());
        let hello = ClientCommand::Auth {
            email: email.to_string(),
            password: password.to_string(),
            public_key: Some(crypto.public_key_base64()),
        };
        Self::establish(addr, hello, email, crypto, config).await
    }

    /// Create the account and log in with it in one step.
    pub async fn register(
        addr: impl ToSocketAddrs,
        email: &str,
        password: &str,
        config: ClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>)> {
        let crypto = Arc::new(CryptoSession::new());
        let hello = ClientCommand::Register {
            email: email.to_string(),
            password: password.to_string(),
            public_key: Some(crypto.public_key_base64()),
        };
        Self::establish(addr, hello, email, crypto, config).await
    }

    async fn establish(
        addr: impl ToSocketAddrs,
        hello: ClientCommand,
        email: &str,
        crypto: Arc<CryptoSession>,
        config: ClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>)> {
        let stream = TcpStream::connect(addr).await?;
        let sock_ref = socket2::SockRef::from(&stream);
        sock_ref.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let mut reader =
            FramedRead::new(read_half, LinesCodec::new_with_max_length(config.max_line_bytes));
        let mut writer = FramedWrite::new(write_half, LinesCodec::new());

        // --- Auth handshake ---
        writer.send(serde_json::to_string(&hello)?).await?;
        let first = reader.next().await.ok_or(ClientError::Closed)??;
        match serde_json::from_str::<ServerEvent>(&first)? {
            ServerEvent::AuthResult { success: true, .. } => {}
            ServerEvent::AuthResult { message, .. } => {
                return Err(ClientError::Auth(
                    message.unwrap_or_else(|| "rejected".to_string()),
                ));
            }
            other => {
                return Err(ClientError::Auth(format!("unexpected reply {:?}", other)));
            }
        }
        info!("Logged in as {}", email);

        let retry = match &config.cache_dir {
            Some(dir) => RetryCache::load(RetryCache::path_for(dir, email), config.retry).await?,
            None => RetryCache::new(config.retry),
        };

        // Spawn writer task
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let writer_handle = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if writer.send(line).await.is_err() {
                    break;
                }
            }
            let _ = SinkExt::<String>::close(&mut writer).await;
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        // Spawn retry task
        let resend_tx = tx.clone();
        let failed_tx = events_tx.clone();
        let retrier = retry.spawn(move |action| match action {
            RetryAction::Resend(message) => {
                debug!("Resending {}", message.id);
                if let Some(cmd) = ClientCommand::resend(&message) {
                    if let Ok(line) = serde_json::to_string(&cmd) {
                        let _ = resend_tx.send(line);
                    }
                }
            }
            RetryAction::Failed(message) => {
                let _ = failed_tx.send(ClientEvent::SendFailed(message));
            }
        });

        // Spawn reader task
        let inbound = Inbound {
            crypto: crypto.clone(),
            retry: retry.clone(),
            seen: DashSet::new(),
            events: events_tx,
        };
        let reader_handle = tokio::spawn(inbound.run(reader, retrier.abort_handle()));

        let session = Self {
            identity: email.to_string(),
            tx,
            crypto,
            retry,
            reader: reader_handle,
            writer: writer_handle,
            retrier,
        };
        Ok((session, events_rx))
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn public_key(&self) -> String {
        self.crypto.public_key_base64()
    }

    pub fn retry_cache(&self) -> &RetryCache {
        &self.retry
    }

    /// Cache a peer key obtained out of band. First key wins.
    pub fn remember_peer_key(&self, identity: &str, public_key_b64: &str) -> Result<bool> {
        Ok(self.crypto.remember_peer(identity, public_key_b64)?)
    }

    fn send_command(&self, cmd: &ClientCommand) -> Result<()> {
        let line = serde_json::to_string(cmd)?;
        self.tx.send(line).map_err(|_| ClientError::Closed)
    }

    async fn send_tracked(&self, message: Message) -> Result<String> {
        let cmd = ClientCommand::resend(&message).ok_or(ClientError::Closed)?;
        self.retry.cache_message(message.clone()).await?;
        self.send_command(&cmd)?;
        Ok(message.id)
    }

    /// Direct message, encrypted when the recipient's key is known and sent
    /// in the clear otherwise. Returns the message id.
    pub async fn send_private(&self, to: &str, text: &str) -> Result<String> {
        let sealed = self.crypto.seal_for(to, text);
        let message = Message::direct(&self.identity, to, sealed.content).encrypted(sealed.encrypted);
        self.send_tracked(message).await
    }

    /// Group messages are not end-to-end encrypted.
    pub async fn send_group(&self, group_name: &str, text: &str) -> Result<String> {
        let message = Message::group(&self.identity, group_name, text);
        self.send_tracked(message).await
    }

    pub fn broadcast(&self, text: &str) -> Result<()> {
        self.send_command(&ClientCommand::Broadcast {
            content: text.to_string(),
        })
    }

    pub fn send_read_receipt(&self, message_id: &str, sender: &str) -> Result<()> {
        self.send_command(&ClientCommand::ReadReceipt {
            message_id: message_id.to_string(),
            sender: sender.to_string(),
            reader: self.identity.clone(),
        })
    }

    pub fn create_group(&self, group_name: &str, members: &[&str]) -> Result<()> {
        self.send_command(&ClientCommand::CreateGroup {
            group_name: group_name.to_string(),
            members: members.iter().map(|m| m.to_string()).collect(),
        })
    }

    pub fn request_groups(&self) -> Result<()> {
        self.send_command(&ClientCommand::GetGroups)
    }

    pub fn request_history(&self, other_user: &str) -> Result<()> {
        self.send_command(&ClientCommand::GetHistory {
            other_user: other_user.to_string(),
        })
    }

    pub fn request_group_history(&self, group_name: &str) -> Result<()> {
        self.send_command(&ClientCommand::GetGroupHistory {
            group_name: group_name.to_string(),
        })
    }

    pub fn request_public_key(&self, email: &str) -> Result<()> {
        self.send_command(&ClientCommand::GetPublicKey {
            email: email.to_string(),
        })
    }

    pub fn upload_file(&self, to: &str, filename: &str, mime_type: &str, bytes: &[u8]) -> Result<()> {
        self.send_command(&ClientCommand::FileUpload {
            to: to.to_string(),
            filename: filename.to_string(),
            mime_type: mime_type.to_string(),
            data: B64.encode(bytes),
            id: None,
        })
    }

    pub fn upload_group_file(
        &self,
        group_name: &str,
        filename: &str,
        mime_type: &str,
        bytes: &[u8],
    ) -> Result<()> {
        self.send_command(&ClientCommand::GroupFileUpload {
            group_name: group_name.to_string(),
            filename: filename.to_string(),
            mime_type: mime_type.to_string(),
            data: B64.encode(bytes),
            id: None,
        })
    }

    pub fn download_file(&self, file_id: &str, filename: Option<&str>, mime_type: Option<&str>) -> Result<()> {
        self.send_command(&ClientCommand::FileDownload {
            file_id: file_id.to_string(),
            filename: filename.map(str::to_string),
            mime_type: mime_type.map(str::to_string),
        })
    }

    /// Say goodbye and wait for the server to close the connection.
    /// Unconfirmed messages stay in the retry cache for the next session.
    pub async fn disconnect(mut self) {
        self.retrier.abort();
        if self.send_command(&ClientCommand::Disconnect).is_err() {
            return;
        }
        if tokio::time::timeout(DISCONNECT_TIMEOUT, &mut self.reader)
            .await
            .is_err()
        {
            warn!("Server did not close the connection for {}", self.identity);
        }
        info!("{} disconnected", self.identity);
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.retrier.abort();
        self.reader.abort();
        self.writer.abort();
    }
}

/// State the reader task needs to turn server events into client events.
struct Inbound {
    crypto: Arc<CryptoSession>,
    retry: RetryCache,
    /// Ids already handed to the application; redeliveries are dropped.
    seen: DashSet<String>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl Inbound {
    async fn run(self, mut reader: FramedRead<OwnedReadHalf, LinesCodec>, retrier: AbortHandle) {
        while let Some(next) = reader.next().await {
            let line = match next {
                Ok(line) => line,
                Err(e) => {
                    warn!("Connection read failed: {}", e);
                    break;
                }
            };
            match serde_json::from_str::<ServerEvent>(&line) {
                Ok(event) => self.handle(event).await,
                Err(e) => warn!("Unreadable server event: {}", e),
            }
        }

        retrier.abort();
        let _ = self.events.send(ClientEvent::Disconnected);
    }

    fn first_sighting(&self, id: &str) -> bool {
        if self.seen.insert(id.to_string()) {
            true
        } else {
            trace!("Dropping duplicate delivery of {}", id);
            false
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    async fn confirm(&self, message_id: &str) {
        if let Err(e) = self.retry.remove_delivered_message(message_id).await {
            warn!("Could not update retry cache for {}: {}", message_id, e);
        }
    }

    async fn handle(&self, event: ServerEvent) {
        match event {
            ServerEvent::Private {
                id,
                from,
                content,
                timestamp,
                encrypted,
                public_key,
                ..
            } => {
                if let Some(key) = public_key {
                    if let Err(e) = self.crypto.remember_peer(&from, &key) {
                        warn!("Ignoring bad public key from {}: {}", from, e);
                    }
                }
                if !self.first_sighting(&id) {
                    return;
                }

                let content = if encrypted {
                    match self.crypto.decrypt(&content) {
                        Ok(plaintext) => plaintext,
                        Err(e) => {
                            warn!("Could not decrypt {} from {}: {}", id, from, e);
                            self.emit(ClientEvent::Undecryptable { id, from });
                            return;
                        }
                    }
                } else {
                    content
                };
                self.emit(ClientEvent::Private {
                    id,
                    from,
                    content,
                    timestamp,
                    encrypted,
                });
            }

            ServerEvent::GroupMessage { ref id, .. }
            | ServerEvent::Broadcast { ref id, .. }
            | ServerEvent::File { ref id, .. } => {
                if self.first_sighting(id) {
                    self.emit(ClientEvent::Server(event));
                }
            }

            ServerEvent::DeliveryReceipt {
                ref message_id,
                status,
            } => {
                if matches!(status, DeliveryStatus::Delivered | DeliveryStatus::Pending) {
                    self.confirm(message_id).await;
                }
                self.emit(ClientEvent::Server(event));
            }

            ServerEvent::ReadReceipt { ref message_id, .. } => {
                self.confirm(message_id).await;
                self.emit(ClientEvent::Server(event));
            }

            ServerEvent::PublicKey {
                ref email,
                public_key: Some(ref key),
            } => {
                if let Err(e) = self.crypto.remember_peer(email, key) {
                    warn!("Ignoring bad public key for {}: {}", email, e);
                }
                self.emit(ClientEvent::Server(event));
            }

            ServerEvent::FileData {
                file_id,
                filename,
                mime_type,
                data,
            } => match B64.decode(&data) {
                Ok(bytes) => self.emit(ClientEvent::FileData {
                    file_id,
                    filename,
                    mime_type,
                    bytes,
                }),
                Err(e) => warn!("Corrupt file data for {}: {}", file_id, e),
            },

            other => self.emit(ClientEvent::Server(other)),
        }
    }
}
