use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, info, trace, warn};

use courier_types::events::{ClientCommand, Inbound, ServerEvent};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::registry::Connection;
use crate::router::MessageRouter;

/// How long a closing session waits for its writer to flush.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Authenticated { identity: String },
    Closed,
}

enum Flow {
    Continue,
    Disconnect,
}

/// Drives one TCP connection from the first line to close.
///
/// Reads happen on this task; writes go through an unbounded channel to a
/// dedicated writer task, so routing from other sessions never blocks on
/// this socket.
pub struct SessionHandler {
    router: MessageRouter,
    config: GatewayConfig,
    peer: SocketAddr,
    state: SessionState,
}

impl SessionHandler {
    pub fn new(router: MessageRouter, config: GatewayConfig, peer: SocketAddr) -> Self {
        Self {
            router,
            config,
            peer,
            state: SessionState::Connecting,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    fn transition(&mut self, next: SessionState) {
        trace!("{}: {:?} -> {:?}", self.peer, self.state, next);
        self.state = next;
    }

    pub async fn run(mut self, stream: TcpStream) -> Result<()> {
        let sock_ref = socket2::SockRef::from(&stream);
        sock_ref.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(
            read_half,
            LinesCodec::new_with_max_length(self.config.max_line_bytes),
        );

        // Spawn writer task: drains the session channel onto the socket
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let mut writer = FramedWrite::new(write_half, LinesCodec::new());
        let write_handle = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if writer.send(line).await.is_err() {
                    break;
                }
            }
            let _ = SinkExt::<String>::close(&mut writer).await;
        });

        let result = self.drive(&mut reader, tx).await;
        self.transition(SessionState::Closed);

        // Every sender is gone once the binding is removed; the writer then
        // flushes what is left and exits
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, write_handle)
            .await
            .is_err()
        {
            warn!("{}: writer did not drain in time", self.peer);
        }

        result
    }

    async fn drive(
        &mut self,
        reader: &mut FramedRead<OwnedReadHalf, LinesCodec>,
        tx: mpsc::UnboundedSender<String>,
    ) -> Result<()> {
        let Some(first) = self.next_line(reader).await? else {
            debug!("{}: closed before authenticating", self.peer);
            return Ok(());
        };
        self.transition(SessionState::Authenticating);

        let conn = match self.authenticate(&first, tx.clone()).await {
            Ok(conn) => conn,
            Err(e) => {
                info!("{}: {}", self.peer, e);
                let reason = match &e {
                    GatewayError::Auth(reason) => reason.clone(),
                    GatewayError::AlreadyConnected(_) => "already logged in".to_string(),
                    _ => "authentication unavailable".to_string(),
                };
                let _ = tx.send(ServerEvent::auth_failed(reason).to_line());
                return Err(e);
            }
        };
        drop(tx);

        self.transition(SessionState::Authenticated {
            identity: conn.identity().to_string(),
        });
        info!("{} authenticated from {} (conn {})", conn.identity(), self.peer, conn.id());

        let result = self.command_loop(reader, &conn).await;

        self.router.registry().unregister(&conn).await;
        info!("{} disconnected (conn {})", conn.identity(), conn.id());
        result
    }

    /// `Ok(None)` on clean EOF.
    async fn next_line(
        &self,
        reader: &mut FramedRead<OwnedReadHalf, LinesCodec>,
    ) -> Result<Option<String>> {
        let next = match self.config.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, reader.next())
                .await
                .map_err(|_| {
                    GatewayError::Network(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("idle for {:?}", limit),
                    ))
                })?,
            None => reader.next().await,
        };

        match next {
            None => Ok(None),
            Some(Ok(line)) => Ok(Some(line)),
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => Err(GatewayError::Protocol(
                format!("line exceeds {} bytes", self.config.max_line_bytes),
            )),
            Some(Err(LinesCodecError::Io(e))) => Err(GatewayError::Network(e)),
        }
    }

    /// Single attempt: a failed login or registration ends the session.
    async fn authenticate(
        &self,
        line: &str,
        tx: mpsc::UnboundedSender<String>,
    ) -> Result<Connection> {
        let (email, public_key) = match Inbound::decode(line) {
            Inbound::Command(ClientCommand::Auth {
                email,
                password,
                public_key,
            }) => {
                if !self.router.authenticate(&email, &password).await? {
                    return Err(GatewayError::Auth("Invalid email or password".into()));
                }
                (email, public_key)
            }
            Inbound::Command(ClientCommand::Register {
                email,
                password,
                public_key,
            }) => {
                if !self.router.register_user(&email, &password).await? {
                    return Err(GatewayError::Auth(format!(
                        "Could not register {}",
                        email
                    )));
                }
                info!("Registered new user {}", email);
                (email, public_key)
            }
            _ => return Err(GatewayError::Auth("Authentication required".into())),
        };

        let conn = Connection::new(email, tx);
        let greeting = ServerEvent::auth_ok(conn.identity());
        self.router.bind(conn.clone(), &greeting).await?;

        if let Some(key) = public_key {
            self.router.keys().record(conn.identity(), key).await;
        }
        Ok(conn)
    }

    async fn command_loop(
        &self,
        reader: &mut FramedRead<OwnedReadHalf, LinesCodec>,
        conn: &Connection,
    ) -> Result<()> {
        loop {
            let line = match self.next_line(reader).await {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(()),
                Err(e) => {
                    if let GatewayError::Protocol(_) = e {
                        conn.send(&ServerEvent::error(e.to_string()));
                    }
                    return Err(e);
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let flow = match Inbound::decode(&line) {
                Inbound::Command(cmd) => self.handle_command(conn, cmd).await,
                Inbound::Rejected { kind, reason } => {
                    warn!(
                        "{} bad command '{}': {} -- raw: {}",
                        conn.identity(),
                        kind,
                        reason,
                        line.chars().take(200).collect::<String>()
                    );
                    Ok(Flow::Continue)
                }
                Inbound::PlainText(text) => {
                    self.router.plain_text(conn, &text).await;
                    Ok(Flow::Continue)
                }
            };

            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::Disconnect) => return Ok(()),
                Err(e) if e.is_terminal() => return Err(e),
                Err(e) => {
                    warn!("{}: {}", conn.identity(), e);
                    conn.send(&ServerEvent::error(e.to_string()));
                }
            }
        }
    }

    async fn handle_command(&self, conn: &Connection, cmd: ClientCommand) -> Result<Flow> {
        let router = &self.router;
        match cmd {
            ClientCommand::Auth { .. } | ClientCommand::Register { .. } => {
                conn.send(&ServerEvent::error("Already authenticated"));
            }

            ClientCommand::GetHistory { other_user } => {
                router.history(conn, other_user).await?;
            }

            ClientCommand::GetGroupHistory { group_name } => {
                router.group_history(conn, group_name).await?;
            }

            ClientCommand::Private {
                to,
                content,
                id,
                encrypted,
            } => {
                router.send_private(conn, &to, content, id, encrypted).await?;
            }

            ClientCommand::Broadcast { content } => {
                router.broadcast(conn, content).await;
            }

            ClientCommand::ReadReceipt {
                message_id, sender, ..
            } => {
                router.read_receipt(conn, message_id, sender).await;
            }

            ClientCommand::CreateGroup {
                group_name,
                members,
            } => {
                router.create_group(conn, group_name, members).await?;
            }

            ClientCommand::GetGroups => {
                router.list_groups(conn).await;
            }

            ClientCommand::FileUpload {
                to,
                filename,
                mime_type,
                data,
                id,
            } => {
                router
                    .upload_file(conn, &to, filename, mime_type, &data, id)
                    .await?;
            }

            ClientCommand::FileDownload {
                file_id,
                filename,
                mime_type,
            } => {
                router
                    .download_file(conn, file_id, filename, mime_type)
                    .await?;
            }

            ClientCommand::GroupFileUpload {
                group_name,
                filename,
                mime_type,
                data,
                id,
            } => {
                router
                    .upload_group_file(conn, &group_name, filename, mime_type, &data, id)
                    .await?;
            }

            ClientCommand::GetPublicKey { email } => {
                router.public_key(conn, email).await;
            }

            ClientCommand::Disconnect => {
                debug!("{} requested disconnect", conn.identity());
                return Ok(Flow::Disconnect);
            }
        }
        Ok(Flow::Continue)
    }
}
