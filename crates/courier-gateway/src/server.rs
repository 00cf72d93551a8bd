use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::config::GatewayConfig;
use crate::router::MessageRouter;
use crate::session::SessionHandler;

/// The TCP accept loop. Each connection gets its own task and session.
#[derive(Clone)]
pub struct Gateway {
    router: MessageRouter,
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(router: MessageRouter, config: GatewayConfig) -> Self {
        Self { router, config }
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    /// Accept connections until the task is cancelled.
    pub async fn run(self, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!("Gateway listening on {}", addr);
        }

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("New connection from {}", addr);
                    let session = SessionHandler::new(self.router.clone(), self.config.clone(), addr);
                    tokio::spawn(async move {
                        if let Err(e) = session.run(stream).await {
                            warn!("Session {} ended: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }
}
