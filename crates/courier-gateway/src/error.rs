use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed input that can't be recovered as a plain broadcast
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("{0} is already logged in")]
    AlreadyConnected(String),

    #[error("unknown recipient or group: {0}")]
    Route(String),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),

    #[error("network error: {0}")]
    Network(#[from] std::io::Error),
}

impl GatewayError {
    /// Errors that end the session rather than being reported back to the client.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Auth(_) | Self::AlreadyConnected(_))
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
