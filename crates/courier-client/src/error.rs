use thiserror::Error;
use tokio_util::codec::LinesCodecError;

use courier_crypto::CryptoError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] LinesCodecError),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("connection closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, ClientError>;
