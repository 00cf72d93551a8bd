use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("no public key known for {0}")]
    MissingPeerKey(String),
    #[error("invalid key: {0}")]
    InvalidKey(&'static str),
    #[error("malformed payload: {0}")]
    Malformed(&'static str),
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}

pub type Result<T> = std::result::Result<T, CryptoError>;
