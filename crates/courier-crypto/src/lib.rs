/// Courier Crypto Library
///
/// Hybrid encryption for direct messages:
/// - one X25519 keypair per process, public half shared at login
/// - a fresh AES-256-GCM key for every outbound message
/// - that key wrapped for the recipient via ephemeral X25519 + HKDF-SHA256
///
/// Group and broadcast payloads are not end-to-end encrypted.

pub mod encrypt;
pub mod error;
pub mod hybrid;
pub mod keys;
pub mod session;

pub use error::CryptoError;
pub use session::{CryptoSession, Sealed};
