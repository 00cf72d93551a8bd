//! Client side of the courier protocol.
//!
//! [`ClientSession`] owns one authenticated TCP connection, a per-process
//! [`courier_crypto::CryptoSession`] for direct messages and a
//! [`RetryCache`] that resends unacknowledged messages until the server
//! confirms them. Everything the server sends surfaces as a [`ClientEvent`].

pub mod error;
pub mod events;
pub mod retry;
pub mod session;

pub use error::ClientError;
pub use events::ClientEvent;
pub use retry::{RetryCache, RetryConfig};
pub use session::{ClientConfig, ClientSession};
