//! Courier gateway: line-delimited JSON over TCP.
//!
//! One task per connection drives a [`session::SessionHandler`]. The
//! registry, group directory, key directory and offline queue are the only
//! state shared between those tasks; all of it hangs off [`router::MessageRouter`].

pub mod config;
pub mod error;
pub mod groups;
pub mod keys;
pub mod offline;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use router::{MessageRouter, Stores};
pub use server::Gateway;
