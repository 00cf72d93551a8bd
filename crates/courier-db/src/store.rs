//! Persistence interfaces consumed by the gateway.
//!
//! All calls are blocking; async callers go through `spawn_blocking`.

use anyhow::Result;

use courier_types::models::{Group, Message};

pub trait UserStore: Send + Sync {
    /// `Ok(false)` for unknown identity or wrong password.
    fn authenticate(&self, identity: &str, credential: &str) -> Result<bool>;

    /// `Ok(false)` if the identity is already taken.
    fn register(&self, identity: &str, credential: &str) -> Result<bool>;

    fn exists(&self, identity: &str) -> Result<bool>;
}

pub trait ConversationStore: Send + Sync {
    /// Append-only. Returns `Ok(false)` and leaves the stored row untouched
    /// when the id already exists.
    fn save(&self, message: &Message) -> Result<bool>;

    fn find(&self, message_id: &str) -> Result<Option<Message>>;

    /// Oldest first.
    fn history(&self, conversation_id: &str) -> Result<Vec<Message>>;

    fn mark_delivered(&self, message_id: &str) -> Result<()>;

    fn mark_read(&self, message_id: &str) -> Result<()>;
}

pub trait GroupStore: Send + Sync {
    /// `Ok(false)` if the name is already taken.
    fn create(&self, group: &Group) -> Result<bool>;

    fn find_by_name(&self, name: &str) -> Result<Option<Group>>;

    fn members_of(&self, name: &str) -> Result<Vec<String>>;

    fn all_groups(&self) -> Result<Vec<Group>>;
}

pub trait FileStore: Send + Sync {
    /// Persist a blob, returning its locator.
    fn save(&self, bytes: &[u8]) -> Result<String>;

    /// `Ok(None)` for an unknown locator.
    fn load(&self, locator: &str) -> Result<Option<Vec<u8>>>;
}
