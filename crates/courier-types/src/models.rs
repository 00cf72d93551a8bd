use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Conversation id shared by every broadcast message.
pub const BROADCAST_CONVERSATION: &str = "broadcast";

const GROUP_CONVERSATION_PREFIX: &str = "group_";
const DIRECT_CONVERSATION_PREFIX: &str = "dm:";

/// Deterministic conversation id for a direct pair. Order-independent.
///
/// The length of the lower identity is encoded so that no two pairs share an
/// id whatever characters the identities contain, and the `dm:` prefix keeps
/// direct ids apart from group and broadcast ids.
pub fn conversation_id(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{}{}:{}:{}", DIRECT_CONVERSATION_PREFIX, lo.len(), lo, hi)
}

pub fn group_conversation_id(group_name: &str) -> String {
    format!("{}{}", GROUP_CONVERSATION_PREFIX, group_name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Private,
    Group,
    Broadcast,
    File,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Group => "group",
            Self::Broadcast => "broadcast",
            Self::File => "file",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMessageKind(pub String);

impl fmt::Display for UnknownMessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown message kind '{}'", self.0)
    }
}

impl std::error::Error for UnknownMessageKind {}

impl FromStr for MessageKind {
    type Err = UnknownMessageKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(Self::Private),
            "group" => Ok(Self::Group),
            "broadcast" => Ok(Self::Broadcast),
            "file" => Ok(Self::File),
            other => Err(UnknownMessageKind(other.to_string())),
        }
    }
}

/// A single chat message. `id` is the deduplication key for redelivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    pub content: String,
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub delivered: bool,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub encrypted: bool,
}

impl Message {
    fn new(
        conversation_id: String,
        sender: &str,
        recipient: Option<&str>,
        content: String,
        kind: MessageKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id,
            sender: sender.to_string(),
            recipient: recipient.map(str::to_string),
            content,
            kind,
            timestamp: Utc::now(),
            delivered: false,
            read: false,
            encrypted: false,
        }
    }

    pub fn direct(sender: &str, recipient: &str, content: impl Into<String>) -> Self {
        Self::new(
            conversation_id(sender, recipient),
            sender,
            Some(recipient),
            content.into(),
            MessageKind::Private,
        )
    }

    pub fn group(sender: &str, group_name: &str, content: impl Into<String>) -> Self {
        Self::new(
            group_conversation_id(group_name),
            sender,
            Some(group_name),
            content.into(),
            MessageKind::Group,
        )
    }

    pub fn broadcast(sender: &str, content: impl Into<String>) -> Self {
        Self::new(
            BROADCAST_CONVERSATION.to_string(),
            sender,
            None,
            content.into(),
            MessageKind::Broadcast,
        )
    }

    /// File metadata message. The descriptor is carried as JSON content.
    pub fn file(sender: &str, target: FileTarget<'_>, descriptor: &FileDescriptor) -> Self {
        let content = serde_json::to_string(descriptor).unwrap_or_default();
        let (conversation, recipient) = match target {
            FileTarget::User(user) => (conversation_id(sender, user), user),
            FileTarget::Group(group) => (group_conversation_id(group), group),
        };
        Self::new(conversation, sender, Some(recipient), content, MessageKind::File)
    }

    /// Keep a caller-supplied id so retries of the same message deduplicate.
    pub fn with_id(mut self, id: Option<String>) -> Self {
        if let Some(id) = id.filter(|id| !id.is_empty()) {
            self.id = id;
        }
        self
    }

    pub fn encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    /// Parse the descriptor back out of a `file` message.
    pub fn file_descriptor(&self) -> Option<FileDescriptor> {
        if self.kind != MessageKind::File {
            return None;
        }
        serde_json::from_str(&self.content).ok()
    }
}

#[derive(Debug, Clone, Copy)]
pub enum FileTarget<'a> {
    User(&'a str),
    Group(&'a str),
}

/// Content descriptor for a stored file blob. `id` is the store locator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub id: String,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub group_name: String,
    pub members: BTreeSet<String>,
}

impl Group {
    pub fn new(name: impl Into<String>, members: impl IntoIterator<Item = String>) -> Self {
        Self {
            group_name: name.into(),
            members: members.into_iter().collect(),
        }
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.members.contains(identity)
    }
}
