use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{FileDescriptor, Group, Message};

/// Commands sent FROM client TO server, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ClientCommand {
    /// Login attempt with existing credentials
    #[serde(rename = "auth")]
    Auth {
        email: String,
        password: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
    },

    /// Create an account, then proceed as a login
    #[serde(rename = "register")]
    Register {
        email: String,
        password: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
    },

    #[serde(rename = "GET_HISTORY")]
    GetHistory { other_user: String },

    #[serde(rename = "GET_GROUP_HISTORY")]
    GetGroupHistory { group_name: String },

    /// Direct message. `to` naming a group turns this into a group message.
    #[serde(rename = "private")]
    Private {
        to: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default)]
        encrypted: bool,
    },

    #[serde(rename = "broadcast")]
    Broadcast { content: String },

    #[serde(rename = "read_receipt")]
    ReadReceipt {
        message_id: String,
        sender: String,
        #[serde(default)]
        reader: String,
    },

    #[serde(rename = "create_group")]
    CreateGroup {
        group_name: String,
        #[serde(default)]
        members: Vec<String>,
    },

    #[serde(rename = "get_groups")]
    GetGroups,

    #[serde(rename = "file_upload")]
    FileUpload {
        to: String,
        filename: String,
        mime_type: String,
        /// base64
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    #[serde(rename = "file_download")]
    FileDownload {
        file_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },

    #[serde(rename = "group_file_upload")]
    GroupFileUpload {
        group_name: String,
        filename: String,
        mime_type: String,
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    /// Explicit key-share request
    #[serde(rename = "get_public_key")]
    GetPublicKey { email: String },

    #[serde(rename = "disconnect")]
    Disconnect,
}

impl ClientCommand {
    /// Rebuild the wire command for a message the client already sent once.
    pub fn resend(message: &Message) -> Option<Self> {
        let to = message.recipient.clone()?;
        Some(Self::Private {
            to,
            content: message.content.clone(),
            id: Some(message.id.clone()),
            encrypted: message.encrypted,
        })
    }
}

/// Result of decoding one inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Command(ClientCommand),
    /// Valid JSON object whose `type` is unknown or whose fields don't match.
    Rejected { kind: String, reason: String },
    /// Anything that is not a JSON object. Delivered as a plain broadcast.
    PlainText(String),
}

impl Inbound {
    pub fn decode(line: &str) -> Self {
        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(value @ serde_json::Value::Object(_)) => value,
            _ => return Self::PlainText(line.to_string()),
        };

        let kind = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();

        match serde_json::from_value::<ClientCommand>(value) {
            Ok(cmd) => Self::Command(cmd),
            Err(e) => Self::Rejected {
                kind,
                reason: e.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Delivered,
    Pending,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    pub group_name: String,
    pub members: Vec<String>,
}

impl From<&Group> for GroupSummary {
    fn from(group: &Group) -> Self {
        Self {
            group_name: group.group_name.clone(),
            members: group.members.iter().cloned().collect(),
        }
    }
}

/// Events sent FROM server TO client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    #[serde(rename = "auth")]
    AuthResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        email: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    #[serde(rename = "private")]
    Private {
        id: String,
        from: String,
        to: String,
        content: String,
        timestamp: DateTime<Utc>,
        #[serde(default)]
        encrypted: bool,
        /// Sender's public key, so the recipient can cache it on first contact
        #[serde(default, skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
    },

    #[serde(rename = "group_message")]
    GroupMessage {
        id: String,
        group_name: String,
        from: String,
        content: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "broadcast")]
    Broadcast {
        id: String,
        from: String,
        content: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "delivery_receipt")]
    DeliveryReceipt {
        message_id: String,
        status: DeliveryStatus,
    },

    #[serde(rename = "read_receipt")]
    ReadReceipt {
        message_id: String,
        sender: String,
        reader: String,
    },

    #[serde(rename = "group_created")]
    GroupCreated {
        group_name: String,
        members: Vec<String>,
        info: String,
    },

    #[serde(rename = "group_list")]
    GroupList { groups: Vec<GroupSummary> },

    #[serde(rename = "HISTORY_RESPONSE")]
    History {
        other_user: String,
        messages: Vec<Message>,
    },

    #[serde(rename = "GROUP_HISTORY_RESPONSE")]
    GroupHistory {
        group_name: String,
        messages: Vec<Message>,
    },

    /// A file was shared with the recipient (metadata only)
    #[serde(rename = "file")]
    File {
        id: String,
        file_id: String,
        filename: String,
        mime_type: String,
        size: u64,
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_name: Option<String>,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "file_data")]
    FileData {
        file_id: String,
        filename: String,
        mime_type: String,
        data: String,
    },

    #[serde(rename = "file_receipt")]
    FileReceipt {
        file_id: String,
        status: DeliveryStatus,
    },

    #[serde(rename = "public_key")]
    PublicKey {
        email: String,
        public_key: Option<String>,
    },

    #[serde(rename = "system")]
    System { message: String },

    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerEvent {
    pub fn auth_ok(email: &str) -> Self {
        Self::AuthResult {
            success: true,
            email: Some(email.to_string()),
            message: None,
        }
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::AuthResult {
            success: false,
            email: None,
            message: Some(message.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Event that delivers a stored file message. `None` for other kinds.
    pub fn file_notice(message: &Message, group_name: Option<&str>) -> Option<Self> {
        let descriptor: FileDescriptor = message.file_descriptor()?;
        Some(Self::File {
            id: message.id.clone(),
            file_id: descriptor.id,
            filename: descriptor.filename,
            mime_type: descriptor.mime_type,
            size: descriptor.size,
            from: message.sender.clone(),
            to: match group_name {
                Some(_) => None,
                None => message.recipient.clone(),
            },
            group_name: group_name.map(str::to_string),
            timestamp: message.timestamp,
        })
    }

    /// Encode as a single wire line (no trailing newline).
    pub fn to_line(&self) -> String {
        // Serializing these plain data variants cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}
