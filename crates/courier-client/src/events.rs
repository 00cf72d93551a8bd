use chrono::{DateTime, Utc};

use courier_types::events::ServerEvent;
use courier_types::models::Message;

/// What the session hands to the local application.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Direct message. `content` is plaintext; `encrypted` says whether it
    /// travelled encrypted.
    Private {
        id: String,
        from: String,
        content: String,
        timestamp: DateTime<Utc>,
        encrypted: bool,
    },

    /// Encrypted direct message we could not open.
    Undecryptable { id: String, from: String },

    /// Downloaded file contents, already base64-decoded.
    FileData {
        file_id: String,
        filename: String,
        mime_type: String,
        bytes: Vec<u8>,
    },

    /// The retry ceiling was reached without a receipt.
    SendFailed(Message),

    /// Any other server event, unchanged.
    Server(ServerEvent),

    /// The connection is gone. Always the last event.
    Disconnected,
}
