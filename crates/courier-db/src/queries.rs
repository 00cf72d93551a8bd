use anyhow::Result;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString};
use chrono::{DateTime, SecondsFormat, Utc};
use rand_core::OsRng;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::warn;

use courier_types::models::{Group, Message, MessageKind};

use crate::Database;
use crate::models::{MessageRow, UserRow};
use crate::store::{ConversationStore, GroupStore, UserStore};

impl UserStore for Database {
    fn authenticate(&self, identity: &str, credential: &str) -> Result<bool> {
        let Some(user) = self.with_conn(|conn| query_user(conn, identity))? else {
            return Ok(false);
        };

        let parsed_hash = PasswordHash::new(&user.password)
            .map_err(|e| anyhow::anyhow!("Corrupt password hash for {}: {}", user.email, e))?;

        Ok(Argon2::default()
            .verify_password(credential.as_bytes(), &parsed_hash)
            .is_ok())
    }

    fn register(&self, identity: &str, credential: &str) -> Result<bool> {
        if identity.trim().is_empty() || credential.is_empty() {
            return Ok(false);
        }

        // Hash password with Argon2id
        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(credential.as_bytes(), &salt)
            .map_err(|e| anyhow::anyhow!("Password hashing failed: {}", e))?
            .to_string();

        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO users (email, password) VALUES (?1, ?2)",
                (identity, &password_hash),
            )?;
            Ok(inserted == 1)
        })
    }

    fn exists(&self, identity: &str) -> Result<bool> {
        self.with_conn(|conn| Ok(query_user(conn, identity)?.is_some()))
    }
}

impl ConversationStore for Database {
    fn save(&self, message: &Message) -> Result<bool> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO messages
                    (id, conversation_id, sender, recipient, content, kind, timestamp, delivered, is_read, encrypted)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    message.id,
                    message.conversation_id,
                    message.sender,
                    message.recipient,
                    message.content,
                    message.kind.as_str(),
                    message.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
                    message.delivered,
                    message.read,
                    message.encrypted,
                ],
            )?;
            Ok(inserted == 1)
        })
    }

    fn find(&self, message_id: &str) -> Result<Option<Message>> {
        let row = self.with_conn(|conn| query_message(conn, message_id))?;
        Ok(row.and_then(row_to_message))
    }

    fn history(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let rows = self.with_conn(|conn| query_messages(conn, conversation_id))?;
        Ok(rows.into_iter().filter_map(row_to_message).collect())
    }

    fn mark_delivered(&self, message_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("UPDATE messages SET delivered = 1 WHERE id = ?1", [message_id])?;
            Ok(())
        })
    }

    fn mark_read(&self, message_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE messages SET is_read = 1, delivered = 1 WHERE id = ?1",
                [message_id],
            )?;
            Ok(())
        })
    }
}

impl GroupStore for Database {
    fn create(&self, group: &Group) -> Result<bool> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO chat_groups (name) VALUES (?1)",
                [&group.group_name],
            )?;
            if inserted == 0 {
                return Ok(false);
            }
            for member in &group.members {
                tx.execute(
                    "INSERT OR IGNORE INTO group_members (group_name, member) VALUES (?1, ?2)",
                    (&group.group_name, member),
                )?;
            }
            tx.commit()?;
            Ok(true)
        })
    }

    fn find_by_name(&self, name: &str) -> Result<Option<Group>> {
        self.with_conn(|conn| {
            let exists = conn
                .query_row("SELECT name FROM chat_groups WHERE name = ?1", [name], |row| {
                    row.get::<_, String>(0)
                })
                .optional()?;

            match exists {
                Some(name) => {
                    let members = query_members(conn, &name)?;
                    Ok(Some(Group::new(name, members)))
                }
                None => Ok(None),
            }
        })
    }

    fn members_of(&self, name: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| query_members(conn, name))
    }

    fn all_groups(&self) -> Result<Vec<Group>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM chat_groups ORDER BY name")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            names
                .into_iter()
                .map(|name| -> Result<Group> {
                    let members = query_members(conn, &name)?;
                    Ok(Group::new(name, members))
                })
                .collect()
        })
    }
}

fn query_user(conn: &Connection, email: &str) -> Result<Option<UserRow>> {
    let row = conn
        .query_row(
            "SELECT email, password FROM users WHERE email = ?1",
            [email],
            |row| {
                Ok(UserRow {
                    email: row.get(0)?,
                    password: row.get(1)?,
                })
            },
        )
        .optional()?;

    Ok(row)
}

fn query_members(conn: &Connection, group_name: &str) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT member FROM group_members WHERE group_name = ?1 ORDER BY member")?;
    let members = stmt
        .query_map([group_name], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(members)
}

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender, recipient, content, kind, timestamp, delivered, is_read, encrypted";

fn message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender: row.get(2)?,
        recipient: row.get(3)?,
        content: row.get(4)?,
        kind: row.get(5)?,
        timestamp: row.get(6)?,
        delivered: row.get(7)?,
        read: row.get(8)?,
        encrypted: row.get(9)?,
    })
}

fn query_message(conn: &Connection, message_id: &str) -> Result<Option<MessageRow>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS),
            [message_id],
            message_row,
        )
        .optional()?;
    Ok(row)
}

fn query_messages(conn: &Connection, conversation_id: &str) -> Result<Vec<MessageRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM messages
         WHERE conversation_id = ?1
         ORDER BY timestamp ASC, rowid ASC",
        MESSAGE_COLUMNS
    ))?;

    let rows = stmt
        .query_map([conversation_id], message_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

fn row_to_message(row: MessageRow) -> Option<Message> {
    let kind: MessageKind = match row.kind.parse() {
        Ok(kind) => kind,
        Err(e) => {
            warn!("Skipping message '{}': {}", row.id, e);
            return None;
        }
    };
    let timestamp = DateTime::parse_from_rfc3339(&row.timestamp)
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}' on message '{}': {}", row.timestamp, row.id, e);
            DateTime::default()
        });

    Some(Message {
        id: row.id,
        conversation_id: row.conversation_id,
        sender: row.sender,
        recipient: row.recipient,
        content: row.content,
        kind,
        timestamp,
        delivered: row.delivered,
        read: row.read,
        encrypted: row.encrypted,
    })
}
