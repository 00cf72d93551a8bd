use anyhow::Result;
use rusqlite::Connection;
use tracing::debug;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            email       TEXT PRIMARY KEY,
            password    TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            sender          TEXT NOT NULL,
            recipient       TEXT,
            content         TEXT NOT NULL,
            kind            TEXT NOT NULL,
            timestamp       TEXT NOT NULL,
            delivered       INTEGER NOT NULL DEFAULT 0,
            is_read         INTEGER NOT NULL DEFAULT 0,
            encrypted       INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, timestamp);

        CREATE TABLE IF NOT EXISTS chat_groups (
            name        TEXT PRIMARY KEY,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS group_members (
            group_name  TEXT NOT NULL REFERENCES chat_groups(name) ON DELETE CASCADE,
            member      TEXT NOT NULL,
            PRIMARY KEY (group_name, member)
        );
        ",
    )?;

    debug!("Database migrations complete");
    Ok(())
}
