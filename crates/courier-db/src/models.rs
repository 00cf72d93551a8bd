/// Database row types; these map directly to SQLite rows.
/// Distinct from courier-types wire models to keep the DB layer independent.

pub struct UserRow {
    pub email: String,
    pub password: String,
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender: String,
    pub recipient: Option<String>,
    pub content: String,
    pub kind: String,
    pub timestamp: String,
    pub delivered: bool,
    pub read: bool,
    pub encrypted: bool,
}
