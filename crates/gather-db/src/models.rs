/// Database row types — these map directly to SQLite rows.
/// Distinct from gather-types API models to keep the DB layer independent.

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub created_at: String,
}

/// A conversation row joined with the querying user's unread count.
pub struct ConversationListRow {
    pub id: i64,
    pub created_at: String,
    pub unread_count: u64,
}

pub struct MessageRow {
    pub id: i64,
    pub conversation_id: i64,
    pub sender_id: String,
    pub sender_username: String,
    pub body: String,
    pub created_at: String,
}

pub struct UnreadRow {
    pub conversation_id: i64,
    pub count: u64,
}
