use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Conversations and messages carry the storage layer's integer ids.
/// Message ids within a conversation are assigned in persistence order,
/// so they double as the delivery order every session observes.
pub type ConversationId = i64;
pub type MessageId = i64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

/// A persisted message. Immutable once created; the id and timestamp are
/// assigned server-side when the message is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: Uuid,
    pub sender_username: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

/// The logical topic a live connection is bound to — exactly one per
/// session, for the lifetime of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Conversation(ConversationId),
    UnreadFeed,
}
