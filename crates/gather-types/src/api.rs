use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ConversationId, MessageId};

// -- JWT Claims --

/// JWT claims shared across gather-api (REST middleware) and the server's
/// WebSocket upgrade handlers. Canonical definition lives here in
/// gather-types to eliminate duplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: Uuid,
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user_id: Uuid,
    pub username: String,
    pub token: String,
}

// -- Conversations --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateConversationRequest {
    pub participant_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct ConversationResponse {
    pub id: ConversationId,
}

/// One row of the conversation list: who is in it and how much of it the
/// current user has not read yet.
#[derive(Debug, Serialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub participants: Vec<String>,
    pub unread_count: u64,
    pub created_at: DateTime<Utc>,
}

// -- Messages --

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_username: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}
