use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{ConversationId, MessageId};

/// The only client -> server frame on a conversation socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSubmit {
    pub message: String,
}

/// Server -> client frame on a conversation socket. Delivered to every
/// session registered on the conversation, the sender's own included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message: String,
    pub sender_username: String,
    pub timestamp: DateTime<Utc>,
    pub message_id: MessageId,
}

/// Server -> client frames on the unread-count feed. No client -> server
/// events are defined on that channel; read acknowledgement arrives over
/// the HTTP mark-read action instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnreadEvent {
    UnreadCountUpdate {
        conversation_id: ConversationId,
        count: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_message_wire_shape() {
        let event = ChatMessage {
            message: "hello".into(),
            sender_username: "alice".into(),
            timestamp: "2026-08-07T12:00:00Z".parse().unwrap(),
            message_id: 42,
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "message": "hello",
                "sender_username": "alice",
                "timestamp": "2026-08-07T12:00:00Z",
                "message_id": 42,
            })
        );
    }

    #[test]
    fn unread_event_wire_shape() {
        let event = UnreadEvent::UnreadCountUpdate {
            conversation_id: 7,
            count: 3,
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "unread_count_update",
                "conversation_id": 7,
                "count": 3,
            })
        );
    }

    #[test]
    fn chat_submit_parses_client_frame() {
        let submit: ChatSubmit = serde_json::from_str(r#"{"message": "hi there"}"#).unwrap();
        assert_eq!(submit.message, "hi there");

        // Anything else on the conversation channel is a protocol violation.
        assert!(serde_json::from_str::<ChatSubmit>(r#"{"typing": true}"#).is_err());
    }
}
