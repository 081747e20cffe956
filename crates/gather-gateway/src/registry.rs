use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::trace;
use uuid::Uuid;

use gather_types::events::ChatMessage;
use gather_types::models::ConversationId;

/// Fan-out state for a single conversation. The outer registry hands out
/// `Arc`s so same-conversation operations synchronize on the topic's own
/// locks while other conversations proceed untouched.
pub struct ConversationTopic {
    /// Serializes the router's persist-then-fan-out sequence for this
    /// conversation. Held across submit, never by register/deregister.
    pub(crate) submit_lock: Mutex<()>,
    sessions: Mutex<HashMap<Uuid, mpsc::UnboundedSender<ChatMessage>>>,
}

/// Maps each conversation to the set of currently connected sessions and
/// routes inbound messages to all of them. The outer lock is held only
/// for map lookup/insert/remove, never during delivery.
pub struct ConversationRegistry {
    topics: RwLock<HashMap<ConversationId, Arc<ConversationTopic>>>,
}

impl ConversationRegistry {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Topic handle for a conversation, created on first use.
    pub(crate) async fn topic(&self, conversation_id: ConversationId) -> Arc<ConversationTopic> {
        if let Some(topic) = self.topics.read().await.get(&conversation_id) {
            return topic.clone();
        }

        let mut topics = self.topics.write().await;
        topics
            .entry(conversation_id)
            .or_insert_with(|| {
                Arc::new(ConversationTopic {
                    submit_lock: Mutex::new(()),
                    sessions: Mutex::new(HashMap::new()),
                })
            })
            .clone()
    }

    /// Add a session to the conversation's fan-out set. Returns the
    /// receiver half the connection loop forwards to its client.
    pub async fn register(
        &self,
        conversation_id: ConversationId,
        session_id: Uuid,
    ) -> mpsc::UnboundedReceiver<ChatMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let topic = self.topic(conversation_id).await;
        topic.sessions.lock().await.insert(session_id, tx);
        rx
    }

    /// Remove a session from the fan-out set. A no-op when the session
    /// was never registered or was already removed; duplicate close
    /// signals are tolerated.
    pub async fn deregister(&self, conversation_id: ConversationId, session_id: Uuid) {
        let Some(topic) = self.topics.read().await.get(&conversation_id).cloned() else {
            return;
        };

        let now_empty = {
            let mut sessions = topic.sessions.lock().await;
            sessions.remove(&session_id);
            sessions.is_empty()
        };

        if now_empty {
            // Re-check under the write lock: a session may have registered
            // between releasing the topic's lock and acquiring the map's.
            let mut topics = self.topics.write().await;
            if let Some(topic) = topics.get(&conversation_id) {
                if topic.sessions.lock().await.is_empty() {
                    topics.remove(&conversation_id);
                }
            }
        }
    }

    /// Deliver an event to every registered session of the conversation,
    /// except `exclude` when given. A conversation with no registered
    /// sessions drops the event; persistence, not fan-out, is the
    /// durability mechanism.
    pub async fn broadcast(
        &self,
        conversation_id: ConversationId,
        event: &ChatMessage,
        exclude: Option<Uuid>,
    ) {
        let Some(topic) = self.topics.read().await.get(&conversation_id).cloned() else {
            trace!("no sessions on conversation {}, dropping broadcast", conversation_id);
            return;
        };

        let sessions = topic.sessions.lock().await;
        for (session_id, tx) in sessions.iter() {
            if Some(*session_id) == exclude {
                continue;
            }
            // A failed send means the receiver task already exited; its
            // connection loop deregisters it.
            let _ = tx.send(event.clone());
        }
    }

    /// Number of sessions currently registered on a conversation.
    pub async fn session_count(&self, conversation_id: ConversationId) -> usize {
        match self.topics.read().await.get(&conversation_id) {
            Some(topic) => topic.sessions.lock().await.len(),
            None => 0,
        }
    }
}

impl Default for ConversationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(text: &str) -> ChatMessage {
        ChatMessage {
            message: text.into(),
            sender_username: "alice".into(),
            timestamp: Utc::now(),
            message_id: 1,
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_all_registered_sessions() {
        let registry = ConversationRegistry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let mut rx_a = registry.register(7, a).await;
        let mut rx_b = registry.register(7, b).await;

        registry.broadcast(7, &event("hello"), None).await;

        assert_eq!(rx_a.recv().await.unwrap().message, "hello");
        assert_eq!(rx_b.recv().await.unwrap().message, "hello");
    }

    #[tokio::test]
    async fn broadcast_respects_exclude() {
        let registry = ConversationRegistry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let mut rx_a = registry.register(7, a).await;
        let mut rx_b = registry.register(7, b).await;

        registry.broadcast(7, &event("hello"), Some(a)).await;

        assert_eq!(rx_b.recv().await.unwrap().message, "hello");
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn sessions_never_see_other_conversations() {
        let registry = ConversationRegistry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let mut rx_a = registry.register(7, a).await;
        let mut rx_b = registry.register(8, b).await;

        registry.broadcast(7, &event("for seven"), None).await;

        assert_eq!(rx_a.recv().await.unwrap().message, "for seven");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn deregister_is_idempotent() {
        let registry = ConversationRegistry::new();
        let a = Uuid::new_v4();

        let _rx = registry.register(7, a).await;
        assert_eq!(registry.session_count(7).await, 1);

        registry.deregister(7, a).await;
        registry.deregister(7, a).await;
        // Deregistering a session that never registered is also a no-op.
        registry.deregister(9, Uuid::new_v4()).await;

        assert_eq!(registry.session_count(7).await, 0);
    }

    #[tokio::test]
    async fn empty_topics_are_pruned() {
        let registry = ConversationRegistry::new();
        let a = Uuid::new_v4();

        let _rx = registry.register(7, a).await;
        registry.deregister(7, a).await;

        assert!(registry.topics.read().await.is_empty());

        // Broadcasting to a pruned conversation simply drops the event.
        registry.broadcast(7, &event("nobody home"), None).await;
    }
}
