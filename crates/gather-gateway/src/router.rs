use std::sync::Arc;

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use gather_db::Database;
use gather_types::events::ChatMessage;
use gather_types::models::{Channel, ConversationId, Message};

use crate::registry::ConversationRegistry;
use crate::session::Session;
use crate::unread::UnreadTracker;

/// Why a submit was rejected. A storage failure aborts before any count
/// update or fan-out, so a message that fails to persist is never
/// observed by anyone.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("message body is empty")]
    EmptyBody,
    #[error("session is not bound to a conversation")]
    WrongChannel,
    #[error("failed to persist message: {0}")]
    Storage(#[source] anyhow::Error),
}

/// Composition root of the messaging core: accepts an inbound message
/// from a connection session, persists it, updates unread counts for the
/// other participants, and fans the event out to every session on the
/// conversation — the sender's own sessions included, so multi-tab views
/// stay consistent.
pub struct MessageRouter {
    db: Arc<Database>,
    registry: Arc<ConversationRegistry>,
    unread: Arc<UnreadTracker>,
}

impl MessageRouter {
    pub fn new(
        db: Arc<Database>,
        registry: Arc<ConversationRegistry>,
        unread: Arc<UnreadTracker>,
    ) -> Self {
        Self {
            db,
            registry,
            unread,
        }
    }

    pub async fn submit(&self, session: &Session, text: &str) -> Result<Message, SubmitError> {
        let Channel::Conversation(conversation_id) = session.channel else {
            return Err(SubmitError::WrongChannel);
        };

        let body = text.trim();
        if body.is_empty() {
            return Err(SubmitError::EmptyBody);
        }

        let topic = self.registry.topic(conversation_id).await;
        // Concurrent sends to the same conversation serialize here, so the
        // order broadcasts go out always matches the persisted id order.
        // Sends to different conversations share nothing but the storage
        // handle.
        let _serialized = topic.submit_lock.lock().await;

        let timestamp = Utc::now();
        let db = self.db.clone();
        let sender_id = session.user_id;
        let body_owned = body.to_string();
        let (message_id, participants) = tokio::task::spawn_blocking(move || {
            let id = db.insert_message(
                conversation_id,
                &sender_id.to_string(),
                &body_owned,
                &timestamp.to_rfc3339(),
            )?;
            let participants = db.participant_ids(conversation_id)?;
            Ok::<_, anyhow::Error>((id, participants))
        })
        .await
        .map_err(|e| SubmitError::Storage(anyhow::anyhow!("storage task failed: {}", e)))?
        .map_err(SubmitError::Storage)?;

        let participants: Vec<Uuid> = participants
            .iter()
            .filter_map(|id| match id.parse() {
                Ok(uid) => Some(uid),
                Err(e) => {
                    warn!("Corrupt participant id '{}' on conversation {}: {}", id, conversation_id, e);
                    None
                }
            })
            .collect();

        if let Err(e) = self
            .unread
            .on_new_message(conversation_id, sender_id, &participants)
            .await
        {
            // The message is persisted and the read cursors are untouched,
            // so stored counts remain correct; only this push was lost.
            warn!("unread update for message {} failed: {}", message_id, e);
        }

        let message = Message {
            id: message_id,
            conversation_id,
            sender_id,
            sender_username: session.username.clone(),
            body: body.to_string(),
            timestamp,
        };

        let event = ChatMessage {
            message: message.body.clone(),
            sender_username: message.sender_username.clone(),
            timestamp: message.timestamp,
            message_id: message.id,
        };
        self.registry.broadcast(conversation_id, &event, None).await;

        Ok(message)
    }

    /// The external mark-read action, surfaced over HTTP.
    pub async fn mark_read(
        &self,
        user_id: Uuid,
        conversation_id: ConversationId,
    ) -> anyhow::Result<()> {
        self.unread.on_conversation_read(user_id, conversation_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gather_types::events::UnreadEvent;

    struct Harness {
        db: Arc<Database>,
        registry: Arc<ConversationRegistry>,
        tracker: Arc<UnreadTracker>,
        router: Arc<MessageRouter>,
        alice: Uuid,
        bob: Uuid,
        conversation_id: ConversationId,
    }

    fn user(db: &Database, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        db.create_user(&id.to_string(), name, "hash").unwrap();
        id
    }

    fn harness() -> Harness {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let alice = user(&db, "alice");
        let bob = user(&db, "bob");
        let conversation_id = db
            .create_conversation(&alice.to_string(), &bob.to_string())
            .unwrap();

        let registry = Arc::new(ConversationRegistry::new());
        let tracker = Arc::new(UnreadTracker::new(db.clone()));
        let router = Arc::new(MessageRouter::new(
            db.clone(),
            registry.clone(),
            tracker.clone(),
        ));

        Harness {
            db,
            registry,
            tracker,
            router,
            alice,
            bob,
            conversation_id,
        }
    }

    fn chat_session(h: &Harness, user_id: Uuid, name: &str) -> Session {
        let session = Session::new(user_id, name.into(), Channel::Conversation(h.conversation_id));
        session.mark_open();
        session
    }

    #[tokio::test]
    async fn empty_body_is_rejected_before_anything_happens() {
        let h = harness();
        let session = chat_session(&h, h.alice, "alice");
        let mut rx = h.registry.register(h.conversation_id, session.id).await;

        let result = h.router.submit(&session, "   \n\t  ").await;
        assert!(matches!(result, Err(SubmitError::EmptyBody)));

        assert!(rx.try_recv().is_err());
        assert!(h.db.get_messages(h.conversation_id, 10).unwrap().is_empty());
        assert_eq!(h.tracker.count(h.bob, h.conversation_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn submit_from_feed_session_is_a_protocol_violation() {
        let h = harness();
        let session = Session::new(h.alice, "alice".into(), Channel::UnreadFeed);
        session.mark_open();

        let result = h.router.submit(&session, "hello").await;
        assert!(matches!(result, Err(SubmitError::WrongChannel)));
    }

    #[tokio::test]
    async fn sender_sessions_receive_their_own_broadcast() {
        let h = harness();
        let alice_tab_one = chat_session(&h, h.alice, "alice");
        let alice_tab_two = chat_session(&h, h.alice, "alice");
        let bob_session = chat_session(&h, h.bob, "bob");

        let mut rx_one = h.registry.register(h.conversation_id, alice_tab_one.id).await;
        let mut rx_two = h.registry.register(h.conversation_id, alice_tab_two.id).await;
        let mut rx_bob = h.registry.register(h.conversation_id, bob_session.id).await;

        let message = h.router.submit(&alice_tab_one, "hello").await.unwrap();

        for rx in [&mut rx_one, &mut rx_two, &mut rx_bob] {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.message, "hello");
            assert_eq!(event.sender_username, "alice");
            assert_eq!(event.message_id, message.id);
        }
    }

    #[tokio::test]
    async fn unread_increments_even_while_recipient_is_connected() {
        // There is no "currently viewing" signal distinct from being
        // connected: a recipient with the conversation open still has
        // their count incremented.
        let h = harness();
        let alice_session = chat_session(&h, h.alice, "alice");
        let bob_session = chat_session(&h, h.bob, "bob");

        let _rx_a = h.registry.register(h.conversation_id, alice_session.id).await;
        let mut rx_b = h.registry.register(h.conversation_id, bob_session.id).await;
        let mut bob_feed = h.tracker.register_feed_session(h.bob, Uuid::new_v4()).await;

        h.router.submit(&alice_session, "hello").await.unwrap();

        assert_eq!(rx_b.recv().await.unwrap().message, "hello");
        let UnreadEvent::UnreadCountUpdate { conversation_id, count } =
            bob_feed.recv().await.unwrap();
        assert_eq!((conversation_id, count), (h.conversation_id, 1));
        assert_eq!(h.tracker.count(h.bob, h.conversation_id).await.unwrap(), 1);
        // The sender's count never moves.
        assert_eq!(h.tracker.count(h.alice, h.conversation_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn increments_are_exactly_once_per_message() {
        let h = harness();
        let alice_session = chat_session(&h, h.alice, "alice");

        for expected in 1..=3u64 {
            h.router.submit(&alice_session, "ping").await.unwrap();
            assert_eq!(
                h.tracker.count(h.bob, h.conversation_id).await.unwrap(),
                expected
            );
        }
    }

    #[tokio::test]
    async fn mark_read_resets_and_later_messages_count_again() {
        let h = harness();
        let alice_session = chat_session(&h, h.alice, "alice");

        h.router.submit(&alice_session, "one").await.unwrap();
        h.router.submit(&alice_session, "two").await.unwrap();
        assert_eq!(h.tracker.count(h.bob, h.conversation_id).await.unwrap(), 2);

        h.router.mark_read(h.bob, h.conversation_id).await.unwrap();
        assert_eq!(h.tracker.count(h.bob, h.conversation_id).await.unwrap(), 0);

        h.router.submit(&alice_session, "three").await.unwrap();
        assert_eq!(h.tracker.count(h.bob, h.conversation_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_sends_are_observed_in_one_total_order() {
        let h = harness();
        let observer_one = chat_session(&h, h.alice, "alice");
        let observer_two = chat_session(&h, h.bob, "bob");

        let mut rx_one = h.registry.register(h.conversation_id, observer_one.id).await;
        let mut rx_two = h.registry.register(h.conversation_id, observer_two.id).await;

        let mut handles = Vec::new();
        for (user_id, name) in [(h.alice, "alice"), (h.bob, "bob")] {
            let router = h.router.clone();
            let conversation_id = h.conversation_id;
            handles.push(tokio::spawn(async move {
                let session = Session::new(user_id, name.into(), Channel::Conversation(conversation_id));
                session.mark_open();
                for i in 0..10 {
                    router
                        .submit(&session, &format!("{} {}", name, i))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut order_one = Vec::new();
        while let Ok(event) = rx_one.try_recv() {
            order_one.push(event.message_id);
        }
        let mut order_two = Vec::new();
        while let Ok(event) = rx_two.try_recv() {
            order_two.push(event.message_id);
        }

        assert_eq!(order_one.len(), 20);
        // Every session observes the same order, and it is the persisted
        // id order.
        assert_eq!(order_one, order_two);
        assert!(order_one.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn offline_participant_accumulates_until_feed_sync() {
        let h = harness();
        let alice_session = chat_session(&h, h.alice, "alice");

        for body in ["one", "two", "three"] {
            h.router.submit(&alice_session, body).await.unwrap();
        }

        // Bob connects a feed session later; the initial sync reports the
        // accumulated count.
        let events = h.tracker.initial_counts(h.bob).await.unwrap();
        assert_eq!(events.len(), 1);
        let UnreadEvent::UnreadCountUpdate { conversation_id, count } = events[0].clone();
        assert_eq!((conversation_id, count), (h.conversation_id, 3));
    }

    #[tokio::test]
    async fn submitted_body_is_trimmed() {
        let h = harness();
        let session = chat_session(&h, h.alice, "alice");
        let mut rx = h.registry.register(h.conversation_id, session.id).await;

        let message = h.router.submit(&session, "  hello  ").await.unwrap();
        assert_eq!(message.body, "hello");
        assert_eq!(rx.recv().await.unwrap().message, "hello");
    }
}
