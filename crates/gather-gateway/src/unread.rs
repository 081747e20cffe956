use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{Mutex, RwLock, mpsc};
use uuid::Uuid;

use gather_db::Database;
use gather_types::events::UnreadEvent;
use gather_types::models::ConversationId;

/// Open unread-feed sessions for one user.
struct UserFeed {
    sessions: Mutex<HashMap<Uuid, mpsc::UnboundedSender<UnreadEvent>>>,
}

/// Maintains per-user unread counts and pushes updates to every
/// unread-feed session the user has open.
///
/// The stored counts live in the storage collaborator, derived from each
/// participant's read cursor. That keeps reset-then-query-zero exact
/// under concurrent increments (an increment lands after the cursor or it
/// doesn't), avoids double counting, and survives restarts — which the
/// full-state sync a fresh feed connection performs relies on. The
/// tracker itself owns the live feed registry and all push behavior.
pub struct UnreadTracker {
    db: Arc<Database>,
    feeds: RwLock<HashMap<Uuid, Arc<UserFeed>>>,
}

impl UnreadTracker {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            feeds: RwLock::new(HashMap::new()),
        }
    }

    /// Add a feed session for the user. Returns the receiver half the
    /// connection loop forwards to its client. The caller is expected to
    /// follow up with `initial_counts` to bring the fresh connection up
    /// to date — pushes only cover changes from here on.
    pub async fn register_feed_session(
        &self,
        user_id: Uuid,
        session_id: Uuid,
    ) -> mpsc::UnboundedReceiver<UnreadEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let feed = {
            if let Some(feed) = self.feeds.read().await.get(&user_id) {
                feed.clone()
            } else {
                let mut feeds = self.feeds.write().await;
                feeds
                    .entry(user_id)
                    .or_insert_with(|| {
                        Arc::new(UserFeed {
                            sessions: Mutex::new(HashMap::new()),
                        })
                    })
                    .clone()
            }
        };
        feed.sessions.lock().await.insert(session_id, tx);
        rx
    }

    /// Remove a feed session; tolerates duplicate close signals.
    pub async fn deregister_feed_session(&self, user_id: Uuid, session_id: Uuid) {
        let Some(feed) = self.feeds.read().await.get(&user_id).cloned() else {
            return;
        };

        let now_empty = {
            let mut sessions = feed.sessions.lock().await;
            sessions.remove(&session_id);
            sessions.is_empty()
        };

        if now_empty {
            let mut feeds = self.feeds.write().await;
            if let Some(feed) = feeds.get(&user_id) {
                if feed.sessions.lock().await.is_empty() {
                    feeds.remove(&user_id);
                }
            }
        }
    }

    /// Full-state sync for a fresh feed connection: every conversation
    /// with a non-zero count. Push-only delivery would otherwise lose
    /// whatever accumulated while the user had no feed session open.
    pub async fn initial_counts(&self, user_id: Uuid) -> Result<Vec<UnreadEvent>> {
        let db = self.db.clone();
        let rows = tokio::task::spawn_blocking(move || db.unread_counts(&user_id.to_string()))
            .await
            .context("unread sync task failed")??;

        Ok(rows
            .into_iter()
            .map(|row| UnreadEvent::UnreadCountUpdate {
                conversation_id: row.conversation_id,
                count: row.count,
            })
            .collect())
    }

    /// Stored count for one (user, conversation) pair.
    pub async fn count(&self, user_id: Uuid, conversation_id: ConversationId) -> Result<u64> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.unread_count(&user_id.to_string(), conversation_id))
            .await
            .context("unread count task failed")?
    }

    /// Called by the router once a message is persisted: push the fresh
    /// count for the conversation to every participant except the sender
    /// (own messages never count as unread). A recipient with no open
    /// feed session only has stored state change; their next feed
    /// connection picks it up via `initial_counts`.
    pub async fn on_new_message(
        &self,
        conversation_id: ConversationId,
        sender_id: Uuid,
        participants: &[Uuid],
    ) -> Result<()> {
        for &user_id in participants {
            if user_id == sender_id {
                continue;
            }
            let count = self.count(user_id, conversation_id).await?;
            self.push(
                user_id,
                UnreadEvent::UnreadCountUpdate {
                    conversation_id,
                    count,
                },
            )
            .await;
        }
        Ok(())
    }

    /// The external mark-read action: reset the user's count for the
    /// conversation to zero and push the zeroed update to their open feed
    /// sessions. Messages persisted after the reset count again.
    pub async fn on_conversation_read(
        &self,
        user_id: Uuid,
        conversation_id: ConversationId,
    ) -> Result<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.mark_read(&user_id.to_string(), conversation_id))
            .await
            .context("mark-read task failed")??;

        self.push(
            user_id,
            UnreadEvent::UnreadCountUpdate {
                conversation_id,
                count: 0,
            },
        )
        .await;
        Ok(())
    }

    async fn push(&self, user_id: Uuid, event: UnreadEvent) {
        let Some(feed) = self.feeds.read().await.get(&user_id).cloned() else {
            return;
        };
        let sessions = feed.sessions.lock().await;
        for tx in sessions.values() {
            let _ = tx.send(event.clone());
        }
    }
}
