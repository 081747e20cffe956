use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use gather_types::events::ChatSubmit;
use gather_types::models::{Channel, ConversationId};

use crate::registry::ConversationRegistry;
use crate::router::{MessageRouter, SubmitError};
use crate::session::Session;
use crate::unread::UnreadTracker;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle a pre-authenticated conversation socket. The JWT and the
/// participant check already ran at the HTTP upgrade layer, so the
/// session registers for fan-out and goes straight into the event loop.
pub async fn handle_chat_connection(
    socket: WebSocket,
    router: Arc<MessageRouter>,
    registry: Arc<ConversationRegistry>,
    user_id: Uuid,
    username: String,
    conversation_id: ConversationId,
) {
    let session = Arc::new(Session::new(
        user_id,
        username.clone(),
        Channel::Conversation(conversation_id),
    ));
    let (mut sender, mut receiver) = socket.split();

    info!("{} ({}) connected to conversation {}", username, user_id, conversation_id);

    let mut events_rx = registry.register(conversation_id, session.id).await;
    session.mark_open();

    // Shared flag for heartbeat
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward fan-out events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = events_rx.recv() => {
                    let Some(event) = result else { break };
                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read frames from the client. A transport failure ends the stream
    // and is handled exactly like a client-initiated close.
    let recv_session = session.clone();
    let recv_router = router.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let submit = match serde_json::from_str::<ChatSubmit>(&text) {
                        Ok(submit) => submit,
                        Err(e) => {
                            // A frame that doesn't match the channel's
                            // shape closes the connection.
                            warn!(
                                "{} ({}) bad frame on conversation {}: {} -- raw: {}",
                                recv_session.username,
                                recv_session.user_id,
                                conversation_id,
                                e,
                                &text[..text.len().min(200)]
                            );
                            break;
                        }
                    };

                    match recv_router.submit(&recv_session, &submit.message).await {
                        Ok(_) => {}
                        Err(SubmitError::EmptyBody) => {
                            // Rejected before persistence; nobody is notified.
                            debug!(
                                "{} ({}) sent an empty message on conversation {}",
                                recv_session.username, recv_session.user_id, conversation_id
                            );
                        }
                        Err(SubmitError::WrongChannel) => {
                            warn!(
                                "{} ({}) submit on a non-conversation session",
                                recv_session.username, recv_session.user_id
                            );
                            break;
                        }
                        Err(SubmitError::Storage(e)) => {
                            // Not broadcast, not counted. There is no
                            // acknowledgement protocol to tell the client.
                            warn!(
                                "failed to persist message from {} ({}) on conversation {}: {}",
                                recv_session.username, recv_session.user_id, conversation_id, e
                            );
                        }
                    }
                }
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Every exit path funnels through here; the session state machine
    // makes the deregistration run exactly once even if closes race.
    if session.begin_close() {
        registry.deregister(conversation_id, session.id).await;
        session.mark_closed();
    }
    info!("{} ({}) disconnected from conversation {}", username, user_id, conversation_id);
}

/// Handle a pre-authenticated unread-feed socket. The feed is push-only:
/// client frames are ignored, and a fresh connection starts with a
/// full-state sync of every non-zero count.
pub async fn handle_unread_connection(
    socket: WebSocket,
    tracker: Arc<UnreadTracker>,
    user_id: Uuid,
    username: String,
) {
    let session = Arc::new(Session::new(user_id, username.clone(), Channel::UnreadFeed));
    let (mut sender, mut receiver) = socket.split();

    info!("{} ({}) connected to unread feed", username, user_id);

    let mut events_rx = tracker.register_feed_session(user_id, session.id).await;
    session.mark_open();

    let sync_events = match tracker.initial_counts(user_id).await {
        Ok(events) => events,
        Err(e) => {
            warn!("initial unread sync for {} ({}) failed: {}", username, user_id, e);
            Vec::new()
        }
    };

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    let mut send_task = tokio::spawn(async move {
        for event in sync_events {
            let text = serde_json::to_string(&event).unwrap();
            if sender.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = events_rx.recv() => {
                    let Some(event) = result else { break };
                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let recv_username = username.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                Message::Text(_) => {
                    // No client -> server events are defined on the feed;
                    // read acknowledgement arrives over HTTP instead.
                    debug!("{} sent a frame on the unread feed, ignoring", recv_username);
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    if session.begin_close() {
        tracker.deregister_feed_session(user_id, session.id).await;
        session.mark_closed();
    }
    info!("{} ({}) disconnected from unread feed", username, user_id);
}
