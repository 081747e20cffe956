use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::{error, warn};

use gather_types::api::{
    Claims, ConversationResponse, ConversationSummary, CreateConversationRequest, MessageResponse,
};
use gather_types::models::ConversationId;

use crate::auth::AppState;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

/// Conversations for the current user, each with its unread count.
pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let user_id = claims.sub.to_string();

    // Run blocking DB queries off the async runtime
    let summaries = tokio::task::spawn_blocking(move || {
        let rows = db.conversations_for_user(&user_id)?;
        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            let participants = db.participant_usernames(row.id)?;
            summaries.push(ConversationSummary {
                id: row.id,
                participants,
                unread_count: row.unread_count,
                created_at: parse_timestamp(&row.created_at),
            });
        }
        Ok::<_, anyhow::Error>(summaries)
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(summaries))
}

/// Find-or-create the two-party conversation with another user.
pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.participant_id == claims.sub {
        return Err(StatusCode::BAD_REQUEST);
    }

    let db = state.db.clone();
    let user_id = claims.sub.to_string();
    let other_id = req.participant_id.to_string();

    let (conversation_id, created) = tokio::task::spawn_blocking(move || {
        if db.get_user_by_id(&other_id)?.is_none() {
            return Ok(None);
        }
        if let Some(existing) = db.find_conversation_between(&user_id, &other_id)? {
            return Ok(Some((existing, false)));
        }
        let id = db.create_conversation(&user_id, &other_id)?;
        Ok::<_, anyhow::Error>(Some((id, true)))
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
    .ok_or(StatusCode::NOT_FOUND)?;

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(ConversationResponse { id: conversation_id })))
}

/// Message history in persistence order, oldest first.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<ConversationId>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let user_id = claims.sub.to_string();
    let limit = query.limit.min(200);

    let rows = tokio::task::spawn_blocking(move || {
        if !db.is_participant(conversation_id, &user_id)? {
            return Ok(None);
        }
        let rows = db.get_messages(conversation_id, limit)?;
        Ok::<_, anyhow::Error>(Some(rows))
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
    .ok_or(StatusCode::FORBIDDEN)?;

    // Storage returns newest-first; the list renders oldest-first.
    let messages: Vec<MessageResponse> = rows
        .into_iter()
        .rev()
        .map(|row| MessageResponse {
            id: row.id,
            conversation_id: row.conversation_id,
            sender_username: row.sender_username,
            message: row.body,
            timestamp: parse_timestamp(&row.created_at),
        })
        .collect();

    Ok(Json(messages))
}

/// The external mark-read action: resets the user's unread count for the
/// conversation and pushes the zeroed update to their feed sessions.
pub async fn mark_read(
    State(state): State<AppState>,
    Path(conversation_id): Path<ConversationId>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let user_id = claims.sub.to_string();

    let is_participant = tokio::task::spawn_blocking(move || db.is_participant(conversation_id, &user_id))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    if !is_participant {
        return Err(StatusCode::FORBIDDEN);
    }

    state
        .router
        .mark_read(claims.sub, conversation_id)
        .await
        .map_err(|e| {
            error!("mark read failed for conversation {}: {}", conversation_id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(StatusCode::NO_CONTENT)
}

pub(crate) fn parse_timestamp(raw: &str) -> chrono::DateTime<chrono::Utc> {
    raw.parse::<chrono::DateTime<chrono::Utc>>()
        .or_else(|_| {
            // SQLite's datetime('now') stores "YYYY-MM-DD HH:MM:SS" without
            // a timezone. Parse as naive UTC and convert.
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt created_at '{}': {}", raw, e);
            chrono::DateTime::default()
        })
}
