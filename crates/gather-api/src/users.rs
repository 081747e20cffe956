use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use tracing::{error, warn};

use gather_types::api::Claims;
use gather_types::models::User;

use crate::auth::AppState;
use crate::conversations::parse_timestamp;

/// Other registered users, for starting a new conversation.
pub async fn list_users(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let user_id = claims.sub.to_string();

    let rows = tokio::task::spawn_blocking(move || db.list_users(&user_id))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let users: Vec<User> = rows
        .into_iter()
        .filter_map(|row| match row.id.parse() {
            Ok(id) => Some(User {
                id,
                username: row.username,
                created_at: parse_timestamp(&row.created_at),
            }),
            Err(e) => {
                warn!("Corrupt user id '{}': {}", row.id, e);
                None
            }
        })
        .collect();

    Ok(Json(users))
}
