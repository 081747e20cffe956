use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use gather_api::auth::{self, AppState, AppStateInner};
use gather_api::conversations;
use gather_api::middleware::require_auth;
use gather_api::users;
use gather_gateway::connection;
use gather_gateway::registry::ConversationRegistry;
use gather_gateway::router::MessageRouter;
use gather_gateway::unread::UnreadTracker;
use gather_types::api::Claims;
use gather_types::models::ConversationId;

#[derive(Clone)]
struct ServerState {
    app: AppState,
    registry: Arc<ConversationRegistry>,
    tracker: Arc<UnreadTracker>,
    router: Arc<MessageRouter>,
    jwt_secret: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gather=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("GATHER_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("GATHER_DB_PATH").unwrap_or_else(|_| "gather.db".into());
    let host = std::env::var("GATHER_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("GATHER_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;
    let static_dir = std::env::var("GATHER_STATIC_DIR").unwrap_or_else(|_| "static".into());

    // Init database
    let db = Arc::new(gather_db::Database::open(&PathBuf::from(&db_path))?);

    // Messaging core
    let registry = Arc::new(ConversationRegistry::new());
    let tracker = Arc::new(UnreadTracker::new(db.clone()));
    let router = Arc::new(MessageRouter::new(
        db.clone(),
        registry.clone(),
        tracker.clone(),
    ));

    // Shared state
    let app_state: AppState = Arc::new(AppStateInner {
        db,
        jwt_secret: jwt_secret.clone(),
        router: router.clone(),
    });

    let state = ServerState {
        app: app_state.clone(),
        registry,
        tracker,
        router,
        jwt_secret,
    };

    // Routes
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(app_state.clone());

    let protected_routes = Router::new()
        .route("/users", get(users::list_users))
        .route("/conversations", get(conversations::list_conversations))
        .route("/conversations", post(conversations::create_conversation))
        .route(
            "/conversations/{conversation_id}/messages",
            get(conversations::get_messages),
        )
        .route(
            "/conversations/{conversation_id}/read",
            post(conversations::mark_read),
        )
        .layer(middleware::from_fn(require_auth))
        .with_state(app_state);

    let ws_routes = Router::new()
        .route("/ws/chat/{conversation_id}/", get(chat_upgrade))
        .route("/ws/unread_counts/", get(unread_upgrade))
        .with_state(state);

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_routes)
        .fallback_service(ServeDir::new(static_dir))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Gather server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Browsers cannot set headers on WebSocket requests, so the JWT arrives
/// as a query parameter instead of an Authorization header.
#[derive(Debug, Deserialize)]
struct WsAuthQuery {
    token: String,
}

/// Conversation socket upgrade. The JWT and participant membership are
/// validated here, before the upgrade completes, so the gateway only
/// ever sees authenticated sessions.
async fn chat_upgrade(
    State(state): State<ServerState>,
    Path(conversation_id): Path<ConversationId>,
    Query(query): Query<WsAuthQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, StatusCode> {
    let claims = decode_token(&state.jwt_secret, &query.token).ok_or(StatusCode::UNAUTHORIZED)?;

    let db = state.app.db.clone();
    let user_id = claims.sub.to_string();
    let is_participant =
        tokio::task::spawn_blocking(move || db.is_participant(conversation_id, &user_id))
            .await
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    if !is_participant {
        warn!(
            "{} ({}) rejected from conversation {}: not a participant",
            claims.username, claims.sub, conversation_id
        );
        return Err(StatusCode::FORBIDDEN);
    }

    Ok(ws.on_upgrade(move |socket| {
        connection::handle_chat_connection(
            socket,
            state.router,
            state.registry,
            claims.sub,
            claims.username,
            conversation_id,
        )
    }))
}

/// Unread-feed socket upgrade; one feed per authenticated user.
async fn unread_upgrade(
    State(state): State<ServerState>,
    Query(query): Query<WsAuthQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, StatusCode> {
    let claims = decode_token(&state.jwt_secret, &query.token).ok_or(StatusCode::UNAUTHORIZED)?;

    Ok(ws.on_upgrade(move |socket| {
        connection::handle_unread_connection(socket, state.tracker, claims.sub, claims.username)
    }))
}

fn decode_token(secret: &str, token: &str) -> Option<Claims> {
    jsonwebtoken::decode::<Claims>(
        token,
        &jsonwebtoken::DecodingKey::from_secret(secret.as_bytes()),
        &jsonwebtoken::Validation::default(),
    )
    .map(|data| data.claims)
    .ok()
}
