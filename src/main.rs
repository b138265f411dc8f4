//! Node Collaboration Server
//!
//! A real-time collaboration layer for document-like "nodes":
//! - Durable per-node sessions (presence roster, operation log, chat) in Sled
//! - Request/response session API over HTTP with token auth
//! - Room-scoped WebSocket fan-out of transient events (pure relay,
//!   independent of the durable state)

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::mpsc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};

mod auth;
mod gateway;
mod session;
mod storage;

use auth::AuthUser;
use gateway::{ClientEvent, RoomRegistry, ServerEvent};
use session::{
    ChatMessage, CollaborationSession, CursorPosition, OperationKind, SessionError, SessionManager,
};
use storage::{SessionStore, StorageConfig};

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Shared application state
pub struct AppState {
    /// Durable session manager
    sessions: SessionManager,
    /// Live connection/room registry
    registry: Arc<RoomRegistry>,
    /// Secret for verifying identity tokens
    pub jwt_secret: String,
    /// Server start time
    started_at: std::time::Instant,
}

impl AppState {
    pub fn new(store: SessionStore, jwt_secret: String) -> Self {
        Self {
            sessions: SessionManager::new(store),
            registry: Arc::new(RoomRegistry::new()),
            jwt_secret,
            started_at: std::time::Instant::now(),
        }
    }
}

// ============================================================================
// API TYPES
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
    active_connections: usize,
    open_rooms: usize,
    stored_sessions: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinRequest {
    cursor_position: Option<CursorPosition>,
    color: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CursorRequest {
    cursor_position: Option<CursorPosition>,
    selection: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
}

#[derive(Debug, Deserialize)]
struct OperationRequest {
    kind: OperationKind,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    version: u64,
}

#[derive(Debug, Serialize)]
struct SessionResponse {
    success: bool,
    collaboration: CollaborationSession,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    success: bool,
    message: String,
}

#[derive(Debug, Serialize)]
struct ChatHistoryResponse {
    success: bool,
    chat: Vec<ChatMessage>,
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            SessionError::NotFound(_) => {
                (StatusCode::NOT_FOUND, "Collaboration not found".to_string())
            }
            SessionError::Malformed(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            SessionError::Storage(e) => {
                error!("Storage failure: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Server error".to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

// ============================================================================
// HTTP HANDLERS
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        active_connections: state.registry.connection_count(),
        open_rooms: state.registry.room_count(),
        stored_sessions: state.sessions.store().session_count(),
    })
}

/// Get the active session for a node, creating one if absent
async fn get_session(
    State(state): State<Arc<AppState>>,
    _user: AuthUser,
    Path(node_id): Path<String>,
) -> Result<Json<SessionResponse>, SessionError> {
    let collaboration = state.sessions.get_or_create(&node_id).await?;
    Ok(Json(SessionResponse {
        success: true,
        collaboration,
    }))
}

/// Register the caller on the node's roster
async fn join_session(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(node_id): Path<String>,
    Json(payload): Json<JoinRequest>,
) -> Result<Json<SessionResponse>, SessionError> {
    let collaboration = state
        .sessions
        .join(&node_id, &user.user_id, payload.cursor_position, payload.color)
        .await?;
    Ok(Json(SessionResponse {
        success: true,
        collaboration,
    }))
}

/// Remove the caller from the node's roster
async fn leave_session(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(node_id): Path<String>,
) -> Result<Json<MessageResponse>, SessionError> {
    state.sessions.leave(&node_id, &user.user_id).await?;
    Ok(Json(MessageResponse {
        success: true,
        message: "Left collaboration successfully".to_string(),
    }))
}

/// Update the caller's cursor and/or selection
async fn update_cursor(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(node_id): Path<String>,
    Json(payload): Json<CursorRequest>,
) -> Result<Json<MessageResponse>, SessionError> {
    state
        .sessions
        .update_cursor(
            &node_id,
            &user.user_id,
            payload.cursor_position,
            payload.selection,
        )
        .await?;
    Ok(Json(MessageResponse {
        success: true,
        message: "Cursor updated successfully".to_string(),
    }))
}

/// Append a chat message to the node's session
async fn add_chat_message(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(node_id): Path<String>,
    Json(payload): Json<ChatRequest>,
) -> Result<Json<MessageResponse>, SessionError> {
    state
        .sessions
        .append_chat(&node_id, &user.user_id, &payload.message)
        .await?;
    Ok(Json(MessageResponse {
        success: true,
        message: "Chat message added successfully".to_string(),
    }))
}

/// Full chat history for the node's most recent session, active or not
async fn get_chat_history(
    State(state): State<Arc<AppState>>,
    _user: AuthUser,
    Path(node_id): Path<String>,
) -> Result<Json<ChatHistoryResponse>, SessionError> {
    let chat = state.sessions.chat_history(&node_id).await?;
    Ok(Json(ChatHistoryResponse { success: true, chat }))
}

/// Record an edit intent in the node's operation log
async fn record_operation(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(node_id): Path<String>,
    Json(payload): Json<OperationRequest>,
) -> Result<Json<MessageResponse>, SessionError> {
    state
        .sessions
        .record_operation(
            &node_id,
            &user.user_id,
            payload.kind,
            payload.payload,
            payload.version,
        )
        .await?;
    Ok(Json(MessageResponse {
        success: true,
        message: "Operation recorded successfully".to_string(),
    }))
}

// ============================================================================
// WEBSOCKET HANDLER
// ============================================================================

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection for its whole lifetime
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let connection_id = uuid::Uuid::new_v4().to_string();
    info!(connection_id = %connection_id, "New WebSocket connection");

    // Per-connection outbox; the registry fans events into it
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    state.registry.register(&connection_id, tx);

    // Welcome goes through the same channel as room events, so it is always
    // delivered first
    let _ = state.registry.send_to(
        &connection_id,
        ServerEvent::Welcome {
            message: "Connected to node collaboration server".to_string(),
            connection_id: connection_id.clone(),
        },
    );

    let conn_id_send = connection_id.clone();
    let conn_id_recv = connection_id.clone();
    let registry = state.registry.clone();

    // Forward queued events to the socket as JSON text frames
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(text) => {
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(connection_id = %conn_id_send, "Failed to encode event: {}", e);
                }
            }
        }
        debug!(connection_id = %conn_id_send, "Send task ended");
    });

    // Decode incoming frames and dispatch them to the registry
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => registry.handle_event(&conn_id_recv, event),
                    Err(e) => {
                        warn!(connection_id = %conn_id_recv, "Malformed event, dropped: {}", e);
                    }
                },
                Message::Ping(_) => {
                    // Pong is handled automatically
                }
                Message::Close(_) => {
                    info!(connection_id = %conn_id_recv, "WebSocket closed by client");
                    break;
                }
                _ => {}
            }
        }
        debug!(connection_id = %conn_id_recv, "Receive task ended");
    });

    // Whichever side finishes first ends the connection; the sibling task
    // is aborted so no queued frame is dispatched after cleanup
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Runs once per disconnect; the registry ignores a repeat for the same
    // id, and emission to remaining members never blocks this cleanup.
    state.registry.disconnect(&connection_id);
}

// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "node_collab_server=info,tower_http=info".into()),
        )
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let storage_path =
        std::env::var("STORAGE_PATH").unwrap_or_else(|_| "./data/collab.sled".to_string());
    let jwt_secret = std::env::var("JWT_SECRET").unwrap_or_else(|_| {
        warn!("JWT_SECRET not set, using development default");
        "collab_dev_secret".to_string()
    });

    info!("Initializing storage at: {}", storage_path);
    let store =
        SessionStore::open(StorageConfig::new(&storage_path)).expect("Failed to open storage");

    let state = Arc::new(AppState::new(store, jwt_secret));

    // Set up CORS for the browser frontend
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    // Build router
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/api/collab/:node_id", get(get_session))
        .route("/api/collab/:node_id/join", post(join_session))
        .route("/api/collab/:node_id/leave", post(leave_session))
        .route("/api/collab/:node_id/cursor", put(update_cursor))
        .route(
            "/api/collab/:node_id/chat",
            get(get_chat_history).post(add_chat_message),
        )
        .route("/api/collab/:node_id/operations", post(record_operation))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(5000);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(
        "Node collaboration server v{} starting",
        env!("CARGO_PKG_VERSION")
    );
    info!("   Listening on: http://{}", addr);
    info!("   WebSocket: ws://{}/ws", addr);
    info!("   Health check: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app).await.expect("Server error");
}
