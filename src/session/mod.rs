//! Durable collaboration session model.
//!
//! One `CollaborationSession` record exists per node, holding:
//! - the presence roster (who registered themselves on the node)
//! - an append-only operation log (edit intents, kept for audit/replay)
//! - an append-only chat log
//!
//! Records are retired by clearing `is_active`, never deleted, so chat
//! history survives the end of a session.

pub mod manager;

pub use manager::SessionManager;

use serde::{Deserialize, Serialize};

use crate::storage::StorageError;

/// Unique identifier for a node (the document-like entity sessions attach to)
pub type NodeId = String;

/// Unique identifier for a user
pub type UserId = String;

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors surfaced by the session manager
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("No active collaboration session for node: {0}")]
    NotFound(NodeId),

    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// 2D cursor coordinate within a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

impl CursorPosition {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A single user's last-known state within a session.
///
/// Best-effort only: refreshed by explicit client calls, not by socket
/// lifecycle. Live room membership is the authority for "who is here now".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub user_id: UserId,
    pub cursor_position: CursorPosition,
    /// Opaque selection string supplied by the client
    pub selection: String,
    /// Last activity timestamp (milliseconds since epoch)
    pub last_active: i64,
    /// Display color (hex)
    pub color: String,
}

impl Presence {
    pub fn new(user_id: impl Into<String>, cursor: CursorPosition, color: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            cursor_position: cursor,
            selection: String::new(),
            last_active: now_millis(),
            color: color.into(),
        }
    }

    /// Refresh the last-activity timestamp
    pub fn touch(&mut self) {
        self.last_active = now_millis();
    }
}

/// Kind of edit operation recorded in the session log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Delete,
    Update,
    Move,
}

/// An edit intent appended to the session's operation log.
///
/// `version` is a caller-supplied ordering hint; it is stored as-is and never
/// validated against the roster or other operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub user_id: UserId,
    pub kind: OperationKind,
    pub payload: serde_json::Value,
    pub timestamp: i64,
    pub version: u64,
}

/// A chat message with a server-assigned timestamp
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub user_id: UserId,
    pub message: String,
    pub timestamp: i64,
}

/// The durable record of one node's collaboration session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaborationSession {
    /// Node this session belongs to, immutable after creation
    pub node_id: NodeId,
    /// Presence roster, at most one entry per user
    pub users: Vec<Presence>,
    /// Append-only operation log, never compacted here
    pub operations: Vec<Operation>,
    /// Append-only chat log
    pub chat: Vec<ChatMessage>,
    /// Cleared by an external reaper to retire the session
    pub is_active: bool,
    /// Refreshed on every mutation (milliseconds since epoch)
    pub last_activity: i64,
}

impl CollaborationSession {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            users: Vec::new(),
            operations: Vec::new(),
            chat: Vec::new(),
            is_active: true,
            last_activity: now_millis(),
        }
    }

    /// Start a fresh session over a retired record, carrying its operation
    /// and chat logs forward. The roster starts empty; presence belongs to
    /// the live session, history belongs to the node.
    pub fn succeed(retired: CollaborationSession) -> Self {
        Self {
            node_id: retired.node_id,
            users: Vec::new(),
            operations: retired.operations,
            chat: retired.chat,
            is_active: true,
            last_activity: now_millis(),
        }
    }

    /// Find a user's presence entry
    pub fn find_user(&self, user_id: &str) -> Option<&Presence> {
        self.users.iter().find(|u| u.user_id == user_id)
    }

    /// Find a user's presence entry for mutation
    pub fn find_user_mut(&mut self, user_id: &str) -> Option<&mut Presence> {
        self.users.iter_mut().find(|u| u.user_id == user_id)
    }

    /// Refresh the session-level activity timestamp
    pub fn touch(&mut self) {
        self.last_activity = now_millis();
    }
}

/// Current time in milliseconds since the unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Generate a pseudo-random display color for a joining user
pub fn generate_user_color() -> String {
    use rand::Rng;
    format!("#{:06x}", rand::thread_rng().gen_range(0..0x1000000u32))
}
