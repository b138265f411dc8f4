//! SessionManager: request/response operations over durable session records.
//!
//! Every mutating operation is a full read-modify-write of the single record
//! keyed by node id. A per-node async mutex serializes those cycles so two
//! concurrent appends against the same node can never silently lose one;
//! operations on different nodes proceed independently.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{
    generate_user_color, now_millis, ChatMessage, CollaborationSession, CursorPosition, NodeId,
    Operation, OperationKind, Presence, SessionError, SessionResult,
};
use crate::storage::SessionStore;

/// Manager for durable presence, operation and chat state
pub struct SessionManager {
    store: Arc<SessionStore>,
    /// Per-node write locks guarding the read-modify-write cycle.
    ///
    /// Entries are never evicted; one mutex stays behind for every node ever
    /// touched. At a few dozen bytes per node that tracks the session tree
    /// itself, which also retains a record per node.
    locks: DashMap<NodeId, Arc<Mutex<()>>>,
}

impl SessionManager {
    pub fn new(store: SessionStore) -> Self {
        Self {
            store: Arc::new(store),
            locks: DashMap::new(),
        }
    }

    /// Access the underlying store
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    fn lock_for(&self, node_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(node_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Return the active session for a node, creating an empty one if absent.
    ///
    /// Never creates a second active session while one exists. A retired
    /// record is revived through succession, keeping its logs.
    pub async fn get_or_create(&self, node_id: &str) -> SessionResult<CollaborationSession> {
        let lock = self.lock_for(node_id);
        let _guard = lock.lock().await;

        let session = match self.store.load_session(node_id)? {
            Some(session) if session.is_active => return Ok(session),
            Some(retired) => {
                info!(node_id, "Reviving retired collaboration session");
                CollaborationSession::succeed(retired)
            }
            None => {
                info!(node_id, "Creating collaboration session");
                CollaborationSession::new(node_id)
            }
        };
        self.store.save_session(&session)?;
        Ok(session)
    }

    /// Register a user on a node's session, creating the session lazily.
    ///
    /// A repeated join refreshes `last_active` in place instead of
    /// duplicating the roster entry.
    pub async fn join(
        &self,
        node_id: &str,
        user_id: &str,
        cursor: Option<CursorPosition>,
        color: Option<String>,
    ) -> SessionResult<CollaborationSession> {
        let lock = self.lock_for(node_id);
        let _guard = lock.lock().await;

        let mut session = match self.store.load_session(node_id)? {
            Some(session) if session.is_active => session,
            Some(retired) => {
                info!(node_id, "Reviving retired collaboration session");
                CollaborationSession::succeed(retired)
            }
            None => CollaborationSession::new(node_id),
        };

        match session.find_user_mut(user_id) {
            Some(presence) => presence.touch(),
            None => {
                session.users.push(Presence::new(
                    user_id,
                    cursor.unwrap_or_default(),
                    color.unwrap_or_else(generate_user_color),
                ));
                info!(node_id, user_id, "User joined session");
            }
        }

        session.touch();
        self.store.save_session(&session)?;
        Ok(session)
    }

    /// Remove a user from a node's roster.
    ///
    /// Fails with `NotFound` if the node has no active session; removing a
    /// user who never joined is a silent no-op.
    pub async fn leave(&self, node_id: &str, user_id: &str) -> SessionResult<()> {
        let lock = self.lock_for(node_id);
        let _guard = lock.lock().await;

        let mut session = self
            .store
            .load_active_session(node_id)?
            .ok_or_else(|| SessionError::NotFound(node_id.to_string()))?;

        session.users.retain(|u| u.user_id != user_id);
        session.touch();
        self.store.save_session(&session)?;

        info!(node_id, user_id, "User left session");
        Ok(())
    }

    /// Update a user's cursor and/or selection.
    ///
    /// Fails with `NotFound` if the node has no active session. An update for
    /// a user without a roster entry is dropped without error; joining is
    /// always explicit.
    pub async fn update_cursor(
        &self,
        node_id: &str,
        user_id: &str,
        cursor: Option<CursorPosition>,
        selection: Option<String>,
    ) -> SessionResult<()> {
        let lock = self.lock_for(node_id);
        let _guard = lock.lock().await;

        let mut session = self
            .store
            .load_active_session(node_id)?
            .ok_or_else(|| SessionError::NotFound(node_id.to_string()))?;

        match session.find_user_mut(user_id) {
            Some(presence) => {
                if let Some(cursor) = cursor {
                    presence.cursor_position = cursor;
                }
                if let Some(selection) = selection {
                    presence.selection = selection;
                }
                presence.touch();
            }
            None => {
                debug!(node_id, user_id, "Cursor update for user not in roster, dropped");
            }
        }

        session.touch();
        self.store.save_session(&session)?;
        Ok(())
    }

    /// Append a chat message with a server-assigned timestamp.
    pub async fn append_chat(&self, node_id: &str, user_id: &str, message: &str) -> SessionResult<()> {
        if message.trim().is_empty() {
            return Err(SessionError::Malformed("Chat message is empty".to_string()));
        }

        let lock = self.lock_for(node_id);
        let _guard = lock.lock().await;

        let mut session = self
            .store
            .load_active_session(node_id)?
            .ok_or_else(|| SessionError::NotFound(node_id.to_string()))?;

        session.chat.push(ChatMessage {
            user_id: user_id.to_string(),
            message: message.to_string(),
            timestamp: now_millis(),
        });
        session.touch();
        self.store.save_session(&session)?;
        Ok(())
    }

    /// Full chat log of the node's most recent session, active or not.
    ///
    /// A missing record yields an empty log, never an error.
    pub async fn chat_history(&self, node_id: &str) -> SessionResult<Vec<ChatMessage>> {
        Ok(self
            .store
            .load_session(node_id)?
            .map(|s| s.chat)
            .unwrap_or_default())
    }

    /// Append an edit intent to the session's operation log.
    pub async fn record_operation(
        &self,
        node_id: &str,
        user_id: &str,
        kind: OperationKind,
        payload: serde_json::Value,
        version: u64,
    ) -> SessionResult<()> {
        let lock = self.lock_for(node_id);
        let _guard = lock.lock().await;

        let mut session = self
            .store
            .load_active_session(node_id)?
            .ok_or_else(|| SessionError::NotFound(node_id.to_string()))?;

        session.operations.push(Operation {
            user_id: user_id.to_string(),
            kind,
            payload,
            timestamp: now_millis(),
            version,
        });
        session.touch();
        self.store.save_session(&session)?;
        Ok(())
    }
}
