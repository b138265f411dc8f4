//! Sled-based storage implementation for collaboration session records.
//!
//! A single tree maps node id -> JSON-encoded `CollaborationSession`. JSON
//! rather than a binary codec because operation payloads are free-form
//! `serde_json::Value` trees, which self-describing encodings handle and
//! schema-driven ones do not.
//! Upserts are atomic at document granularity; cross-record transactions are
//! never needed because a session only ever references its own node.

use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use super::StorageConfig;
use crate::session::CollaborationSession;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

const TREE_SESSIONS: &str = "sessions";

/// Sled-backed store for collaboration session records
#[derive(Clone)]
pub struct SessionStore {
    db: Arc<Db>,
    sessions: Tree,
}

impl SessionStore {
    /// Open or create a session store at the configured path
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let path = Path::new(&config.path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::InitFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        let sessions = db.open_tree(TREE_SESSIONS)?;

        Ok(Self {
            db: Arc::new(db),
            sessions,
        })
    }

    /// Open with default configuration
    pub fn open_default() -> StorageResult<Self> {
        Self::open(StorageConfig::default())
    }

    /// Upsert the session record for its node
    pub fn save_session(&self, session: &CollaborationSession) -> StorageResult<()> {
        let bytes = serde_json::to_vec(session)?;
        self.sessions.insert(session.node_id.as_bytes(), bytes)?;
        Ok(())
    }

    /// Load a node's session record, active or not
    pub fn load_session(&self, node_id: &str) -> StorageResult<Option<CollaborationSession>> {
        match self.sessions.get(node_id.as_bytes())? {
            Some(bytes) => {
                let session: CollaborationSession = serde_json::from_slice(&bytes)?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    /// Load a node's session record only if it is still active
    pub fn load_active_session(&self, node_id: &str) -> StorageResult<Option<CollaborationSession>> {
        Ok(self.load_session(node_id)?.filter(|s| s.is_active))
    }

    /// Check whether any record exists for a node
    pub fn session_exists(&self, node_id: &str) -> StorageResult<bool> {
        Ok(self.sessions.contains_key(node_id.as_bytes())?)
    }

    /// Number of stored session records
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        // Attempt to flush on drop, but don't panic
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{
        ChatMessage, CollaborationSession, CursorPosition, Operation, OperationKind, Presence,
    };
    use serde_json::json;
    use tempfile::tempdir;

    fn test_store() -> SessionStore {
        let dir = tempdir().unwrap();
        let config = StorageConfig::new(dir.path().join("test.sled").to_string_lossy().to_string());
        SessionStore::open(config).unwrap()
    }

    #[test]
    fn test_save_load_roundtrip() {
        let store = test_store();

        let mut session = CollaborationSession::new("node-1");
        session
            .users
            .push(Presence::new("user-1", CursorPosition::new(1.0, 2.0), "#ff0000"));
        session.chat.push(ChatMessage {
            user_id: "user-1".to_string(),
            message: "hello".to_string(),
            timestamp: 42,
        });

        store.save_session(&session).unwrap();
        let loaded = store.load_session("node-1").unwrap().unwrap();

        assert_eq!(loaded.node_id, "node-1");
        assert_eq!(loaded.users.len(), 1);
        assert_eq!(loaded.users[0].user_id, "user-1");
        assert_eq!(loaded.chat.len(), 1);
        assert_eq!(loaded.chat[0].message, "hello");
    }

    #[test]
    fn test_operation_payload_roundtrip() {
        let store = test_store();

        // Payloads are arbitrary JSON trees and must survive a reload intact
        let mut session = CollaborationSession::new("node-1");
        session.operations.push(Operation {
            user_id: "user-1".to_string(),
            kind: OperationKind::Update,
            payload: json!({"title": "renamed", "tags": ["a", "b"], "depth": 3}),
            timestamp: 42,
            version: 1,
        });

        store.save_session(&session).unwrap();
        let loaded = store.load_session("node-1").unwrap().unwrap();

        assert_eq!(loaded.operations.len(), 1);
        assert_eq!(loaded.operations[0].payload["title"], "renamed");
        assert_eq!(loaded.operations[0].payload["tags"][1], "b");
        assert_eq!(loaded.operations[0].version, 1);
    }

    #[test]
    fn test_missing_session() {
        let store = test_store();
        assert!(store.load_session("nonexistent").unwrap().is_none());
        assert!(!store.session_exists("nonexistent").unwrap());
    }

    #[test]
    fn test_active_filter() {
        let store = test_store();

        let mut session = CollaborationSession::new("node-1");
        session.is_active = false;
        store.save_session(&session).unwrap();

        // The record is still readable, just no longer active
        assert!(store.load_session("node-1").unwrap().is_some());
        assert!(store.load_active_session("node-1").unwrap().is_none());
    }

    #[test]
    fn test_upsert_replaces() {
        let store = test_store();

        let mut session = CollaborationSession::new("node-1");
        store.save_session(&session).unwrap();

        session
            .users
            .push(Presence::new("user-1", CursorPosition::default(), "#00ff00"));
        store.save_session(&session).unwrap();

        let loaded = store.load_session("node-1").unwrap().unwrap();
        assert_eq!(loaded.users.len(), 1);
        assert_eq!(store.session_count(), 1);
    }
}
