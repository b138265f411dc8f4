//! Realtime gateway: room-scoped fan-out of transient events.
//!
//! Connections are grouped into rooms keyed by node id (`node-{id}`) or
//! workspace id (`workspace-{id}`) — two independent namespaces a connection
//! joins separately. Relaying never touches the durable session store; a
//! client keeps the roster up to date through the HTTP session API on its
//! own. The two views can therefore disagree: room membership is the truth
//! for "who is here right now", the durable roster is a last-known snapshot.

pub mod protocol;
pub mod registry;

pub use protocol::{ClientEvent, ServerEvent};
pub use registry::RoomRegistry;

/// Unique identifier for a live connection
pub type ConnectionId = String;

/// Room name for a node-scoped room
pub fn node_room(node_id: &str) -> String {
    format!("node-{}", node_id)
}

/// Room name for a workspace-scoped room
pub fn workspace_room(workspace_id: &str) -> String {
    format!("workspace-{}", workspace_id)
}

/// Errors surfaced by gateway operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("Connection not registered: {0}")]
    ConnectionNotFound(ConnectionId),

    #[error("Connection channel closed: {0}")]
    ChannelClosed(ConnectionId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_namespaces_are_disjoint() {
        assert_eq!(node_room("7"), "node-7");
        assert_eq!(workspace_room("7"), "workspace-7");
        assert_ne!(node_room("7"), workspace_room("7"));
    }
}
