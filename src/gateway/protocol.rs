//! JSON wire protocol for the realtime gateway.
//!
//! Client events arrive as `{"event": "...", "data": ...}`; relayed payloads
//! are free-form JSON objects carrying the target `nodeId` (or `workspaceId`
//! for node creation). Server events flatten the relayed payload and add the
//! sending connection's id plus a server timestamp.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ConnectionId;

/// Events sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Join the room for a node
    JoinNode(String),
    /// Leave the room for a node
    LeaveNode(String),
    /// Relay an edit event to the node's room (payload carries `nodeId`)
    NodeUpdate(Value),
    /// Relay a cursor movement to the node's room (payload carries `nodeId`)
    CursorMove(Value),
    /// Relay a chat message to the node's room, echoing back to the sender
    ChatMessage(Value),
    /// Announce a new node to its workspace room (payload carries `workspaceId`)
    NodeCreated(Value),
}

/// Events sent from server to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Welcome {
        message: String,
        connection_id: ConnectionId,
    },
    #[serde(rename_all = "camelCase")]
    UserJoined {
        connection_id: ConnectionId,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    UserLeft {
        connection_id: ConnectionId,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    NodeUpdated {
        #[serde(flatten)]
        data: Value,
        connection_id: ConnectionId,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    CursorMoved {
        #[serde(flatten)]
        data: Value,
        connection_id: ConnectionId,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    NewChatMessage {
        #[serde(flatten)]
        data: Value,
        connection_id: ConnectionId,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    NewNode {
        #[serde(flatten)]
        data: Value,
        connection_id: ConnectionId,
        timestamp: i64,
    },
}

/// Extract the node id a relay payload is scoped to
pub fn payload_node_id(data: &Value) -> Option<&str> {
    data.get("nodeId").and_then(Value::as_str)
}

/// Extract the workspace id a node-created payload is scoped to
pub fn payload_workspace_id(data: &Value) -> Option<&str> {
    data.get("workspaceId").and_then(Value::as_str)
}
