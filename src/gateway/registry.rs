//! Room registry: the gateway's process-wide shared state.
//!
//! One registry instance lives in the application state for the process
//! lifetime. It maps connection ids to their outbound channels and room names
//! to member connection ids. Broadcasts snapshot the membership first, so
//! concurrent joins and leaves cannot corrupt an in-flight delivery, and each
//! member is reached through its own unbounded channel — a slow receiver
//! never blocks the sender.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::protocol::{payload_node_id, payload_workspace_id};
use super::{node_room, workspace_room, ClientEvent, ConnectionId, GatewayError, ServerEvent};

/// A single live connection with its outbound channel
pub struct ConnectionHandle {
    pub id: ConnectionId,
    tx: mpsc::UnboundedSender<ServerEvent>,
    joined_rooms: Vec<String>,
}

impl ConnectionHandle {
    fn new(id: impl Into<String>, tx: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self {
            id: id.into(),
            tx,
            joined_rooms: Vec::new(),
        }
    }

    /// Queue an event for delivery to this connection
    fn send(&self, event: ServerEvent) -> Result<(), GatewayError> {
        self.tx
            .send(event)
            .map_err(|_| GatewayError::ChannelClosed(self.id.clone()))
    }

    fn track_room(&mut self, room: &str) {
        if !self.joined_rooms.iter().any(|r| r == room) {
            self.joined_rooms.push(room.to_string());
        }
    }

    fn untrack_room(&mut self, room: &str) {
        self.joined_rooms.retain(|r| r != room);
    }
}

/// Registry of live connections and their room memberships
pub struct RoomRegistry {
    connections: DashMap<ConnectionId, Arc<RwLock<ConnectionHandle>>>,
    rooms: DashMap<String, Vec<ConnectionId>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            rooms: DashMap::new(),
        }
    }

    /// Register a new connection and its outbound channel
    pub fn register(&self, connection_id: &str, tx: mpsc::UnboundedSender<ServerEvent>) {
        self.connections.insert(
            connection_id.to_string(),
            Arc::new(RwLock::new(ConnectionHandle::new(connection_id, tx))),
        );
        info!(connection_id, "Connection registered");
    }

    /// Queue an event for a single connection
    pub fn send_to(&self, connection_id: &str, event: ServerEvent) -> Result<(), GatewayError> {
        let handle = self
            .connections
            .get(connection_id)
            .ok_or_else(|| GatewayError::ConnectionNotFound(connection_id.to_string()))?;
        // The guard temporary must not outlive the map ref in tail position
        let result = handle.read().send(event);
        result
    }

    /// Number of live connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of rooms with at least one member
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Snapshot of a room's members
    pub fn room_members(&self, room: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(room)
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Dispatch a decoded client event.
    ///
    /// Relay payloads missing their scope id are logged and dropped; the
    /// gateway never escalates a bad payload back to the connection.
    pub fn handle_event(&self, connection_id: &str, event: ClientEvent) {
        match event {
            ClientEvent::JoinNode(node_id) => self.join_room(connection_id, &node_room(&node_id)),
            ClientEvent::LeaveNode(node_id) => self.leave_room(connection_id, &node_room(&node_id)),
            ClientEvent::NodeUpdate(data) => self.relay_node_update(connection_id, data),
            ClientEvent::CursorMove(data) => self.relay_cursor_move(connection_id, data),
            ClientEvent::ChatMessage(data) => self.relay_chat_message(connection_id, data),
            ClientEvent::NodeCreated(data) => self.relay_node_created(connection_id, data),
        }
    }

    /// Add a connection to a room and notify the existing members.
    ///
    /// The joining connection does not receive its own `user-joined`. A join
    /// for a connection that is no longer registered is refused: the recv
    /// task can dispatch a queued frame after disconnect cleanup already
    /// ran, and accepting it would leave membership nothing ever removes.
    pub fn join_room(&self, connection_id: &str, room: &str) {
        {
            let Some(handle) = self.connections.get(connection_id) else {
                debug!(connection_id, room, "Join for unregistered connection, dropped");
                return;
            };
            handle.write().track_room(room);
        }
        {
            let mut members = self.rooms.entry(room.to_string()).or_default();
            if !members.iter().any(|m| m == connection_id) {
                members.push(connection_id.to_string());
            }
        }

        debug!(connection_id, room, "Connection joined room");

        self.broadcast(
            room,
            Some(connection_id),
            ServerEvent::UserJoined {
                connection_id: connection_id.to_string(),
                timestamp: event_timestamp(),
            },
        );
    }

    /// Remove a connection from a room. Emits nothing to the room; only a
    /// disconnect produces `user-left`.
    pub fn leave_room(&self, connection_id: &str, room: &str) {
        self.remove_membership(connection_id, room);
        if let Some(handle) = self.connections.get(connection_id) {
            handle.write().untrack_room(room);
        }
        debug!(connection_id, room, "Connection left room");
    }

    /// Relay an edit event to the node's room, sender excluded
    pub fn relay_node_update(&self, connection_id: &str, data: Value) {
        let Some(node_id) = payload_node_id(&data).map(str::to_string) else {
            warn!(connection_id, "node-update payload missing nodeId, dropped");
            return;
        };
        self.broadcast(
            &node_room(&node_id),
            Some(connection_id),
            ServerEvent::NodeUpdated {
                data,
                connection_id: connection_id.to_string(),
                timestamp: event_timestamp(),
            },
        );
    }

    /// Relay a cursor movement to the node's room, sender excluded
    pub fn relay_cursor_move(&self, connection_id: &str, data: Value) {
        let Some(node_id) = payload_node_id(&data).map(str::to_string) else {
            warn!(connection_id, "cursor-move payload missing nodeId, dropped");
            return;
        };
        self.broadcast(
            &node_room(&node_id),
            Some(connection_id),
            ServerEvent::CursorMoved {
                data,
                connection_id: connection_id.to_string(),
                timestamp: event_timestamp(),
            },
        );
    }

    /// Relay a chat message to the node's room, sender included — the echo
    /// is the client's delivery confirmation.
    pub fn relay_chat_message(&self, connection_id: &str, data: Value) {
        let Some(node_id) = payload_node_id(&data).map(str::to_string) else {
            warn!(connection_id, "chat-message payload missing nodeId, dropped");
            return;
        };
        self.broadcast(
            &node_room(&node_id),
            None,
            ServerEvent::NewChatMessage {
                data,
                connection_id: connection_id.to_string(),
                timestamp: event_timestamp(),
            },
        );
    }

    /// Announce a new node to its workspace room, sender excluded
    pub fn relay_node_created(&self, connection_id: &str, data: Value) {
        let Some(workspace_id) = payload_workspace_id(&data).map(str::to_string) else {
            warn!(connection_id, "node-created payload missing workspaceId, dropped");
            return;
        };
        self.broadcast(
            &workspace_room(&workspace_id),
            Some(connection_id),
            ServerEvent::NewNode {
                data,
                connection_id: connection_id.to_string(),
                timestamp: event_timestamp(),
            },
        );
    }

    /// Tear down a connection: emit exactly one `user-left` to each room it
    /// belonged to, then drop all membership. Safe to call once per
    /// disconnect; a second call finds nothing to clean.
    pub fn disconnect(&self, connection_id: &str) {
        let Some((_, handle)) = self.connections.remove(connection_id) else {
            return;
        };

        let joined_rooms = {
            let handle = handle.read();
            handle.joined_rooms.clone()
        };

        for room in &joined_rooms {
            self.remove_membership(connection_id, room);
            self.broadcast(
                room,
                Some(connection_id),
                ServerEvent::UserLeft {
                    connection_id: connection_id.to_string(),
                    timestamp: event_timestamp(),
                },
            );
        }

        info!(connection_id, rooms = joined_rooms.len(), "Connection disconnected");
    }

    /// Deliver an event to a snapshot of a room's members, optionally
    /// excluding one connection. Delivery failures are per-connection and
    /// never abort the loop.
    fn broadcast(&self, room: &str, exclude: Option<&str>, event: ServerEvent) {
        let members = self.room_members(room);
        for member in members {
            if exclude == Some(member.as_str()) {
                continue;
            }
            if let Some(handle) = self.connections.get(&member) {
                if let Err(e) = handle.read().send(event.clone()) {
                    debug!(room, member = %member, error = %e, "Dropped event for closed connection");
                }
            }
        }
    }

    fn remove_membership(&self, connection_id: &str, room: &str) {
        let mut empty = false;
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.retain(|m| m != connection_id);
            empty = members.is_empty();
        }
        if empty {
            self.rooms.remove_if(room, |_, members| members.is_empty());
        }
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Server timestamp attached to outbound events (milliseconds since epoch)
fn event_timestamp() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn connect(registry: &RoomRegistry, id: &str) -> UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(id, tx);
        rx
    }

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_send_to_targets_one_connection() {
        let registry = RoomRegistry::new();
        let mut rx_a = connect(&registry, "conn-a");
        let mut rx_b = connect(&registry, "conn-b");

        registry
            .send_to(
                "conn-a",
                ServerEvent::Welcome {
                    message: "hello".to_string(),
                    connection_id: "conn-a".to_string(),
                },
            )
            .unwrap();

        assert_eq!(drain(&mut rx_a).len(), 1);
        assert!(drain(&mut rx_b).is_empty());

        let result = registry.send_to(
            "conn-z",
            ServerEvent::Welcome {
                message: "hello".to_string(),
                connection_id: "conn-z".to_string(),
            },
        );
        assert!(matches!(result, Err(GatewayError::ConnectionNotFound(_))));
    }

    #[test]
    fn test_join_after_disconnect_leaves_no_membership() {
        let registry = RoomRegistry::new();
        let _rx = connect(&registry, "conn-x");

        registry.disconnect("conn-x");
        registry.join_room("conn-x", &node_room("7"));

        assert!(registry.room_members(&node_room("7")).is_empty());
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn test_join_notifies_existing_members_only() {
        let registry = RoomRegistry::new();
        let mut rx_a = connect(&registry, "conn-a");
        let mut rx_b = connect(&registry, "conn-b");

        registry.join_room("conn-a", &node_room("7"));
        registry.join_room("conn-b", &node_room("7"));

        // A sees B join; B receives nothing about its own join
        let a_events = drain(&mut rx_a);
        assert_eq!(a_events.len(), 1);
        assert!(matches!(
            &a_events[0],
            ServerEvent::UserJoined { connection_id, .. } if connection_id == "conn-b"
        ));
        assert!(drain(&mut rx_b).is_empty());
    }

    #[test]
    fn test_node_update_excludes_sender() {
        let registry = RoomRegistry::new();
        let mut rx_a = connect(&registry, "conn-a");
        let mut rx_b = connect(&registry, "conn-b");

        registry.join_room("conn-a", &node_room("7"));
        registry.join_room("conn-b", &node_room("7"));
        drain(&mut rx_a);
        drain(&mut rx_b);

        registry.handle_event(
            "conn-a",
            ClientEvent::NodeUpdate(json!({"nodeId": "7", "title": "new"})),
        );

        let b_events = drain(&mut rx_b);
        assert_eq!(b_events.len(), 1);
        match &b_events[0] {
            ServerEvent::NodeUpdated {
                data,
                connection_id,
                ..
            } => {
                assert_eq!(connection_id, "conn-a");
                assert_eq!(data["title"], "new");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(drain(&mut rx_a).is_empty());
    }

    #[test]
    fn test_chat_echoes_to_sender() {
        let registry = RoomRegistry::new();
        let mut rx_a = connect(&registry, "conn-a");
        let mut rx_b = connect(&registry, "conn-b");

        registry.join_room("conn-a", &node_room("7"));
        registry.join_room("conn-b", &node_room("7"));
        drain(&mut rx_a);
        drain(&mut rx_b);

        registry.handle_event(
            "conn-a",
            ClientEvent::ChatMessage(json!({"nodeId": "7", "message": "hi"})),
        );

        let a_events = drain(&mut rx_a);
        let b_events = drain(&mut rx_b);
        assert_eq!(a_events.len(), 1);
        assert_eq!(b_events.len(), 1);
        assert!(matches!(&a_events[0], ServerEvent::NewChatMessage { .. }));
    }

    #[test]
    fn test_events_do_not_leak_across_rooms() {
        let registry = RoomRegistry::new();
        let mut rx_a = connect(&registry, "conn-a");
        let mut rx_b = connect(&registry, "conn-b");

        registry.join_room("conn-a", &node_room("7"));
        registry.join_room("conn-b", &node_room("8"));
        drain(&mut rx_a);
        drain(&mut rx_b);

        registry.relay_node_update("conn-a", json!({"nodeId": "7"}));
        assert!(drain(&mut rx_b).is_empty());
    }

    #[test]
    fn test_node_created_targets_workspace_room() {
        let registry = RoomRegistry::new();
        let mut rx_a = connect(&registry, "conn-a");
        let mut rx_b = connect(&registry, "conn-b");

        // B joined the node room but not the workspace room
        registry.join_room("conn-a", &workspace_room("9"));
        registry.join_room("conn-b", &node_room("9"));
        drain(&mut rx_a);
        drain(&mut rx_b);

        registry.relay_node_created("conn-b", json!({"workspaceId": "9", "name": "board"}));

        let a_events = drain(&mut rx_a);
        assert_eq!(a_events.len(), 1);
        assert!(matches!(&a_events[0], ServerEvent::NewNode { .. }));
        assert!(drain(&mut rx_b).is_empty());
    }

    #[test]
    fn test_leave_room_is_silent() {
        let registry = RoomRegistry::new();
        let mut rx_a = connect(&registry, "conn-a");
        let _rx_b = connect(&registry, "conn-b");

        registry.join_room("conn-a", &node_room("7"));
        registry.join_room("conn-b", &node_room("7"));
        drain(&mut rx_a);

        registry.leave_room("conn-b", &node_room("7"));
        assert!(drain(&mut rx_a).is_empty());

        // And the departed member no longer receives relays
        registry.relay_node_update("conn-a", json!({"nodeId": "7"}));
        assert_eq!(registry.room_members(&node_room("7")), vec!["conn-a"]);
    }

    #[test]
    fn test_disconnect_emits_user_left_per_room() {
        let registry = RoomRegistry::new();
        let mut rx_a = connect(&registry, "conn-a");
        let mut rx_b = connect(&registry, "conn-b");
        let _rx_c = connect(&registry, "conn-c");

        registry.join_room("conn-a", &node_room("3"));
        registry.join_room("conn-b", &workspace_room("9"));
        registry.join_room("conn-c", &node_room("3"));
        registry.join_room("conn-c", &workspace_room("9"));
        drain(&mut rx_a);
        drain(&mut rx_b);

        registry.disconnect("conn-c");

        let a_events = drain(&mut rx_a);
        let b_events = drain(&mut rx_b);
        assert_eq!(a_events.len(), 1);
        assert_eq!(b_events.len(), 1);
        assert!(matches!(
            &a_events[0],
            ServerEvent::UserLeft { connection_id, .. } if connection_id == "conn-c"
        ));
        assert!(matches!(
            &b_events[0],
            ServerEvent::UserLeft { connection_id, .. } if connection_id == "conn-c"
        ));

        assert!(!registry.room_members(&node_room("3")).contains(&"conn-c".to_string()));
        assert!(!registry.room_members(&workspace_room("9")).contains(&"conn-c".to_string()));
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let registry = RoomRegistry::new();
        let mut rx_a = connect(&registry, "conn-a");
        let _rx_b = connect(&registry, "conn-b");

        registry.join_room("conn-a", &node_room("3"));
        registry.join_room("conn-b", &node_room("3"));
        drain(&mut rx_a);

        registry.disconnect("conn-b");
        registry.disconnect("conn-b");

        assert_eq!(drain(&mut rx_a).len(), 1);
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn test_malformed_payload_is_dropped() {
        let registry = RoomRegistry::new();
        let mut rx_a = connect(&registry, "conn-a");
        let _rx_b = connect(&registry, "conn-b");

        registry.join_room("conn-a", &node_room("7"));
        registry.join_room("conn-b", &node_room("7"));
        drain(&mut rx_a);

        registry.relay_node_update("conn-b", json!({"title": "no scope"}));
        registry.relay_chat_message("conn-b", json!("not an object"));

        assert!(drain(&mut rx_a).is_empty());
    }

    #[test]
    fn test_empty_rooms_are_removed() {
        let registry = RoomRegistry::new();
        let _rx_a = connect(&registry, "conn-a");

        registry.join_room("conn-a", &node_room("7"));
        assert_eq!(registry.room_count(), 1);

        registry.leave_room("conn-a", &node_room("7"));
        assert_eq!(registry.room_count(), 0);
    }
}
