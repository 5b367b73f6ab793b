pub mod actor;
pub mod broadcast;
pub mod handler;
pub mod protocol;

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Type alias for the sender half of a WebSocket connection's channel.
/// Other parts of the system can clone this to push messages to a specific client.
pub type ConnectionSender = mpsc::UnboundedSender<axum::extract::ws::Message>;

/// Connection registry: tracks all active WebSocket connections per user.
/// A user can have multiple concurrent connections (multiple devices/tabs).
/// This is the per-identity private channel — it reaches a user whether or
/// not they are bound to any room.
pub type ConnectionRegistry = Arc<DashMap<String, Vec<ConnectionSender>>>;

/// Create a new empty connection registry.
pub fn new_connection_registry() -> ConnectionRegistry {
    Arc::new(DashMap::new())
}

/// A live connection currently bound to a room. Process-lifetime only;
/// carries no persisted state and is destroyed on unbind or disconnect.
#[derive(Clone)]
pub struct RoomSubscriber {
    pub conn_id: String,
    pub user_id: String,
    pub username: String,
    pub sender: ConnectionSender,
}

/// Room registry: live bindings from room id to the connections subscribed
/// to that room's channel. Owned by the hub; all access goes through the
/// hub's bind/unbind/broadcast helpers so that live bindings only ever
/// change alongside an access-engine decision.
pub type RoomRegistry = Arc<DashMap<String, Vec<RoomSubscriber>>>;

/// Create a new empty room registry.
pub fn new_room_registry() -> RoomRegistry {
    Arc::new(DashMap::new())
}
