//! Outbound delivery: fan a dispatched notification out to its channel.
//!
//! Delivery is fire-and-forget over each connection's mpsc sender; the
//! dispatching task never awaits a socket write, and a dead connection's
//! failed send is ignored (the actor cleans it up).

use axum::extract::ws::Message;

use crate::state::AppState;
use crate::ws::protocol::{ConnContext, Outbound, ServerMessage, Target};
use crate::ws::{ConnectionRegistry, RoomRegistry};

/// Serialize a server message to a WebSocket text frame.
fn to_frame(message: &ServerMessage) -> Option<Message> {
    match serde_json::to_string(message) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize server message");
            None
        }
    }
}

/// Deliver a batch of outbound notifications produced by dispatch.
pub fn deliver(state: &AppState, ctx: &ConnContext, outbounds: Vec<Outbound>) {
    for outbound in outbounds {
        let Some(frame) = to_frame(&outbound.message) else {
            continue;
        };
        match outbound.target {
            Target::Caller => {
                let _ = ctx.sender.send(frame);
            }
            Target::Room {
                room_id,
                exclude_conn,
            } => {
                broadcast_to_room(&state.rooms_live, &room_id, Some(&exclude_conn), frame);
            }
            Target::User(user_id) => {
                send_to_user(&state.connections, &user_id, frame);
            }
        }
    }
}

/// Send a frame to every connection bound to a room, optionally excluding
/// the origin connection (no echo to the sender).
pub fn broadcast_to_room(
    registry: &RoomRegistry,
    room_id: &str,
    exclude_conn: Option<&str>,
    frame: Message,
) {
    if let Some(subscribers) = registry.get(room_id) {
        for sub in subscribers.iter() {
            if exclude_conn == Some(sub.conn_id.as_str()) {
                continue;
            }
            let _ = sub.sender.send(frame.clone());
        }
    }
}

/// Send a frame to all of one user's connections (private channel).
pub fn send_to_user(registry: &ConnectionRegistry, user_id: &str, frame: Message) {
    if let Some(connections) = registry.get(user_id) {
        for sender in connections.value().iter() {
            let _ = sender.send(frame.clone());
        }
    }
}

/// Convenience used by REST handlers: serialize and send to a user.
pub fn notify_user(registry: &ConnectionRegistry, user_id: &str, message: &ServerMessage) {
    if let Some(frame) = to_frame(message) {
        send_to_user(registry, user_id, frame);
    }
}

/// Convenience used by REST handlers: serialize and broadcast to a room.
pub fn notify_room(registry: &RoomRegistry, room_id: &str, message: &ServerMessage) {
    if let Some(frame) = to_frame(message) {
        broadcast_to_room(registry, room_id, None, frame);
    }
}
