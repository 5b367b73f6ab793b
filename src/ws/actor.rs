use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use uuid::Uuid;

use crate::rooms::access;
use crate::state::AppState;
use crate::ws::protocol::{self, ClientMessage, ConnContext, ServerMessage};
use crate::ws::{broadcast, ConnectionSender};

/// Ping interval: server sends WebSocket ping every 30 seconds.
/// Prevents connection leaks from abrupt disconnects.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Pong timeout: if pong not received within 10 seconds after ping, close.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the actor-per-connection pattern for an authenticated WebSocket.
///
/// Splits the WebSocket into reader and writer halves:
/// - Writer task: owns the sink, forwards messages from an mpsc channel
/// - Reader task: decodes tagged JSON messages, runs dispatch, delivers
///
/// The mpsc channel allows any part of the system to send messages to this
/// client by cloning the sender.
pub async fn run_connection(socket: WebSocket, state: AppState, user_id: String, username: String) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    // Register this connection in the connection registry (private channel)
    register_connection(&state, &user_id, tx.clone());

    // Mark the identity online. Best-effort: presence bookkeeping must
    // never gate the connection itself.
    set_online(&state, &user_id, true).await;

    let mut ctx = ConnContext {
        conn_id: Uuid::new_v4().to_string(),
        user_id: user_id.clone(),
        username: username.clone(),
        sender: tx.clone(),
        room_id: None,
    };

    tracing::info!(
        user_id = %user_id,
        username = %username,
        conn_id = %ctx.conn_id,
        "WebSocket actor started"
    );

    // Spawn writer task: forwards mpsc messages to WebSocket sink
    let writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    // Track pong reception
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();

    // Spawn ping task: sends periodic pings and monitors pong responses
    let ping_tx = tx.clone();
    let ping_handle = tokio::spawn(async move {
        let mut ping_timer = interval(PING_INTERVAL);
        // Skip the first immediate tick
        ping_timer.tick().await;

        loop {
            ping_timer.tick().await;

            // Send ping
            if ping_tx.send(Message::Ping(vec![1, 2, 3, 4].into())).is_err() {
                // Writer task has died — connection is gone
                break;
            }

            // Wait for pong within timeout
            match timeout(PONG_TIMEOUT, pong_rx.recv()).await {
                Ok(Some(())) => {
                    // Pong received, continue
                }
                _ => {
                    // Pong timeout or channel closed — close connection
                    tracing::warn!("Pong timeout, closing connection");
                    let _ = ping_tx.send(Message::Close(Some(CloseFrame {
                        code: 1001,
                        reason: "Pong timeout".into(),
                    })));
                    break;
                }
            }
        }
    });

    // Reader loop: process incoming WebSocket messages
    loop {
        match ws_receiver.next().await {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => {
                    handle_text_message(&state, &mut ctx, text.as_str()).await;
                }
                Message::Binary(_) => {
                    tracing::debug!(
                        user_id = %user_id,
                        "Received binary message (expected JSON text)"
                    );
                }
                Message::Pong(_) => {
                    // Pong received — notify the ping task
                    let _ = pong_tx.send(());
                }
                Message::Ping(data) => {
                    // Respond to client pings with pong
                    let _ = tx.send(Message::Pong(data));
                }
                Message::Close(frame) => {
                    tracing::info!(
                        user_id = %user_id,
                        reason = ?frame,
                        "Client initiated close"
                    );
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(
                    user_id = %user_id,
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
            None => {
                // Stream ended — client disconnected
                tracing::info!(user_id = %user_id, "WebSocket stream ended");
                break;
            }
        }
    }

    // Cleanup: abort writer and ping tasks. The registry sweep below keys
    // off sender.is_closed(), so wait for the aborted writer to actually
    // drop its receiver before sweeping.
    writer_handle.abort();
    ping_handle.abort();
    let _ = writer_handle.await;

    // Implicit leave-room if bound. Idempotent and tolerant of the room or
    // session having been removed by a concurrent leave.
    cleanup_binding(&state, &mut ctx).await;

    // Remove this connection from the registry
    unregister_connection(&state, &user_id);

    // Only mark offline if this was the user's last connection
    let has_remaining = state
        .connections
        .get(&user_id)
        .map(|v| !v.is_empty())
        .unwrap_or(false);

    if !has_remaining {
        set_online(&state, &user_id, false).await;
    }

    tracing::info!(
        user_id = %user_id,
        username = %username,
        "WebSocket actor stopped"
    );
}

/// Decode one tagged JSON message, dispatch it, and deliver the results.
async fn handle_text_message(state: &AppState, ctx: &mut ConnContext, text: &str) {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!(
                user_id = %ctx.user_id,
                error = %e,
                "Failed to decode client message"
            );
            broadcast::deliver(
                state,
                ctx,
                vec![crate::ws::protocol::Outbound {
                    target: crate::ws::protocol::Target::Caller,
                    message: ServerMessage::Error {
                        message: "invalid message".to_string(),
                    },
                }],
            );
            return;
        }
    };

    let outbounds = protocol::dispatch(state, ctx, msg).await;
    broadcast::deliver(state, ctx, outbounds);
}

/// Disconnect treated as an implicit leave-room for the bound room.
async fn cleanup_binding(state: &AppState, ctx: &mut ConnContext) {
    let Some(room_id) = ctx.room_id.take() else {
        return;
    };

    protocol::unbind(state, &room_id, &ctx.conn_id);

    // Membership removal may legitimately fail: the owner never leaves,
    // and the room may already be gone. Both are no-ops here.
    if let Err(e) = access::leave(state.db.clone(), room_id.clone(), ctx.user_id.clone()).await {
        tracing::debug!(
            user_id = %ctx.user_id,
            room_id = %room_id,
            error = %e,
            "Disconnect cleanup: leave was a no-op"
        );
        access::remove_cursor(state.db.clone(), room_id.clone(), ctx.user_id.clone()).await;
    }

    broadcast::notify_room(
        &state.rooms_live,
        &room_id,
        &ServerMessage::UserLeft {
            room_id: room_id.clone(),
            user_id: ctx.user_id.clone(),
            username: ctx.username.clone(),
        },
    );
}

/// Writer task: receives messages from mpsc channel and forwards them to the WebSocket sink.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        if ws_sender.send(msg).await.is_err() {
            // WebSocket send failed — connection is broken
            break;
        }
    }
}

/// Register a connection sender in the connection registry.
fn register_connection(state: &AppState, user_id: &str, tx: ConnectionSender) {
    state
        .connections
        .entry(user_id.to_string())
        .or_default()
        .push(tx);

    let conn_count = state.connections.get(user_id).map(|v| v.len()).unwrap_or(0);
    tracing::debug!(
        user_id = %user_id,
        connections = conn_count,
        "Connection registered"
    );
}

/// Remove closed connections from the registry for a user.
/// After the reader loop exits, the tx sender is dropped, so any
/// corresponding receivers are closed. We remove senders that are closed.
fn unregister_connection(state: &AppState, user_id: &str) {
    let mut remove_user = false;

    if let Some(mut connections) = state.connections.get_mut(user_id) {
        // Remove senders that are closed (the receiver has been dropped)
        connections.retain(|sender| !sender.is_closed());
        if connections.is_empty() {
            remove_user = true;
        }
    }

    if remove_user {
        state.connections.remove(user_id);
    }

    tracing::debug!(
        user_id = %user_id,
        "Connection unregistered"
    );
}

/// Flip the user's online flag and stamp last_seen. Failures are logged only.
async fn set_online(state: &AppState, user_id: &str, online: bool) {
    let db = state.db.clone();
    let uid = user_id.to_string();
    let result = tokio::task::spawn_blocking(move || {
        let conn = db.lock().ok()?;
        conn.execute(
            "UPDATE users SET is_online = ?2, last_seen = ?3, updated_at = ?3 WHERE id = ?1",
            rusqlite::params![uid, online as i64, Utc::now().to_rfc3339()],
        )
        .ok()
    })
    .await;

    if !matches!(result, Ok(Some(_))) {
        tracing::warn!(user_id = %user_id, "Failed to update online status");
    }
}
