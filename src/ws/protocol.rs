//! Tagged WebSocket protocol and the per-connection dispatch function.
//!
//! Every inbound frame is one tagged JSON message; dispatch consults the
//! access engine, mutates live bindings, and returns the list of outbound
//! notifications with their target channels. Delivery is a separate, thin
//! layer (broadcast.rs), so the dispatch logic here is testable without a
//! live transport.

use serde::{Deserialize, Serialize};

use crate::db::models::Cursor;
use crate::error::ApiError;
use crate::rooms::{access, join_code};
use crate::state::AppState;
use crate::ws::{ConnectionSender, RoomSubscriber};

/// Client-to-server intents.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Join a room located by id, or discovered via a join code.
    JoinRoom {
        #[serde(default)]
        room_id: Option<String>,
        #[serde(default)]
        code: Option<String>,
    },
    LeaveRoom,
    /// Whole-buffer overwrite of the bound room's code (last writer wins).
    CodeChange { code: String },
    CursorMove { line: i64, ch: i64, color: String },
    RequestJoin { room_id: String },
    ApproveRequest { room_id: String, user_id: String },
    RejectRequest { room_id: String, user_id: String },
    CancelRequest { room_id: String },
}

/// Server-to-client events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Full snapshot sent to the joining connection only.
    RoomData { room: access::RoomSnapshot },
    /// Join evaluated to PENDING; the connection is not bound to the room.
    AwaitingApproval { room_id: String },
    JoinDenied { room_id: String, reason: String },
    UserJoined {
        room_id: String,
        user_id: String,
        username: String,
    },
    UserLeft {
        room_id: String,
        user_id: String,
        username: String,
    },
    CodeUpdated {
        room_id: String,
        code: String,
        updated_by: String,
    },
    CursorUpdated { room_id: String, cursor: Cursor },
    /// Owner's private channel: a new request landed in the queue.
    JoinRequestReceived {
        room_id: String,
        user_id: String,
        username: String,
    },
    /// Requester's private channel: the owner let them in.
    JoinRequestApproved {
        room_id: String,
        room: access::RoomSnapshot,
    },
    /// Requester's private channel: the owner turned them down.
    JoinRequestRejected { room_id: String },
    /// Owner's (or canceller's) channel: a queue entry was consumed.
    JoinRequestProcessed {
        room_id: String,
        user_id: String,
        action: String,
    },
    Error { message: String },
}

/// Delivery channel for an outbound notification.
#[derive(Debug, Clone)]
pub enum Target {
    /// The connection that sent the inbound message.
    Caller,
    /// Every connection bound to the room except the origin connection.
    Room {
        room_id: String,
        exclude_conn: String,
    },
    /// Every connection of one identity (private channel).
    User(String),
}

/// One outbound notification with its target channel.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub target: Target,
    pub message: ServerMessage,
}

impl Outbound {
    fn caller(message: ServerMessage) -> Self {
        Self {
            target: Target::Caller,
            message,
        }
    }

    fn room(room_id: &str, exclude_conn: &str, message: ServerMessage) -> Self {
        Self {
            target: Target::Room {
                room_id: room_id.to_string(),
                exclude_conn: exclude_conn.to_string(),
            },
            message,
        }
    }

    fn user(user_id: &str, message: ServerMessage) -> Self {
        Self {
            target: Target::User(user_id.to_string()),
            message,
        }
    }
}

/// Per-connection context: identity plus the live room binding.
/// The binding lives only here and in the room registry; it is destroyed
/// on disconnect and never persisted.
pub struct ConnContext {
    pub conn_id: String,
    pub user_id: String,
    pub username: String,
    pub sender: ConnectionSender,
    pub room_id: Option<String>,
}

/// Dispatch one inbound message and return the notifications to deliver.
/// State changes commit inside the access engine before any notification
/// is produced, so a failed conditional update never emits an event.
pub async fn dispatch(state: &AppState, ctx: &mut ConnContext, msg: ClientMessage) -> Vec<Outbound> {
    match msg {
        ClientMessage::JoinRoom { room_id, code } => handle_join_room(state, ctx, room_id, code).await,
        ClientMessage::LeaveRoom => handle_leave_room(state, ctx).await,
        ClientMessage::CodeChange { code } => handle_code_change(state, ctx, code).await,
        ClientMessage::CursorMove { line, ch, color } => {
            handle_cursor_move(state, ctx, line, ch, color).await
        }
        ClientMessage::RequestJoin { room_id } => handle_request_join(state, ctx, room_id).await,
        ClientMessage::ApproveRequest { room_id, user_id } => {
            handle_approve(state, ctx, room_id, user_id).await
        }
        ClientMessage::RejectRequest { room_id, user_id } => {
            handle_reject(state, ctx, room_id, user_id).await
        }
        ClientMessage::CancelRequest { room_id } => handle_cancel(state, ctx, room_id).await,
    }
}

async fn handle_join_room(
    state: &AppState,
    ctx: &mut ConnContext,
    room_id: Option<String>,
    code: Option<String>,
) -> Vec<Outbound> {
    // Locate the target room: by id, or by join code (discovery path).
    let (room_id, via_code) = match (room_id, code) {
        (_, Some(code)) => match join_code::resolve(state.db.clone(), code).await {
            Ok(room) => (room.id, true),
            Err(e) => return vec![error_out(e)],
        },
        (Some(id), None) => (id, false),
        (None, None) => {
            return vec![Outbound::caller(ServerMessage::Error {
                message: "join-room requires room_id or code".to_string(),
            })]
        }
    };

    match access::join(
        state.db.clone(),
        room_id.clone(),
        ctx.user_id.clone(),
        via_code,
    )
    .await
    {
        Ok(access::JoinOutcome::Joined(snapshot)) => {
            // Rebinding to a new room implicitly drops the old live binding.
            let mut out = Vec::new();
            if let Some(old_room) = ctx.room_id.take() {
                if old_room != room_id {
                    unbind(state, &old_room, &ctx.conn_id);
                    out.push(Outbound::room(
                        &old_room,
                        &ctx.conn_id,
                        ServerMessage::UserLeft {
                            room_id: old_room.clone(),
                            user_id: ctx.user_id.clone(),
                            username: ctx.username.clone(),
                        },
                    ));
                }
            }

            bind(state, &room_id, ctx);
            ctx.room_id = Some(room_id.clone());

            out.push(Outbound::room(
                &room_id,
                &ctx.conn_id,
                ServerMessage::UserJoined {
                    room_id: room_id.clone(),
                    user_id: ctx.user_id.clone(),
                    username: ctx.username.clone(),
                },
            ));
            out.push(Outbound::caller(ServerMessage::RoomData { room: snapshot }));
            out
        }
        Ok(access::JoinOutcome::AwaitingApproval) => {
            vec![Outbound::caller(ServerMessage::AwaitingApproval { room_id })]
        }
        Err(ApiError::Forbidden(reason)) => {
            vec![Outbound::caller(ServerMessage::JoinDenied { room_id, reason })]
        }
        Err(e) => vec![error_out(e)],
    }
}

async fn handle_leave_room(state: &AppState, ctx: &mut ConnContext) -> Vec<Outbound> {
    let Some(room_id) = ctx.room_id.take() else {
        return vec![Outbound::caller(ServerMessage::Error {
            message: "not in a room".to_string(),
        })];
    };

    unbind(state, &room_id, &ctx.conn_id);

    let mut out = vec![Outbound::room(
        &room_id,
        &ctx.conn_id,
        ServerMessage::UserLeft {
            room_id: room_id.clone(),
            user_id: ctx.user_id.clone(),
            username: ctx.username.clone(),
        },
    )];

    match access::leave(state.db.clone(), room_id.clone(), ctx.user_id.clone()).await {
        Ok(()) => {}
        Err(ApiError::Forbidden(reason)) => {
            // The owner's membership is permanent; only the live binding ends.
            out.push(Outbound::caller(ServerMessage::Error { message: reason }));
            access::remove_cursor(state.db.clone(), room_id, ctx.user_id.clone()).await;
        }
        Err(e) => out.push(error_out(e)),
    }

    out
}

async fn handle_code_change(state: &AppState, ctx: &mut ConnContext, code: String) -> Vec<Outbound> {
    let Some(room_id) = ctx.room_id.clone() else {
        return vec![Outbound::caller(ServerMessage::Error {
            message: "not in a room".to_string(),
        })];
    };

    match access::update_code(state.db.clone(), room_id.clone(), code.clone()).await {
        // The originating connection is not echoed back.
        Ok(()) => vec![Outbound::room(
            &room_id,
            &ctx.conn_id,
            ServerMessage::CodeUpdated {
                room_id: room_id.clone(),
                code,
                updated_by: ctx.username.clone(),
            },
        )],
        Err(e) => vec![error_out(e)],
    }
}

async fn handle_cursor_move(
    state: &AppState,
    ctx: &mut ConnContext,
    line: i64,
    ch: i64,
    color: String,
) -> Vec<Outbound> {
    let Some(room_id) = ctx.room_id.clone() else {
        return vec![Outbound::caller(ServerMessage::Error {
            message: "not in a room".to_string(),
        })];
    };

    let cursor = Cursor {
        user_id: ctx.user_id.clone(),
        username: ctx.username.clone(),
        line,
        ch,
        color,
    };

    // Membership is checked against the persisted participant set, which
    // rejects stale events from a connection already removed from the room.
    match access::update_cursor(state.db.clone(), room_id.clone(), cursor.clone()).await {
        Ok(()) => vec![Outbound::room(
            &room_id,
            &ctx.conn_id,
            ServerMessage::CursorUpdated {
                room_id: room_id.clone(),
                cursor,
            },
        )],
        Err(e) => vec![error_out(e)],
    }
}

async fn handle_request_join(state: &AppState, ctx: &mut ConnContext, room_id: String) -> Vec<Outbound> {
    match access::request_join(
        state.db.clone(),
        room_id.clone(),
        ctx.user_id.clone(),
        ctx.username.clone(),
    )
    .await
    {
        Ok(owner_id) => vec![
            Outbound::user(
                &owner_id,
                ServerMessage::JoinRequestReceived {
                    room_id: room_id.clone(),
                    user_id: ctx.user_id.clone(),
                    username: ctx.username.clone(),
                },
            ),
            Outbound::caller(ServerMessage::AwaitingApproval { room_id }),
        ],
        Err(e) => vec![error_out(e)],
    }
}

async fn handle_approve(
    state: &AppState,
    ctx: &mut ConnContext,
    room_id: String,
    requester_id: String,
) -> Vec<Outbound> {
    match access::approve(
        state.db.clone(),
        room_id.clone(),
        ctx.user_id.clone(),
        requester_id.clone(),
    )
    .await
    {
        Ok(snapshot) => {
            let username = snapshot
                .participants
                .iter()
                .find(|p| p.user_id == requester_id)
                .map(|p| p.username.clone())
                .unwrap_or_default();
            vec![
                Outbound::user(
                    &requester_id,
                    ServerMessage::JoinRequestApproved {
                        room_id: room_id.clone(),
                        room: snapshot,
                    },
                ),
                // Membership changed: tell everyone bound to the room.
                Outbound::room(
                    &room_id,
                    &ctx.conn_id,
                    ServerMessage::UserJoined {
                        room_id: room_id.clone(),
                        user_id: requester_id.clone(),
                        username,
                    },
                ),
                Outbound::caller(ServerMessage::JoinRequestProcessed {
                    room_id,
                    user_id: requester_id,
                    action: "approved".to_string(),
                }),
            ]
        }
        Err(e) => vec![error_out(e)],
    }
}

async fn handle_reject(
    state: &AppState,
    ctx: &mut ConnContext,
    room_id: String,
    requester_id: String,
) -> Vec<Outbound> {
    match access::reject(
        state.db.clone(),
        room_id.clone(),
        ctx.user_id.clone(),
        requester_id.clone(),
    )
    .await
    {
        Ok(()) => vec![
            Outbound::user(
                &requester_id,
                ServerMessage::JoinRequestRejected {
                    room_id: room_id.clone(),
                },
            ),
            Outbound::caller(ServerMessage::JoinRequestProcessed {
                room_id,
                user_id: requester_id,
                action: "rejected".to_string(),
            }),
        ],
        Err(e) => vec![error_out(e)],
    }
}

async fn handle_cancel(state: &AppState, ctx: &mut ConnContext, room_id: String) -> Vec<Outbound> {
    match access::cancel(state.db.clone(), room_id.clone(), ctx.user_id.clone()).await {
        Ok(owner_id) => {
            let processed = ServerMessage::JoinRequestProcessed {
                room_id,
                user_id: ctx.user_id.clone(),
                action: "cancelled".to_string(),
            };
            vec![
                Outbound::user(&owner_id, processed.clone()),
                Outbound::caller(processed),
            ]
        }
        Err(e) => vec![error_out(e)],
    }
}

fn error_out(err: ApiError) -> Outbound {
    Outbound::caller(ServerMessage::Error {
        message: err.to_string(),
    })
}

/// Add this connection to a room's live subscriber list.
fn bind(state: &AppState, room_id: &str, ctx: &ConnContext) {
    let mut subscribers = state.rooms_live.entry(room_id.to_string()).or_default();
    // Re-join over an existing binding must not duplicate the subscriber.
    subscribers.retain(|s| s.conn_id != ctx.conn_id);
    subscribers.push(RoomSubscriber {
        conn_id: ctx.conn_id.clone(),
        user_id: ctx.user_id.clone(),
        username: ctx.username.clone(),
        sender: ctx.sender.clone(),
    });
}

/// Remove this connection from a room's live subscriber list.
/// Idempotent: safe when the room entry is already gone.
pub fn unbind(state: &AppState, room_id: &str, conn_id: &str) {
    let mut remove_room = false;
    if let Some(mut subscribers) = state.rooms_live.get_mut(room_id) {
        subscribers.retain(|s| s.conn_id != conn_id);
        if subscribers.is_empty() {
            remove_room = true;
        }
    }
    if remove_room {
        state.rooms_live.remove(room_id);
    }
}
