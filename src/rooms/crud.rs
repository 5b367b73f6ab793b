//! REST handlers for room lifecycle and the join-request workflow.
//!
//! Anything touching participants or the pending queue goes through the
//! access engine; these handlers never mutate room rows directly except
//! for owner metadata edits and soft deletion.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::middleware::Claims;
use crate::db::models::{JoinRequest, Participant, Room, RoomType};
use crate::error::ApiError;
use crate::rooms::{access, join_code};
use crate::state::AppState;
use crate::ws::broadcast;
use crate::ws::protocol::ServerMessage;

// --- Request/response types ---

#[derive(Debug, Deserialize)]
pub struct CreateRoomRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub room_type: Option<RoomType>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateRoomRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub room_type: Option<RoomType>,
}

#[derive(Debug, Serialize)]
pub struct RoomResponse {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub language: String,
    pub owner_id: String,
    pub room_type: RoomType,
    pub join_code: Option<String>,
    pub participants: Vec<Participant>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Serialize)]
pub struct RoomListResponse {
    pub rooms: Vec<RoomResponse>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JoinResponse {
    Joined { room: access::RoomSnapshot },
    AwaitingApproval,
}

#[derive(Debug, Deserialize)]
pub struct JoinWithCodeRequest {
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct JoinCodeResponse {
    pub join_code: String,
}

#[derive(Debug, Serialize)]
pub struct RequestListResponse {
    pub requests: Vec<JoinRequest>,
}

fn room_response(room: Room, participants: Vec<Participant>, include_code: bool) -> RoomResponse {
    RoomResponse {
        id: room.id,
        name: room.name,
        description: room.description,
        language: room.language,
        owner_id: room.owner_id,
        room_type: room.room_type,
        join_code: if include_code { room.join_code } else { None },
        participants,
        created_at: room.created_at,
        updated_at: room.updated_at,
    }
}

// --- Handlers ---

/// POST /api/rooms — Create a room; the creator becomes owner and the
/// sole participant (owner ∈ participants from the very first write).
pub async fn create_room(
    State(state): State<AppState>,
    claims: Claims,
    Json(req): Json<CreateRoomRequest>,
) -> Result<(StatusCode, Json<RoomResponse>), ApiError> {
    let name = req.name.trim().to_string();
    if name.is_empty() || name.len() > 100 {
        return Err(ApiError::BadRequest(
            "room name must be 1-100 characters".to_string(),
        ));
    }

    let db = state.db.clone();
    let owner_id = claims.sub.clone();
    let username = claims.username.clone();

    let response = tokio::task::spawn_blocking(move || {
        let mut conn = db.lock().map_err(|e| ApiError::internal("DB lock", e))?;
        let now = Utc::now().to_rfc3339();
        let room_id = Uuid::new_v4().to_string();
        let room_type = req.room_type.unwrap_or(RoomType::Public);
        let language = req.language.unwrap_or_else(|| "javascript".to_string());

        let tx = conn.transaction().map_err(ApiError::from)?;
        tx.execute(
            "INSERT INTO rooms (id, name, description, language, owner_id, room_type,
                                code, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, '', 1, ?7, ?7)",
            rusqlite::params![
                room_id,
                name,
                req.description,
                language,
                owner_id,
                room_type.as_str(),
                now
            ],
        )?;
        tx.execute(
            "INSERT INTO room_participants (room_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![room_id, owner_id, now],
        )?;
        tx.commit().map_err(ApiError::from)?;

        let room = access::load_room(&conn, &room_id)?;
        Ok::<_, ApiError>(room_response(
            room,
            vec![Participant {
                user_id: owner_id,
                username,
            }],
            true,
        ))
    })
    .await??;

    Ok((StatusCode::CREATED, Json(response)))
}

/// GET /api/rooms/public — Active public rooms, newest first.
pub async fn list_public_rooms(
    State(state): State<AppState>,
    _claims: Claims,
) -> Result<Json<RoomListResponse>, ApiError> {
    let db = state.db.clone();

    let rooms = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|e| ApiError::internal("DB lock", e))?;
        let mut stmt = conn.prepare(
            "SELECT id, name, description, language, owner_id, room_type, code,
                    join_code, is_active, created_at, updated_at
             FROM rooms WHERE room_type = 'public' AND is_active = 1
             ORDER BY created_at DESC",
        )?;
        let rooms: Vec<Room> = stmt
            .query_map([], access::row_to_room)?
            .filter_map(|r| r.ok())
            .collect();
        list_with_participants(&conn, rooms)
    })
    .await??;

    Ok(Json(RoomListResponse { rooms }))
}

/// GET /api/rooms/mine — Active rooms the caller owns or participates in,
/// most recently updated first.
pub async fn list_my_rooms(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<RoomListResponse>, ApiError> {
    let db = state.db.clone();
    let user_id = claims.sub;

    let rooms = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|e| ApiError::internal("DB lock", e))?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT r.id, r.name, r.description, r.language, r.owner_id,
                    r.room_type, r.code, r.join_code, r.is_active, r.created_at, r.updated_at
             FROM rooms r
             LEFT JOIN room_participants p ON p.room_id = r.id
             WHERE (r.owner_id = ?1 OR p.user_id = ?1) AND r.is_active = 1
             ORDER BY r.updated_at DESC",
        )?;
        let rooms: Vec<Room> = stmt
            .query_map(rusqlite::params![user_id], access::row_to_room)?
            .filter_map(|r| r.ok())
            .collect();
        list_with_participants(&conn, rooms)
    })
    .await??;

    Ok(Json(RoomListResponse { rooms }))
}

/// GET /api/rooms/{id}
pub async fn get_room(
    State(state): State<AppState>,
    claims: Claims,
    Path(room_id): Path<String>,
) -> Result<Json<RoomResponse>, ApiError> {
    let db = state.db.clone();

    let response = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|e| ApiError::internal("DB lock", e))?;
        let room = access::load_room(&conn, &room_id)?;
        let participants = load_participants(&conn, &room_id)?;
        // Only the owner sees the join code.
        let include_code = room.owner_id == claims.sub;
        Ok::<_, ApiError>(room_response(room, participants, include_code))
    })
    .await??;

    Ok(Json(response))
}

/// PUT /api/rooms/{id} — Owner-only metadata edits. The owner identity
/// itself is immutable after creation.
pub async fn update_room(
    State(state): State<AppState>,
    claims: Claims,
    Path(room_id): Path<String>,
    Json(req): Json<UpdateRoomRequest>,
) -> Result<Json<RoomResponse>, ApiError> {
    let db = state.db.clone();
    let user_id = claims.sub;

    let response = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|e| ApiError::internal("DB lock", e))?;
        let room = access::load_room(&conn, &room_id)?;
        if room.owner_id != user_id {
            return Err(ApiError::Forbidden(
                "only the room owner may update the room".to_string(),
            ));
        }

        let name = req.name.unwrap_or(room.name);
        let description = req.description.or(room.description);
        let language = req.language.unwrap_or(room.language);
        let room_type = req.room_type.unwrap_or(room.room_type);

        conn.execute(
            "UPDATE rooms SET name = ?2, description = ?3, language = ?4,
                              room_type = ?5, updated_at = ?6
             WHERE id = ?1 AND is_active = 1",
            rusqlite::params![
                room_id,
                name,
                description,
                language,
                room_type.as_str(),
                Utc::now().to_rfc3339()
            ],
        )?;

        let room = access::load_room(&conn, &room_id)?;
        let participants = load_participants(&conn, &room_id)?;
        Ok::<_, ApiError>(room_response(room, participants, true))
    })
    .await??;

    Ok(Json(response))
}

/// DELETE /api/rooms/{id} — Owner-only soft delete. Deactivation makes the
/// join code unresolvable and strands no pending requests: the queue dies
/// with the room.
pub async fn delete_room(
    State(state): State<AppState>,
    claims: Claims,
    Path(room_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let db = state.db.clone();
    let user_id = claims.sub;
    let rid = room_id.clone();

    tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|e| ApiError::internal("DB lock", e))?;
        let room = access::load_room(&conn, &rid)?;
        if room.owner_id != user_id {
            return Err(ApiError::Forbidden(
                "only the room owner may delete the room".to_string(),
            ));
        }
        conn.execute(
            "UPDATE rooms SET is_active = 0, updated_at = ?2 WHERE id = ?1",
            rusqlite::params![rid, Utc::now().to_rfc3339()],
        )?;
        conn.execute(
            "DELETE FROM join_requests WHERE room_id = ?1",
            rusqlite::params![rid],
        )?;
        Ok(())
    })
    .await??;

    Ok(StatusCode::OK)
}

/// POST /api/rooms/{id}/join
pub async fn join_room(
    State(state): State<AppState>,
    claims: Claims,
    Path(room_id): Path<String>,
) -> Result<Json<JoinResponse>, ApiError> {
    match access::join(state.db.clone(), room_id.clone(), claims.sub.clone(), false).await? {
        access::JoinOutcome::Joined(snapshot) => {
            broadcast::notify_room(
                &state.rooms_live,
                &room_id,
                &ServerMessage::UserJoined {
                    room_id: room_id.clone(),
                    user_id: claims.sub,
                    username: claims.username,
                },
            );
            Ok(Json(JoinResponse::Joined { room: snapshot }))
        }
        access::JoinOutcome::AwaitingApproval => Ok(Json(JoinResponse::AwaitingApproval)),
    }
}

/// POST /api/rooms/join-with-code — Join the room a code resolves to.
/// The code bypasses a closed room's deny; a gated room still pends.
pub async fn join_room_with_code(
    State(state): State<AppState>,
    claims: Claims,
    Json(req): Json<JoinWithCodeRequest>,
) -> Result<Json<JoinResponse>, ApiError> {
    let room = join_code::resolve(state.db.clone(), req.code).await?;
    let room_id = room.id;

    match access::join(state.db.clone(), room_id.clone(), claims.sub.clone(), true).await? {
        access::JoinOutcome::Joined(snapshot) => {
            broadcast::notify_room(
                &state.rooms_live,
                &room_id,
                &ServerMessage::UserJoined {
                    room_id: room_id.clone(),
                    user_id: claims.sub,
                    username: claims.username,
                },
            );
            Ok(Json(JoinResponse::Joined { room: snapshot }))
        }
        access::JoinOutcome::AwaitingApproval => Ok(Json(JoinResponse::AwaitingApproval)),
    }
}

/// POST /api/rooms/{id}/leave
pub async fn leave_room(
    State(state): State<AppState>,
    claims: Claims,
    Path(room_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    access::leave(state.db.clone(), room_id.clone(), claims.sub.clone()).await?;
    broadcast::notify_room(
        &state.rooms_live,
        &room_id,
        &ServerMessage::UserLeft {
            room_id: room_id.clone(),
            user_id: claims.sub,
            username: claims.username,
        },
    );
    Ok(StatusCode::OK)
}

/// POST /api/rooms/{id}/requests — Ask to join a gated room.
pub async fn request_join(
    State(state): State<AppState>,
    claims: Claims,
    Path(room_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let owner_id = access::request_join(
        state.db.clone(),
        room_id.clone(),
        claims.sub.clone(),
        claims.username.clone(),
    )
    .await?;

    // Notification only after the enqueue committed.
    broadcast::notify_user(
        &state.connections,
        &owner_id,
        &ServerMessage::JoinRequestReceived {
            room_id,
            user_id: claims.sub,
            username: claims.username,
        },
    );
    Ok(StatusCode::ACCEPTED)
}

/// GET /api/rooms/{id}/requests — Owner's pending queue, oldest first.
pub async fn list_requests(
    State(state): State<AppState>,
    claims: Claims,
    Path(room_id): Path<String>,
) -> Result<Json<RequestListResponse>, ApiError> {
    let requests = access::pending_requests(state.db.clone(), room_id, claims.sub).await?;
    Ok(Json(RequestListResponse { requests }))
}

/// POST /api/rooms/{id}/requests/{user_id}/approve
pub async fn approve_request(
    State(state): State<AppState>,
    claims: Claims,
    Path((room_id, requester_id)): Path<(String, String)>,
) -> Result<Json<access::RoomSnapshot>, ApiError> {
    let snapshot = access::approve(
        state.db.clone(),
        room_id.clone(),
        claims.sub.clone(),
        requester_id.clone(),
    )
    .await?;

    let username = snapshot
        .participants
        .iter()
        .find(|p| p.user_id == requester_id)
        .map(|p| p.username.clone())
        .unwrap_or_default();

    broadcast::notify_user(
        &state.connections,
        &requester_id,
        &ServerMessage::JoinRequestApproved {
            room_id: room_id.clone(),
            room: snapshot.clone(),
        },
    );
    broadcast::notify_room(
        &state.rooms_live,
        &room_id,
        &ServerMessage::UserJoined {
            room_id: room_id.clone(),
            user_id: requester_id,
            username,
        },
    );

    Ok(Json(snapshot))
}

/// POST /api/rooms/{id}/requests/{user_id}/reject
pub async fn reject_request(
    State(state): State<AppState>,
    claims: Claims,
    Path((room_id, requester_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    access::reject(
        state.db.clone(),
        room_id.clone(),
        claims.sub.clone(),
        requester_id.clone(),
    )
    .await?;

    broadcast::notify_user(
        &state.connections,
        &requester_id,
        &ServerMessage::JoinRequestRejected { room_id },
    );
    Ok(StatusCode::OK)
}

/// DELETE /api/rooms/{id}/requests — Withdraw one's own pending request.
pub async fn cancel_request(
    State(state): State<AppState>,
    claims: Claims,
    Path(room_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let owner_id = access::cancel(state.db.clone(), room_id.clone(), claims.sub.clone()).await?;

    broadcast::notify_user(
        &state.connections,
        &owner_id,
        &ServerMessage::JoinRequestProcessed {
            room_id,
            user_id: claims.sub,
            action: "cancelled".to_string(),
        },
    );
    Ok(StatusCode::OK)
}

/// POST /api/rooms/{id}/join-code — Issue (or rotate) the room's join code.
pub async fn generate_join_code(
    State(state): State<AppState>,
    claims: Claims,
    Path(room_id): Path<String>,
) -> Result<Json<JoinCodeResponse>, ApiError> {
    let code = join_code::generate(state.db.clone(), room_id, claims.sub).await?;
    Ok(Json(JoinCodeResponse { join_code: code }))
}

/// GET /api/rooms/code/{code} — Resolve a join code to its active room.
/// Discovery only: the response never includes the code buffer, and joining
/// still goes through the room's own type rules.
pub async fn resolve_join_code(
    State(state): State<AppState>,
    _claims: Claims,
    Path(code): Path<String>,
) -> Result<Json<RoomResponse>, ApiError> {
    let room = join_code::resolve(state.db.clone(), code).await?;
    let db = state.db.clone();
    let room_id = room.id.clone();

    let participants = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|e| ApiError::internal("DB lock", e))?;
        load_participants(&conn, &room_id)
    })
    .await??;

    Ok(Json(room_response(room, participants, false)))
}

// --- In-lock helpers ---

fn load_participants(
    conn: &rusqlite::Connection,
    room_id: &str,
) -> Result<Vec<Participant>, ApiError> {
    let mut stmt = conn.prepare(
        "SELECT p.user_id, u.username FROM room_participants p
         JOIN users u ON u.id = p.user_id
         WHERE p.room_id = ?1 ORDER BY p.joined_at ASC",
    )?;
    let participants = stmt
        .query_map(rusqlite::params![room_id], |row| {
            Ok(Participant {
                user_id: row.get(0)?,
                username: row.get(1)?,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(participants)
}

fn list_with_participants(
    conn: &rusqlite::Connection,
    rooms: Vec<Room>,
) -> Result<Vec<RoomResponse>, ApiError> {
    let mut out = Vec::with_capacity(rooms.len());
    for room in rooms {
        let participants = load_participants(conn, &room.id)?;
        out.push(room_response(room, participants, false));
    }
    Ok(out)
}
