//! Access control engine: join evaluation, the pending-request queue,
//! and participant mutations.
//!
//! Every mutation that depends on current state is a single conditional
//! SQL statement (or one transaction) executed while holding the connection
//! mutex — success is decided by rows_affected, never by a read followed by
//! an unconditioned write. Two concurrent callers racing on the same room
//! see exactly one precondition hold; the loser gets Conflict.

use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;

use crate::db::models::{Cursor, JoinRequest, Participant, Room, RoomType};
use crate::db::DbPool;
use crate::error::ApiError;
use crate::rooms::sessions;

/// Outcome of evaluating a join attempt against room policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinDecision {
    Allow,
    Pending,
    Deny(String),
}

/// Result of applying a join: either the caller is now a participant and
/// receives the full room snapshot, or approval is still required.
#[derive(Debug)]
pub enum JoinOutcome {
    Joined(RoomSnapshot),
    AwaitingApproval,
}

/// Full room state sent to a connection that just joined.
#[derive(Debug, Clone, Serialize)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub name: String,
    pub language: String,
    pub room_type: RoomType,
    pub owner_id: String,
    pub code: String,
    pub participants: Vec<Participant>,
    pub cursors: Vec<Cursor>,
}

/// Decide ALLOW / PENDING / DENY for a join attempt.
///
/// Participants and the owner always get Allow (idempotent re-join).
/// A valid join code bypasses a private room's default deny, but is only
/// a discovery mechanism for request_to_join rooms — approval still applies.
pub fn evaluate_join(room: &Room, user_id: &str, is_participant: bool, via_code: bool) -> JoinDecision {
    if !room.is_active {
        return JoinDecision::Deny("room is not active".to_string());
    }
    if room.owner_id == user_id || is_participant {
        return JoinDecision::Allow;
    }
    match room.room_type {
        RoomType::Public => JoinDecision::Allow,
        RoomType::Private => {
            if via_code {
                JoinDecision::Allow
            } else {
                JoinDecision::Deny("room is closed".to_string())
            }
        }
        RoomType::RequestToJoin => JoinDecision::Pending,
    }
}

/// Join a room (id already resolved, possibly via join code).
/// On Allow: upserts the caller into participants, refreshes the session,
/// and returns the snapshot. On Pending: returns AwaitingApproval without
/// touching any state. On Deny: Forbidden with the reason.
pub async fn join(
    db: DbPool,
    room_id: String,
    user_id: String,
    via_code: bool,
) -> Result<JoinOutcome, ApiError> {
    tokio::task::spawn_blocking(move || {
        let mut conn = db.lock().map_err(|e| ApiError::internal("DB lock", e))?;
        let room = load_room(&conn, &room_id)?;
        let is_participant = is_participant(&conn, &room_id, &user_id)?;

        match evaluate_join(&room, &user_id, is_participant, via_code) {
            JoinDecision::Deny(reason) => Err(ApiError::Forbidden(reason)),
            JoinDecision::Pending => Ok(JoinOutcome::AwaitingApproval),
            JoinDecision::Allow => {
                let now = Utc::now().to_rfc3339();
                // Membership and a pending entry are mutually exclusive. The
                // room may have been opened up while a request waited, so any
                // leftover pending entry is consumed by the same transaction
                // that grants membership.
                let tx = conn.transaction().map_err(ApiError::from)?;
                tx.execute(
                    "DELETE FROM join_requests WHERE room_id = ?1 AND user_id = ?2",
                    rusqlite::params![room_id, user_id],
                )?;
                // Idempotent: a second join by the same user is a no-op.
                tx.execute(
                    "INSERT OR IGNORE INTO room_participants (room_id, user_id, joined_at)
                     VALUES (?1, ?2, ?3)",
                    rusqlite::params![room_id, user_id, now],
                )?;
                tx.commit().map_err(ApiError::from)?;

                sessions::open(&conn, &user_id, &room_id);
                Ok(JoinOutcome::Joined(snapshot_locked(&conn, &room)?))
            }
        }
    })
    .await?
}

/// Enqueue a join request for a gated room.
///
/// The enqueue is one conditional INSERT: it lands only if the room is
/// active and gated, and the requester is neither a participant nor already
/// pending. Two concurrent requests from the same identity cannot both
/// succeed — the loser observes zero rows and gets Conflict.
/// Returns the room owner's id so the caller can notify their private channel.
pub async fn request_join(
    db: DbPool,
    room_id: String,
    user_id: String,
    username: String,
) -> Result<String, ApiError> {
    tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|e| ApiError::internal("DB lock", e))?;
        let now = Utc::now().to_rfc3339();

        let inserted = conn.execute(
            "INSERT INTO join_requests (room_id, user_id, username, requested_at)
             SELECT ?1, ?2, ?3, ?4
             WHERE EXISTS (SELECT 1 FROM rooms
                           WHERE id = ?1 AND is_active = 1 AND room_type = 'request_to_join')
               AND NOT EXISTS (SELECT 1 FROM room_participants
                               WHERE room_id = ?1 AND user_id = ?2)
               AND NOT EXISTS (SELECT 1 FROM join_requests
                               WHERE room_id = ?1 AND user_id = ?2)",
            rusqlite::params![room_id, user_id, username, now],
        )?;

        if inserted == 0 {
            // The mutation already failed atomically; this read only picks
            // the error message.
            let room = load_room(&conn, &room_id)?;
            if room.room_type != RoomType::RequestToJoin {
                return Err(ApiError::Forbidden(
                    "room does not accept join requests".to_string(),
                ));
            }
            if is_participant(&conn, &room_id, &user_id)? {
                return Err(ApiError::Conflict(
                    "already a participant in this room".to_string(),
                ));
            }
            return Err(ApiError::Conflict(
                "join request already pending".to_string(),
            ));
        }

        load_room(&conn, &room_id).map(|r| r.owner_id)
    })
    .await?
}

/// Approve a pending join request (owner only).
///
/// The removal of the pending entry and the participant insert happen in one
/// transaction, conditioned on the pending entry still existing and the
/// caller still being the owner of an active room. A concurrent approve or
/// reject that got there first leaves zero rows to delete — that caller's
/// precondition won, and this call returns Conflict rather than corrupting
/// state (no double-approve, no orphaned pending entries).
pub async fn approve(
    db: DbPool,
    room_id: String,
    owner_id: String,
    requester_id: String,
) -> Result<RoomSnapshot, ApiError> {
    tokio::task::spawn_blocking(move || {
        let mut conn = db.lock().map_err(|e| ApiError::internal("DB lock", e))?;
        require_owner(&conn, &room_id, &owner_id)?;

        let tx = conn.transaction().map_err(ApiError::from)?;
        let removed = tx.execute(
            "DELETE FROM join_requests
             WHERE room_id = ?1 AND user_id = ?2
               AND EXISTS (SELECT 1 FROM rooms
                           WHERE id = ?1 AND owner_id = ?3 AND is_active = 1)",
            rusqlite::params![room_id, requester_id, owner_id],
        )?;
        if removed == 0 {
            return Err(ApiError::Conflict(
                "request not found or already processed".to_string(),
            ));
        }

        let now = Utc::now().to_rfc3339();
        tx.execute(
            "INSERT OR IGNORE INTO room_participants (room_id, user_id, joined_at)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![room_id, requester_id, now],
        )?;
        tx.commit().map_err(ApiError::from)?;

        sessions::open(&conn, &requester_id, &room_id);

        let room = load_room(&conn, &room_id)?;
        snapshot_locked(&conn, &room)
    })
    .await?
}

/// Reject a pending join request (owner only).
/// Single conditional removal; the losing side of a race gets Conflict.
pub async fn reject(
    db: DbPool,
    room_id: String,
    owner_id: String,
    requester_id: String,
) -> Result<(), ApiError> {
    tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|e| ApiError::internal("DB lock", e))?;
        require_owner(&conn, &room_id, &owner_id)?;

        let removed = conn.execute(
            "DELETE FROM join_requests
             WHERE room_id = ?1 AND user_id = ?2
               AND EXISTS (SELECT 1 FROM rooms
                           WHERE id = ?1 AND owner_id = ?3 AND is_active = 1)",
            rusqlite::params![room_id, requester_id, owner_id],
        )?;
        if removed == 0 {
            return Err(ApiError::Conflict(
                "request not found or already processed".to_string(),
            ));
        }
        Ok(())
    })
    .await?
}

/// Withdraw one's own pending join request. Never requires owner identity.
/// Returns the room owner's id for the "request processed" notification.
pub async fn cancel(db: DbPool, room_id: String, user_id: String) -> Result<String, ApiError> {
    tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|e| ApiError::internal("DB lock", e))?;

        let removed = conn.execute(
            "DELETE FROM join_requests WHERE room_id = ?1 AND user_id = ?2",
            rusqlite::params![room_id, user_id],
        )?;
        if removed == 0 {
            return Err(ApiError::Conflict(
                "request not found or already processed".to_string(),
            ));
        }
        load_room(&conn, &room_id).map(|r| r.owner_id)
    })
    .await?
}

/// Remove a participant from a room. The owner may never leave their own
/// room. Closes the session and drops the live cursor entry.
pub async fn leave(db: DbPool, room_id: String, user_id: String) -> Result<(), ApiError> {
    tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|e| ApiError::internal("DB lock", e))?;
        let room = load_room(&conn, &room_id)?;
        if room.owner_id == user_id {
            return Err(ApiError::Forbidden("owner cannot leave room".to_string()));
        }

        conn.execute(
            "DELETE FROM room_participants WHERE room_id = ?1 AND user_id = ?2",
            rusqlite::params![room_id, user_id],
        )?;
        conn.execute(
            "DELETE FROM room_cursors WHERE room_id = ?1 AND user_id = ?2",
            rusqlite::params![room_id, user_id],
        )?;
        sessions::close(&conn, &user_id, &room_id);
        Ok(())
    })
    .await?
}

/// Overwrite the room's code buffer (whole-buffer, last writer wins).
pub async fn update_code(db: DbPool, room_id: String, code: String) -> Result<(), ApiError> {
    tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|e| ApiError::internal("DB lock", e))?;
        let updated = conn.execute(
            "UPDATE rooms SET code = ?2, updated_at = ?3 WHERE id = ?1 AND is_active = 1",
            rusqlite::params![room_id, code, Utc::now().to_rfc3339()],
        )?;
        if updated == 0 {
            return Err(ApiError::NotFound("room not found".to_string()));
        }
        Ok(())
    })
    .await?
}

/// Upsert a participant's cursor, conditioned on persisted membership.
/// A connection that was removed from the room but has not yet disconnected
/// fails the membership condition and its stale cursor event is rejected.
pub async fn update_cursor(db: DbPool, room_id: String, cursor: Cursor) -> Result<(), ApiError> {
    tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|e| ApiError::internal("DB lock", e))?;
        let now = Utc::now().to_rfc3339();
        let upserted = conn.execute(
            "INSERT INTO room_cursors (room_id, user_id, username, line, ch, color, updated_at)
             SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7
             WHERE EXISTS (SELECT 1 FROM room_participants
                           WHERE room_id = ?1 AND user_id = ?2)
             ON CONFLICT(room_id, user_id) DO UPDATE
                SET line = excluded.line, ch = excluded.ch,
                    color = excluded.color, updated_at = excluded.updated_at",
            rusqlite::params![
                room_id,
                cursor.user_id,
                cursor.username,
                cursor.line,
                cursor.ch,
                cursor.color,
                now
            ],
        )?;
        if upserted == 0 {
            return Err(ApiError::Forbidden(
                "not a participant in this room".to_string(),
            ));
        }
        Ok(())
    })
    .await?
}

/// Drop a cursor entry. Best-effort: the row (or the room) may already be gone.
pub async fn remove_cursor(db: DbPool, room_id: String, user_id: String) {
    let result = tokio::task::spawn_blocking(move || {
        let conn = db.lock().ok()?;
        conn.execute(
            "DELETE FROM room_cursors WHERE room_id = ?1 AND user_id = ?2",
            rusqlite::params![room_id, user_id],
        )
        .ok()
    })
    .await;
    if result.is_err() {
        tracing::warn!("Cursor removal task failed");
    }
}

/// Load the full snapshot for a room by id.
pub async fn snapshot(db: DbPool, room_id: String) -> Result<RoomSnapshot, ApiError> {
    tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|e| ApiError::internal("DB lock", e))?;
        let room = load_room(&conn, &room_id)?;
        snapshot_locked(&conn, &room)
    })
    .await?
}

/// Pending requests for a room, oldest first (owner's review queue).
pub async fn pending_requests(
    db: DbPool,
    room_id: String,
    owner_id: String,
) -> Result<Vec<JoinRequest>, ApiError> {
    tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|e| ApiError::internal("DB lock", e))?;
        require_owner(&conn, &room_id, &owner_id)?;

        let mut stmt = conn.prepare(
            "SELECT user_id, username, requested_at FROM join_requests
             WHERE room_id = ?1 ORDER BY requested_at ASC",
        )?;
        let requests = stmt
            .query_map(rusqlite::params![room_id], |row| {
                Ok(JoinRequest {
                    user_id: row.get(0)?,
                    username: row.get(1)?,
                    requested_at: row.get(2)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(requests)
    })
    .await?
}

// --- In-lock helpers shared across engine operations ---

/// Load an active room row or NotFound.
pub fn load_room(conn: &Connection, room_id: &str) -> Result<Room, ApiError> {
    conn.query_row(
        "SELECT id, name, description, language, owner_id, room_type, code,
                join_code, is_active, created_at, updated_at
         FROM rooms WHERE id = ?1 AND is_active = 1",
        rusqlite::params![room_id],
        row_to_room,
    )
    .map_err(|_| ApiError::NotFound("room not found".to_string()))
}

pub fn row_to_room(row: &rusqlite::Row<'_>) -> rusqlite::Result<Room> {
    let room_type: String = row.get(5)?;
    Ok(Room {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        language: row.get(3)?,
        owner_id: row.get(4)?,
        room_type: RoomType::from_str(&room_type).unwrap_or(RoomType::Public),
        code: row.get(6)?,
        join_code: row.get(7)?,
        is_active: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn is_participant(conn: &Connection, room_id: &str, user_id: &str) -> Result<bool, ApiError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM room_participants WHERE room_id = ?1 AND user_id = ?2",
        rusqlite::params![room_id, user_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn require_owner(conn: &Connection, room_id: &str, user_id: &str) -> Result<(), ApiError> {
    let room = load_room(conn, room_id)?;
    if room.owner_id != user_id {
        return Err(ApiError::Forbidden(
            "only the room owner may do this".to_string(),
        ));
    }
    Ok(())
}

fn snapshot_locked(conn: &Connection, room: &Room) -> Result<RoomSnapshot, ApiError> {
    let mut stmt = conn.prepare(
        "SELECT p.user_id, u.username FROM room_participants p
         JOIN users u ON u.id = p.user_id
         WHERE p.room_id = ?1 ORDER BY p.joined_at ASC",
    )?;
    let participants = stmt
        .query_map(rusqlite::params![room.id], |row| {
            Ok(Participant {
                user_id: row.get(0)?,
                username: row.get(1)?,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();

    let mut stmt = conn.prepare(
        "SELECT user_id, username, line, ch, color FROM room_cursors WHERE room_id = ?1",
    )?;
    let cursors = stmt
        .query_map(rusqlite::params![room.id], |row| {
            Ok(Cursor {
                user_id: row.get(0)?,
                username: row.get(1)?,
                line: row.get(2)?,
                ch: row.get(3)?,
                color: row.get(4)?,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();

    Ok(RoomSnapshot {
        room_id: room.id.clone(),
        name: room.name.clone(),
        language: room.language.clone(),
        room_type: room.room_type,
        owner_id: room.owner_id.clone(),
        code: room.code.clone(),
        participants,
        cursors,
    })
}
