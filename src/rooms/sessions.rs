//! Session tracker: join/leave timestamps per (user, room) pair.
//!
//! Sessions are analytics, not access state. These helpers run inside the
//! caller's DB lock but never surface errors — a failed session write is
//! logged and the join/leave proceeds regardless.

use chrono::Utc;
use rusqlite::Connection;
use uuid::Uuid;

/// Open (or refresh) the active session for a (user, room) pair.
/// Upsert-on-active-pair: a re-join refreshes joined_at instead of
/// stacking a duplicate row.
pub fn open(conn: &Connection, user_id: &str, room_id: &str) {
    let now = Utc::now().to_rfc3339();
    let result = conn.execute(
        "INSERT INTO sessions (id, user_id, room_id, joined_at, is_active)
         VALUES (?1, ?2, ?3, ?4, 1)
         ON CONFLICT(user_id, room_id) WHERE is_active = 1
         DO UPDATE SET joined_at = excluded.joined_at",
        rusqlite::params![Uuid::new_v4().to_string(), user_id, room_id, now],
    );
    if let Err(e) = result {
        tracing::warn!(
            user_id = %user_id,
            room_id = %room_id,
            error = %e,
            "Failed to open session"
        );
    }
}

/// Close the active session for a (user, room) pair. No-op if none active.
pub fn close(conn: &Connection, user_id: &str, room_id: &str) {
    let now = Utc::now().to_rfc3339();
    let result = conn.execute(
        "UPDATE sessions SET left_at = ?3, is_active = 0
         WHERE user_id = ?1 AND room_id = ?2 AND is_active = 1",
        rusqlite::params![user_id, room_id, now],
    );
    if let Err(e) = result {
        tracing::warn!(
            user_id = %user_id,
            room_id = %room_id,
            error = %e,
            "Failed to close session"
        );
    }
}
