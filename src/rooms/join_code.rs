//! Join-code issuer: short human-shareable codes bound to active rooms.

use chrono::Utc;
use rand::Rng;

use crate::db::models::Room;
use crate::db::DbPool;
use crate::error::ApiError;
use crate::rooms::access;

/// Code alphabet: uppercase alphanumerics minus the ambiguous 0/O/1/I/L.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
const CODE_LENGTH: usize = 6;

/// How many collisions we tolerate before giving up. The keyspace is
/// ~887 million codes, so hitting this means something is very wrong.
const MAX_GENERATION_ATTEMPTS: usize = 32;

/// Generate a 6-character join code from the unambiguous alphabet.
fn generate_code() -> String {
    let mut rng = rand::rng();
    (0..CODE_LENGTH)
        .map(|_| {
            let idx = rng.random_range(0..CODE_ALPHABET.len());
            CODE_ALPHABET[idx] as char
        })
        .collect()
}

/// Issue (or rotate) the join code for a room. Owner only.
///
/// Uniqueness among active rooms is enforced by the partial unique index on
/// rooms.join_code; a collision shows up as a constraint violation on the
/// conditional UPDATE and is handled by regenerating, never by failing.
pub async fn generate(db: DbPool, room_id: String, owner_id: String) -> Result<String, ApiError> {
    tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|e| ApiError::internal("DB lock", e))?;

        for _ in 0..MAX_GENERATION_ATTEMPTS {
            let code = generate_code();
            let result = conn.execute(
                "UPDATE rooms SET join_code = ?1, updated_at = ?2
                 WHERE id = ?3 AND owner_id = ?4 AND is_active = 1",
                rusqlite::params![code, Utc::now().to_rfc3339(), room_id, owner_id],
            );
            match result {
                Ok(0) => {
                    // Room missing, inactive, or caller is not the owner.
                    let room = access::load_room(&conn, &room_id)?;
                    if room.owner_id != owner_id {
                        return Err(ApiError::Forbidden(
                            "only the room owner may generate a join code".to_string(),
                        ));
                    }
                    return Err(ApiError::NotFound("room not found".to_string()));
                }
                Ok(_) => return Ok(code),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    // Another active room holds this code; try a fresh one.
                    continue;
                }
                Err(e) => return Err(ApiError::from(e)),
            }
        }

        Err(ApiError::internal(
            "join code generation exhausted retries",
            "keyspace saturated",
        ))
    })
    .await?
}

/// Resolve a join code to its active room. Codes on inactive rooms are
/// not resolvable.
pub async fn resolve(db: DbPool, code: String) -> Result<Room, ApiError> {
    tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|e| ApiError::internal("DB lock", e))?;
        conn.query_row(
            "SELECT id, name, description, language, owner_id, room_type, code,
                    join_code, is_active, created_at, updated_at
             FROM rooms WHERE join_code = ?1 AND is_active = 1",
            rusqlite::params![code],
            access::row_to_room,
        )
        .map_err(|_| ApiError::NotFound("no room matches that join code".to_string()))
    })
    .await?
}
