/// Database row types for all tables.
/// These correspond 1:1 to the SQLite schema defined in migrations.rs.
use serde::{Deserialize, Serialize};

/// User record in the users table
#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub username: String,
    pub password_hash: String,
    pub is_online: bool,
    pub last_seen: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Room visibility / join policy, stored as TEXT in the rooms table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomType {
    /// Anyone may join.
    #[serde(rename = "public")]
    Public,
    /// Joinable only by the owner or via a valid join code.
    #[serde(rename = "private")]
    Private,
    /// Join attempts queue a request that the owner must approve.
    #[serde(rename = "request_to_join")]
    RequestToJoin,
}

impl RoomType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "public" => Some(Self::Public),
            "private" => Some(Self::Private),
            "request_to_join" => Some(Self::RequestToJoin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
            Self::RequestToJoin => "request_to_join",
        }
    }
}

/// Room record (without the child participant/pending/cursor rows)
#[derive(Debug, Clone)]
pub struct Room {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub language: String,
    pub owner_id: String,
    pub room_type: RoomType,
    pub code: String,
    pub join_code: Option<String>,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Pending join request nested under a room
#[derive(Debug, Clone, Serialize)]
pub struct JoinRequest {
    pub user_id: String,
    pub username: String,
    pub requested_at: String,
}

/// Last-known cursor position for a participant, removed on leave
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cursor {
    pub user_id: String,
    pub username: String,
    pub line: i64,
    pub ch: i64,
    pub color: String,
}

/// Editing session: one active row per (user, room) pair
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub room_id: String,
    pub joined_at: String,
    pub left_at: Option<String>,
    pub is_active: bool,
}

/// Participant entry as exposed in room snapshots
#[derive(Debug, Clone, Serialize)]
pub struct Participant {
    pub user_id: String,
    pub username: String,
}
