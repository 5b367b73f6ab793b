use rusqlite_migration::{Migrations, M};

/// Define all schema migrations.
/// Uses SQLite user_version pragma for tracking — no migration table needed.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            "-- Migration 1: Initial schema

CREATE TABLE users (
    id TEXT PRIMARY KEY,
    username TEXT NOT NULL,
    password_hash TEXT NOT NULL,
    is_online INTEGER NOT NULL DEFAULT 0,
    last_seen TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX idx_users_username ON users(username);

CREATE TABLE rooms (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT,
    language TEXT NOT NULL DEFAULT 'javascript',
    owner_id TEXT NOT NULL,
    room_type TEXT NOT NULL DEFAULT 'public'
        CHECK (room_type IN ('public', 'private', 'request_to_join')),
    code TEXT NOT NULL DEFAULT '',
    join_code TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (owner_id) REFERENCES users(id)
);

CREATE INDEX idx_rooms_owner_active ON rooms(owner_id, is_active);
CREATE INDEX idx_rooms_type_active ON rooms(room_type, is_active);

-- Join codes must be unique among ACTIVE rooms only; codes on soft-deleted
-- rooms are not resolvable and must not block reuse.
CREATE UNIQUE INDEX idx_rooms_join_code_active
    ON rooms(join_code) WHERE join_code IS NOT NULL AND is_active = 1;

CREATE TABLE room_participants (
    room_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    joined_at TEXT NOT NULL,
    PRIMARY KEY (room_id, user_id),
    FOREIGN KEY (room_id) REFERENCES rooms(id),
    FOREIGN KEY (user_id) REFERENCES users(id)
);

CREATE INDEX idx_participants_user ON room_participants(user_id);

-- At most one pending entry per (room, requester) by primary key construction.
CREATE TABLE join_requests (
    room_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    username TEXT NOT NULL,
    requested_at TEXT NOT NULL,
    PRIMARY KEY (room_id, user_id),
    FOREIGN KEY (room_id) REFERENCES rooms(id),
    FOREIGN KEY (user_id) REFERENCES users(id)
);

CREATE TABLE room_cursors (
    room_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    username TEXT NOT NULL,
    line INTEGER NOT NULL DEFAULT 0,
    ch INTEGER NOT NULL DEFAULT 0,
    color TEXT NOT NULL DEFAULT '#007acc',
    updated_at TEXT NOT NULL,
    PRIMARY KEY (room_id, user_id),
    FOREIGN KEY (room_id) REFERENCES rooms(id)
);

CREATE TABLE sessions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    room_id TEXT NOT NULL,
    joined_at TEXT NOT NULL,
    left_at TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    FOREIGN KEY (user_id) REFERENCES users(id),
    FOREIGN KEY (room_id) REFERENCES rooms(id)
);

CREATE INDEX idx_sessions_pair ON sessions(user_id, room_id, is_active);

-- One ACTIVE session per (user, room) pair: new joins upsert, never stack.
CREATE UNIQUE INDEX idx_sessions_active_pair
    ON sessions(user_id, room_id) WHERE is_active = 1;
",
        ),
    ])
}
