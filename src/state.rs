use crate::db::DbPool;
use crate::ws::{ConnectionRegistry, RoomRegistry};

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// SQLite connection wrapped in Arc<Mutex>
    pub db: DbPool,
    /// JWT signing secret (256-bit random key)
    pub jwt_secret: Vec<u8>,
    /// Active WebSocket connections per user (private channels)
    pub connections: ConnectionRegistry,
    /// Live room bindings (room channels)
    pub rooms_live: RoomRegistry,
}
