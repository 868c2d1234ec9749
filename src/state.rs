use std::sync::Arc;

use crate::chat::registry::SessionRegistry;
use crate::db::DbPool;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// SQLite connection wrapped in Arc<Mutex>
    pub db: DbPool,
    /// JWT signing secret (256-bit random key)
    pub jwt_secret: Vec<u8>,
    /// Active chat sessions, keyed by username
    pub sessions: Arc<SessionRegistry>,
    /// How many stored messages are replayed to a connecting client
    pub history_limit: u32,
}
