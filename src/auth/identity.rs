//! Identity gate for the WebSocket handshake: resolves a bearer token to a
//! Principal before any session is created.

use thiserror::Error;

use crate::auth::jwt;
use crate::db::{models, DbPool};

/// Resolved identity of a connecting user.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: String,
    pub username: String,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    /// Token is expired.
    #[error("token expired")]
    Unauthorized,
    /// Token is malformed, has a bad signature, or otherwise invalid.
    #[error("token invalid")]
    Forbidden,
    /// Token is valid but references a user that no longer exists.
    #[error("user not found")]
    NotFound,
    #[error("identity lookup failed: {0}")]
    Internal(String),
}

/// Resolve a bearer token to a Principal.
/// Blocking (DB lookup) — call through spawn_blocking from async contexts.
pub fn resolve_token(db: &DbPool, secret: &[u8], token: &str) -> Result<Principal, IdentityError> {
    let claims = jwt::validate_access_token(secret, token).map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => IdentityError::Unauthorized,
        _ => IdentityError::Forbidden,
    })?;

    let conn = db
        .lock()
        .map_err(|e| IdentityError::Internal(format!("DB lock error: {}", e)))?;

    // The user may have been deleted since the token was issued.
    // The username in the claims is informational only; the directory wins.
    let username = models::find_username_by_id(&conn, &claims.sub)
        .map_err(|e| IdentityError::Internal(e.to_string()))?
        .ok_or(IdentityError::NotFound)?;

    Ok(Principal {
        user_id: claims.sub,
        username,
    })
}
