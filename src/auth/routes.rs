//! REST endpoints for account creation and credential issuance.

use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::{jwt, password};
use crate::db::models;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: String,
    pub username: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenPairResponse {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// POST /api/auth/register
/// Create a new user. Usernames are whitespace-free tokens because the
/// `/pm <receiver> <text>` frame grammar delimits on whitespace.
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), (StatusCode, String)> {
    let username = req.username.trim().to_string();
    if username.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "Username cannot be empty".to_string(),
        ));
    }
    if username.chars().any(char::is_whitespace) {
        return Err((
            StatusCode::BAD_REQUEST,
            "Username cannot contain whitespace".to_string(),
        ));
    }
    if username.starts_with('/') {
        return Err((
            StatusCode::BAD_REQUEST,
            "Username cannot start with '/'".to_string(),
        ));
    }
    if req.password.len() < 8 {
        return Err((
            StatusCode::BAD_REQUEST,
            "Password must be at least 8 characters".to_string(),
        ));
    }

    let db = state.db.clone();
    let email = req.email.clone();
    let pass = req.password.clone();
    let uname = username.clone();

    let user_id = tokio::task::spawn_blocking(move || {
        // Argon2 hashing is deliberately slow — keep it off the async runtime
        let password_hash = password::hash_password(&pass)
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

        let conn = db
            .lock()
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE username = ?1 OR (email IS NOT NULL AND email = ?2))",
                rusqlite::params![uname, email],
                |row| row.get(0),
            )
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
        if exists {
            return Err((
                StatusCode::BAD_REQUEST,
                "User with this email or username already exists".to_string(),
            ));
        }

        let user_id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO users (id, username, email, password_hash, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            rusqlite::params![user_id, uname, email, password_hash, now],
        )
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

        Ok::<_, (StatusCode, String)>(user_id)
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))??;

    tracing::info!(username = %username, "User registered");

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse { user_id, username }),
    ))
}

/// POST /api/auth/login
/// Password check, then issue an access JWT and a refresh token.
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<TokenPairResponse>, (StatusCode, String)> {
    let db = state.db.clone();
    let uname = req.username.clone();
    let pass = req.password.clone();

    let user = tokio::task::spawn_blocking(move || {
        let user = {
            let conn = db
                .lock()
                .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
            models::find_user_by_username(&conn, &uname)
                .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        };

        // Verify outside the DB lock — argon2 takes tens of milliseconds
        match user {
            Some(user) if password::verify_password(&pass, &user.password_hash) => Ok(user),
            _ => Err((
                StatusCode::BAD_REQUEST,
                "Incorrect username or password".to_string(),
            )),
        }
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))??;

    issue_token_pair(&state, &user.id, &user.username).await
}

/// POST /api/auth/refresh
/// Rotate a refresh token: consume the old one, issue a new pair.
pub async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<TokenPairResponse>, (StatusCode, String)> {
    let db = state.db.clone();
    let token = req.refresh_token.clone();

    let user = tokio::task::spawn_blocking(move || {
        let user_id = jwt::validate_and_consume_refresh_token(&db, &token)
            .map_err(|_| (StatusCode::FORBIDDEN, "Invalid token".to_string()))?;

        let conn = db
            .lock()
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
        let username = models::find_username_by_id(&conn, &user_id)
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
            .ok_or((StatusCode::NOT_FOUND, "Invalid token for user".to_string()))?;

        Ok::<_, (StatusCode, String)>((user_id, username))
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))??;

    issue_token_pair(&state, &user.0, &user.1).await
}

/// Issue an access JWT plus a stored-hash refresh token for a user.
async fn issue_token_pair(
    state: &AppState,
    user_id: &str,
    username: &str,
) -> Result<Json<TokenPairResponse>, (StatusCode, String)> {
    let access_token = jwt::issue_access_token(&state.jwt_secret, user_id, username)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let (refresh_token, refresh_hash) = jwt::issue_refresh_token();

    let db = state.db.clone();
    let uid = user_id.to_string();
    tokio::task::spawn_blocking(move || jwt::store_refresh_token(&db, &uid, &refresh_hash))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(TokenPairResponse {
        access_token,
        refresh_token,
    }))
}
