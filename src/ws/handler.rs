use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use serde::Deserialize;

use crate::auth::identity::{self, IdentityError};
use crate::state::AppState;
use crate::ws::actor;

/// Query parameters for the WebSocket connection. Auth is via ?token=JWT;
/// the token is optional here so a missing credential can be refused with a
/// proper close code instead of a 400 before the upgrade.
#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: Option<String>,
}

/// WebSocket close codes:
/// 1008 = policy violation (missing credential)
/// 4000 = session replaced by a newer connection for the same username
/// 4001 = token expired
/// 4002 = token invalid
/// 4004 = token subject no longer exists
const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_SESSION_REPLACED: u16 = 4000;
const CLOSE_TOKEN_EXPIRED: u16 = 4001;
const CLOSE_TOKEN_INVALID: u16 = 4002;
const CLOSE_USER_NOT_FOUND: u16 = 4004;
const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// GET /ws?token=JWT
/// WebSocket upgrade endpoint. Resolves the credential to a Principal before
/// any session exists; every failure refuses the connection with a close
/// code and allocates nothing.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsAuthQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = params.token else {
        tracing::warn!("WebSocket connection refused: missing credential");
        return refuse(ws, CLOSE_POLICY_VIOLATION, "Missing credential");
    };

    let resolved = {
        let db = state.db.clone();
        let secret = state.jwt_secret.clone();
        tokio::task::spawn_blocking(move || identity::resolve_token(&db, &secret, &token)).await
    };

    match resolved {
        Ok(Ok(principal)) => {
            tracing::info!(
                user_id = %principal.user_id,
                username = %principal.username,
                "WebSocket connection authenticated"
            );
            ws.on_upgrade(move |socket| actor::run_connection(socket, state, principal))
        }
        Ok(Err(err)) => {
            let (close_code, reason) = match err {
                IdentityError::Unauthorized => (CLOSE_TOKEN_EXPIRED, "Token expired"),
                IdentityError::Forbidden => (CLOSE_TOKEN_INVALID, "Token invalid"),
                IdentityError::NotFound => (CLOSE_USER_NOT_FOUND, "User not found"),
                IdentityError::Internal(ref detail) => {
                    tracing::error!(error = %detail, "Identity resolution failed");
                    (CLOSE_INTERNAL_ERROR, "Internal error")
                }
            };

            tracing::warn!(
                close_code = close_code,
                reason = reason,
                "WebSocket auth failed"
            );
            refuse(ws, close_code, reason)
        }
        Err(e) => {
            tracing::error!(error = %e, "Identity resolution task failed");
            refuse(ws, CLOSE_INTERNAL_ERROR, "Internal error")
        }
    }
}

/// Upgrade the connection, then immediately close with the given code.
fn refuse(ws: WebSocketUpgrade, code: u16, reason: &'static str) -> Response {
    ws.on_upgrade(move |mut socket| async move {
        let close_frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        let _ = socket.send(Message::Close(Some(close_frame))).await;
    })
}
