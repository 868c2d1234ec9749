use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};

use crate::auth::identity::Principal;
use crate::chat::{dispatch, store};
use crate::state::AppState;
use crate::ws::handler::CLOSE_SESSION_REPLACED;
use crate::ws::SessionSender;

/// Ping interval: server sends a WebSocket ping every 30 seconds so an
/// abandoned transport cannot hold a registry entry forever.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Pong timeout: if pong not received within 10 seconds after ping, close.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the actor-per-connection pattern for an authenticated WebSocket.
///
/// Splits the WebSocket into reader and writer halves:
/// - Writer task: owns the sink, forwards messages from an mpsc channel
/// - Reader task: dispatches each inbound text frame as a chat command
///
/// The mpsc sender is the session's transport handle in the registry; any
/// part of the system can clone it to push lines to this client.
pub async fn run_connection(socket: WebSocket, state: AppState, principal: Principal) {
    let username = principal.username;
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    // One live session per username: a reconnect replaces the entry and the
    // previous transport is force-closed rather than silently leaked.
    if let Some(previous) = state.sessions.register(&username, tx.clone()) {
        let _ = previous.send(Message::Close(Some(CloseFrame {
            code: CLOSE_SESSION_REPLACED,
            reason: "Session replaced".into(),
        })));
        tracing::info!(username = %username, "Existing session replaced by new connection");
    }

    tracing::info!(
        user_id = %principal.user_id,
        username = %username,
        online = state.sessions.online_count(),
        "Chat session started"
    );

    // Spawn writer task: forwards mpsc messages to WebSocket sink
    let writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    // Replay stored history before any live traffic is processed
    replay_backlog(&state, &username, &tx).await;

    // Track pong reception
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();

    // Spawn ping task: sends periodic pings and monitors pong responses
    let ping_tx = tx.clone();
    let ping_handle = tokio::spawn(async move {
        let mut ping_timer = interval(PING_INTERVAL);
        // Skip the first immediate tick
        ping_timer.tick().await;

        loop {
            ping_timer.tick().await;

            if ping_tx.send(Message::Ping(vec![1, 2, 3, 4].into())).is_err() {
                // Writer task has died — connection is gone
                break;
            }

            match timeout(PONG_TIMEOUT, pong_rx.recv()).await {
                Ok(Some(())) => {
                    // Pong received, continue
                }
                _ => {
                    tracing::warn!("Pong timeout, closing connection");
                    let _ = ping_tx.send(Message::Close(Some(CloseFrame {
                        code: 1001,
                        reason: "Pong timeout".into(),
                    })));
                    break;
                }
            }
        }
    });

    // Reader loop: each text frame flows through the command dispatcher.
    // Per-frame failures are reported inline and never end the loop; only
    // transport close or error does.
    loop {
        match ws_receiver.next().await {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => {
                    dispatch::handle_frame(&state, &username, text.as_str()).await;
                }
                Message::Binary(_) => {
                    tracing::debug!(
                        username = %username,
                        "Received binary frame (expected UTF-8 text), ignoring"
                    );
                }
                Message::Pong(_) => {
                    let _ = pong_tx.send(());
                }
                Message::Ping(data) => {
                    let _ = tx.send(Message::Pong(data));
                }
                Message::Close(frame) => {
                    tracing::info!(
                        username = %username,
                        reason = ?frame,
                        "Client initiated close"
                    );
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(
                    username = %username,
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
            None => {
                // Stream ended — client disconnected
                tracing::info!(username = %username, "WebSocket stream ended");
                break;
            }
        }
    }

    // Cleanup on every exit path: abort helper tasks, then drop the registry
    // entry. The sender-identity guard keeps a replaced actor from evicting
    // the session that superseded it.
    writer_handle.abort();
    ping_handle.abort();
    state.sessions.unregister(&username, &tx);

    tracing::info!(
        username = %username,
        online = state.sessions.online_count(),
        "Chat session ended"
    );
}

/// Writer task: receives messages from mpsc channel and forwards them to the WebSocket sink.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        if ws_sender.send(msg).await.is_err() {
            // WebSocket send failed — connection is broken
            break;
        }
    }
}

/// Send the backlog to a freshly connected client: up to `history_limit`
/// stored messages involving this user, oldest first, one line per message.
async fn replay_backlog(state: &AppState, username: &str, tx: &SessionSender) {
    let db = state.db.clone();
    let user = username.to_string();
    let limit = state.history_limit;

    let backlog =
        tokio::task::spawn_blocking(move || store::last_messages_for_user(&db, &user, limit))
            .await;

    match backlog {
        Ok(Ok(messages)) => {
            let replayed = messages.len();
            for message in messages {
                let line = dispatch::format_private_line(
                    &dispatch::format_timestamp(&message.created_at),
                    &message.sender_username,
                    &message.receiver_username,
                    &message.text,
                );
                let _ = tx.send(Message::Text(line.into()));
            }
            tracing::debug!(username = %username, replayed, "Backlog replayed");
        }
        Ok(Err(e)) => {
            tracing::error!(username = %username, error = %e, "Failed to load backlog");
        }
        Err(e) => {
            tracing::error!(username = %username, error = %e, "Backlog task failed");
        }
    }
}
