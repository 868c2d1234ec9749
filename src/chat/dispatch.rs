//! Per-frame command dispatch: classifies an inbound frame, delivers through
//! the session registry, and persists private messages.
//!
//! A private message is persisted before any delivery happens; a crash
//! cannot leave a recipient with a message the store never saw. Registry
//! writes are channel sends and never block.

use chrono::{DateTime, Utc};

use crate::chat::command::{self, Command};
use crate::chat::store::{self, StoreError};
use crate::state::AppState;

/// Timestamp shape used in every user-visible line.
pub const TIMESTAMP_FORMAT: &str = "%d/%m/%y %H:%M";

pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// `[DD/MM/YY HH:MM] sender: text`
pub fn format_broadcast_line(timestamp: &str, sender: &str, text: &str) -> String {
    format!("[{}] {}: {}", timestamp, sender, text)
}

/// `[DD/MM/YY HH:MM] sender для receiver: text`
pub fn format_private_line(timestamp: &str, sender: &str, receiver: &str, text: &str) -> String {
    format!("[{}] {} для {}: {}", timestamp, sender, receiver, text)
}

/// Sent to the sender when the receiver has no active session.
pub fn offline_notice(receiver: &str) -> String {
    format!(
        "Пользователь '{}' сейчас не в сети, он увидит Ваше сообщение, когда зайдет в чат.",
        receiver
    )
}

/// Sent to the sender when the receiver is not in the user directory.
pub fn unknown_user_notice(username: &str) -> String {
    format!("Пользователь '{}' не найден.", username)
}

/// Sent to the sender on a self-addressed private message.
pub const SELF_PM_NOTICE: &str = "Вы не можете отправлять личные сообщения себе.";

/// Sent to the sender when the store failed; distinct from the offline notice.
pub const PERSIST_FAILED_NOTICE: &str =
    "Не удалось сохранить сообщение в истории, но оно будет доставлено.";

/// Handle one inbound text frame from `sender`.
/// Failures are contained per-frame: the sender gets an inline notice and
/// the connection loop continues.
pub async fn handle_frame(state: &AppState, sender: &str, frame: &str) {
    match command::parse(frame) {
        Command::Broadcast { text } => {
            let line = format_broadcast_line(&format_timestamp(&Utc::now()), sender, &text);
            state.sessions.broadcast(&line);
        }
        Command::Private { receiver, text } => {
            handle_private(state, sender, &receiver, &text).await;
        }
        Command::Invalid { reason } => {
            tracing::debug!(sender = %sender, "Malformed command frame");
            state.sessions.send_to(sender, &reason);
        }
    }
}

async fn handle_private(state: &AppState, sender: &str, receiver: &str, text: &str) {
    if receiver == sender {
        state.sessions.send_to(sender, SELF_PM_NOTICE);
        return;
    }

    // Persist first; delivery notifications follow durability.
    let db = state.db.clone();
    let (s, r, t) = (sender.to_string(), receiver.to_string(), text.to_string());
    let persisted =
        tokio::task::spawn_blocking(move || store::create_message(&db, &s, &r, &t)).await;

    match persisted {
        Ok(Ok(message)) => {
            tracing::debug!(
                message_id = %message.id,
                sender = %sender,
                receiver = %receiver,
                "Private message persisted"
            );
        }
        Ok(Err(StoreError::UserNotFound(name))) => {
            state.sessions.send_to(sender, &unknown_user_notice(&name));
            return;
        }
        Ok(Err(e)) => {
            tracing::error!(sender = %sender, receiver = %receiver, error = %e,
                "Failed to persist private message");
            state.sessions.send_to(sender, PERSIST_FAILED_NOTICE);
            // delivery still proceeds
        }
        Err(e) => {
            tracing::error!(error = %e, "Persistence task failed");
            state.sessions.send_to(sender, PERSIST_FAILED_NOTICE);
        }
    }

    let line = format_private_line(&format_timestamp(&Utc::now()), sender, receiver, text);
    if state.sessions.is_online(receiver) {
        state.sessions.send_to(receiver, &line);
    } else {
        state.sessions.send_to(sender, &offline_notice(receiver));
    }
    // The sender always gets an echo of the outgoing message
    state.sessions.send_to(sender, &line);
}
