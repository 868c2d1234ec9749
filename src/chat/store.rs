//! Message store: persistence and retrieval of private chat messages.
//!
//! Synchronous rusqlite functions — always call through
//! tokio::task::spawn_blocking from async contexts.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::params;
use thiserror::Error;
use uuid::Uuid;

use crate::db::{models, DbPool};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("user '{0}' not found")]
    UserNotFound(String),
    #[error("DB lock error: {0}")]
    Lock(String),
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

/// A persisted chat message. Immutable once stored.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: String,
    pub text: String,
    pub sender_username: String,
    pub receiver_username: String,
    pub created_at: DateTime<Utc>,
}

/// Persist a private message. Both sender and receiver must exist in the
/// user directory at persistence time; the server assigns the timestamp.
pub fn create_message(
    db: &DbPool,
    sender: &str,
    receiver: &str,
    text: &str,
) -> Result<StoredMessage, StoreError> {
    let conn = db.lock().map_err(|e| StoreError::Lock(e.to_string()))?;

    if !models::user_exists(&conn, sender)? {
        return Err(StoreError::UserNotFound(sender.to_string()));
    }
    if !models::user_exists(&conn, receiver)? {
        return Err(StoreError::UserNotFound(receiver.to_string()));
    }

    let created_at = Utc::now();
    let message = StoredMessage {
        id: Uuid::now_v7().to_string(),
        text: text.to_string(),
        sender_username: sender.to_string(),
        receiver_username: receiver.to_string(),
        created_at,
    };

    conn.execute(
        "INSERT INTO messages (id, sender_username, receiver_username, text, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            message.id,
            message.sender_username,
            message.receiver_username,
            message.text,
            // fixed-width fraction so the TEXT column sorts chronologically
            created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
        ],
    )?;

    Ok(message)
}

/// Return up to `limit` of the most recent messages where `username` is
/// sender or receiver, ordered oldest-first for backlog replay.
pub fn last_messages_for_user(
    db: &DbPool,
    username: &str,
    limit: u32,
) -> Result<Vec<StoredMessage>, StoreError> {
    let conn = db.lock().map_err(|e| StoreError::Lock(e.to_string()))?;

    let mut stmt = conn.prepare(
        "SELECT id, sender_username, receiver_username, text, created_at
         FROM messages
         WHERE sender_username = ?1 OR receiver_username = ?1
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?2",
    )?;

    let mut messages: Vec<StoredMessage> = stmt
        .query_map(params![username, limit], |row| {
            let created_raw: String = row.get(4)?;
            let created_at = DateTime::parse_from_rfc3339(&created_raw)
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        4,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?
                .with_timezone(&Utc);
            Ok(StoredMessage {
                id: row.get(0)?,
                sender_username: row.get(1)?,
                receiver_username: row.get(2)?,
                text: row.get(3)?,
                created_at,
            })
        })?
        .collect::<Result<_, _>>()?;

    // Query returns newest-first; backlog replay wants oldest-first
    messages.reverse();
    Ok(messages)
}
