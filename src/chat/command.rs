//! Typed parser for inbound chat frames.
//!
//! A frame whose first whitespace-delimited token is `/pm` must carry a
//! receiver token and non-empty message text; anything short of that is
//! `Invalid` with a user-facing reason, never a panic. Every other frame is
//! a broadcast.

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Broadcast { text: String },
    Private { receiver: String, text: String },
    Invalid { reason: String },
}

/// Usage notice shown to the sender on a malformed `/pm` frame.
pub const PM_USAGE_NOTICE: &str =
    "Неверный формат команды. Используйте: /pm <получатель> <текст>";

pub fn parse(frame: &str) -> Command {
    let mut parts = frame.splitn(3, ' ');

    match parts.next() {
        Some("/pm") => {}
        // `/pmfoo ...` is not the /pm token; treat as ordinary chat text
        _ => {
            return Command::Broadcast {
                text: frame.to_string(),
            }
        }
    }

    let receiver = match parts.next() {
        Some(r) if !r.is_empty() => r.to_string(),
        _ => {
            return Command::Invalid {
                reason: PM_USAGE_NOTICE.to_string(),
            }
        }
    };

    match parts.next() {
        Some(text) if !text.trim().is_empty() => Command::Private {
            receiver,
            text: text.to_string(),
        },
        _ => Command::Invalid {
            reason: PM_USAGE_NOTICE.to_string(),
        },
    }
}
