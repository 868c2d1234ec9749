pub mod actor;
pub mod handler;

use tokio::sync::mpsc;

/// Type alias for the sender half of a connection's channel — the opaque
/// transport handle the session registry holds for directed writes.
pub type SessionSender = mpsc::UnboundedSender<axum::extract::ws::Message>;
