//! In-memory session registry: the single point of truth for who is online.
//!
//! One live session per username. A transport handle is the sender half of
//! the connection actor's mpsc channel; writes never block.

use axum::extract::ws::Message;
use dashmap::DashMap;

use crate::ws::SessionSender;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionSender>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Insert or replace the session for `username`. Always succeeds.
    /// Returns the previous transport handle when the entry was replaced;
    /// the caller decides what to do with it (we force-close it).
    pub fn register(&self, username: &str, sender: SessionSender) -> Option<SessionSender> {
        self.sessions.insert(username.to_string(), sender)
    }

    /// Remove the session for `username`, but only while it still maps to
    /// this exact transport. A replaced actor cleaning up after itself must
    /// not evict its successor. No-op if absent.
    pub fn unregister(&self, username: &str, sender: &SessionSender) {
        self.sessions
            .remove_if(username, |_, current| current.same_channel(sender));
    }

    pub fn is_online(&self, username: &str) -> bool {
        self.sessions.contains_key(username)
    }

    pub fn online_count(&self) -> usize {
        self.sessions.len()
    }

    /// Best-effort directed write: silently drops when the username has no
    /// active session or the channel is already closed.
    pub fn send_to(&self, username: &str, line: &str) {
        if let Some(entry) = self.sessions.get(username) {
            let _ = entry.value().send(Message::Text(line.to_string().into()));
        }
    }

    /// Write `line` to every registered session. The senders are snapshotted
    /// first so a concurrent connect/disconnect cannot skip or duplicate a
    /// session present throughout the call.
    pub fn broadcast(&self, line: &str) {
        let msg = Message::Text(line.to_string().into());
        let snapshot: Vec<SessionSender> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for sender in snapshot {
            let _ = sender.send(msg.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn channel() -> (SessionSender, mpsc::UnboundedReceiver<Message>) {
        mpsc::unbounded_channel()
    }

    fn text_of(msg: Message) -> String {
        match msg {
            Message::Text(t) => t.to_string(),
            other => panic!("expected text message, got {:?}", other),
        }
    }

    #[test]
    fn register_twice_keeps_only_the_later_session() {
        let registry = SessionRegistry::new();
        let (tx1, mut rx1) = channel();
        let (tx2, mut rx2) = channel();

        assert!(registry.register("alice", tx1).is_none());
        let previous = registry.register("alice", tx2);
        assert!(previous.is_some());
        assert_eq!(registry.online_count(), 1);

        registry.send_to("alice", "hi");
        assert!(rx1.try_recv().is_err());
        assert_eq!(text_of(rx2.try_recv().unwrap()), "hi");
    }

    #[test]
    fn stale_unregister_does_not_evict_successor() {
        let registry = SessionRegistry::new();
        let (tx1, _rx1) = channel();
        let (tx2, mut rx2) = channel();

        registry.register("alice", tx1.clone());
        registry.register("alice", tx2);

        // The replaced actor cleans up with its own (now stale) sender
        registry.unregister("alice", &tx1);
        assert!(registry.is_online("alice"));

        registry.send_to("alice", "still here");
        assert_eq!(text_of(rx2.try_recv().unwrap()), "still here");
    }

    #[test]
    fn send_to_unknown_username_is_a_silent_noop() {
        let registry = SessionRegistry::new();
        registry.send_to("nobody", "hello");
        assert!(!registry.is_online("nobody"));
    }

    #[test]
    fn unregister_absent_username_is_a_noop() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = channel();
        registry.unregister("ghost", &tx);
        assert_eq!(registry.online_count(), 0);
    }

    #[test]
    fn broadcast_reaches_every_session() {
        let registry = SessionRegistry::new();
        let (tx_a, mut rx_a) = channel();
        let (tx_b, mut rx_b) = channel();
        let (tx_c, mut rx_c) = channel();
        registry.register("alice", tx_a);
        registry.register("bob", tx_b);
        registry.register("carol", tx_c);

        registry.broadcast("to everyone");

        for rx in [&mut rx_a, &mut rx_b, &mut rx_c] {
            assert_eq!(text_of(rx.try_recv().unwrap()), "to everyone");
        }
    }

    #[test]
    fn unregistered_session_no_longer_receives() {
        let registry = SessionRegistry::new();
        let (tx, mut rx) = channel();
        registry.register("alice", tx.clone());
        registry.unregister("alice", &tx);

        registry.send_to("alice", "lost");
        registry.broadcast("lost too");
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.online_count(), 0);
    }
}
