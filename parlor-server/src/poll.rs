//! Long-poll coordination.
//!
//! Each session may have at most one suspended poll. The suspended side of
//! the call is a oneshot channel: the receiver is awaited by the request
//! handler, the sender sits in the hub keyed by session id until exactly one
//! of three things resolves it: a mutation flush, a transport abort
//! (request future dropped), or the explicit poll timeout. The oneshot
//! enforces single resolution; whichever path takes the sender out of the
//! hub first wins.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

/// A poll is already suspended for the session.
#[derive(Debug, Error)]
#[error("a poll is already outstanding for this session")]
pub struct PollConflict;

/// One queued change record on the wire: `{"type": ..., "entity": ...}`.
pub type ChangeRecord = Value;

/// Side table of suspended polls, keyed by session id.
///
/// The continuation deliberately lives here instead of inside the session
/// entity: entities are plain JSON values and the store never holds live
/// channel handles.
#[derive(Default)]
pub struct PollHub {
    pending: Mutex<HashMap<String, oneshot::Sender<Vec<ChangeRecord>>>>,
}

impl PollHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspend a poll for this session. Errors if one is already suspended.
    pub fn attach(
        &self,
        session_id: &str,
    ) -> Result<oneshot::Receiver<Vec<ChangeRecord>>, PollConflict> {
        let mut pending = self.pending.lock();
        if pending.contains_key(session_id) {
            return Err(PollConflict);
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(session_id.to_string(), tx);
        Ok(rx)
    }

    /// Drop a suspended poll without resolving it. Returns whether one was
    /// attached. The queue is never touched here.
    pub fn detach(&self, session_id: &str) -> bool {
        self.pending.lock().remove(session_id).is_some()
    }

    /// Resolve a suspended poll with the flushed queue. Returns whether the
    /// records were actually delivered; if the receiving side is already
    /// gone the caller must keep the records queued.
    pub fn resolve(&self, session_id: &str, records: Vec<ChangeRecord>) -> bool {
        let Some(sender) = self.pending.lock().remove(session_id) else {
            return false;
        };
        sender.send(records).is_ok()
    }

    /// Whether a poll is currently suspended for this session.
    #[must_use]
    pub fn has_pending(&self, session_id: &str) -> bool {
        self.pending.lock().contains_key(session_id)
    }
}

/// Detaches the suspended poll when the request future is dropped mid-await
/// (client abort). Disarmed on every path that resolves the poll itself.
pub struct PollGuard {
    hub: Arc<PollHub>,
    session_id: String,
    armed: bool,
}

impl PollGuard {
    #[must_use]
    pub fn new(hub: Arc<PollHub>, session_id: String) -> Self {
        Self {
            hub,
            session_id,
            armed: true,
        }
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PollGuard {
    fn drop(&mut self) {
        if self.armed {
            self.hub.detach(&self.session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn attach_is_exclusive_per_session() {
        let hub = PollHub::new();
        let _rx = hub.attach("aaaaaaaa").expect("first attach");
        assert!(hub.attach("aaaaaaaa").is_err());
        assert!(hub.attach("bbbbbbbb").is_ok());
    }

    #[test]
    fn resolve_delivers_to_the_receiver() {
        let hub = PollHub::new();
        let mut rx = hub.attach("aaaaaaaa").expect("attach");
        assert!(hub.resolve("aaaaaaaa", vec![json!({"type": "room"})]));
        let records = rx.try_recv().expect("records");
        assert_eq!(records.len(), 1);
        // Sender is gone; a second resolve finds nothing.
        assert!(!hub.resolve("aaaaaaaa", Vec::new()));
    }

    #[test]
    fn resolve_reports_a_vanished_receiver() {
        let hub = PollHub::new();
        let rx = hub.attach("aaaaaaaa").expect("attach");
        drop(rx);
        assert!(!hub.resolve("aaaaaaaa", vec![json!({"type": "room"})]));
    }

    #[test]
    fn guard_detaches_on_drop_unless_disarmed() {
        let hub = Arc::new(PollHub::new());
        let _rx = hub.attach("aaaaaaaa").expect("attach");
        {
            let _guard = PollGuard::new(Arc::clone(&hub), "aaaaaaaa".to_string());
        }
        assert!(!hub.has_pending("aaaaaaaa"));

        let _rx = hub.attach("aaaaaaaa").expect("attach");
        {
            let mut guard = PollGuard::new(Arc::clone(&hub), "aaaaaaaa".to_string());
            guard.disarm();
        }
        assert!(hub.has_pending("aaaaaaaa"));
    }
}
