//! Listener subscriptions and their lifecycle policy.

use std::sync::Arc;

use crate::entity::Entity;
use crate::store::Store;

/// Opaque handle for one subscription. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

impl ListenerId {
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Error type a listener callback may return.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Invoked with the new snapshot after every real change to the watched
/// entity, and once with `None` as a farewell when the entity is removed.
/// The callback receives the store and may call back into it freely.
pub type ListenerCallback =
    Arc<dyn Fn(&mut Store, Option<&Entity>) -> Result<(), ListenerError> + Send + Sync>;

/// What to do with a subscription whose callback returns an error.
///
/// The default retires the listener, but callers that consider a one-off
/// failure survivable can opt to keep it subscribed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OnError {
    /// Log the error and drop the subscription. No farewell is delivered.
    #[default]
    Retire,
    /// Log the error and keep the subscription.
    Retain,
}

/// One registered subscription.
pub(crate) struct Listener {
    pub(crate) listener_id: ListenerId,
    pub(crate) slice: String,
    pub(crate) entity_id: String,
    pub(crate) callback: ListenerCallback,
    pub(crate) on_error: OnError,
}
