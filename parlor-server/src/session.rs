//! The session slice: bearer-token sessions, the per-session change queue,
//! and the room listener that feeds it.
//!
//! A session entity looks like:
//! ```json
//! {
//!   "id": "<access token>",
//!   "userId": "...",
//!   "roomId": null,
//!   "roomListener": 0,
//!   "expireTime": 1756250000000,
//!   "changes": [{"type": "room", "entity": {...}}]
//! }
//! ```
//! `roomListener` is re-established whenever `roomId` changes, and both the
//! listener and the session die together through the cleanup hook. The poll
//! continuation is NOT part of the entity; it lives in the [`PollHub`].

use std::sync::Arc;

use serde_json::{json, Value};

use parlor_core::{
    entity_id, Applied, Entity, ListenerCallback, ListenerId, Patch, SliceSchema, Store,
    StoreError,
};

use crate::poll::PollHub;

/// Sessions last twenty minutes, refreshed by every authenticated request.
pub const SESSION_EXPIRE_TIME_MS: i64 = 1000 * 60 * 20;

/// Bounded retention for the change queue of a session that stopped
/// polling: at the cap the oldest record is dropped. Coalescing already
/// bounds growth by the number of distinct entities of interest, so hitting
/// this cap means the client is long gone.
pub const CHANGE_QUEUE_CAP: usize = 64;

/// Milliseconds since the epoch.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Schema hooks for the `session` slice.
pub struct SessionSlice {
    hub: Arc<PollHub>,
}

impl SessionSlice {
    #[must_use]
    pub fn new(hub: Arc<PollHub>) -> Self {
        Self { hub }
    }
}

impl SliceSchema for SessionSlice {
    fn new_entity(&self, _store: &Store, id: &str) -> Entity {
        let mut entity = Entity::new();
        entity.insert("id".into(), Value::String(id.into()));
        entity.insert("userId".into(), Value::String(String::new()));
        entity.insert("roomId".into(), Value::Null);
        entity.insert("roomListener".into(), Value::from(0u64));
        entity.insert(
            "expireTime".into(),
            Value::from(now_ms() + SESSION_EXPIRE_TIME_MS),
        );
        entity.insert("changes".into(), Value::Array(Vec::new()));
        entity
    }

    fn apply_changes(
        &self,
        store: &mut Store,
        original: &Entity,
        patch: &Patch,
    ) -> Result<Applied, StoreError> {
        let mut modified = original.clone();
        let mut really_changed = false;

        if let Some(user_id) = patch.get_set("userId").and_then(Value::as_str) {
            let current = modified.get("userId").and_then(Value::as_str).unwrap_or("");
            if !user_id.is_empty() && current != user_id {
                if !current.is_empty() {
                    return Err(StoreError::Conflict(
                        "a session's userId cannot change once set".into(),
                    ));
                }
                if session_for_user_id(store, user_id).is_some() {
                    return Err(StoreError::Conflict(format!(
                        "user '{user_id}' already has an active session"
                    )));
                }
                modified.insert("userId".into(), Value::String(user_id.into()));
                really_changed = true;
            }
        }

        if let Some(expire_time) = patch.get_set("expireTime") {
            if modified.get("expireTime") != Some(expire_time) {
                modified.insert("expireTime".into(), expire_time.clone());
                really_changed = true;
            }
        }

        // The queue compares by full value: a coalesced replacement of the
        // same entity's snapshot is a real change and must be written.
        if let Some(changes) = patch.get_set("changes") {
            if modified.get("changes") != Some(changes) {
                modified.insert("changes".into(), changes.clone());
                really_changed = true;
            }
        }

        if let Some(room_id) = patch.get_set("roomId") {
            if modified.get("roomId") != Some(room_id) {
                modified.insert("roomId".into(), room_id.clone());
                really_changed = true;

                let old_listener = modified
                    .get("roomListener")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                if old_listener != 0 {
                    store.unlisten(ListenerId(old_listener));
                }

                let new_listener = match room_id.as_str() {
                    Some(room_id) => {
                        let session_id = entity_id(original).unwrap_or_default().to_string();
                        let callback = room_changed_callback(
                            Arc::clone(&self.hub),
                            session_id,
                            room_id.to_string(),
                        );
                        store
                            .listen("room", room_id, callback)
                            .map_or(0, ListenerId::raw)
                    }
                    None => 0,
                };
                modified.insert("roomListener".into(), Value::from(new_listener));
            }
        }

        Ok(if really_changed {
            Applied::Changed(modified)
        } else {
            Applied::Unchanged
        })
    }

    fn cleanup_entity(&self, store: &mut Store, entity: &Entity) {
        let listener = entity
            .get("roomListener")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if listener != 0 {
            store.unlisten(ListenerId(listener));
        }
        if let Some(session_id) = entity_id(entity) {
            // Dropping the sender resolves any suspended poll with "session
            // gone".
            self.hub.detach(session_id);
        }
    }
}

/// The listener callback driving one session's change queue.
///
/// On every snapshot (or farewell) of the watched room: coalesce away any
/// queued record for the same `(type, entityId)`, append the new record,
/// and, if a poll is suspended, flush the whole queue to it and clear the
/// queue in the same step.
fn room_changed_callback(
    hub: Arc<PollHub>,
    session_id: String,
    room_id: String,
) -> ListenerCallback {
    Arc::new(move |store, room| {
        let Some(session) = store.get_entity("session", &session_id) else {
            return Ok(());
        };

        let mut queue: Vec<Value> = session
            .get("changes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        queue.retain(|record| {
            !(record.get("type") == Some(&json!("room"))
                && record
                    .get("entity")
                    .and_then(|e| e.get("id"))
                    .and_then(Value::as_str)
                    == Some(room_id.as_str()))
        });
        queue.push(json!({
            "type": "room",
            "entity": room.map_or(Value::Null, |r| Value::Object(r.clone())),
        }));
        while queue.len() > CHANGE_QUEUE_CAP {
            tracing::warn!(
                session = %session_id,
                "change queue at capacity, dropping oldest record"
            );
            queue.remove(0);
        }

        if hub.resolve(&session_id, queue.clone()) {
            // Delivered; the queue is spent.
            store.update_entity(
                "session",
                &session_id,
                &Patch::new().set("changes", Vec::<Value>::new()),
            )?;
        } else {
            // No poll suspended (or it aborted between queue and flush):
            // keep the records for the next poll.
            store.update_entity("session", &session_id, &Patch::new().set("changes", queue))?;
        }
        Ok(())
    })
}

/* Session queries used by the service layer.
 *********************************************************/

/// Ids of every session whose expiry has passed.
#[must_use]
pub fn get_expired_session_ids(store: &Store) -> Vec<String> {
    let now = now_ms();
    store
        .get_entities_of_slice("session")
        .iter()
        .filter(|session| {
            session
                .get("expireTime")
                .and_then(Value::as_i64)
                .is_some_and(|expire| expire <= now)
        })
        .filter_map(|session| entity_id(session).map(str::to_string))
        .collect()
}

/// Refresh a session's expiry window.
pub fn touch_session(store: &mut Store, id: &str) -> Result<Entity, StoreError> {
    store.update_entity(
        "session",
        id,
        &Patch::new().set("expireTime", now_ms() + SESSION_EXPIRE_TIME_MS),
    )
}

/// The active session of a user, if any.
#[must_use]
pub fn session_for_user_id(store: &Store, user_id: &str) -> Option<Entity> {
    store
        .get_entities_of_slice("session")
        .into_iter()
        .find(|session| session.get("userId").and_then(Value::as_str) == Some(user_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parlor_core::SliceDef;

    /// A generic `room` slice is enough here; the session hooks only care
    /// about the slice name.
    fn test_store(hub: Arc<PollHub>) -> (Store, String) {
        let mut store = Store::init(vec![
            SliceDef::new("room"),
            SliceDef::with_schema("session", Arc::new(SessionSlice::new(hub))),
        ])
        .expect("store init");
        let session = store.add_entity("session", None).expect("add session");
        let session_id = entity_id(&session).expect("id").to_string();
        (store, session_id)
    }

    /// Queue one change record for a fresh room: enter it, touch it, leave.
    /// The join itself queues nothing (the listener is installed after the
    /// room last changed), so each cycle adds exactly one record.
    fn queue_one_room_record(store: &mut Store, session_id: &str, round: u64) -> String {
        let room = store.add_entity("room", None).expect("add room");
        let room_id = entity_id(&room).expect("id").to_string();
        store
            .update_entity(
                "session",
                session_id,
                &Patch::new().set("roomId", room_id.clone()),
            )
            .expect("enter room");
        store
            .update_entity("room", &room_id, &Patch::new().set("round", round))
            .expect("touch room");
        store
            .update_entity("session", session_id, &Patch::new().set("roomId", Value::Null))
            .expect("leave room");
        room_id
    }

    #[test]
    fn change_queue_drops_oldest_at_the_cap() {
        let hub = Arc::new(PollHub::new());
        let (mut store, session_id) = test_store(Arc::clone(&hub));

        let overflow = 6;
        let mut room_ids = Vec::new();
        for round in 0..(CHANGE_QUEUE_CAP + overflow) as u64 {
            room_ids.push(queue_one_room_record(&mut store, &session_id, round));
        }

        let session = store.get_entity("session", &session_id).expect("session");
        let queue = session
            .get("changes")
            .and_then(Value::as_array)
            .expect("queue");
        assert_eq!(queue.len(), CHANGE_QUEUE_CAP);

        // The eldest records made way; the survivors keep arrival order.
        let queued_room_id = |record: &Value| {
            record["entity"]["id"].as_str().map(str::to_string).expect("room id")
        };
        assert_eq!(queued_room_id(&queue[0]), room_ids[overflow]);
        assert_eq!(
            queued_room_id(&queue[CHANGE_QUEUE_CAP - 1]),
            room_ids[room_ids.len() - 1]
        );
    }

    #[test]
    fn expired_sessions_are_reported_and_fresh_ones_are_not() {
        let hub = Arc::new(PollHub::new());
        let (mut store, stale_id) = test_store(Arc::clone(&hub));
        let fresh = store.add_entity("session", None).expect("add session");
        let fresh_id = entity_id(&fresh).expect("id").to_string();

        store
            .update_entity(
                "session",
                &stale_id,
                &Patch::new().set("expireTime", now_ms() - 1),
            )
            .expect("age session");

        assert_eq!(get_expired_session_ids(&store), vec![stale_id.clone()]);

        // Touching renews the window.
        touch_session(&mut store, &stale_id).expect("touch");
        assert!(get_expired_session_ids(&store).is_empty());
        assert!(store.get_entity("session", &fresh_id).is_some());
    }

    #[test]
    fn removing_a_session_retires_its_listener_and_poll() {
        let hub = Arc::new(PollHub::new());
        let (mut store, session_id) = test_store(Arc::clone(&hub));
        let room = store.add_entity("room", None).expect("add room");
        let room_id = entity_id(&room).expect("id").to_string();
        store
            .update_entity(
                "session",
                &session_id,
                &Patch::new().set("roomId", room_id.clone()),
            )
            .expect("enter room");
        let mut rx = hub.attach(&session_id).expect("attach poll");

        store
            .remove_entity("session", &session_id)
            .expect("remove session");

        // The suspended poll's sender died with the session.
        assert!(!hub.has_pending(&session_id));
        assert!(rx.try_recv().is_err());

        // And the room listener went with it: a further room change finds
        // nothing to notify and queues nowhere.
        store
            .update_entity("room", &room_id, &Patch::new().set("round", 1))
            .expect("touch room");
        assert!(store.get_entity("session", &session_id).is_none());
    }
}
