//! The room slice and its service rules.
//!
//! A room entity:
//! ```json
//! {
//!   "id": "...",
//!   "ownerUserId": "...",
//!   "userIds": ["..."],
//!   "state": "gather" | "play" | "conclude" | "cancel",
//!   "startTime": null, "endTime": null,
//!   "backgroundImageUrl": null,
//!   "showInPublicLists": false,
//!   "permitAnyLogin": true,
//!   "permitAnyEdit": false,
//!   "improvements": {"userId": <serial>},
//!   "electionId": null
//! }
//! ```

use serde_json::{json, Map, Value};

use parlor_core::{Applied, Entity, Patch, SliceSchema, Store, StoreError};

/// Legal room states.
pub const ROOM_STATES: [&str; 4] = ["gather", "play", "conclude", "cancel"];

const SCALAR_FIELDS: [&str; 8] = [
    "ownerUserId",
    "startTime",
    "endTime",
    "backgroundImageUrl",
    "showInPublicLists",
    "permitAnyLogin",
    "permitAnyEdit",
    "electionId",
];

/// Schema hooks for the `room` slice.
pub struct RoomSlice;

impl SliceSchema for RoomSlice {
    fn new_entity(&self, _store: &Store, id: &str) -> Entity {
        let mut entity = Entity::new();
        entity.insert("id".into(), Value::String(id.into()));
        entity.insert("ownerUserId".into(), Value::Null);
        entity.insert("userIds".into(), Value::Array(Vec::new()));
        entity.insert("state".into(), Value::String("gather".into()));
        entity.insert("startTime".into(), Value::Null);
        entity.insert("endTime".into(), Value::Null);
        entity.insert("backgroundImageUrl".into(), Value::Null);
        entity.insert("showInPublicLists".into(), Value::Bool(false));
        entity.insert("permitAnyLogin".into(), Value::Bool(true));
        entity.insert("permitAnyEdit".into(), Value::Bool(false));
        entity.insert("improvements".into(), Value::Object(Map::new()));
        entity.insert("electionId".into(), Value::Null);
        entity
    }

    fn apply_changes(
        &self,
        _store: &mut Store,
        original: &Entity,
        patch: &Patch,
    ) -> Result<Applied, StoreError> {
        let mut modified = original.clone();
        let mut really_changed = false;

        for field in SCALAR_FIELDS {
            if let Some(value) = patch.get_set(field) {
                if modified.get(field) != Some(value) {
                    modified.insert(field.into(), value.clone());
                    really_changed = true;
                }
            }
        }

        if let Some(state) = patch.get_set("state") {
            let Some(state_str) = state.as_str() else {
                return Err(StoreError::Validation(format!("invalid state '{state}'")));
            };
            if !ROOM_STATES.contains(&state_str) {
                return Err(StoreError::Validation(format!(
                    "invalid state '{state_str}'"
                )));
            }
            if modified.get("state") != Some(state) {
                modified.insert("state".into(), state.clone());
                really_changed = true;
            }
        }

        // Membership lists compare as sets of the incoming ids.
        if let Some(user_ids) = patch.get_set("userIds").and_then(Value::as_array) {
            let current = modified
                .get("userIds")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let differs = current.len() != user_ids.len()
                || user_ids.iter().any(|id| !current.contains(id));
            if differs {
                modified.insert("userIds".into(), Value::Array(user_ids.clone()));
                really_changed = true;
            }
        }

        if let Some(improvements) = patch.get_set("improvements").and_then(Value::as_object) {
            let current = modified
                .get("improvements")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let differs = current.len() != improvements.len()
                || improvements
                    .iter()
                    .any(|(user_id, serial)| current.get(user_id) != Some(serial));
            if differs {
                modified.insert(
                    "improvements".into(),
                    Value::Object(improvements.clone()),
                );
                really_changed = true;
            }
        }

        Ok(if really_changed {
            Applied::Changed(modified)
        } else {
            Applied::Unchanged
        })
    }
}

/* Room service rules.
 *************************************************/

/// Create a room owned by `user_id`, with the owner as sole member.
pub fn create_room(store: &mut Store, user_id: &str) -> Result<Entity, StoreError> {
    let id = store.generate_unique_id();
    let mut room = RoomSlice.new_entity(store, &id);
    room.insert("ownerUserId".into(), Value::String(user_id.into()));
    room.insert("userIds".into(), json!([user_id]));
    store.add_entity("room", Some(room))
}

/// Owner may always edit; others only when the room permits it.
#[must_use]
pub fn user_may_edit_room(user_id: &str, room: &Entity) -> bool {
    room.get("ownerUserId").and_then(Value::as_str) == Some(user_id)
        || room.get("permitAnyEdit").and_then(Value::as_bool) == Some(true)
}

/// Join: the session must not already be in a room. Appends the user to the
/// member list and points the session at the room, which (re)establishes
/// its room listener.
pub fn join_room(
    store: &mut Store,
    session_id: &str,
    room_id: &str,
) -> Result<Entity, StoreError> {
    let session = store
        .get_entity("session", session_id)
        .cloned()
        .ok_or_else(|| StoreError::not_found("session", session_id))?;
    let room = store
        .get_entity("room", room_id)
        .cloned()
        .ok_or_else(|| StoreError::not_found("room", room_id))?;
    if session
        .get("roomId")
        .is_some_and(|room_id| !room_id.is_null())
    {
        return Err(StoreError::Conflict("session is already in a room".into()));
    }

    let user_id = session
        .get("userId")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let mut user_ids = room
        .get("userIds")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if !user_ids.contains(&json!(user_id)) {
        user_ids.push(json!(user_id));
    }
    let room = store.update_entity("room", room_id, &Patch::new().set("userIds", user_ids))?;
    store.update_entity("session", session_id, &Patch::new().set("roomId", room_id))?;
    Ok(room)
}

/// Leave: removes the user from the member list and clears the session's
/// room (which retires its listener).
pub fn leave_room(store: &mut Store, session_id: &str, room_id: &str) -> Result<(), StoreError> {
    let session = store
        .get_entity("session", session_id)
        .cloned()
        .ok_or_else(|| StoreError::not_found("session", session_id))?;
    if session.get("roomId").and_then(Value::as_str) != Some(room_id) {
        return Err(StoreError::Conflict("session is not in that room".into()));
    }
    let room = store
        .get_entity("room", room_id)
        .cloned()
        .ok_or_else(|| StoreError::not_found("room", room_id))?;

    let user_id = session.get("userId").cloned().unwrap_or(Value::Null);
    let user_ids: Vec<Value> = room
        .get("userIds")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .filter(|id| *id != user_id)
        .collect();
    store.update_entity("room", room_id, &Patch::new().set("userIds", user_ids))?;
    store.update_entity(
        "session",
        session_id,
        &Patch::new().set("roomId", Value::Null),
    )?;
    Ok(())
}

/// Record one member's submission. Moving the room from `play` to
/// `conclude` once every member has submitted is our job.
pub fn register_improvement(
    store: &mut Store,
    room_id: &str,
    user_id: &str,
    serial: Value,
) -> Result<Entity, StoreError> {
    let room = store
        .get_entity("room", room_id)
        .cloned()
        .ok_or_else(|| StoreError::not_found("room", room_id))?;
    let user_ids = room
        .get("userIds")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if !user_ids.contains(&json!(user_id)) {
        return Err(StoreError::Conflict(format!(
            "user '{user_id}' is not a member of room '{room_id}'"
        )));
    }

    let mut improvements = room
        .get("improvements")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    improvements.insert(user_id.to_string(), serial);

    let mut state = room
        .get("state")
        .and_then(Value::as_str)
        .unwrap_or("gather")
        .to_string();
    if state == "play" && user_ids.iter().all(|id| {
        id.as_str()
            .is_some_and(|id| improvements.contains_key(id))
    }) {
        state = "conclude".to_string();
    }

    store.update_entity(
        "room",
        room_id,
        &Patch::new()
            .set("improvements", Value::Object(improvements))
            .set("state", state),
    )
}
