//! The vote slice and election tallying.
//!
//! There is no election entity; an election id is minted when the first
//! vote of a concluded room arrives and lives in the room's `electionId`
//! field. Tallies are computed on demand from the vote slice.

use rand::Rng;
use serde_json::{json, Value};

use parlor_core::{entity_id, id, Entity, Patch, SliceSchema, Store, StoreError};

use crate::session::now_ms;

/// Schema hooks for the `vote` slice. Votes use the generic merge; only
/// validation is customized.
pub struct VoteSlice;

impl SliceSchema for VoteSlice {
    fn validate_entity(&self, _store: &Store, entity: &Entity) -> Result<(), StoreError> {
        for field in ["electionId", "voter", "target"] {
            if entity.get(field).and_then(Value::as_str).is_none() {
                return Err(StoreError::Validation(format!(
                    "vote is missing '{field}'"
                )));
            }
        }
        Ok(())
    }
}

/// Election ids carry a timestamp and random tail to stay unique without an
/// entity backing them.
#[must_use]
pub fn generate_election_id() -> String {
    let prefix = id::generate_random_id();
    let suffix = now_ms().rem_euclid(1000);
    let extra = rand::thread_rng().gen_range(0..1000);
    format!("{prefix}{suffix:03}{extra:03}")
}

/// Cast or update a vote in the room's election, creating the election on
/// the first vote of a concluded room. Returns the updated tally.
pub fn cast_vote(
    store: &mut Store,
    room_id: &str,
    voter_user_id: &str,
    target_user_id: &str,
) -> Result<Value, StoreError> {
    let room = store
        .get_entity("room", room_id)
        .cloned()
        .ok_or_else(|| StoreError::not_found("room", room_id))?;

    let election_id = match room.get("electionId").and_then(Value::as_str) {
        Some(election_id) => election_id.to_string(),
        None => {
            if room.get("state").and_then(Value::as_str) != Some("conclude") {
                return Err(StoreError::Conflict(
                    "voting opens when the room concludes".into(),
                ));
            }
            let election_id = generate_election_id();
            store.update_entity(
                "room",
                room_id,
                &Patch::new().set("electionId", election_id.clone()),
            )?;
            election_id
        }
    };

    // One vote per voter per election; a re-vote moves the target.
    let existing = store.get_entities_of_slice("vote").into_iter().find(|vote| {
        vote.get("electionId").and_then(Value::as_str) == Some(election_id.as_str())
            && vote.get("voter").and_then(Value::as_str) == Some(voter_user_id)
    });
    match existing.as_ref().and_then(|vote| entity_id(vote)) {
        Some(vote_id) => {
            let vote_id = vote_id.to_string();
            store.update_entity(
                "vote",
                &vote_id,
                &Patch::new().set("target", target_user_id),
            )?;
        }
        None => {
            let mut vote = Entity::new();
            vote.insert("electionId".into(), Value::String(election_id.clone()));
            vote.insert("voter".into(), Value::String(voter_user_id.into()));
            vote.insert("target".into(), Value::String(target_user_id.into()));
            store.add_entity("vote", Some(vote))?;
        }
    }

    Ok(get_election(store, &election_id))
}

/// Tally one election: candidates sorted by vote count, high to low, with
/// names resolved through the user slice.
#[must_use]
pub fn get_election(store: &Store, election_id: &str) -> Value {
    let mut candidates: Vec<(String, u64)> = Vec::new();
    for vote in store.get_entities_of_slice("vote") {
        if vote.get("electionId").and_then(Value::as_str) != Some(election_id) {
            continue;
        }
        let Some(target) = vote.get("target").and_then(Value::as_str) else {
            continue;
        };
        match candidates.iter_mut().find(|(user_id, _)| user_id == target) {
            Some((_, count)) => *count += 1,
            None => candidates.push((target.to_string(), 1)),
        }
    }
    candidates.sort_by(|a, b| b.1.cmp(&a.1));

    let candidates: Vec<Value> = candidates
        .into_iter()
        .map(|(user_id, count)| {
            let name = store
                .get_entity("user", &user_id)
                .and_then(|user| user.get("name").and_then(Value::as_str))
                .unwrap_or(&user_id)
                .to_string();
            json!({"userId": user_id, "name": name, "count": count})
        })
        .collect();

    json!({"id": election_id, "candidates": candidates})
}

/// The tally of the room's current election, if one is running.
#[must_use]
pub fn get_election_for_room(store: &Store, room_id: &str) -> Option<Value> {
    let room = store.get_entity("room", room_id)?;
    let election_id = room.get("electionId").and_then(Value::as_str)?;
    Some(get_election(store, election_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn election_ids_are_long_enough_to_avoid_collisions() {
        let a = generate_election_id();
        let b = generate_election_id();
        assert_eq!(a.len(), 14);
        assert_ne!(a, b);
    }
}
