//! The user slice and account helpers.
//!
//! A user entity:
//! ```json
//! { "id": "...", "name": "unique, 1-12 word chars", "hash": "sha256 hex" }
//! ```
//! `hash` is sha256 of `"id:password"`; anonymous single-visit users carry
//! no hash and cannot log back in.

use serde_json::Value;
use sha2::{Digest, Sha256};

use parlor_core::{entity_id, Applied, Entity, Patch, SliceSchema, Store, StoreError};

/// Schema hooks for the `user` slice.
pub struct UserSlice;

impl SliceSchema for UserSlice {
    fn new_entity(&self, store: &Store, id: &str) -> Entity {
        let mut entity = Entity::new();
        entity.insert("id".into(), Value::String(id.into()));
        entity.insert("name".into(), Value::String(unused_name(store)));
        entity
    }

    fn validate_entity(&self, _store: &Store, entity: &Entity) -> Result<(), StoreError> {
        let name = entity.get("name").and_then(Value::as_str).unwrap_or("");
        if !validate_user_name(name) {
            return Err(StoreError::Validation(format!("invalid user name '{name}'")));
        }
        Ok(())
    }

    fn apply_changes(
        &self,
        store: &mut Store,
        original: &Entity,
        patch: &Patch,
    ) -> Result<Applied, StoreError> {
        let mut modified = original.clone();
        let mut really_changed = false;

        if let Some(name) = patch.get_set("name").and_then(Value::as_str) {
            let current = modified.get("name").and_then(Value::as_str).unwrap_or("");
            if !name.is_empty() && current != name {
                if user_by_name(store, name).is_some() {
                    return Err(StoreError::Conflict(format!("name '{name}' in use")));
                }
                modified.insert("name".into(), Value::String(name.into()));
                really_changed = true;
            }
        }

        if let Some(hash) = patch.get_set("hash") {
            if !hash.is_null() && modified.get("hash") != Some(hash) {
                modified.insert("hash".into(), hash.clone());
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

/// 1-12 characters of `[0-9a-zA-Z]`.
#[must_use]
pub fn validate_user_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= 12 && name.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Minimum password strength for persistent accounts.
#[must_use]
pub fn validate_new_password(password: &str) -> bool {
    password.len() >= 8
}

/// sha256 hex of `"id:password"`.
#[must_use]
pub fn hash_password(id: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// First free `AnonymousN` name.
#[must_use]
pub fn unused_name(store: &Store) -> String {
    let max_anon = store
        .get_entities_of_slice("user")
        .iter()
        .filter_map(|user| user.get("name").and_then(Value::as_str))
        .filter_map(|name| name.strip_prefix("Anonymous"))
        .filter_map(|suffix| {
            if suffix.is_empty() {
                Some(0)
            } else {
                suffix.parse::<u64>().ok()
            }
        })
        .max()
        .unwrap_or(0);
    format!("Anonymous{}", max_anon + 1)
}

/// Look a user up by display name.
#[must_use]
pub fn user_by_name(store: &Store, name: &str) -> Option<Entity> {
    store
        .get_entities_of_slice("user")
        .into_iter()
        .find(|user| user.get("name").and_then(Value::as_str) == Some(name))
}

/// As a convenience, also check the password. Users without a hash only
/// match when no password is given.
#[must_use]
pub fn user_by_name_and_password(store: &Store, name: &str, password: Option<&str>) -> Option<Entity> {
    let user = user_by_name(store, name)?;
    let id = entity_id(&user)?;
    match (user.get("hash").and_then(Value::as_str), password) {
        (Some(hash), Some(password)) if hash_password(id, password) == hash => Some(user),
        (None, None) => Some(user),
        _ => None,
    }
}

/// Set a new password after verifying the old one.
pub fn change_password(
    store: &mut Store,
    id: &str,
    old_password: Option<&str>,
    new_password: &str,
) -> Result<Entity, StoreError> {
    if !validate_new_password(new_password) {
        return Err(StoreError::Validation("password too short".into()));
    }
    let user = store
        .get_entity("user", id)
        .cloned()
        .ok_or_else(|| StoreError::not_found("user", id))?;

    let current_hash = user.get("hash").and_then(Value::as_str);
    match (current_hash, old_password) {
        (Some(hash), Some(old)) if hash_password(id, old) == hash => {}
        (None, None) => {}
        _ => return Err(StoreError::Conflict("old password incorrect".into())),
    }

    store.update_entity(
        "user",
        id,
        &Patch::new().set("hash", hash_password(id, new_password)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_names_are_word_characters() {
        assert!(validate_user_name("Abbott"));
        assert!(validate_user_name("a"));
        assert!(validate_user_name("TwelveCharsX"));
        assert!(!validate_user_name(""));
        assert!(!validate_user_name("ThirteenChars"));
        assert!(!validate_user_name("has space"));
        assert!(!validate_user_name("dot.ted"));
    }

    #[test]
    fn password_hash_is_stable_and_id_bound() {
        let a = hash_password("abcdefgh", "hunter22");
        assert_eq!(a, hash_password("abcdefgh", "hunter22"));
        assert_ne!(a, hash_password("jjjjjjjj", "hunter22"));
        assert_ne!(a, hash_password("abcdefgh", "hunter23"));
        assert_eq!(a.len(), 64);
    }
}
