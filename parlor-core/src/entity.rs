//! Entity values and the patch type used to update them.
//!
//! Entities are JSON objects keyed by field name; their `id` field always
//! equals the slot key they live under. A [`Patch`] describes field changes
//! explicitly: `Set` overwrites a field, `Remove` deletes it. Merge hooks
//! report whether anything really changed through [`Applied`], which lets
//! callers skip validation, the write, and listener notification entirely
//! for redundant updates.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

/// An entity snapshot. Immutable by convention: updates build a new map.
pub type Entity = Map<String, Value>;

/// The `id` field of an entity, if present and a string.
#[must_use]
pub fn entity_id(entity: &Entity) -> Option<&str> {
    entity.get("id").and_then(Value::as_str)
}

/// One field change within a patch.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldChange {
    /// Set the field to this value (which may be JSON null).
    Set(Value),
    /// Delete the field.
    Remove,
}

/// An explicit set of field changes, applied shallowly.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch(BTreeMap<String, FieldChange>);

impl Patch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field set.
    #[must_use]
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), FieldChange::Set(value.into()));
        self
    }

    /// Builder-style field removal.
    #[must_use]
    pub fn remove(mut self, key: impl Into<String>) -> Self {
        self.0.insert(key.into(), FieldChange::Remove);
        self
    }

    /// Treat every field of an entity-shaped object as a `Set`.
    #[must_use]
    pub fn from_entity(entity: &Entity) -> Self {
        Self(
            entity
                .iter()
                .map(|(k, v)| (k.clone(), FieldChange::Set(v.clone())))
                .collect(),
        )
    }

    /// The change recorded for `key`, if any.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&FieldChange> {
        self.0.get(key)
    }

    /// The value recorded by a `Set` on `key`, if any.
    #[must_use]
    pub fn get_set(&self, key: &str) -> Option<&Value> {
        match self.0.get(key) {
            Some(FieldChange::Set(value)) => Some(value),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldChange)> {
        self.0.iter()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Result of a merge hook: either a new snapshot or "nothing really changed".
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Changed(Entity),
    Unchanged,
}

/// Generic shallow merge: apply each field change, tracking whether any of
/// them had an effect.
#[must_use]
pub fn apply_generic_changes(original: &Entity, patch: &Patch) -> Applied {
    let mut modified = original.clone();
    let mut really_changed = false;
    for (key, change) in patch.iter() {
        match change {
            FieldChange::Remove => {
                if modified.remove(key).is_some() {
                    really_changed = true;
                }
            }
            FieldChange::Set(value) => {
                if modified.get(key) != Some(value) {
                    modified.insert(key.clone(), value.clone());
                    really_changed = true;
                }
            }
        }
    }
    if really_changed {
        Applied::Changed(modified)
    } else {
        Applied::Unchanged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(value: Value) -> Entity {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn generic_merge_reports_unchanged_for_redundant_patch() {
        let original = entity(json!({"id": "abcdefgh", "name": "Bud"}));
        let patch = Patch::new().set("name", "Bud");
        assert_eq!(apply_generic_changes(&original, &patch), Applied::Unchanged);
    }

    #[test]
    fn generic_merge_sets_and_removes() {
        let original = entity(json!({"id": "abcdefgh", "name": "Bud", "tag": 1}));
        let patch = Patch::new().set("name", "Ellen").remove("tag");
        match apply_generic_changes(&original, &patch) {
            Applied::Changed(modified) => {
                assert_eq!(modified.get("name"), Some(&json!("Ellen")));
                assert!(!modified.contains_key("tag"));
                // original untouched
                assert_eq!(original.get("name"), Some(&json!("Bud")));
            }
            Applied::Unchanged => panic!("expected a change"),
        }
    }

    #[test]
    fn removing_an_absent_field_is_not_a_change() {
        let original = entity(json!({"id": "abcdefgh"}));
        let patch = Patch::new().remove("ghost");
        assert_eq!(apply_generic_changes(&original, &patch), Applied::Unchanged);
    }

    #[test]
    fn setting_null_is_distinct_from_removing() {
        let original = entity(json!({"id": "abcdefgh", "roomId": "jjjjjjjj"}));
        let patch = Patch::new().set("roomId", Value::Null);
        match apply_generic_changes(&original, &patch) {
            Applied::Changed(modified) => {
                assert_eq!(modified.get("roomId"), Some(&Value::Null));
            }
            Applied::Unchanged => panic!("expected a change"),
        }
    }
}
