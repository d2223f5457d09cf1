//! The entity store: slices, CRUD, and synchronous listener notification.
//!
//! The store performs no internal locking. Every operation runs to
//! completion within one logical call (validate, compute, swap, notify), so
//! callers that share a store across tasks serialize access around it.
//! Hooks and listener callbacks receive `&mut Store` and may re-enter any
//! public operation; dispatch clones the handles it needs out of the store
//! before invoking them.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use crate::entity::{entity_id, Applied, Entity, Patch};
use crate::error::{Result, StoreError};
use crate::id;
use crate::listener::{Listener, ListenerCallback, ListenerId, OnError};
use crate::schema::{SliceDef, SliceSchema};
use std::sync::Arc;

struct Slice {
    schema: Arc<dyn SliceSchema>,
    entities: HashMap<String, Entity>,
}

/// The reactive entity store. Owns every slice map and the listener
/// registry exclusively; all access goes through these methods.
pub struct Store {
    slices: BTreeMap<String, Slice>,
    listeners: Vec<Listener>,
    next_listener_id: u64,
}

impl Store {
    /// Build a store from its slice declarations. Fails on an empty or
    /// duplicate slice name.
    pub fn init(slice_defs: Vec<SliceDef>) -> Result<Self> {
        let mut slices = BTreeMap::new();
        for def in slice_defs {
            if def.name.is_empty() {
                return Err(StoreError::Configuration(
                    "store slices must carry a name".into(),
                ));
            }
            if slices.contains_key(&def.name) {
                return Err(StoreError::Configuration(format!(
                    "duplicate slice name '{}'",
                    def.name
                )));
            }
            slices.insert(
                def.name,
                Slice {
                    schema: def.schema,
                    entities: HashMap::new(),
                },
            );
        }
        Ok(Self {
            slices,
            listeners: Vec::new(),
            next_listener_id: 1,
        })
    }

    fn schema_for(&self, slice: &str) -> Result<Arc<dyn SliceSchema>> {
        self.slices
            .get(slice)
            .map(|s| Arc::clone(&s.schema))
            .ok_or_else(|| StoreError::Configuration(format!("slice '{slice}' not found")))
    }

    /* Id generation.
     * Uniqueness is enforced by retrying until no slice holds the candidate.
     *************************************************************/

    /// A fresh id unused by every slice.
    #[must_use]
    pub fn generate_unique_id(&self) -> String {
        loop {
            let id = id::generate_random_id();
            if self.get_entity_of_any_slice_by_id(&id).is_none() {
                return id;
            }
        }
    }

    /* Mass retrieval.
     *************************************************************/

    /// Every entity of one slice, in unspecified order. Empty for an
    /// unknown slice.
    #[must_use]
    pub fn get_entities_of_slice(&self, slice: &str) -> Vec<Entity> {
        self.slices
            .get(slice)
            .map(|s| s.entities.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Look an id up across all slices.
    #[must_use]
    pub fn get_entity_of_any_slice_by_id(&self, id: &str) -> Option<&Entity> {
        self.slices.values().find_map(|s| s.entities.get(id))
    }

    /// Snapshot of the whole store, for diagnostics.
    #[must_use]
    pub fn examine_full_content(&self) -> Value {
        let mut root = serde_json::Map::new();
        for (name, slice) in &self.slices {
            let mut entities = serde_json::Map::new();
            for (id, entity) in &slice.entities {
                entities.insert(id.clone(), Value::Object(entity.clone()));
            }
            root.insert(name.clone(), Value::Object(entities));
        }
        Value::Object(root)
    }

    /* CRUD.
     *************************************************************/

    /// The entity at `(slice, id)`, or `None`. Never errors.
    #[must_use]
    pub fn get_entity(&self, slice: &str, id: &str) -> Option<&Entity> {
        self.slices.get(slice).and_then(|s| s.entities.get(id))
    }

    /// Insert an entity. Without a supplied entity, the slice's constructor
    /// hook builds one for a fresh id. A missing, invalid, or already-used
    /// id is replaced by a fresh globally-unique one. The stored snapshot is
    /// returned after validation.
    pub fn add_entity(&mut self, slice: &str, entity: Option<Entity>) -> Result<Entity> {
        let schema = self.schema_for(slice)?;
        let mut entity = match entity {
            Some(entity) => entity,
            None => {
                let fresh = self.generate_unique_id();
                schema.new_entity(self, &fresh)
            }
        };
        let id_usable = entity_id(&entity).is_some_and(|id| {
            id::validate_id(id) && self.get_entity_of_any_slice_by_id(id).is_none()
        });
        if !id_usable {
            let fresh = self.generate_unique_id();
            entity.insert("id".into(), Value::String(fresh));
        }
        schema.validate_entity(self, &entity)?;
        let id = entity_id(&entity)
            .ok_or_else(|| StoreError::Validation(format!("'{slice}' entity lost its id")))?
            .to_string();
        if let Some(s) = self.slices.get_mut(slice) {
            s.entities.insert(id, entity.clone());
        }
        Ok(entity)
    }

    /// Delete an entity. Runs the cleanup hook first, then delivers a
    /// farewell (`None`) to every listener on the key and retires them.
    pub fn remove_entity(&mut self, slice: &str, id: &str) -> Result<()> {
        let schema = self.schema_for(slice)?;
        let entity = self
            .get_entity(slice, id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(slice, id))?;
        schema.cleanup_entity(self, &entity);
        if let Some(s) = self.slices.get_mut(slice) {
            s.entities.remove(id);
        }
        self.notify_listeners(slice, id, None);
        Ok(())
    }

    /// Apply a patch. The merge hook (or the generic shallow merge) decides
    /// whether anything really changed; a redundant patch returns the
    /// original snapshot without validating, writing, or notifying.
    pub fn update_entity(&mut self, slice: &str, id: &str, patch: &Patch) -> Result<Entity> {
        let schema = self.schema_for(slice)?;
        let original = self
            .get_entity(slice, id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(slice, id))?;
        let modified = match schema.apply_changes(self, &original, patch)? {
            Applied::Unchanged => return Ok(original),
            Applied::Changed(modified) => modified,
        };
        if entity_id(&modified) != Some(id) {
            return Err(StoreError::Validation(format!(
                "update may not change the id of '{slice}' entity '{id}'"
            )));
        }
        schema.validate_entity(self, &modified)?;
        if let Some(s) = self.slices.get_mut(slice) {
            s.entities.insert(id.to_string(), modified.clone());
        }
        self.notify_listeners(slice, id, Some(&modified));
        Ok(modified)
    }

    /// Update if the id already exists in the slice, otherwise add. A
    /// caller-supplied id that fails validation or is used by another slice
    /// is a conflict.
    pub fn upsert_entity(&mut self, slice: &str, mut entity: Entity) -> Result<Entity> {
        self.schema_for(slice)?;
        match entity_id(&entity) {
            None => {
                let fresh = self.generate_unique_id();
                entity.insert("id".into(), Value::String(fresh));
            }
            Some(id) => {
                if self.get_entity(slice, id).is_some() {
                    let id = id.to_string();
                    return self.update_entity(slice, &id, &Patch::from_entity(&entity));
                }
                if !id::validate_id(id) || self.get_entity_of_any_slice_by_id(id).is_some() {
                    return Err(StoreError::Conflict(format!(
                        "new '{slice}' entity id '{id}' is invalid or in use by another slice"
                    )));
                }
            }
        }
        self.add_entity(slice, Some(entity))
    }

    /* Listeners.
     * The initial state of an entity is not sent on subscribe; use
     * `get_entity` for that. Listeners are retired automatically when the
     * entity is removed, after a farewell `None`.
     *************************************************************/

    /// Subscribe to changes on an existing entity. Returns `None` if the
    /// slice or entity does not exist.
    pub fn listen(
        &mut self,
        slice: &str,
        id: &str,
        callback: ListenerCallback,
    ) -> Option<ListenerId> {
        self.listen_with_policy(slice, id, callback, OnError::default())
    }

    /// Subscribe with an explicit on-error policy.
    pub fn listen_with_policy(
        &mut self,
        slice: &str,
        id: &str,
        callback: ListenerCallback,
        on_error: OnError,
    ) -> Option<ListenerId> {
        if self.get_entity(slice, id).is_none() {
            return None;
        }
        let listener_id = ListenerId(self.next_listener_id);
        self.next_listener_id += 1;
        self.listeners.push(Listener {
            listener_id,
            slice: slice.to_string(),
            entity_id: id.to_string(),
            callback,
            on_error,
        });
        Some(listener_id)
    }

    /// Drop a subscription. Returns whether it existed.
    pub fn unlisten(&mut self, listener_id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| l.listener_id != listener_id);
        self.listeners.len() != before
    }

    fn listener_exists(&self, listener_id: ListenerId) -> bool {
        self.listeners.iter().any(|l| l.listener_id == listener_id)
    }

    /// Deliver a snapshot (or farewell `None`) to every listener on
    /// `(slice, id)`, most recently subscribed first. Listeners registered
    /// during dispatch do not receive this notification.
    fn notify_listeners(&mut self, slice: &str, id: &str, entity: Option<&Entity>) {
        let pending: Vec<(ListenerId, ListenerCallback, OnError)> = self
            .listeners
            .iter()
            .rev()
            .filter(|l| l.slice == slice && l.entity_id == id)
            .map(|l| (l.listener_id, Arc::clone(&l.callback), l.on_error))
            .collect();
        for (listener_id, callback, on_error) in pending {
            // A callback earlier in this pass may have unlistened this one.
            if !self.listener_exists(listener_id) {
                continue;
            }
            if let Err(error) = callback(self, entity) {
                tracing::error!(
                    slice,
                    entity_id = id,
                    listener = listener_id.raw(),
                    %error,
                    "store listener failed"
                );
                if on_error == OnError::Retire {
                    self.unlisten(listener_id);
                    continue;
                }
            }
            if entity.is_none() {
                self.unlisten(listener_id);
            }
        }
    }
}
