//! Per-slice schema hooks.
//!
//! A slice may customize entity construction, validation, merging, and
//! teardown. Every hook has a generic default, so a bare slice behaves like
//! a plain keyed map with shallow-merge updates.

use std::sync::Arc;

use serde_json::Value;

use crate::entity::{apply_generic_changes, Applied, Entity, Patch};
use crate::error::StoreError;
use crate::store::Store;

/// Capability hooks for one entity kind. All methods have defaults; a slice
/// implements only what it needs. Hooks receive the store and may call back
/// into it; the store clones the schema handle out before invoking, so
/// re-entrant calls are safe.
pub trait SliceSchema: Send + Sync {
    /// Build a blank entity for a freshly generated id.
    fn new_entity(&self, store: &Store, id: &str) -> Entity {
        let _ = store;
        let mut entity = Entity::new();
        entity.insert("id".into(), Value::String(id.into()));
        entity
    }

    /// Accept or reject an entity about to be stored.
    fn validate_entity(&self, store: &Store, entity: &Entity) -> Result<(), StoreError> {
        let _ = (store, entity);
        Ok(())
    }

    /// Merge a patch into an entity. Returning [`Applied::Unchanged`] skips
    /// validation, the write, and listener notification.
    fn apply_changes(
        &self,
        store: &mut Store,
        original: &Entity,
        patch: &Patch,
    ) -> Result<Applied, StoreError> {
        let _ = store;
        Ok(apply_generic_changes(original, patch))
    }

    /// Run just before the entity is deleted from its slice.
    fn cleanup_entity(&self, store: &mut Store, entity: &Entity) {
        let _ = (store, entity);
    }
}

/// The do-nothing schema used by slices that declare no hooks.
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericSchema;

impl SliceSchema for GenericSchema {}

/// Declaration of one slice, passed to [`Store::init`].
pub struct SliceDef {
    pub(crate) name: String,
    pub(crate) schema: Arc<dyn SliceSchema>,
}

impl SliceDef {
    /// A slice with generic behavior only.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: Arc::new(GenericSchema),
        }
    }

    /// A slice with custom hooks.
    #[must_use]
    pub fn with_schema(name: impl Into<String>, schema: Arc<dyn SliceSchema>) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }
}
