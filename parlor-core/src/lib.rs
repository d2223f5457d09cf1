//! Parlor core: a reactive in-memory entity store.
//!
//! The store is the source of truth for every entity kind the server knows
//! about. Some rules:
//! - All entities carry a unique string field `id`, same as their slot key.
//! - Entities are immutable; every change produces a new snapshot.
//! - All entities belong to a slice which must be declared at construction.
//! - Ids are unique across *all* slices.
//! - Clients may listen to existing entities and are notified synchronously
//!   on every real change, with a final farewell when the entity is removed.

#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

pub mod entity;
pub mod error;
pub mod id;
pub mod listener;
pub mod schema;
pub mod store;

pub use entity::{entity_id, Applied, Entity, FieldChange, Patch};
pub use error::StoreError;
pub use listener::{ListenerCallback, ListenerError, ListenerId, OnError};
pub use schema::{GenericSchema, SliceDef, SliceSchema};
pub use store::Store;
