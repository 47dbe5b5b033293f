//! Shared data types: cache slots, tracked values, entities and conversions.

pub mod conversions;
pub mod entity;
pub mod slot;

pub use entity::{Entity, EntityDescriptor, EntityId, InvalidEntityError};
pub use slot::{MergeOutcome, Owner, ResourceId, Scope, SlotKey, TrackedValue};
