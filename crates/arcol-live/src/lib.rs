//! In-memory replicated storage for the Arcol object graph.
//!
//! This crate stands in for the real-time collaboration backend: a [`Room`]
//! of key-ordered [`LiveMap`] collections holding [`LiveObject`] records, with
//! batched local writes, an outbox of [`StorageOp`] batches, and remote batches
//! delivered to subscribers as [`StorageUpdate`]s. It does no merging of its
//! own beyond last-arrival-wins per field.
//!
//! [`key_between`] generates the fractional sort keys used to order siblings.

mod fractional;
mod live;
mod room;

pub use fractional::{is_valid_key, key_between, BASE62};
pub use live::{Fields, LiveMap, LiveObject, StorageOp};
pub use room::{
    CollectionChange, RemoteBatch, Room, RoomSnapshot, StorageUpdate, SubscriptionId,
};

/// Field values are plain JSON values.
pub use serde_json::Value;
