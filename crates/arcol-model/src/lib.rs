//! Local object graph for Arcol documents.
//!
//! Mirrors the replicated collections of a [`Room`](arcol_live::Room) as
//! typed, observable objects and keeps derived state in step with them.
//!
//! # Layers
//!
//! - **ChangeManager**: reentrant transactions; tags changes local or remote
//! - **ObjectStore**: id → object map for one collection, reconciles remote
//!   batches, publishes `(object, change, origin)` to listeners
//! - **HierarchyIndex**: parent → sorted children, from `parentId`/`parentIndex`
//! - **RelationsStore**: `A<>B` edges with reverse indices and endpoint cleanup
//! - **UndoHistory**: diff recording, and replay that tolerates remote edits
//! - **Editor**: one document with its elements, relations, history,
//!   selection and deferred work
//!
//! # Origins
//!
//! Changes made inside [`ChangeManager::make_changes`] are local. Changes
//! arriving through the room subscription are remote and never enter undo
//! history. Both go through the same listener chain.

mod change;
mod config;
mod editor;
mod element;
mod error;
mod hierarchy;
mod object;
mod project;
mod relations;
mod selection;
mod store;
mod undo;

pub use change::{ChangeManager, ChangeOrigin, Transaction};
pub use config::EditorConfig;
pub use editor::{DeferredWork, DeleteEmptyExtrusions, Editor};
pub use element::{
    Element, ElementFactory, ElementObject, Extrusion, Group, Hidable, Level, Sketch,
};
pub use error::{ConfigError, StoreError};
pub use hierarchy::{HierarchyIndex, MAX_HIERARCHY_DEPTH};
pub use object::{ArcolObject, Attachment};
pub use project::{initial_storage, ProjectStore, DEFAULT_SKETCH_COLOR, ELEMENTS_COLLECTION};
pub use relations::{
    ElementRelations, Relation, RelationObject, RelationsStore, ELEMENT_RELATIONS_COLLECTION,
};
pub use selection::{Selection, SelectionListener, SelectionModel};
pub use store::{
    ListenerId, ObjectChange, ObjectFactory, ObjectListener, ObjectStore, PlainFactory, StoreName,
};
pub use undo::{Diff, HistoryEntry, HistoryStore, UndoHistory, DEFAULT_MAX_UNDO_LEVELS};

/// Result type for store construction and object instantiation.
pub type Result<T> = std::result::Result<T, StoreError>;
